use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use http::StatusCode;
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpListener,
    time::timeout,
};

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("requests_total", "Total requests by decision");
    let vec = IntCounterVec::new(opts, &["decision"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register requests_total");
    vec
});

static REQUEST_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let opts = HistogramOpts::new("request_duration_seconds", "Request latency by decision");
    let vec = HistogramVec::new(opts, &["decision"]).expect("create histogram vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register request_duration_seconds");
    vec
});

static RESPONSES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("responses_total", "Responses by status class and method");
    let vec = IntCounterVec::new(opts, &["method", "status_class"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register responses_total");
    vec
});

static CACHE_LOOKUPS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("cache_lookups_total", "Cache lookups by outcome");
    let vec = IntCounterVec::new(opts, &["outcome"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register cache_lookups_total");
    vec
});

static CACHE_STORES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("cache_stores_total", "Committed cache entries")
        .expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_stores_total");
    counter
});

static CACHE_STORE_FAILURES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("cache_store_failures_total", "Failed cache commits")
        .expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_store_failures_total");
    counter
});

static CACHE_EVICTIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter =
        IntCounter::new("cache_evictions_total", "Evicted cache entries").expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_evictions_total");
    counter
});

static CACHE_ENTRIES: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new("cache_entries", "Entries currently indexed").expect("create gauge");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("register cache_entries");
    gauge
});

static ORIGIN_FAILURES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("origin_failures_total", "Origin fetch failures by kind");
    let vec = IntCounterVec::new(opts, &["kind"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register origin_failures_total");
    vec
});

pub fn record_request(decision: &str, method: &str, status: StatusCode, elapsed: Duration) {
    REQUESTS_TOTAL.with_label_values(&[decision]).inc();
    REQUEST_DURATION_SECONDS
        .with_label_values(&[decision])
        .observe(elapsed.as_secs_f64());
    let status_class = match status.as_u16() {
        100..=199 => "1xx",
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        _ => "5xx",
    };
    RESPONSES_TOTAL
        .with_label_values(&[method, status_class])
        .inc();
}

pub fn record_cache_lookup(hit: bool) {
    let outcome = if hit { "hit" } else { "miss" };
    CACHE_LOOKUPS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_cache_store() {
    CACHE_STORES_TOTAL.inc();
}

pub fn record_cache_store_failure() {
    CACHE_STORE_FAILURES_TOTAL.inc();
}

pub fn record_cache_evictions(count: u64) {
    CACHE_EVICTIONS_TOTAL.inc_by(count);
}

pub fn set_cache_entries(count: usize) {
    CACHE_ENTRIES.set(count as i64);
}

pub fn record_origin_failure(kind: &str) {
    ORIGIN_FAILURES_TOTAL.with_label_values(&[kind]).inc();
}

pub fn render() -> Result<Vec<u8>> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&REGISTRY.gather(), &mut buffer)
        .context("failed to encode metrics")?;
    Ok(buffer)
}

const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Serve the Prometheus text exposition format over plain HTTP.
pub async fn serve(addr: SocketAddr, path: String) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {addr}"))?;

    loop {
        let (stream, _peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                tracing::warn!(error = %err, "failed to accept metrics connection");
                continue;
            }
        };
        let path = path.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_scrape(stream, &path).await {
                tracing::debug!(error = %err, "metrics scrape failed");
            }
        });
    }
}

async fn handle_scrape(stream: tokio::net::TcpStream, path: &str) -> Result<()> {
    let mut reader = BufReader::new(stream);
    let mut request_line = String::new();
    timeout(READ_TIMEOUT, reader.read_line(&mut request_line))
        .await
        .context("timed out reading metrics request")??;

    let mut line = String::new();
    loop {
        line.clear();
        let read = timeout(READ_TIMEOUT, reader.read_line(&mut line))
            .await
            .context("timed out reading metrics request headers")??;
        if read == 0 || line == "\r\n" || line == "\n" {
            break;
        }
    }

    let requested = request_line.split_whitespace().nth(1).unwrap_or("");
    let stream = reader.get_mut();
    if requested != path {
        stream
            .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
            .await?;
        return Ok(());
    }

    let body = render()?;
    let head = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(&body).await?;
    stream.shutdown().await.ok();
    Ok(())
}
