use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::Result;
use http::{Method, StatusCode};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

use crate::io_util::{copy_with_write_timeout, write_all_with_timeout};
use crate::logging::AccessLogBuilder;
use crate::proxy::AppContext;
use crate::proxy::cache::{CacheKey, CacheOutcome, HttpCache};
use crate::proxy::request::{ParsedRequest, parse_http1_request, redacted_path};
use crate::util::timeout_with_context;

use super::codec;
use super::origin::{self, FetchError, OriginLimits, OriginTimeouts};

/// Drive one client connection through the request pipeline:
/// parse → derive key → cache lookup → hit relay, or single-flight origin
/// fetch → commit → relay. Every exit path tears the connection down; parse
/// failures answer 400, origin failures 502/504, a vanished client nothing.
pub async fn handle_http<S>(stream: S, peer: SocketAddr, app: AppContext) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let start = Instant::now();
    let client_timeout = app.settings.client_timeout();
    let mut reader = BufReader::new(stream);

    let head = match codec::read_request_head(
        &mut reader,
        peer,
        client_timeout,
        app.settings.max_request_header_size,
    )
    .await
    {
        Ok(Some(head)) => head,
        // Client closed before sending a request; nothing to answer.
        Ok(None) => return Ok(()),
        Err(err) => {
            debug!(peer = %peer, error = %err, "failed to read request head");
            return respond_with_access_log(
                reader.get_mut(),
                StatusCode::BAD_REQUEST,
                b"malformed request\r\n",
                client_timeout,
                0,
                start.elapsed(),
                AccessLogBuilder::new(peer)
                    .decision("ERROR")
                    .error_reason(err.to_string()),
            )
            .await;
        }
    };

    let head_bytes = head.head_bytes();
    let parsed = match parse_http1_request(head.method.clone(), &head.target, head.headers.host())
    {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!(peer = %peer, error = ?err, "failed to parse request target");
            return respond_with_access_log(
                reader.get_mut(),
                StatusCode::BAD_REQUEST,
                b"invalid request target\r\n",
                client_timeout,
                head_bytes,
                start.elapsed(),
                AccessLogBuilder::new(peer)
                    .method(head.method.as_str())
                    .host(head.headers.host().unwrap_or(""))
                    .path(head.target.clone())
                    .decision("ERROR")
                    .error_reason(err.to_string()),
            )
            .await;
        }
    };

    let content_length = match head.headers.content_length() {
        Ok(value) => value.unwrap_or(0),
        Err(err) => {
            warn!(peer = %peer, error = %err, "invalid content-length header");
            return respond_with_access_log(
                reader.get_mut(),
                StatusCode::BAD_REQUEST,
                b"invalid Content-Length header\r\n",
                client_timeout,
                head_bytes,
                start.elapsed(),
                access_log(&parsed, peer)
                    .decision("ERROR")
                    .error_reason(err.to_string()),
            )
            .await;
        }
    };

    if content_length > app.settings.max_request_body_size as u64 {
        warn!(
            peer = %peer,
            length = content_length,
            max = app.settings.max_request_body_size,
            "request body exceeds limit"
        );
        return respond_with_access_log(
            reader.get_mut(),
            StatusCode::PAYLOAD_TOO_LARGE,
            b"request body exceeds configured limit\r\n",
            client_timeout,
            head_bytes,
            start.elapsed(),
            access_log(&parsed, peer).decision("ERROR"),
        )
        .await;
    }

    // Body bytes are passed through opaquely up to the declared length; the
    // raw head plus body is what gets forwarded to the origin byte-exact.
    let mut request_bytes = head.raw;
    if content_length > 0 {
        match codec::read_request_body(&mut reader, peer, content_length as usize, client_timeout)
            .await
        {
            Ok(body) => request_bytes.extend_from_slice(&body),
            Err(err) => {
                debug!(peer = %peer, error = %err, "failed to read request body");
                return respond_with_access_log(
                    reader.get_mut(),
                    StatusCode::BAD_REQUEST,
                    b"incomplete request body\r\n",
                    client_timeout,
                    head_bytes,
                    start.elapsed(),
                    access_log(&parsed, peer)
                        .decision("ERROR")
                        .error_reason(err.to_string()),
                )
                .await;
            }
        }
    }

    let ctx = RequestContext {
        peer,
        start,
        bytes_in: request_bytes.len() as u64,
        client_timeout,
        timeouts: OriginTimeouts {
            connect: app.settings.upstream_connect_timeout(),
            read: app.settings.upstream_timeout(),
        },
        limits: OriginLimits {
            max_header_bytes: app.settings.max_response_header_size,
            max_response_bytes: app.settings.max_response_size,
        },
    };

    match (CacheKey::for_request(&parsed), app.cache.as_ref()) {
        (Some(key), Some(cache)) => {
            serve_with_cache(&mut reader, &parsed, key, cache, request_bytes, &ctx).await
        }
        _ => serve_direct(&mut reader, &parsed, request_bytes, &ctx).await,
    }
}

struct RequestContext {
    peer: SocketAddr,
    start: Instant,
    bytes_in: u64,
    client_timeout: Duration,
    timeouts: OriginTimeouts,
    limits: OriginLimits,
}

fn access_log(parsed: &ParsedRequest, peer: SocketAddr) -> AccessLogBuilder {
    AccessLogBuilder::new(peer)
        .method(parsed.method.as_str())
        .host(parsed.host.clone())
        .path(redacted_path(&parsed.path))
}

async fn serve_with_cache<S>(
    reader: &mut BufReader<S>,
    parsed: &ParsedRequest,
    key: CacheKey,
    cache: &HttpCache,
    request_bytes: Vec<u8>,
    ctx: &RequestContext,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let host = parsed.host.clone();
    let port = parsed.port;
    let expect_body = parsed.method != Method::HEAD;
    let timeouts = ctx.timeouts;
    let limits = ctx.limits;
    let fetch = move || async move {
        origin::fetch_origin(&host, port, &request_bytes, expect_body, &timeouts, &limits).await
    };

    match cache.fetch_or_store(&key, fetch).await {
        Ok(CacheOutcome::Hit(cached)) => {
            let stream = reader.get_mut();
            let copied =
                match relay_file(stream, &cached.body_path, ctx.client_timeout).await {
                    Ok(copied) => copied,
                    Err(err) => {
                        debug!(
                            peer = %ctx.peer,
                            error = %err,
                            "client went away during cached response relay"
                        );
                        return Ok(());
                    }
                };
            shutdown_stream(stream, ctx.client_timeout).await.ok();
            access_log(parsed, ctx.peer)
                .decision("CACHE_HIT")
                .status(cached.status)
                .cache_lookup("hit")
                .cache_store("bypassed")
                .bytes(ctx.bytes_in, copied)
                .elapsed(ctx.start.elapsed())
                .log();
            Ok(())
        }
        Ok(CacheOutcome::Fetched { response, store }) => {
            let stream = reader.get_mut();
            if let Err(err) =
                write_all_with_timeout(stream, &response.bytes, ctx.client_timeout, "relaying response")
                    .await
            {
                debug!(
                    peer = %ctx.peer,
                    error = %err,
                    "client went away during response relay"
                );
                return Ok(());
            }
            shutdown_stream(stream, ctx.client_timeout).await.ok();
            access_log(parsed, ctx.peer)
                .decision("FETCH")
                .status(response.status)
                .cache_lookup("miss")
                .cache_store(store.as_str())
                .bytes(ctx.bytes_in, response.bytes.len() as u64)
                .elapsed(ctx.start.elapsed())
                .origin_addr(response.origin_addr.to_string())
                .log();
            Ok(())
        }
        Err(err) => respond_fetch_error(reader.get_mut(), parsed, err, "miss", ctx).await,
    }
}

/// Forward without cache participation: non-idempotent methods and
/// cache-disabled deployments take this path.
async fn serve_direct<S>(
    reader: &mut BufReader<S>,
    parsed: &ParsedRequest,
    request_bytes: Vec<u8>,
    ctx: &RequestContext,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let expect_body = parsed.method != Method::HEAD;
    let result = origin::fetch_origin(
        &parsed.host,
        parsed.port,
        &request_bytes,
        expect_body,
        &ctx.timeouts,
        &ctx.limits,
    )
    .await;

    match result {
        Ok(response) => {
            let stream = reader.get_mut();
            if let Err(err) =
                write_all_with_timeout(stream, &response.bytes, ctx.client_timeout, "relaying response")
                    .await
            {
                debug!(
                    peer = %ctx.peer,
                    error = %err,
                    "client went away during response relay"
                );
                return Ok(());
            }
            shutdown_stream(stream, ctx.client_timeout).await.ok();
            access_log(parsed, ctx.peer)
                .decision("FORWARD")
                .status(response.status)
                .cache_lookup("bypass")
                .cache_store("bypassed")
                .bytes(ctx.bytes_in, response.bytes.len() as u64)
                .elapsed(ctx.start.elapsed())
                .origin_addr(response.origin_addr.to_string())
                .log();
            Ok(())
        }
        Err(err) => respond_fetch_error(reader.get_mut(), parsed, err, "bypass", ctx).await,
    }
}

async fn respond_fetch_error<S>(
    stream: &mut S,
    parsed: &ParsedRequest,
    err: FetchError,
    cache_lookup: &str,
    ctx: &RequestContext,
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    warn!(
        peer = %ctx.peer,
        host = %parsed.host,
        port = parsed.port,
        error = %err,
        "origin fetch failed"
    );
    crate::metrics::record_origin_failure(err.metric_kind());
    respond_with_access_log(
        stream,
        err.client_status(),
        b"origin fetch failed\r\n",
        ctx.client_timeout,
        ctx.bytes_in,
        ctx.start.elapsed(),
        access_log(parsed, ctx.peer)
            .decision("ERROR")
            .cache_lookup(cache_lookup)
            .error_reason(err.to_string()),
    )
    .await
}

async fn relay_file<S>(stream: &mut S, path: &std::path::Path, timeout_dur: Duration) -> Result<u64>
where
    S: AsyncWrite + Unpin,
{
    let mut file = tokio::fs::File::open(path).await?;
    copy_with_write_timeout(&mut file, stream, timeout_dur, "relaying cached response").await
}

#[allow(clippy::too_many_arguments)]
async fn respond_with_access_log<S>(
    stream: &mut S,
    status: StatusCode,
    body: &[u8],
    timeout_dur: Duration,
    bytes_in: u64,
    elapsed: Duration,
    log_builder: AccessLogBuilder,
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let bytes_out = send_response(stream, status, body, timeout_dur).await?;
    shutdown_stream(stream, timeout_dur).await?;
    log_builder
        .status(status)
        .bytes(bytes_in, bytes_out as u64)
        .elapsed(elapsed)
        .log();
    Ok(())
}

pub async fn send_response<S>(
    stream: &mut S,
    status: StatusCode,
    body: &[u8],
    timeout_dur: Duration,
) -> Result<usize>
where
    S: AsyncWrite + Unpin,
{
    let reason = status.canonical_reason().unwrap_or("Unknown");
    let header = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n",
        status.as_u16(),
        reason,
        body.len()
    );
    write_all_with_timeout(
        stream,
        header.as_bytes(),
        timeout_dur,
        "writing response header",
    )
    .await?;
    let mut written = header.len();
    if !body.is_empty() {
        write_all_with_timeout(stream, body, timeout_dur, "writing response body").await?;
        written += body.len();
    }
    Ok(written)
}

pub async fn shutdown_stream<S>(stream: &mut S, timeout_dur: Duration) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    timeout_with_context(
        timeout_dur,
        stream.shutdown(),
        "shutting down client stream",
    )
    .await
}
