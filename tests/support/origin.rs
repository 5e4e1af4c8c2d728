use std::net::Ipv4Addr;
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};
use std::time::Duration as StdDuration;

use anyhow::Result;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
};

/// Minimal HTTP origin that counts connections and captures the raw request
/// bytes it receives, so tests can assert both single-flight behavior and
/// byte-exact request forwarding.
pub struct MockOrigin {
    listener: TcpListener,
    pub connections: Arc<AtomicUsize>,
    pub received_requests: Arc<Mutex<Vec<Vec<u8>>>>,
    body: String,
    extra_headers: String,
    delay: Option<StdDuration>,
    silent: bool,
}

impl MockOrigin {
    pub async fn new() -> Result<Self> {
        Self::with_body("origin-response").await
    }

    pub async fn with_body(body: &str) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        Ok(Self {
            listener,
            connections: Arc::new(AtomicUsize::new(0)),
            received_requests: Arc::new(Mutex::new(Vec::new())),
            body: body.to_string(),
            extra_headers: String::new(),
            delay: None,
            silent: false,
        })
    }

    pub fn with_delay(mut self, delay: StdDuration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_extra_headers(mut self, headers: &str) -> Self {
        self.extra_headers = headers.to_string();
        self
    }

    /// Accept connections but never answer; used for read-timeout tests.
    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    pub fn port(&self) -> u16 {
        self.listener.local_addr().expect("local addr").port()
    }

    /// The exact response bytes the origin sends for every request.
    pub fn response_bytes(&self) -> Vec<u8> {
        format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n{}\r\n{}",
            self.body.len(),
            self.extra_headers,
            self.body
        )
        .into_bytes()
    }

    pub async fn run(self) -> Result<()> {
        let response = self.response_bytes();
        loop {
            let (mut socket, _) = self.listener.accept().await?;
            self.connections.fetch_add(1, Ordering::SeqCst);
            let received = self.received_requests.clone();
            let response = response.clone();
            let delay = self.delay;
            let silent = self.silent;
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let mut data = Vec::new();
                loop {
                    let read = socket.read(&mut buf).await.unwrap_or(0);
                    if read == 0 {
                        break;
                    }
                    data.extend_from_slice(&buf[..read]);
                    if request_is_complete(&data) {
                        break;
                    }
                }
                if data.is_empty() {
                    return;
                }
                received.lock().unwrap().push(data);

                if silent {
                    tokio::time::sleep(StdDuration::from_secs(60)).await;
                    return;
                }
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                socket.write_all(&response).await.ok();
                socket.shutdown().await.ok();
            });
        }
    }
}

/// The request is complete once the header block terminator has arrived and
/// any declared body length is satisfied.
fn request_is_complete(data: &[u8]) -> bool {
    let Some(head_end) = data
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|pos| pos + 4)
    else {
        return false;
    };
    let head = String::from_utf8_lossy(&data[..head_end]);
    let content_length = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    data.len() >= head_end + content_length
}
