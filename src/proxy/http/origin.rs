use std::net::SocketAddr;
use std::time::Duration;

use http::StatusCode;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use super::codec::parse_status_line;

const READ_CHUNK_SIZE: usize = 16 * 1024;
const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Failure classification for origin fetches. The variants map onto the
/// client-facing status: timeouts become 504, everything else 502.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("failed to resolve origin {host}:{port}: {source}")]
    Resolve {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("timed out resolving origin {host}:{port}")]
    ResolveTimeout { host: String, port: u16 },
    #[error("no addresses found for origin {host}:{port}")]
    NoAddresses { host: String, port: u16 },
    #[error("timed out connecting to origin {host}:{port}")]
    ConnectTimeout { host: String, port: u16 },
    #[error("failed to connect to origin {host}:{port}: {source}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to send request to origin {host}:{port}: {source}")]
    Send {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("timed out reading response from origin {host}:{port}")]
    ReadTimeout { host: String, port: u16 },
    #[error("failed to read response from origin {host}:{port}: {source}")]
    Read {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("origin {host}:{port} closed the connection mid-response")]
    Truncated { host: String, port: u16 },
    #[error("malformed response from origin {host}:{port}: {reason}")]
    Malformed {
        host: String,
        port: u16,
        reason: String,
    },
    #[error("origin response exceeds configured limit of {limit} bytes")]
    TooLarge { limit: u64 },
}

impl FetchError {
    pub fn client_status(&self) -> StatusCode {
        match self {
            FetchError::ResolveTimeout { .. }
            | FetchError::ConnectTimeout { .. }
            | FetchError::ReadTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn metric_kind(&self) -> &'static str {
        match self {
            FetchError::Resolve { .. } => "resolve",
            FetchError::ResolveTimeout { .. } => "resolve_timeout",
            FetchError::NoAddresses { .. } => "no_addresses",
            FetchError::ConnectTimeout { .. } => "connect_timeout",
            FetchError::Connect { .. } => "connect",
            FetchError::Send { .. } => "send",
            FetchError::ReadTimeout { .. } => "read_timeout",
            FetchError::Read { .. } => "read",
            FetchError::Truncated { .. } => "truncated",
            FetchError::Malformed { .. } => "malformed",
            FetchError::TooLarge { .. } => "too_large",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OriginTimeouts {
    pub connect: Duration,
    pub read: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct OriginLimits {
    pub max_header_bytes: usize,
    pub max_response_bytes: u64,
}

/// A complete origin response: the raw bytes as received plus the minimal
/// head fields the pipeline and cache need. The fetcher never rewrites the
/// bytes it relays.
#[derive(Debug, Clone)]
pub struct OriginResponse {
    pub bytes: Vec<u8>,
    pub status: StatusCode,
    pub content_length: Option<u64>,
    pub origin_addr: SocketAddr,
}

/// Open a fresh connection to the origin, forward the request bytes
/// verbatim, and read a complete response. The response is complete when a
/// declared Content-Length is satisfied, the origin closes the connection,
/// or (for HEAD requests) the header block ends.
pub async fn fetch_origin(
    host: &str,
    port: u16,
    request: &[u8],
    expect_body: bool,
    timeouts: &OriginTimeouts,
    limits: &OriginLimits,
) -> Result<OriginResponse, FetchError> {
    let addresses = resolve(host, port, timeouts.connect).await?;
    let (mut stream, origin_addr) = connect_to_addrs(host, port, &addresses, timeouts.connect).await?;

    match timeout(timeouts.read, stream.write_all(request)).await {
        Ok(Ok(())) => {}
        Ok(Err(source)) => {
            return Err(FetchError::Send {
                host: host.to_string(),
                port,
                source,
            });
        }
        Err(_) => {
            return Err(FetchError::Send {
                host: host.to_string(),
                port,
                source: std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "timed out sending request",
                ),
            });
        }
    }

    let response = read_response(&mut stream, host, port, expect_body, timeouts, limits).await?;
    stream.shutdown().await.ok();
    Ok(OriginResponse {
        bytes: response.bytes,
        status: response.status,
        content_length: response.content_length,
        origin_addr,
    })
}

async fn resolve(
    host: &str,
    port: u16,
    timeout_dur: Duration,
) -> Result<Vec<SocketAddr>, FetchError> {
    let lookup = tokio::net::lookup_host((host, port));
    let addresses: Vec<SocketAddr> = match timeout(timeout_dur, lookup).await {
        Ok(Ok(addrs)) => addrs.collect(),
        Ok(Err(source)) => {
            return Err(FetchError::Resolve {
                host: host.to_string(),
                port,
                source,
            });
        }
        Err(_) => {
            return Err(FetchError::ResolveTimeout {
                host: host.to_string(),
                port,
            });
        }
    };
    if addresses.is_empty() {
        return Err(FetchError::NoAddresses {
            host: host.to_string(),
            port,
        });
    }
    Ok(addresses)
}

async fn connect_to_addrs(
    host: &str,
    port: u16,
    addrs: &[SocketAddr],
    connect_timeout: Duration,
) -> Result<(TcpStream, SocketAddr), FetchError> {
    let mut last_err = None;
    for addr in addrs {
        match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                if let Err(err) = stream.set_nodelay(true) {
                    debug!(
                        origin = %addr,
                        error = %err,
                        "failed to set TCP_NODELAY on origin stream"
                    );
                }
                debug!(origin = %addr, "connected to origin");
                return Ok((stream, *addr));
            }
            Ok(Err(source)) => {
                last_err = Some(FetchError::Connect {
                    host: host.to_string(),
                    port,
                    source,
                });
            }
            Err(_) => {
                last_err = Some(FetchError::ConnectTimeout {
                    host: host.to_string(),
                    port,
                });
            }
        }
    }
    Err(last_err.unwrap_or(FetchError::NoAddresses {
        host: host.to_string(),
        port,
    }))
}

struct RawResponse {
    bytes: Vec<u8>,
    status: StatusCode,
    content_length: Option<u64>,
}

async fn read_response(
    stream: &mut TcpStream,
    host: &str,
    port: u16,
    expect_body: bool,
    timeouts: &OriginTimeouts,
    limits: &OriginLimits,
) -> Result<RawResponse, FetchError> {
    let mut bytes = Vec::with_capacity(READ_CHUNK_SIZE);
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    // Head phase: accumulate until the blank-line terminator.
    let head_len = loop {
        if let Some(pos) = find_head_terminator(&bytes) {
            break pos + HEAD_TERMINATOR.len();
        }
        if bytes.len() > limits.max_header_bytes {
            return Err(FetchError::Malformed {
                host: host.to_string(),
                port,
                reason: format!(
                    "response headers exceed limit of {} bytes",
                    limits.max_header_bytes
                ),
            });
        }
        let read = read_chunk(stream, &mut chunk, host, port, timeouts.read).await?;
        if read == 0 {
            return Err(FetchError::Truncated {
                host: host.to_string(),
                port,
            });
        }
        bytes.extend_from_slice(&chunk[..read]);
    };

    let (status, content_length) = parse_response_head(&bytes[..head_len], host, port)?;

    // A HEAD response carries no body even when it declares a length.
    if !expect_body {
        bytes.truncate(head_len);
        return Ok(RawResponse {
            bytes,
            status,
            content_length,
        });
    }

    let expected_total = content_length.map(|length| head_len as u64 + length);
    loop {
        if let Some(expected) = expected_total {
            if bytes.len() as u64 >= expected {
                bytes.truncate(expected as usize);
                break;
            }
        }
        if bytes.len() as u64 > limits.max_response_bytes {
            return Err(FetchError::TooLarge {
                limit: limits.max_response_bytes,
            });
        }
        let read = read_chunk(stream, &mut chunk, host, port, timeouts.read).await?;
        if read == 0 {
            match expected_total {
                // Declared length not satisfied: the partial body is discarded
                // with the error, never surfaced or cached.
                Some(_) => {
                    return Err(FetchError::Truncated {
                        host: host.to_string(),
                        port,
                    });
                }
                None => break,
            }
        }
        bytes.extend_from_slice(&chunk[..read]);
    }

    if bytes.len() as u64 > limits.max_response_bytes {
        return Err(FetchError::TooLarge {
            limit: limits.max_response_bytes,
        });
    }

    Ok(RawResponse {
        bytes,
        status,
        content_length,
    })
}

async fn read_chunk(
    stream: &mut TcpStream,
    chunk: &mut [u8],
    host: &str,
    port: u16,
    read_timeout: Duration,
) -> Result<usize, FetchError> {
    match timeout(read_timeout, stream.read(chunk)).await {
        Ok(Ok(read)) => Ok(read),
        Ok(Err(source)) => Err(FetchError::Read {
            host: host.to_string(),
            port,
            source,
        }),
        Err(_) => Err(FetchError::ReadTimeout {
            host: host.to_string(),
            port,
        }),
    }
}

fn find_head_terminator(bytes: &[u8]) -> Option<usize> {
    bytes
        .windows(HEAD_TERMINATOR.len())
        .position(|window| window == HEAD_TERMINATOR)
}

fn parse_response_head(
    head: &[u8],
    host: &str,
    port: u16,
) -> Result<(StatusCode, Option<u64>), FetchError> {
    let malformed = |reason: String| FetchError::Malformed {
        host: host.to_string(),
        port,
        reason,
    };

    let text = std::str::from_utf8(head)
        .map_err(|_| malformed("response head contained invalid bytes".to_string()))?;
    let mut lines = text.split("\r\n");
    let status_line = lines
        .next()
        .ok_or_else(|| malformed("missing status line".to_string()))?;
    let (_version, status) =
        parse_status_line(status_line).map_err(|err| malformed(err.to_string()))?;

    let mut content_length = None;
    for line in lines {
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case("content-length") {
            let parsed: u64 = value
                .trim()
                .parse()
                .map_err(|_| malformed(format!("invalid Content-Length value '{}'", value.trim())))?;
            if let Some(existing) = content_length
                && existing != parsed
            {
                return Err(malformed("conflicting Content-Length headers".to_string()));
            }
            content_length = Some(parsed);
        }
    }

    Ok((status, content_length))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::io::AsyncReadExt as _;
    use tokio::net::TcpListener;

    fn timeouts() -> OriginTimeouts {
        OriginTimeouts {
            connect: Duration::from_secs(1),
            read: Duration::from_millis(500),
        }
    }

    fn limits() -> OriginLimits {
        OriginLimits {
            max_header_bytes: 8 * 1024,
            max_response_bytes: 1024 * 1024,
        }
    }

    async fn spawn_origin(response: &'static [u8]) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut buf = [0u8; 4096];
            let mut data = Vec::new();
            loop {
                let read = socket.read(&mut buf).await.unwrap_or(0);
                if read == 0 {
                    return;
                }
                data.extend_from_slice(&buf[..read]);
                if data.windows(4).any(|window| window == b"\r\n\r\n") {
                    break;
                }
            }
            socket.write_all(response).await.expect("write response");
            socket.shutdown().await.ok();
        });
        Ok(addr)
    }

    #[tokio::test]
    async fn fetches_complete_response_with_content_length() -> anyhow::Result<()> {
        let response: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        let addr = spawn_origin(response).await?;
        let fetched = fetch_origin(
            "127.0.0.1",
            addr.port(),
            b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n",
            true,
            &timeouts(),
            &limits(),
        )
        .await
        .expect("fetch should succeed");
        assert_eq!(fetched.bytes, response);
        assert_eq!(fetched.status, StatusCode::OK);
        assert_eq!(fetched.content_length, Some(5));
        Ok(())
    }

    #[tokio::test]
    async fn reads_until_close_without_content_length() -> anyhow::Result<()> {
        let response: &[u8] = b"HTTP/1.0 200 OK\r\nConnection: close\r\n\r\nstreamed-until-close";
        let addr = spawn_origin(response).await?;
        let fetched = fetch_origin(
            "127.0.0.1",
            addr.port(),
            b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n",
            true,
            &timeouts(),
            &limits(),
        )
        .await
        .expect("fetch should succeed");
        assert_eq!(fetched.bytes, response);
        assert_eq!(fetched.content_length, None);
        Ok(())
    }

    #[tokio::test]
    async fn head_response_completes_at_header_block() -> anyhow::Result<()> {
        let response: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 1000\r\n\r\n";
        let addr = spawn_origin(response).await?;
        let fetched = fetch_origin(
            "127.0.0.1",
            addr.port(),
            b"HEAD / HTTP/1.1\r\nHost: localhost\r\n\r\n",
            false,
            &timeouts(),
            &limits(),
        )
        .await
        .expect("HEAD fetch should succeed");
        assert_eq!(fetched.bytes, response);
        assert_eq!(fetched.content_length, Some(1000));
        Ok(())
    }

    #[tokio::test]
    async fn connection_refused_maps_to_bad_gateway() {
        // Bind then drop to get a port that refuses connections.
        let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = fetch_origin(
            "127.0.0.1",
            port,
            b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n",
            true,
            &timeouts(),
            &limits(),
        )
        .await
        .expect_err("connect should fail");
        assert!(matches!(err, FetchError::Connect { .. }), "got {err:?}");
        assert_eq!(err.client_status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn silent_origin_maps_to_gateway_timeout() -> anyhow::Result<()> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.expect("accept");
            // Hold the socket open without responding.
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let err = fetch_origin(
            "127.0.0.1",
            addr.port(),
            b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n",
            true,
            &timeouts(),
            &limits(),
        )
        .await
        .expect_err("read should time out");
        assert!(matches!(err, FetchError::ReadTimeout { .. }), "got {err:?}");
        assert_eq!(err.client_status(), StatusCode::GATEWAY_TIMEOUT);
        Ok(())
    }

    #[tokio::test]
    async fn truncated_body_is_an_error() -> anyhow::Result<()> {
        let response: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\nshort";
        let addr = spawn_origin(response).await?;
        let err = fetch_origin(
            "127.0.0.1",
            addr.port(),
            b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n",
            true,
            &timeouts(),
            &limits(),
        )
        .await
        .expect_err("truncated body should fail");
        assert!(matches!(err, FetchError::Truncated { .. }), "got {err:?}");
        Ok(())
    }

    #[tokio::test]
    async fn oversized_response_is_rejected() -> anyhow::Result<()> {
        let response: &'static [u8] =
            b"HTTP/1.1 200 OK\r\nContent-Length: 4096\r\n\r\n";
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            socket.write_all(response).await.expect("write head");
            socket.write_all(&[0u8; 4096]).await.expect("write body");
            socket.shutdown().await.ok();
        });

        let small_limits = OriginLimits {
            max_header_bytes: 8 * 1024,
            max_response_bytes: 512,
        };
        let err = fetch_origin(
            "127.0.0.1",
            addr.port(),
            b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n",
            true,
            &timeouts(),
            &small_limits,
        )
        .await
        .expect_err("oversized response should fail");
        assert!(matches!(err, FetchError::TooLarge { .. }), "got {err:?}");
        Ok(())
    }

    #[test]
    fn response_head_parsing_extracts_status_and_length() {
        let head = b"HTTP/1.1 404 Not Found\r\nServer: test\r\nContent-Length: 9\r\n\r\n";
        let (status, length) = parse_response_head(head, "example.com", 80).unwrap();
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(length, Some(9));
    }

    #[test]
    fn response_head_rejects_conflicting_lengths() {
        let head = b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\nContent-Length: 2\r\n\r\n";
        let err = parse_response_head(head, "example.com", 80).unwrap_err();
        assert!(matches!(err, FetchError::Malformed { .. }));
    }
}
