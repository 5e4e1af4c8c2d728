use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail, ensure};
use http::{Method, StatusCode, Version};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::time::Instant;

use crate::util::timeout_with_context;

#[derive(Clone, Debug)]
pub struct HeaderLine {
    pub name: String,
    pub value: String,
    lower_name: String,
}

impl HeaderLine {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        let name_string = name.into();
        let lower_name = name_string.to_ascii_lowercase();
        let value_string = value.into();
        Self {
            name: name_string,
            value: value_string,
            lower_name,
        }
    }

    pub fn lower_name(&self) -> &str {
        &self.lower_name
    }
}

/// Ordered collection of request headers. Order is preserved because the raw
/// header block is relayed byte-exact to the origin; this structure only
/// answers questions the pipeline needs (host, body length).
#[derive(Default, Debug)]
pub struct HeaderAccumulator {
    headers: Vec<HeaderLine>,
    total_bytes: usize,
}

impl HeaderAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one header line (without its terminator). Returns an error for
    /// lines that are not `Name: value` shaped.
    pub fn push_line(&mut self, line: &str, line_bytes: usize) -> Result<()> {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| anyhow!("header missing ':' separator"))?;
        let name = name.trim();
        let value = value.trim();
        if name.is_empty() {
            bail!("header name must not be empty");
        }
        self.total_bytes += line_bytes;
        self.headers.push(HeaderLine::new(name, value));
        Ok(())
    }

    pub fn host(&self) -> Option<&str> {
        self.headers
            .iter()
            .find(|header| header.lower_name() == "host")
            .map(|header| header.value.as_str())
    }

    pub fn content_length(&self) -> Result<Option<u64>> {
        let mut length = None;
        for header in &self.headers {
            if header.lower_name() != "content-length" {
                continue;
            }
            let parsed: u64 = header
                .value
                .parse()
                .with_context(|| format!("invalid Content-Length value '{}'", header.value))?;
            if let Some(existing) = length
                && existing != parsed
            {
                bail!("conflicting Content-Length headers");
            }
            length = Some(parsed);
        }
        Ok(length)
    }

    pub fn iter(&self) -> impl Iterator<Item = &HeaderLine> {
        self.headers.iter()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }
}

#[derive(Debug)]
pub struct RequestHead {
    pub method: Method,
    pub target: String,
    pub headers: HeaderAccumulator,
    /// Request line plus header block exactly as received, terminator included.
    pub raw: Vec<u8>,
}

impl RequestHead {
    pub fn head_bytes(&self) -> u64 {
        self.raw.len() as u64
    }
}

/// Read the request line and header block incrementally until the blank-line
/// terminator, a size budget violation, or the deadline. Returns `Ok(None)`
/// when the client closes the connection before sending anything.
pub async fn read_request_head<S>(
    reader: &mut BufReader<S>,
    peer: SocketAddr,
    timeout: Duration,
    max_header_bytes: usize,
) -> Result<Option<RequestHead>>
where
    S: AsyncRead + Unpin,
{
    ensure!(
        max_header_bytes > 0,
        "request header limit must be greater than zero"
    );
    let deadline = Instant::now() + timeout;
    let mut raw = Vec::new();

    let Some(line) = read_raw_line(reader, peer, deadline, max_header_bytes).await? else {
        return Ok(None);
    };
    raw.extend_from_slice(&line);

    let request_line = decode_line(&line, peer)?;
    if request_line.is_empty() {
        bail!("empty request line from {peer}");
    }

    let mut parts = request_line.split_whitespace();
    let method_str = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing method"))?;
    let target = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing target"))?;
    let version = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing version"))?;
    match version {
        "HTTP/1.1" | "HTTP/1.0" => {}
        other => bail!("invalid HTTP version '{other}'"),
    }

    let method = Method::from_bytes(method_str.as_bytes())
        .with_context(|| format!("invalid method '{method_str}'"))?;
    let target = target.to_string();

    let mut headers = HeaderAccumulator::new();
    loop {
        let remaining = max_header_bytes
            .checked_sub(raw.len())
            .filter(|remaining| *remaining > 0)
            .ok_or_else(|| anyhow!("request headers exceed configured limit for {peer}"))?;
        let line = read_raw_line(reader, peer, deadline, remaining)
            .await?
            .ok_or_else(|| anyhow!("connection closed during request headers from {peer}"))?;
        raw.extend_from_slice(&line);
        let text = decode_line(&line, peer)?;
        if text.is_empty() {
            break;
        }
        headers
            .push_line(&text, line.len())
            .with_context(|| format!("invalid header from {peer}"))?;
    }

    Ok(Some(RequestHead {
        method,
        target,
        headers,
        raw,
    }))
}

/// Read exactly `length` body bytes, bounding each read by the deadline.
pub async fn read_request_body<S>(
    reader: &mut BufReader<S>,
    peer: SocketAddr,
    length: usize,
    timeout: Duration,
) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let deadline = Instant::now() + timeout;
    let mut body = vec![0u8; length];
    let mut filled = 0usize;
    let context = format!("reading request body from {peer}");
    while filled < length {
        let remaining = remaining_deadline(deadline, &context)?;
        let read =
            timeout_with_context(remaining, reader.read(&mut body[filled..]), context.as_str())
                .await?;
        if read == 0 {
            bail!("connection closed before complete request body from {peer}");
        }
        filled += read;
    }
    Ok(body)
}

/// Read one line including its `\n` terminator, as raw bytes. Returns
/// `Ok(None)` on EOF before any byte arrives.
async fn read_raw_line<S>(
    reader: &mut BufReader<S>,
    peer: SocketAddr,
    deadline: Instant,
    max_len: usize,
) -> Result<Option<Vec<u8>>>
where
    S: AsyncRead + Unpin,
{
    ensure!(max_len > 0, "line length limit must be greater than zero");
    let mut collected = Vec::new();
    let context = format!("reading request head from {peer}");

    loop {
        let remaining = remaining_deadline(deadline, &context)?;
        let available =
            timeout_with_context(remaining, reader.fill_buf(), context.as_str()).await?;

        if available.is_empty() {
            if collected.is_empty() {
                return Ok(None);
            }
            bail!("connection closed mid-line from {peer}");
        }

        let newline_pos = available.iter().position(|byte| *byte == b'\n');
        let consume = newline_pos.map(|idx| idx + 1).unwrap_or(available.len());

        if collected.len() + consume > max_len {
            bail!("line from {peer} exceeds configured limit of {max_len} bytes");
        }

        collected.extend_from_slice(&available[..consume]);
        reader.consume(consume);

        if newline_pos.is_some() {
            break;
        }
    }

    Ok(Some(collected))
}

/// Decode a raw line into trimmed text, validating UTF-8 and the terminator.
fn decode_line(line: &[u8], peer: SocketAddr) -> Result<String> {
    let text = std::str::from_utf8(line)
        .map_err(|_| anyhow!("line from {peer} contained invalid bytes"))?;
    if !text.ends_with('\n') {
        bail!("line from {peer} missing newline terminator");
    }
    Ok(text.trim_end_matches(['\r', '\n']).to_string())
}

fn remaining_deadline(deadline: Instant, context: &str) -> Result<Duration> {
    deadline
        .checked_duration_since(Instant::now())
        .ok_or_else(|| anyhow!("timed out {context}"))
}

pub fn parse_status_line(value: &str) -> Result<(Version, StatusCode)> {
    let mut parts = value.split_whitespace();
    let version = parts
        .next()
        .ok_or_else(|| anyhow!("status line missing HTTP version"))?;
    let status = parts
        .next()
        .ok_or_else(|| anyhow!("status line missing status code"))?;

    let version = match version {
        "HTTP/1.1" => Version::HTTP_11,
        "HTTP/1.0" => Version::HTTP_10,
        other => bail!("invalid HTTP version '{other}'"),
    };

    let status_code: u16 = status
        .parse()
        .with_context(|| format!("invalid status code '{status}'"))?;
    let status = StatusCode::from_u16(status_code)
        .map_err(|_| anyhow!("unsupported status code '{status_code}'"))?;

    Ok((version, status))
}
