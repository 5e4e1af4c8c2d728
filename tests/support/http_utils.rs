use anyhow::Result;
use tokio::io::{AsyncRead, AsyncReadExt};

pub async fn read_http_response<S>(stream: &mut S) -> Result<String>
where
    S: AsyncRead + Unpin,
{
    let bytes = read_http_response_bytes(stream).await?;
    Ok(String::from_utf8_lossy(&bytes).to_string())
}

pub async fn read_http_response_bytes<S>(stream: &mut S) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await?;
    Ok(buf)
}
