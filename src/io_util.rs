use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::util::timeout_with_context;

const COPY_CHUNK_SIZE: usize = 16 * 1024;

/// Write the whole buffer, bounding each write by the supplied timeout. A slow
/// or stalled reader on the other end surfaces as a timeout error rather than
/// blocking the connection handler indefinitely.
pub async fn write_all_with_timeout<S>(
    stream: &mut S,
    bytes: &[u8],
    timeout_dur: Duration,
    context: &str,
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    timeout_with_context(timeout_dur, stream.write_all(bytes), context).await
}

/// Copy reader to writer in chunks until EOF, bounding each read and write by
/// the supplied timeout. Returns the number of bytes copied.
pub async fn copy_with_write_timeout<R, W>(
    reader: &mut R,
    writer: &mut W,
    timeout_dur: Duration,
    context: &str,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; COPY_CHUNK_SIZE];
    let mut copied = 0u64;
    loop {
        let read = timeout_with_context(timeout_dur, reader.read(&mut buf), context).await?;
        if read == 0 {
            break;
        }
        timeout_with_context(timeout_dur, writer.write_all(&buf[..read]), context).await?;
        copied += read as u64;
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn copy_reports_bytes_copied() -> Result<()> {
        let payload = vec![7u8; COPY_CHUNK_SIZE * 2 + 11];
        let mut reader = &payload[..];
        let mut sink = Vec::new();
        let copied = copy_with_write_timeout(
            &mut reader,
            &mut sink,
            Duration::from_secs(1),
            "copying test payload",
        )
        .await?;
        assert_eq!(copied, payload.len() as u64);
        assert_eq!(sink, payload);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn write_times_out_when_peer_stalls() {
        let (mut writer, _reader) = tokio::io::duplex(64);
        let payload = vec![0u8; 1024];
        let task = tokio::spawn(async move {
            write_all_with_timeout(
                &mut writer,
                &payload,
                Duration::from_millis(50),
                "writing to stalled peer",
            )
            .await
        });
        tokio::time::advance(Duration::from_millis(100)).await;
        let err = task.await.expect("join").expect_err("should time out");
        assert!(err.to_string().contains("timed out"));
    }
}
