//! Length-prefixed framing shared by every transport.
//!
//! ```text
//! ┌────────────────────┬──────────────────────────┐
//! │ body length (u32)  │ body (Fragment/Response) │
//! │ big-endian         │                          │
//! └────────────────────┴──────────────────────────┘
//! ```

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{OffloadError, Result};

/// Default largest frame body (64 MiB)
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Read one frame body.
///
/// Returns `Ok(None)` when the peer closed the stream on a frame boundary.
pub async fn read_frame<R>(reader: &mut R, max_bytes: usize) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(OffloadError::Transport(
                "Stream closed inside a frame header".to_string(),
            ));
        }
        filled += n;
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > max_bytes {
        return Err(OffloadError::Transport(format!(
            "Frame of {len} bytes exceeds limit of {max_bytes}"
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            OffloadError::Transport(format!("Stream closed inside a {len} byte frame"))
        } else {
            OffloadError::Io(e)
        }
    })?;
    Ok(Some(body))
}

/// Write one frame body and flush.
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(body.len()).map_err(|_| {
        OffloadError::Transport(format!("Frame of {} bytes is too large", body.len()))
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_in_order() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_frame(&mut client, b"first").await.unwrap();
        write_frame(&mut client, b"").await.unwrap();
        write_frame(&mut client, b"third").await.unwrap();
        drop(client);

        assert_eq!(read_frame(&mut server, 64).await.unwrap().unwrap(), b"first");
        assert_eq!(read_frame(&mut server, 64).await.unwrap().unwrap(), b"");
        assert_eq!(read_frame(&mut server, 64).await.unwrap().unwrap(), b"third");
        assert!(read_frame(&mut server, 64).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversize_rejected() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_frame(&mut client, &[0u8; 100]).await.unwrap();
        assert!(matches!(
            read_frame(&mut server, 10).await,
            Err(OffloadError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_truncated_frame() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(&[0, 0, 0, 9, b'a', b'b']).await.unwrap();
        drop(client);
        assert!(matches!(
            read_frame(&mut server, 64).await,
            Err(OffloadError::Transport(_))
        ));

        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(&[0, 0]).await.unwrap();
        drop(client);
        assert!(read_frame(&mut server, 64).await.is_err());
    }
}
