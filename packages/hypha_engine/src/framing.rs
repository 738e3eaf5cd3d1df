//! Tagged length-prefixed frames for the reference engine's stream protocol.
//!
//! Wire format: `[1-byte tag][4-byte big-endian length][payload]`
//!
//! Tag 0 carries a JSON-encoded [`LogEntry`]; tag 1 carries an opaque
//! extension payload.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{EngineError, LogEntry};

/// Maximum frame payload (1 MiB). Larger frames kill the stream.
const MAX_FRAME_SIZE: usize = 1024 * 1024;

const TAG_ENTRY: u8 = 0;
const TAG_EXTENSION: u8 = 1;

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Entry(LogEntry),
    Extension(Vec<u8>),
}

/// Write one frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Frame) -> Result<(), EngineError> {
    let (tag, payload) = match frame {
        Frame::Entry(entry) => (
            TAG_ENTRY,
            serde_json::to_vec(entry).map_err(|e| EngineError::Stream(format!("encode entry: {e}")))?,
        ),
        Frame::Extension(payload) => (TAG_EXTENSION, payload.clone()),
    };
    if payload.len() > MAX_FRAME_SIZE {
        return Err(EngineError::Stream(format!(
            "frame too large: {} bytes (max {MAX_FRAME_SIZE})",
            payload.len()
        )));
    }

    let len = (payload.len() as u32).to_be_bytes();
    w.write_all(&[tag])
        .await
        .map_err(|e| EngineError::Stream(e.to_string()))?;
    w.write_all(&len)
        .await
        .map_err(|e| EngineError::Stream(e.to_string()))?;
    w.write_all(&payload)
        .await
        .map_err(|e| EngineError::Stream(e.to_string()))?;
    Ok(())
}

/// Read one frame. Returns `None` on a clean end of stream.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<Frame>, EngineError> {
    let mut tag = [0u8; 1];
    match r.read_exact(&mut tag).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(EngineError::Stream(e.to_string())),
    }

    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf)
        .await
        .map_err(|e| EngineError::Stream(e.to_string()))?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(EngineError::Stream(format!(
            "frame too large: {len} bytes (max {MAX_FRAME_SIZE})"
        )));
    }

    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)
        .await
        .map_err(|e| EngineError::Stream(e.to_string()))?;

    match tag[0] {
        TAG_ENTRY => {
            let entry: LogEntry = serde_json::from_slice(&payload)
                .map_err(|e| EngineError::Stream(format!("decode entry: {e}")))?;
            Ok(Some(Frame::Entry(entry)))
        }
        TAG_EXTENSION => Ok(Some(Frame::Extension(payload))),
        other => Err(EngineError::Stream(format!("unknown frame tag {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hypha_identity::SigningKey;

    fn sample_entry() -> LogEntry {
        let sk = SigningKey::from_bytes([9u8; 32]);
        let writer = sk.public_key();
        let value = serde_json::json!({"table": {"a": 1}});
        let signature = sk.sign(&LogEntry::signing_bytes(&writer, 0, &value));
        LogEntry {
            writer,
            seq: 0,
            value,
            signature,
        }
    }

    #[tokio::test]
    async fn entry_frame_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let entry = sample_entry();
        write_frame(&mut a, &Frame::Entry(entry.clone())).await.unwrap();
        let frame = read_frame(&mut b).await.unwrap().unwrap();
        assert_eq!(frame, Frame::Entry(entry));
    }

    #[tokio::test]
    async fn extension_frame_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let payload = br#"{"action":"authorise"}"#.to_vec();
        write_frame(&mut a, &Frame::Extension(payload.clone()))
            .await
            .unwrap();
        let frame = read_frame(&mut b).await.unwrap().unwrap();
        assert_eq!(frame, Frame::Extension(payload));
    }

    #[tokio::test]
    async fn clean_close_yields_none() {
        let (a, mut b) = tokio::io::duplex(4096);
        drop(a);
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_write_rejected() {
        let (mut a, _b) = tokio::io::duplex(4096);
        let huge = vec![0u8; MAX_FRAME_SIZE + 1];
        assert!(write_frame(&mut a, &Frame::Extension(huge)).await.is_err());
    }

    #[tokio::test]
    async fn oversized_length_prefix_rejected() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        use tokio::io::AsyncWriteExt;
        // Hand-craft a frame header claiming 2 MiB.
        a.write_all(&[TAG_EXTENSION]).await.unwrap();
        a.write_all(&(2u32 * 1024 * 1024).to_be_bytes()).await.unwrap();
        assert!(read_frame(&mut b).await.is_err());
    }
}
