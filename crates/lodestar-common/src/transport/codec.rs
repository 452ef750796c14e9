use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::{LodestarError, Result};

/// Maximum frame size (100 MB)
pub const MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

/// JSON codec for request and response frames.
///
/// # Example
///
/// ```
/// use lodestar_common::transport::JsonCodec;
/// use lodestar_common::protocol::RequestFrame;
/// use serde_json::json;
///
/// let request = RequestFrame::new("printer", "print", json!({"doc": "a.txt"}));
/// let encoded = JsonCodec::encode(&request).unwrap();
/// let decoded: RequestFrame = JsonCodec::decode(&encoded).unwrap();
/// assert_eq!(request, decoded);
/// ```
pub struct JsonCodec;

impl JsonCodec {
    pub fn encode<T: Serialize>(frame: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(frame)?)
    }

    pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Writes one length-prefixed frame.
///
/// Wire format: `[4-byte length as u32 big-endian] + [JSON data]`
pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let data = JsonCodec::encode(frame)?;
    if data.len() > MAX_FRAME_SIZE {
        return Err(LodestarError::Protocol(format!(
            "Frame too large: {} bytes (max {} bytes)",
            data.len(),
            MAX_FRAME_SIZE
        )));
    }

    let len = data.len() as u32;
    writer
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|e| map_io_error(e, "writing length prefix"))?;
    writer
        .write_all(&data)
        .await
        .map_err(|e| map_io_error(e, "writing data"))?;
    writer
        .flush()
        .await
        .map_err(|e| map_io_error(e, "flushing stream"))?;
    Ok(())
}

/// What arrived at a frame boundary.
#[derive(Debug)]
pub enum Incoming<T> {
    Frame(T),
    /// A zero-length frame: the peer is closing and dispatched nothing
    /// after its last reply.
    CloseNotice,
    /// The stream ended without a close notice.
    Eof,
}

/// Writes a close notice, the zero-length frame announcing a graceful close.
pub async fn write_close_notice<W>(writer: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(&0u32.to_be_bytes())
        .await
        .map_err(|e| map_io_error(e, "writing close notice"))?;
    writer
        .flush()
        .await
        .map_err(|e| map_io_error(e, "flushing stream"))
}

/// Reads one length-prefixed frame, a close notice, or the end of the stream.
///
/// End of stream inside a frame is a lost connection.
pub async fn read_incoming<R, T>(reader: &mut R) -> Result<Incoming<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(Incoming::Eof),
        Err(e) => return Err(map_io_error(e, "reading length prefix")),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 {
        return Ok(Incoming::CloseNotice);
    }
    if len > MAX_FRAME_SIZE {
        return Err(LodestarError::Protocol(format!(
            "Frame too large: {} bytes (max {} bytes)",
            len, MAX_FRAME_SIZE
        )));
    }

    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| map_io_error(e, "reading data"))?;

    JsonCodec::decode(&buf)
        .map(Incoming::Frame)
        .map_err(|e| LodestarError::Protocol(format!("undecodable frame: {}", e)))
}

/// Reads one length-prefixed frame.
///
/// A close notice or the end of the stream at a frame boundary yields
/// `ConnectionClosed { by_peer: true }`. Use [`read_incoming`] where the two
/// must be told apart.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    match read_incoming(reader).await? {
        Incoming::Frame(frame) => Ok(frame),
        Incoming::CloseNotice | Incoming::Eof => Err(LodestarError::ConnectionClosed { by_peer: true }),
    }
}

/// Map IO errors to transport failures.
pub(crate) fn map_io_error(err: std::io::Error, context: &str) -> LodestarError {
    match err.kind() {
        std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::NotConnected
        | std::io::ErrorKind::UnexpectedEof => {
            LodestarError::ConnectionLost(format!("{}: {}", context, err))
        }
        _ => LodestarError::Io(err),
    }
}
