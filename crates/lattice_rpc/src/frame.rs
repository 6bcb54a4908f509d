//! Length-prefixed wire frames for the RPC transport.
//!
//! Two frame shapes travel over a connection, both prefixed with the total
//! length of everything that follows the prefix:
//!
//! ```text
//! Request : total(i32) | method_len(i32) | method(utf8) | payload_len(i32) | payload
//! Response: total(i32) | error_len(i32)  | error(utf8)  | payload_len(i32) | payload
//! ```
//!
//! All integers are 4-byte big-endian signed. An empty error string in a
//! response frame means success. A zero-length payload is encoded as a
//! zero length field and round-trips as an empty byte vector.
//!
//! The protocol itself imposes no payload ceiling; readers take a
//! `max_frame_len` guard so the embedding component decides its own
//! resource-exhaustion policy.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frame length guard used by the client and server unless overridden.
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// A decoded request frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    /// Method name the caller wants dispatched.
    pub method: String,
    /// Opaque request payload, already serialized by the caller.
    pub payload: Vec<u8>,
}

/// A decoded response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    /// Application error message; empty means the call succeeded.
    pub error: String,
    /// Opaque response payload.
    pub payload: Vec<u8>,
}

/// Errors produced while encoding or decoding frames.
///
/// Every decode-side variant other than `Io` is fatal to the connection:
/// once framing is lost there is no way to resynchronize the stream.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("i/o error on frame stream: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid total frame length {0}")]
    InvalidLength(i32),

    #[error("frame length {len} exceeds limit {max}")]
    TooLarge { len: i32, max: usize },

    #[error("frame truncated reading {field}")]
    Truncated { field: &'static str },

    #[error("{field} is not valid utf-8")]
    InvalidUtf8 { field: &'static str },

    #[error("{field} of {len} bytes does not fit in a frame")]
    FieldTooLong { field: &'static str, len: usize },
}

fn put_i32(buf: &mut Vec<u8>, value: i32) {
    buf.extend_from_slice(&value.to_be_bytes());
}

fn field_len(field: &'static str, bytes: &[u8]) -> Result<i32, FrameError> {
    i32::try_from(bytes.len()).map_err(|_| FrameError::FieldTooLong {
        field,
        len: bytes.len(),
    })
}

/// Encodes a request frame, length prefix included, into one contiguous
/// buffer so a frame is always a single write on the stream.
pub fn encode_request(method: &str, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    encode(
        ("method name", method.as_bytes()),
        ("request payload", payload),
    )
}

/// Encodes a response frame. An empty `error` marks success.
pub fn encode_response(error: &str, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    encode(
        ("error string", error.as_bytes()),
        ("response payload", payload),
    )
}

fn encode(
    (head_name, head): (&'static str, &[u8]),
    (body_name, body): (&'static str, &[u8]),
) -> Result<Vec<u8>, FrameError> {
    let head_len = field_len(head_name, head)?;
    let body_len = field_len(body_name, body)?;
    let total = 8i64 + head.len() as i64 + body.len() as i64;
    let total = i32::try_from(total).map_err(|_| FrameError::FieldTooLong {
        field: "frame",
        len: head.len() + body.len(),
    })?;

    let mut buf = Vec::with_capacity(4 + total as usize);
    put_i32(&mut buf, total);
    put_i32(&mut buf, head_len);
    buf.extend_from_slice(head);
    put_i32(&mut buf, body_len);
    buf.extend_from_slice(body);
    Ok(buf)
}

/// Reads one request frame from the stream.
///
/// Returns `Ok(None)` when the peer closed the connection cleanly, i.e. EOF
/// arrived before any byte of the length prefix. EOF anywhere after that is
/// a truncated frame and surfaces as an `Io` error.
pub async fn read_request<R>(
    stream: &mut R,
    max_frame_len: usize,
) -> Result<Option<RequestFrame>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let Some(frame) = read_frame(stream, max_frame_len).await? else {
        return Ok(None);
    };
    let (method, payload) = split_frame(&frame, "method name")?;
    let method = String::from_utf8(method).map_err(|_| FrameError::InvalidUtf8 {
        field: "method name",
    })?;
    Ok(Some(RequestFrame { method, payload }))
}

/// Reads one response frame from the stream. Same EOF contract as
/// [`read_request`].
pub async fn read_response<R>(
    stream: &mut R,
    max_frame_len: usize,
) -> Result<Option<ResponseFrame>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let Some(frame) = read_frame(stream, max_frame_len).await? else {
        return Ok(None);
    };
    let (error, payload) = split_frame(&frame, "error string")?;
    let error = String::from_utf8(error).map_err(|_| FrameError::InvalidUtf8 {
        field: "error string",
    })?;
    Ok(Some(ResponseFrame { error, payload }))
}

/// Writes an encoded frame to the stream and flushes it.
pub async fn write_frame<W>(stream: &mut W, frame: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    stream.write_all(frame).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_frame<R>(stream: &mut R, max_frame_len: usize) -> Result<Option<Vec<u8>>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 4];
    match stream.read_exact(&mut prefix).await {
        Ok(_) => {}
        // EOF on the prefix is a clean close, not a protocol violation.
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let total = i32::from_be_bytes(prefix);
    if total <= 0 {
        return Err(FrameError::InvalidLength(total));
    }
    if total as usize > max_frame_len {
        return Err(FrameError::TooLarge {
            len: total,
            max: max_frame_len,
        });
    }

    let mut frame = vec![0u8; total as usize];
    stream.read_exact(&mut frame).await?;
    Ok(Some(frame))
}

/// Splits a frame body into its string field and payload, validating that
/// the inner length fields stay inside the frame.
fn split_frame(frame: &[u8], head_name: &'static str) -> Result<(Vec<u8>, Vec<u8>), FrameError> {
    let (head, rest) = take_field(frame, head_name)?;
    let (payload, _) = take_field(rest, "payload")?;
    Ok((head.to_vec(), payload.to_vec()))
}

fn take_field<'a>(
    data: &'a [u8],
    field: &'static str,
) -> Result<(&'a [u8], &'a [u8]), FrameError> {
    if data.len() < 4 {
        return Err(FrameError::Truncated { field });
    }
    let len = i32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    if len < 0 || data.len() - 4 < len as usize {
        return Err(FrameError::Truncated { field });
    }
    let (value, rest) = data[4..].split_at(len as usize);
    Ok((value, rest))
}
