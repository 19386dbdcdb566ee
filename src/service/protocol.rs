//! Wire protocol for the Coordination Service.
//!
//! Frame = 4-byte big-endian unsigned length + UTF-8 JSON body.
//! Request: `{"action": <string>, "params": {...}}`
//! Response: `{"status":"success","data":<any>}` or
//! `{"status":"error","message":<string>}`.
//! A connection may carry several sequential request/response pairs.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame either side accepts by default (16 MiB)
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 4;
const READ_CHUNK: usize = 4096;

/// Framing and encoding failures
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Peer closed the connection cleanly between frames
    #[error("Connection closed")]
    Closed,

    #[error("Truncated frame: expected {expected} bytes, received {received}")]
    Truncated { expected: usize, received: usize },

    #[error("Frame of {size} bytes exceeds limit of {limit} bytes")]
    TooLarge { size: usize, limit: usize },

    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A request frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub action: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl Request {
    pub fn new(action: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            action: action.into(),
            params,
        }
    }
}

/// A response frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Response {
    Success {
        #[serde(default)]
        data: serde_json::Value,
    },
    Error {
        message: String,
    },
}

impl Response {
    pub fn success(data: serde_json::Value) -> Self {
        Self::Success { data }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

/// Read one frame body. Loops until exactly the announced length arrives,
/// never assuming one read returns the whole payload.
pub async fn read_frame<R>(reader: &mut R, max_frame_bytes: usize) -> Result<Vec<u8>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            return Err(if filled == 0 {
                ProtocolError::Closed
            } else {
                ProtocolError::Truncated {
                    expected: HEADER_LEN,
                    received: filled,
                }
            });
        }
        filled += n;
    }

    let expected = u32::from_be_bytes(header) as usize;
    if expected > max_frame_bytes {
        return Err(ProtocolError::TooLarge {
            size: expected,
            limit: max_frame_bytes,
        });
    }

    let mut body = Vec::with_capacity(expected);
    let mut chunk = [0u8; READ_CHUNK];
    while body.len() < expected {
        let want = (expected - body.len()).min(READ_CHUNK);
        let n = reader.read(&mut chunk[..want]).await?;
        if n == 0 {
            return Err(ProtocolError::Truncated {
                expected,
                received: body.len(),
            });
        }
        body.extend_from_slice(&chunk[..n]);
    }

    Ok(body)
}

/// Write one frame and flush
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(body.len()).map_err(|_| ProtocolError::TooLarge {
        size: body.len(),
        limit: u32::MAX as usize,
    })?;

    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(body);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Serialize and send a message
pub async fn send_message<W, T>(writer: &mut W, message: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(message)?;
    write_frame(writer, &body).await
}

/// Receive and deserialize a message
pub async fn recv_message<R, T>(reader: &mut R, max_frame_bytes: usize) -> Result<T, ProtocolError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let body = read_frame(reader, max_frame_bytes).await?;
    Ok(serde_json::from_slice(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_response_wire_shape() {
        let ok = serde_json::to_value(Response::success(json!(true))).unwrap();
        assert_eq!(ok, json!({"status": "success", "data": true}));

        let err = serde_json::to_value(Response::error("boom")).unwrap();
        assert_eq!(err, json!({"status": "error", "message": "boom"}));

        let parsed: Response = serde_json::from_str(r#"{"status":"success"}"#).unwrap();
        assert_eq!(parsed, Response::success(serde_json::Value::Null));
    }

    #[test]
    fn test_request_params_default_to_null() {
        let request: Request = serde_json::from_str(r#"{"action":"are_tasks_active"}"#).unwrap();
        assert_eq!(request.action, "are_tasks_active");
        assert!(request.params.is_null());
    }

    #[tokio::test]
    async fn test_frame_header_is_big_endian_length() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"{}").await.unwrap();
        assert_eq!(&buf[..4], &[0, 0, 0, 2]);
        assert_eq!(&buf[4..], b"{}");
    }

    #[tokio::test]
    async fn test_read_frame_reassembles_split_payload() {
        let (mut client, mut server) = tokio::io::duplex(8);
        let body = vec![b'x'; 10_000];
        let expected = body.clone();

        let writer = tokio::spawn(async move {
            write_frame(&mut client, &body).await.unwrap();
        });

        let received = read_frame(&mut server, DEFAULT_MAX_FRAME_BYTES).await.unwrap();
        writer.await.unwrap();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_truncated_body_is_reported() {
        let mut bytes: &[u8] = &[0, 0, 0, 10, b'a', b'b'];
        let err = read_frame(&mut bytes, DEFAULT_MAX_FRAME_BYTES).await.unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Truncated {
                expected: 10,
                received: 2
            }
        ));
    }

    #[tokio::test]
    async fn test_clean_eof_and_oversize() {
        let mut empty: &[u8] = &[];
        assert!(matches!(
            read_frame(&mut empty, 16).await.unwrap_err(),
            ProtocolError::Closed
        ));

        let mut big: &[u8] = &[0, 0, 1, 0];
        assert!(matches!(
            read_frame(&mut big, 16).await.unwrap_err(),
            ProtocolError::TooLarge { size: 256, limit: 16 }
        ));
    }
}
