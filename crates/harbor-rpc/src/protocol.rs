//! Request/response envelopes and the length-prefixed framing.

use harbor_model::ErrorKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{RpcError, RpcResult};

/// Refuse frames past this size rather than allocating unboundedly.
const MAX_FRAME: usize = 16 * 1024 * 1024;

/// One RPC call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    /// `Service.Method`, e.g. `ControlPlane.GetService`.
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl Request {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            id,
            method: method.into(),
            params,
        }
    }
}

/// A structured failure carried back to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcFailure {
    pub kind: ErrorKind,
    pub message: String,
}

/// One RPC reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcFailure>,
}

impl Response {
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn fail(id: u64, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(RpcFailure {
                kind,
                message: message.into(),
            }),
        }
    }
}

/// Write one length-prefixed JSON frame.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> RpcResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(message).map_err(|e| RpcError::Protocol(e.to_string()))?;
    let len = body.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed JSON frame. `Ok(None)` means a clean EOF at a
/// frame boundary.
pub async fn read_frame<R, T>(reader: &mut R) -> RpcResult<Option<T>>
where
    R: AsyncRead + Unpin,
    T: serde::de::DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME {
        return Err(RpcError::Protocol(format!(
            "frame of {len} bytes exceeds the {MAX_FRAME} byte limit"
        )));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    let message = serde_json::from_slice(&body).map_err(|e| RpcError::Protocol(e.to_string()))?;
    Ok(Some(message))
}
