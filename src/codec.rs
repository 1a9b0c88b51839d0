//! Length-prefixed framing and the wire forms of call records and replies.
//!
//! Every message on either channel is `<u32 big-endian length><payload>`.
//! Call records and replies are JSON: a request is the triple
//! `[name, args, kwargs]`, a reply is one of the tagged arrays
//! `["OK", value]`, `["SHM", name, shape, dtype]`, or
//! `["ERR", {type, message}, traceback]`. Stream-frame payloads are raw
//! UTF-8 text with no tag.

use std::io;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::Error;

/// Marker key identifying a registered-function argument on the wire.
pub(crate) const FN_MARKER_KEY: &str = "__ml3_fn__";

/// Writes one `<u32 BE length><payload>` frame.
pub(crate) async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame exceeds u32 length"))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

/// Reads one frame. Returns `Ok(None)` on a clean EOF at a frame boundary;
/// an EOF inside the header or payload is an error. Partial reads of any
/// size are reassembled.
pub(crate) async fn read_frame<R>(reader: &mut R) -> io::Result<Option<Vec<u8>>>
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
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed mid-header",
            ));
        }
        filled += n;
    }
    let len = u32::from_be_bytes(header) as usize;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// One call: the function identifier plus its JSON-encoded arguments.
#[derive(Debug, Clone)]
pub(crate) struct CallRecord {
    pub function: String,
    pub args: Vec<Value>,
    pub kwargs: serde_json::Map<String, Value>,
}

/// The on-wire shape of a call record: a bare triple.
#[derive(serde::Serialize)]
struct WireCall<'a>(&'a str, &'a [Value], &'a serde_json::Map<String, Value>);

impl CallRecord {
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&WireCall(&self.function, &self.args, &self.kwargs))
    }
}

/// A decoded worker reply.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Reply {
    Ok(Value),
    Shm {
        name: String,
        shape: Vec<usize>,
        dtype: String,
    },
    Err {
        kind: String,
        message: String,
        traceback: String,
    },
}

fn malformed(what: &str) -> Error {
    Error::Protocol(format!("malformed reply from daemon: {what}"))
}

impl Reply {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let value: Value = serde_json::from_slice(bytes)?;
        let items = value.as_array().ok_or_else(|| malformed("not an array"))?;
        let tag = items
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| malformed("missing tag"))?;
        match tag {
            "OK" => {
                let value = items.get(1).ok_or_else(|| malformed("OK without value"))?;
                Ok(Reply::Ok(value.clone()))
            }
            "SHM" => {
                let name = items
                    .get(1)
                    .and_then(Value::as_str)
                    .ok_or_else(|| malformed("SHM without segment name"))?;
                let shape = items
                    .get(2)
                    .and_then(Value::as_array)
                    .ok_or_else(|| malformed("SHM without shape"))?
                    .iter()
                    .map(|d| d.as_u64().map(|d| d as usize))
                    .collect::<Option<Vec<usize>>>()
                    .ok_or_else(|| malformed("non-integer dimension"))?;
                let dtype = items
                    .get(3)
                    .and_then(Value::as_str)
                    .ok_or_else(|| malformed("SHM without dtype"))?;
                Ok(Reply::Shm {
                    name: name.to_string(),
                    shape,
                    dtype: dtype.to_string(),
                })
            }
            "ERR" => {
                let info = items
                    .get(1)
                    .and_then(Value::as_object)
                    .ok_or_else(|| malformed("ERR without exception info"))?;
                let kind = info
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("Exception");
                let message = info.get("message").and_then(Value::as_str).unwrap_or("");
                let traceback = items
                    .get(2)
                    .and_then(Value::as_str)
                    .ok_or_else(|| malformed("ERR without traceback"))?;
                Ok(Reply::Err {
                    kind: kind.to_string(),
                    message: message.to_string(),
                    traceback: traceback.to_string(),
                })
            }
            _ => Err(Error::Protocol("Unknown response from daemon".to_string())),
        }
    }
}
