//! Control channel message framing and JSON envelopes
//!
//! Every message on the control connection is one wire frame:
//!
//! ```text
//! kind: u8      1 = text (JSON), 2 = binary (telemetry)
//! len:  u32 LE  payload length
//! payload
//! ```
//!
//! Text and binary frames interleave freely; clients dispatch on `kind`.
use serde_json::{json, Map, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ResultExt, SystemError, TypedResult};
use crate::problem;

/// Upper bound on a single wire frame; anything larger is a protocol error
pub const MAX_FRAME_LEN: usize = 1 << 24;

/// Discriminator of a wire frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireKind {
    Text = 1,
    Binary = 2,
}

impl TryFrom<u8> for WireKind {
    type Error = crate::error::TypedError;

    fn try_from(value: u8) -> TypedResult<Self> {
        match value {
            1 => Ok(WireKind::Text),
            2 => Ok(WireKind::Binary),
            other => Err(problem!(Protocol, "Unknown wire frame kind: {other}")),
        }
    }
}

/// Writes one frame to the connection
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    kind: WireKind,
    payload: &[u8],
) -> TypedResult<()> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(problem!(Protocol, "Frame too large: {}", payload.len()));
    }
    writer
        .write_all(&[kind as u8])
        .await
        .typ(SystemError::ClientDisconnect)?;
    writer
        .write_all(&(payload.len() as u32).to_le_bytes())
        .await
        .typ(SystemError::ClientDisconnect)?;
    writer
        .write_all(payload)
        .await
        .typ(SystemError::ClientDisconnect)?;
    writer.flush().await.typ(SystemError::ClientDisconnect)?;
    Ok(())
}

/// Reads one frame from the connection.
/// A closed connection surfaces as [`SystemError::ClientDisconnect`].
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> TypedResult<(WireKind, Vec<u8>)> {
    let mut kind_byte = [0u8; 1];
    reader
        .read_exact(&mut kind_byte)
        .await
        .typ(SystemError::ClientDisconnect)?;
    let kind = WireKind::try_from(kind_byte[0])?;

    let mut len_bytes = [0u8; 4];
    reader
        .read_exact(&mut len_bytes)
        .await
        .typ(SystemError::ClientDisconnect)?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(problem!(Protocol, "Frame length {len} exceeds limit"));
    }

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .typ(SystemError::ClientDisconnect)?;
    Ok((kind, payload))
}

/// State change events broadcast to every connected client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Running,
    Paused,
    Reset,
    Stopped,
}

impl Event {
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::Running => "running",
            Event::Paused => "paused",
            Event::Reset => "reset",
            Event::Stopped => "stopped",
        }
    }
}

/// A control command received from a client
#[derive(Debug, Clone)]
pub struct Command {
    pub action: String,
    pub params: Map<String, Value>,
}

impl Command {
    /// Parses a command envelope `{action, params}` from JSON text
    pub fn from_json(data: &str) -> TypedResult<Self> {
        let parsed: Value = serde_json::from_str(data)
            .map_err(|e| problem!(Protocol, "Invalid JSON: {e}"))?;
        let obj = parsed
            .as_object()
            .ok_or_else(|| problem!(Protocol, "Command must be a JSON object"))?;

        let action = obj
            .get("action")
            .and_then(Value::as_str)
            .ok_or_else(|| problem!(Protocol, "Command missing 'action' field"))?
            .to_string();

        let params = match obj.get("params") {
            None => Map::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(_) => return Err(problem!(Protocol, "Command 'params' must be an object")),
        };

        Ok(Self { action, params })
    }

    /// Validates action-specific parameter shapes
    pub fn validate(&self) -> TypedResult<()> {
        match self.action.as_str() {
            "pause" | "resume" | "reset" => Ok(()),
            "step" => {
                if let Some(count) = self.params.get("count") {
                    match count.as_u64() {
                        Some(n) if n >= 1 => {}
                        _ => {
                            return Err(problem!(
                                Protocol,
                                "step 'count' must be a positive integer"
                            ))
                        }
                    }
                }
                Ok(())
            }
            "set" => {
                if !self.params.contains_key("signal") {
                    return Err(problem!(Protocol, "set command requires 'signal' param"));
                }
                if !self.params.contains_key("value") {
                    return Err(problem!(Protocol, "set command requires 'value' param"));
                }
                Ok(())
            }
            "subscribe" => match self.params.get("signals") {
                Some(Value::Array(_)) => Ok(()),
                Some(_) => Err(problem!(Protocol, "subscribe 'signals' must be a list")),
                None => Err(problem!(
                    Protocol,
                    "subscribe command requires 'signals' param"
                )),
            },
            other => Err(problem!(Protocol, "Unknown action: {other}")),
        }
    }
}

/// Schema message sent to every freshly connected client
pub fn make_schema(modules: Value) -> String {
    json!({"type": "schema", "modules": modules}).to_string()
}

/// State change event message
pub fn make_event(event: Event) -> String {
    json!({"type": "event", "event": event.as_str()}).to_string()
}

/// Error response message
pub fn make_error(message: &str, code: Option<i64>) -> String {
    let mut msg = json!({"type": "error", "message": message});
    if let Some(code) = code {
        msg["code"] = json!(code);
    }
    msg.to_string()
}

/// Command acknowledgment, optionally with extra detail fields
pub fn make_ack(action: &str, details: Option<Value>) -> String {
    let mut msg = json!({"type": "ack", "action": action});
    if let Some(Value::Object(details)) = details {
        for (k, v) in details {
            msg[k] = v;
        }
    }
    msg.to_string()
}
