use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::warn;

use crate::{BEGIN_MARKER, END_MARKER, Signal};

/// A decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Size field as declared on the wire: payload bytes + 4
    pub size: u32,
    pub signal: Signal,
    /// Parsed JSON payload; an empty object when the frame carried none
    pub payload: Value,
}

impl Message {
    pub fn new(signal: Signal, payload: Value) -> Self {
        let size = payload_bytes(Some(&payload)).len() as u32 + 4;
        Self {
            size,
            signal,
            payload,
        }
    }

    /// What a frame decodes to when its signal or payload is unusable.
    fn fallback(size: u32) -> Self {
        Self {
            size,
            signal: Signal::Status,
            payload: Value::Object(Map::new()),
        }
    }

    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }

    pub fn to_bytes(&self) -> Bytes {
        encode(self.signal, Some(&self.payload))
    }
}

fn payload_bytes(payload: Option<&Value>) -> Vec<u8> {
    match payload {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Object(map)) if map.is_empty() => Vec::new(),
        Some(value) => value.to_string().into_bytes(),
    }
}

/// Frame a signal and optional JSON payload.
pub fn encode(signal: Signal, payload: Option<&Value>) -> Bytes {
    let json = payload_bytes(payload);
    let mut buf =
        BytesMut::with_capacity(BEGIN_MARKER.len() + 8 + json.len() + END_MARKER.len());

    buf.put_slice(BEGIN_MARKER);
    buf.put_u32(json.len() as u32 + 4);
    buf.put_u32(signal.code());
    buf.put_slice(&json);
    buf.put_slice(END_MARKER);

    buf.freeze()
}

/// Parse a frame, with or without its markers.
///
/// Never fails: an unknown signal or an unparsable payload yields a STATUS
/// message with an empty payload.
pub fn decode(bytes: &[u8]) -> Message {
    let body = bytes.strip_prefix(BEGIN_MARKER.as_slice()).unwrap_or(bytes);
    let body = body.strip_suffix(END_MARKER.as_slice()).unwrap_or(body);

    if body.len() < 8 {
        warn!(len = body.len(), "Frame too short to carry a signal");
        return Message::fallback(0);
    }

    let size = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
    let code = u32::from_be_bytes([body[4], body[5], body[6], body[7]]);

    let signal = match Signal::try_from(code) {
        Ok(signal) => signal,
        Err(code) => {
            warn!(code, "Unknown signal, answering as STATUS");
            return Message::fallback(size);
        }
    };

    let declared = (size as usize).saturating_sub(4);
    let end = body.len().min(8 + declared);
    let json = &body[8..end];

    if json.iter().all(u8::is_ascii_whitespace) {
        return Message {
            size,
            signal,
            payload: Value::Object(Map::new()),
        };
    }

    match serde_json::from_slice(json) {
        Ok(payload) => Message {
            size,
            signal,
            payload,
        },
        Err(e) => {
            warn!(%signal, error = %e, "Malformed payload, answering as STATUS");
            Message::fallback(size)
        }
    }
}
