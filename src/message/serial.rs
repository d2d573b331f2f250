use serde::{Deserialize, Serialize};

use super::*;
use crate::telemetry::Snapshot;

/// Size of the big-endian length prefix preceding every payload.
pub const HEADER_SIZE: usize = 2;

pub const PAYLOAD_SIZE_MAX: usize = u16::MAX as usize;

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("payload of {0} bytes exceeds the {} byte frame limit", PAYLOAD_SIZE_MAX)]
    TooLarge(usize),
    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failure to interpret a payload. These are recoverable: the channel itself remains usable.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown message type {0}")]
    UnknownKind(u8),
    #[error("{kind} message is missing required field `{field}`")]
    MissingField {
        kind: MessageKind,
        field: &'static str,
    },
    #[error("invalid value {value} for field `{field}`")]
    InvalidField { field: &'static str, value: String },
}

#[derive(Serialize)]
struct WireMessageOut<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    state: Option<&'a Snapshot>,
    flow_id: u32,
    #[serde(rename = "type")]
    kind: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    observer: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    step: Option<u32>,
}

#[derive(Deserialize)]
struct WireMessageIn {
    #[serde(default)]
    state: Option<Snapshot>,
    flow_id: u32,
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default)]
    observer: Option<u32>,
    #[serde(default)]
    step: Option<u32>,
}

#[derive(Deserialize)]
struct WireAction {
    // Decision processes written in dynamic languages may send integral floats
    cwnd: serde_json::Number,
}

#[derive(Deserialize)]
struct WireAssignment {
    flow_id: u32,
}

/// Serializes a message into its self-describing payload, without the length prefix.
pub fn encode_payload(message: &Message) -> Result<Vec<u8>, EncodeError> {
    let (state, observer, step) = match &message.body {
        Body::Init | Body::Start | Body::End => (None, None, None),
        Body::Alive { snapshot } => (Some(snapshot), None, None),
        Body::Observe {
            observer,
            step,
            snapshot,
        } => (snapshot.as_ref(), Some(*observer), Some(*step)),
    };

    let wire = WireMessageOut {
        state,
        flow_id: message.flow_id.0,
        kind: message.kind() as u8,
        observer,
        step,
    };

    Ok(serde_json::to_vec(&wire)?)
}

/// Prepends the length header to a payload.
pub fn write_frame(payload: &[u8]) -> Result<Vec<u8>, EncodeError> {
    let len = u16::try_from(payload.len()).map_err(|_| EncodeError::TooLarge(payload.len()))?;

    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);

    Ok(frame)
}

/// Encodes a message as a complete frame, ready to be written in one piece.
pub fn encode(message: &Message) -> Result<Vec<u8>, EncodeError> {
    write_frame(&encode_payload(message)?)
}

pub fn decode_message(payload: &[u8]) -> Result<Message, DecodeError> {
    let wire: WireMessageIn = serde_json::from_slice(payload)?;

    let kind = MessageKind::from_u8(wire.kind).ok_or(DecodeError::UnknownKind(wire.kind))?;

    let body = match kind {
        MessageKind::Init => Body::Init,
        MessageKind::Start => Body::Start,
        MessageKind::End => Body::End,
        MessageKind::Alive => Body::Alive {
            snapshot: wire.state.ok_or(DecodeError::MissingField {
                kind,
                field: "state",
            })?,
        },
        MessageKind::Observe => Body::Observe {
            observer: wire.observer.ok_or(DecodeError::MissingField {
                kind,
                field: "observer",
            })?,
            step: wire.step.ok_or(DecodeError::MissingField {
                kind,
                field: "step",
            })?,
            snapshot: wire.state,
        },
    };

    Ok(Message {
        flow_id: FlowId(wire.flow_id),
        body,
    })
}

pub fn decode_action(payload: &[u8]) -> Result<Action, DecodeError> {
    let wire: WireAction = serde_json::from_slice(payload)?;

    let cwnd = window_from_number(&wire.cwnd).ok_or_else(|| DecodeError::InvalidField {
        field: "cwnd",
        value: wire.cwnd.to_string(),
    })?;

    Ok(Action { cwnd })
}

// Any non-negative number within range is a window; a fractional part is truncated.
fn window_from_number(number: &serde_json::Number) -> Option<u32> {
    if let Some(value) = number.as_u64() {
        return u32::try_from(value).ok();
    }

    let value = number.as_f64()?;

    if value.is_finite() && value >= 0.0 && value < u32::MAX as f64 + 1.0 {
        Some(value as u32)
    } else {
        None
    }
}

pub fn encode_action(action: &Action) -> Result<Vec<u8>, EncodeError> {
    write_frame(&serde_json::to_vec(&serde_json::json!({ "cwnd": action.cwnd }))?)
}

/// Decodes the decision process reply to START, which carries the assigned flow identity.
pub fn decode_assignment(payload: &[u8]) -> Result<FlowId, DecodeError> {
    let wire: WireAssignment = serde_json::from_slice(payload)?;
    Ok(FlowId(wire.flow_id))
}

pub fn encode_assignment(flow_id: FlowId) -> Result<Vec<u8>, EncodeError> {
    write_frame(&serde_json::to_vec(&serde_json::json!({ "flow_id": flow_id.0 }))?)
}

/// Reassembles length-prefixed frames from a byte stream. Partial frames are kept until the rest
/// of their bytes arrive.
#[derive(Default)]
pub struct FrameReader {
    buffer: Vec<u8>,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Removes and returns the next complete payload, if one has been fully received.
    pub fn next_frame(&mut self) -> Option<Box<[u8]>> {
        if self.buffer.len() < HEADER_SIZE {
            return None;
        }

        let len = u16::from_be_bytes([self.buffer[0], self.buffer[1]]) as usize;

        if self.buffer.len() < HEADER_SIZE + len {
            return None;
        }

        let payload = self.buffer[HEADER_SIZE..HEADER_SIZE + len].into();
        self.buffer.drain(..HEADER_SIZE + len);

        Some(payload)
    }

    /// Number of buffered bytes not yet returned as a frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
