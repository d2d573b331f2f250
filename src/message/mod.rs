use super::telemetry::Snapshot;

pub mod serial;

pub use serial::{DecodeError, EncodeError, FrameReader};

/// Identifies a flow to the decision process.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct FlowId(pub u32);

impl std::fmt::Display for FlowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Numeric message tag as it appears on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Init = 0,
    Start = 1,
    End = 2,
    Alive = 3,
    Observe = 4,
}

impl MessageKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Init),
            1 => Some(Self::Start),
            2 => Some(Self::End),
            3 => Some(Self::Alive),
            4 => Some(Self::Observe),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Init => "INIT",
            Self::Start => "START",
            Self::End => "END",
            Self::Alive => "ALIVE",
            Self::Observe => "OBSERVE",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Body {
    Init,
    Start,
    End,
    Alive {
        snapshot: Snapshot,
    },
    Observe {
        observer: u32,
        step: u32,
        snapshot: Option<Snapshot>,
    },
}

impl Body {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Init => MessageKind::Init,
            Self::Start => MessageKind::Start,
            Self::End => MessageKind::End,
            Self::Alive { .. } => MessageKind::Alive,
            Self::Observe { .. } => MessageKind::Observe,
        }
    }
}

/// A single control channel message. Messages carry no state across cycles.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub flow_id: FlowId,
    pub body: Body,
}

impl Message {
    pub fn new(flow_id: FlowId, body: Body) -> Self {
        Self { flow_id, body }
    }

    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }
}

/// Decision process reply to an ALIVE message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Action {
    pub cwnd: u32,
}
