pub mod codec;

pub use codec::{CodecError, MessageCodec, decode_datagram, encode_datagram};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// UDP port idle nodes broadcast their presence to.
pub const DEFAULT_DISCOVERY_PORT: u16 = 10001;
/// TCP port an idle node accepts invites on.
pub const DEFAULT_INVITE_PORT: u16 = 10002;
/// TCP port a worker accepts its single task connection on.
pub const DEFAULT_TASK_PORT: u16 = 10003;

/// Envelope header: one kind byte followed by a big-endian `u32` payload length.
pub const HEADER_LEN: usize = 5;
/// Largest payload accepted on a stream (16 MiB).
pub const MAX_PAYLOAD_BYTES: usize = 16 * 1024 * 1024;
/// Receive buffer for presence datagrams. Larger datagrams are truncated and fail to decode.
pub const MAX_DATAGRAM_BYTES: usize = 4096;

/// Kind tag carried in the first byte of every envelope.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Presence,
    Invite,
    Task,
    Result,
}

impl MessageKind {
    pub fn tag(self) -> u8 {
        match self {
            MessageKind::Presence => 1,
            MessageKind::Invite => 2,
            MessageKind::Task => 3,
            MessageKind::Result => 4,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(MessageKind::Presence),
            2 => Some(MessageKind::Invite),
            3 => Some(MessageKind::Task),
            4 => Some(MessageKind::Result),
            _ => None,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Presence => write!(f, "presence"),
            MessageKind::Invite => write!(f, "invite"),
            MessageKind::Task => write!(f, "task"),
            MessageKind::Result => write!(f, "result"),
        }
    }
}

/// Every message exchanged between nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Broadcast by idle nodes on the discovery channel.
    Presence(Presence),
    /// Asks an idle node to become a worker. Carries no payload.
    Invite,
    /// Unit of work sent to a worker's task endpoint.
    Task(Task),
    /// Worker's answer, written back on the task connection.
    Result(TaskResult),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Presence(_) => MessageKind::Presence,
            Message::Invite => MessageKind::Invite,
            Message::Task(_) => MessageKind::Task,
            Message::Result(_) => MessageKind::Result,
        }
    }
}

/// Availability announcement of an idle node.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Presence {
    /// Reachable invite endpoint of the advertising node.
    pub address: SocketAddr,
    /// Port the node will accept its task connection on once it is a worker.
    pub task_port: u16,
    /// Free-form capability description, e.g. "4 cores".
    pub capability: String,
}

impl Presence {
    pub fn task_endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.address.ip(), self.task_port)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Task {
    /// Correlates the Result with the Task that produced it.
    pub task_id: String,
    pub script: String,
    /// Engine identifier the worker resolves to an interpreter, e.g. "node".
    pub engine: String,
}

impl Task {
    /// Build a task with a fresh random identifier.
    pub fn new(script: impl Into<String>, engine: impl Into<String>) -> Self {
        Self {
            task_id: uuid::Uuid::new_v4().to_string(),
            script: script.into(),
            engine: engine.into(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TaskResult {
    pub task_id: String,
    pub output: String,
    pub success: bool,
}
