//! Transport-agnostic socket and frame types for the chat hub (§4.5).
//!
//! The actual WebSocket upgrade is an HTTP-boundary concern (out of scope,
//! §1); this layer only needs a bounded outbound queue per connection and a
//! uniform frame shape a thin adapter can serialize onto a real socket.

use chrono::{DateTime, Utc};
use common::storage::types::chat_message::{ChatMessage, SenderKind};
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Default bound for a socket's outbound queue (§4.5/§5): overflow closes the
/// socket rather than growing unbounded or blocking the hub's single writer.
pub const DEFAULT_OUTBOUND_QUEUE: usize = 256;

/// Which of the chat's two WebSocket populations a socket belongs to (§4.5).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    ThirdParty(i64),
    Admin(String),
}

/// Why a socket was closed by the hub rather than by its own transport.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CloseCode {
    /// Outbound queue overflowed (§4.5: "the socket is closed with a specific code").
    Overflow,
    /// The hub itself is being torn down (idle reap or process shutdown).
    HubShutdown,
    /// `delete(chat, actor)` force-closed the hub (§4.5).
    ChatDeleted,
}

/// A frame the transport adapter forwards to its WebSocket however it
/// chooses to serialize it (JSON text frame is the natural default).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    Message {
        message_id: String,
        sender_kind: SenderKind,
        sender_id: String,
        content: String,
        created_at: DateTime<Utc>,
    },
    /// One token of an in-flight auto-mode streamed reply (§4.5 `auto` mode).
    Token {
        content: String,
    },
    Joined {
        admin_id: String,
    },
    Left {
        admin_id: String,
    },
    ModeChanged {
        mode: String,
    },
    Typing {
        sender: String,
    },
    Closed {
        code: CloseCode,
    },
    Error {
        message: String,
    },
}

impl From<&ChatMessage> for OutboundFrame {
    fn from(message: &ChatMessage) -> Self {
        OutboundFrame::Message {
            message_id: message.id.clone(),
            sender_kind: message.sender_kind,
            sender_id: message.sender_id.clone(),
            content: message.content.clone(),
            created_at: message.created_at,
        }
    }
}

/// One attached connection. Cheap to hold in a hub's registry; the receiving
/// half is handed to whatever transport adapter drives the real socket.
pub struct Socket {
    pub id: Uuid,
    pub identity: Identity,
    tx: mpsc::Sender<OutboundFrame>,
}

impl Socket {
    pub fn new(identity: Identity, queue_capacity: usize) -> (Self, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        (
            Socket {
                id: Uuid::new_v4(),
                identity,
                tx,
            },
            rx,
        )
    }

    /// Non-blocking send. Returns `false` on backpressure overflow or a
    /// dropped receiver; the caller is expected to detach this socket.
    pub fn try_send(&self, frame: OutboundFrame) -> bool {
        self.tx.try_send(frame).is_ok()
    }
}
