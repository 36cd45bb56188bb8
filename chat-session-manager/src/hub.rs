//! Per-chat hub: owns the socket registry and serializes writes so persisted
//! order always equals delivery order (§4.5/§5).
//!
//! Grounded on `Humans-Not-Required-local-agent-chat/src/routes/stream.rs`'s
//! presence-tracked broadcast room, adapted from a single shared broadcast
//! channel to one bounded `mpsc` queue per socket: unlike a broadcast room,
//! each socket here needs independent backpressure, since a slow admin
//! browser tab must not stall delivery to every other connection.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Instant,
};

use async_openai::{config::OpenAIConfig, Client};
use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            chat::{Chat, ChatMode, ChatStatus},
            chat_message::{ChatMessage, MessageType, SenderKind},
        },
    },
};
use retrieval_pipeline::RetrievalEngine;
use tokio::sync::{mpsc, Mutex};
use tracing::warn;
use uuid::Uuid;

use crate::{
    llm,
    socket::{CloseCode, Identity, OutboundFrame, Socket},
};

struct HubState {
    user_sockets: HashMap<Uuid, Socket>,
    admin_sockets: HashMap<Uuid, Socket>,
    joined_admin_ids: HashSet<String>,
    last_activity: Instant,
}

impl HubState {
    fn new() -> Self {
        HubState {
            user_sockets: HashMap::new(),
            admin_sockets: HashMap::new(),
            joined_admin_ids: HashSet::new(),
            last_activity: Instant::now(),
        }
    }

    /// Returns the number of sockets dropped for backpressure overflow so the
    /// caller can attribute the drop to a chat id in its log line.
    fn broadcast_all(&mut self, frame: &OutboundFrame) -> usize {
        let before = self.user_sockets.len() + self.admin_sockets.len();
        self.user_sockets.retain(|_, socket| socket.try_send(frame.clone()));
        self.admin_sockets.retain(|_, socket| socket.try_send(frame.clone()));
        before - (self.user_sockets.len() + self.admin_sockets.len())
    }

    fn broadcast_admins(&mut self, frame: &OutboundFrame) -> usize {
        let before = self.admin_sockets.len();
        self.admin_sockets.retain(|_, socket| socket.try_send(frame.clone()));
        before - self.admin_sockets.len()
    }
}

/// One chat's live connections plus the write-serialization lock (§4.5:
/// "enforced by serializing writes through the hub"). Held behind an `Arc` by
/// `ChatSessionManager`'s per-chat registry.
pub struct ChatHub {
    chat_id: String,
    state: Mutex<HubState>,
    write_lock: Mutex<()>,
}

impl ChatHub {
    pub fn new(chat_id: String) -> Self {
        ChatHub {
            chat_id,
            state: Mutex::new(HubState::new()),
            write_lock: Mutex::new(()),
        }
    }

    pub async fn is_idle_for(&self, idle_for: std::time::Duration) -> bool {
        let state = self.state.lock().await;
        state.user_sockets.is_empty()
            && state.admin_sockets.is_empty()
            && state.last_activity.elapsed() >= idle_for
    }

    /// Attaches a new socket (§4.5 `join`/connect), first replaying `replay`
    /// (recent history) to it alone before it's visible to broadcasts; third-
    /// party sockets just register, admin sockets additionally mark the
    /// operator as joined so `mixed` mode can tell whether a human is already
    /// watching.
    pub async fn attach(
        &self,
        identity: Identity,
        queue_capacity: usize,
        replay: &[OutboundFrame],
    ) -> (Uuid, mpsc::Receiver<OutboundFrame>) {
        let (socket, rx) = Socket::new(identity.clone(), queue_capacity);
        let id = socket.id;
        for frame in replay {
            socket.try_send(frame.clone());
        }
        let mut state = self.state.lock().await;
        match identity {
            Identity::ThirdParty(_) => {
                state.user_sockets.insert(id, socket);
            }
            Identity::Admin(admin_id) => {
                state.joined_admin_ids.insert(admin_id.clone());
                state.admin_sockets.insert(id, socket);
                let frame = OutboundFrame::Joined { admin_id };
                state.broadcast_all(&frame);
            }
        }
        state.last_activity = Instant::now();
        (id, rx)
    }

    /// Detaches a socket (disconnect or hub-initiated close). Returns the
    /// admin id if the departing socket was the last one for that admin, so
    /// the caller can run `remove_admin` bookkeeping.
    pub async fn detach(&self, identity: &Identity, socket_id: Uuid) -> Option<String> {
        let mut state = self.state.lock().await;
        match identity {
            Identity::ThirdParty(_) => {
                state.user_sockets.remove(&socket_id);
                None
            }
            Identity::Admin(admin_id) => {
                state.admin_sockets.remove(&socket_id);
                let still_present = state
                    .admin_sockets
                    .values()
                    .any(|s| s.identity == Identity::Admin(admin_id.clone()));
                if still_present {
                    None
                } else {
                    state.joined_admin_ids.remove(admin_id);
                    let frame = OutboundFrame::Left {
                        admin_id: admin_id.clone(),
                    };
                    state.broadcast_all(&frame);
                    Some(admin_id.clone())
                }
            }
        }
    }

    pub async fn admin_joined(&self) -> bool {
        !self.state.lock().await.joined_admin_ids.is_empty()
    }

    pub async fn notify_typing(&self, sender: &str) {
        let mut state = self.state.lock().await;
        state.broadcast_all(&OutboundFrame::Typing {
            sender: sender.to_string(),
        });
    }

    pub async fn notify_mode_changed(&self, mode: ChatMode) {
        let mut state = self.state.lock().await;
        state.broadcast_all(&OutboundFrame::ModeChanged {
            mode: format!("{mode:?}").to_lowercase(),
        });
    }

    /// Force-closes every attached socket (chat deletion, hub shutdown) with a
    /// reason code so the transport adapter can explain the disconnect.
    pub async fn close_all(&self, code: CloseCode) {
        let mut state = self.state.lock().await;
        state.broadcast_all(&OutboundFrame::Closed { code });
        state.user_sockets.clear();
        state.admin_sockets.clear();
        state.joined_admin_ids.clear();
    }

    /// Core write path (§4.5 `send`): persists the message, then delivers it
    /// per the chat's mode, optionally following with a streamed auto-reply.
    /// Holds `write_lock` for the whole operation so a second `send()` on the
    /// same chat cannot interleave its persist between this one's persist and
    /// broadcast.
    #[allow(clippy::too_many_arguments)]
    pub async fn send(
        &self,
        db: &SurrealDbClient,
        retrieval: &RetrievalEngine,
        openai_client: &Arc<Client<OpenAIConfig>>,
        chat: &Chat,
        sender_kind: SenderKind,
        sender_id: &str,
        content: String,
    ) -> Result<ChatMessage, AppError> {
        if chat.status == ChatStatus::Deleted {
            return Err(AppError::Conflict("chat is deleted".into()));
        }

        let _write_guard = self.write_lock.lock().await;

        let message = ChatMessage::new(
            chat.id.clone(),
            sender_kind,
            sender_id.to_string(),
            MessageType::Text,
            content.clone(),
        );
        message.persist(db).await?;

        let admin_present = self.admin_joined().await;
        let auto_answer = match chat.mode {
            ChatMode::Auto => true,
            ChatMode::Manual => false,
            ChatMode::Mixed => !admin_present,
        };

        {
            let mut state = self.state.lock().await;
            let frame = OutboundFrame::from(&message);
            let dropped = if chat.mode == ChatMode::Manual {
                state.broadcast_admins(&frame)
            } else {
                state.broadcast_all(&frame)
            };
            state.last_activity = Instant::now();
            if dropped > 0 {
                warn!(chat_id = %self.chat_id, dropped, "closed sockets on outbound queue overflow");
            }
        }

        if auto_answer && sender_kind == SenderKind::ThirdParty {
            self.run_auto_reply(db, retrieval, openai_client, chat, &content).await?;
        }

        Ok(message)
    }

    async fn run_auto_reply(
        &self,
        db: &SurrealDbClient,
        retrieval: &RetrievalEngine,
        openai_client: &Arc<Client<OpenAIConfig>>,
        chat: &Chat,
        user_message: &str,
    ) -> Result<(), AppError> {
        let (token_tx, mut token_rx) = mpsc::channel::<String>(64);

        let forward = async {
            while let Some(token) = token_rx.recv().await {
                let mut state = self.state.lock().await;
                state.broadcast_all(&OutboundFrame::Token { content: token });
            }
        };

        let (reply, ()) = tokio::join!(
            llm::generate_reply(db, retrieval, openai_client, chat, user_message, token_tx),
            forward,
        );
        let reply = reply?;

        if reply.trim().is_empty() {
            return Ok(());
        }

        let reply_message = ChatMessage::new(
            chat.id.clone(),
            SenderKind::System,
            "assistant".to_string(),
            MessageType::Text,
            reply,
        );
        reply_message.persist(db).await?;

        let mut state = self.state.lock().await;
        state.broadcast_all(&OutboundFrame::from(&reply_message));
        Ok(())
    }
}
