#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

//! Owns every live chat's WebSocket-driven state (§4.5): per-chat hubs,
//! mode-aware message dispatch, join/leave bookkeeping and idle reaping.
//! Persistence and retrieval/LLM mechanics live in `common`/`retrieval-
//! pipeline`; this crate is the concurrency and lifecycle layer above them,
//! mirroring how `training-coordinator` sits above `ingestion-pipeline`.

mod hub;
pub mod llm;
pub mod socket;

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_openai::{config::OpenAIConfig, Client};
use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            chat::{Chat, ChatMode, ChatStatus},
            chat_message::{ChatMessage, SenderKind},
            kb_membership::{KbMembership, Permission},
        },
    },
};
use retrieval_pipeline::RetrievalEngine;
use serde_json::json;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{info, warn};
use uuid::Uuid;
use webhook_dispatcher::WebhookDispatcher;

pub use hub::ChatHub;
pub use socket::{CloseCode, Identity, OutboundFrame, Socket};

/// Default outbound queue bound a new socket gets when the caller doesn't
/// override it (§5, mirrors `AppConfig::chat_outbound_queue`).
const DEFAULT_QUEUE_CAPACITY: usize = socket::DEFAULT_OUTBOUND_QUEUE;

/// Owns every chat's hub for the process lifetime. Cheap to clone (`Arc`
/// internally); share one instance across every transport adapter.
pub struct ChatSessionManager {
    db: Arc<SurrealDbClient>,
    retrieval: Arc<RetrievalEngine>,
    openai_client: Arc<Client<OpenAIConfig>>,
    hubs: AsyncMutex<HashMap<String, Arc<ChatHub>>>,
    outbound_queue_capacity: usize,
    idle_timeout: Duration,
    webhook_dispatcher: Option<Arc<WebhookDispatcher>>,
}

/// A socket freshly attached to a chat: its id (for a later `leave`/detach
/// call) plus the receiving half the transport adapter drains onto the wire.
pub struct AttachedSocket {
    pub socket_id: Uuid,
    pub identity: Identity,
    pub receiver: mpsc::Receiver<OutboundFrame>,
}

impl ChatSessionManager {
    pub fn new(
        db: Arc<SurrealDbClient>,
        retrieval: Arc<RetrievalEngine>,
        openai_client: Arc<Client<OpenAIConfig>>,
        outbound_queue_capacity: usize,
        idle_timeout: Duration,
        webhook_dispatcher: Option<Arc<WebhookDispatcher>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            retrieval,
            openai_client,
            hubs: AsyncMutex::new(HashMap::new()),
            outbound_queue_capacity: outbound_queue_capacity.max(1),
            idle_timeout,
            webhook_dispatcher,
        })
    }

    #[cfg(test)]
    fn with_defaults(
        db: Arc<SurrealDbClient>,
        retrieval: Arc<RetrievalEngine>,
        openai_client: Arc<Client<OpenAIConfig>>,
    ) -> Arc<Self> {
        Self::new(
            db,
            retrieval,
            openai_client,
            DEFAULT_QUEUE_CAPACITY,
            Duration::from_secs(3600),
            None,
        )
    }

    async fn notify(&self, event_type: &str, chat: &Chat) {
        let Some(dispatcher) = &self.webhook_dispatcher else {
            return;
        };
        let data = json!({
            "chat_id": chat.id,
            "kb_id": chat.kb_id,
        });
        if let Err(err) = dispatcher.publish(event_type, data, json!({})).await {
            warn!(chat_id = %chat.id, event_type, error = %err, "failed to publish webhook event");
        }
    }

    async fn hub_for(&self, chat_id: &str) -> Arc<ChatHub> {
        let mut hubs = self.hubs.lock().await;
        Arc::clone(
            hubs.entry(chat_id.to_string())
                .or_insert_with(|| Arc::new(ChatHub::new(chat_id.to_string()))),
        )
    }

    /// `open(kb, external_user_id, mode)`: creates a new chat and its hub.
    pub async fn open(&self, kb_id: String, external_user_id: i64, mode: ChatMode) -> Result<Chat, AppError> {
        let chat = Chat::new(kb_id, external_user_id, mode);
        self.db.store_item(chat.clone()).await?;
        self.hub_for(&chat.id).await;
        self.notify("chat.started", &chat).await;
        Ok(chat)
    }

    /// Attaches a third-party (end-user) socket to a chat, replaying the last
    /// `replay_count` messages first so a reconnect doesn't lose context.
    pub async fn join_as_user(&self, chat_id: &str, replay_count: u32) -> Result<AttachedSocket, AppError> {
        let chat = Chat::get(&self.db, chat_id).await?;
        let hub = self.hub_for(chat_id).await;
        let identity = Identity::ThirdParty(chat.external_user_id);
        let replay = ChatMessage::last_n(&self.db, chat_id, replay_count)
            .await?
            .iter()
            .map(OutboundFrame::from)
            .collect::<Vec<_>>();
        let (socket_id, receiver) = hub.attach(identity.clone(), self.outbound_queue_capacity, &replay).await;

        Ok(AttachedSocket {
            socket_id,
            identity,
            receiver,
        })
    }

    /// Attaches an admin socket (`join(chat, admin)`, §4.5), requiring at
    /// least viewer membership on the chat's knowledge base.
    pub async fn join_as_admin(
        &self,
        chat_id: &str,
        admin_id: &str,
        replay_count: u32,
    ) -> Result<AttachedSocket, AppError> {
        let chat = Chat::get(&self.db, chat_id).await?;
        KbMembership::require_permission(&self.db, &chat.kb_id, admin_id, Permission::Viewer).await?;

        let hub = self.hub_for(chat_id).await;
        let identity = Identity::Admin(admin_id.to_string());
        let replay = ChatMessage::last_n(&self.db, chat_id, replay_count)
            .await?
            .iter()
            .map(OutboundFrame::from)
            .collect::<Vec<_>>();
        let (socket_id, receiver) = hub.attach(identity.clone(), self.outbound_queue_capacity, &replay).await;

        Ok(AttachedSocket {
            socket_id,
            identity,
            receiver,
        })
    }

    /// `leave(chat, admin)`: detaches a socket; if it was an admin's last
    /// socket, un-marks them as joined so `mixed` mode resumes auto-answering.
    pub async fn leave(&self, chat_id: &str, identity: &Identity, socket_id: Uuid) -> Result<(), AppError> {
        let hub = self.hub_for(chat_id).await;
        hub.detach(identity, socket_id).await;
        Ok(())
    }

    /// `send(chat, sender, content)`: the one write path into a chat.
    pub async fn send(
        &self,
        chat_id: &str,
        sender_kind: SenderKind,
        sender_id: &str,
        content: String,
    ) -> Result<ChatMessage, AppError> {
        if content.trim().is_empty() {
            return Err(AppError::Validation("message content must not be empty".into()));
        }
        let chat = Chat::get(&self.db, chat_id).await?;
        let hub = self.hub_for(chat_id).await;
        hub.send(
            &self.db,
            &self.retrieval,
            &self.openai_client,
            &chat,
            sender_kind,
            sender_id,
            content,
        )
        .await
    }

    pub async fn typing(&self, chat_id: &str, sender: &str) -> Result<(), AppError> {
        let hub = self.hub_for(chat_id).await;
        hub.notify_typing(sender).await;
        Ok(())
    }

    /// `switch_mode(chat, admin, mode)`: requires editor+ on the chat's KB.
    pub async fn switch_mode(&self, chat_id: &str, admin_id: &str, mode: ChatMode) -> Result<Chat, AppError> {
        let chat = Chat::get(&self.db, chat_id).await?;
        KbMembership::require_permission(&self.db, &chat.kb_id, admin_id, Permission::Editor).await?;
        let updated = Chat::switch_mode(&self.db, chat_id, mode).await?;
        let hub = self.hub_for(chat_id).await;
        hub.notify_mode_changed(mode).await;
        Ok(updated)
    }

    pub async fn add_admin(&self, chat_id: &str, admin_id: &str) -> Result<Chat, AppError> {
        Chat::add_admin(&self.db, chat_id, admin_id).await
    }

    pub async fn remove_admin(&self, chat_id: &str, admin_id: &str) -> Result<Chat, AppError> {
        Chat::remove_admin(&self.db, chat_id, admin_id).await
    }

    /// `delete(chat, actor)`: soft-deletes the chat and force-closes every
    /// attached socket. Requires admin+ on the chat's KB.
    pub async fn delete(&self, chat_id: &str, actor_id: &str) -> Result<Chat, AppError> {
        let chat = Chat::get(&self.db, chat_id).await?;
        KbMembership::require_permission(&self.db, &chat.kb_id, actor_id, Permission::Admin).await?;
        let updated = Chat::soft_delete(&self.db, chat_id).await?;
        let hub = self.hub_for(chat_id).await;
        hub.close_all(CloseCode::ChatDeleted).await;
        self.notify("chat.ended", &updated).await;
        Ok(updated)
    }

    pub async fn restore(&self, chat_id: &str, actor_id: &str) -> Result<Chat, AppError> {
        let chat = Chat::get(&self.db, chat_id).await?;
        KbMembership::require_permission(&self.db, &chat.kb_id, actor_id, Permission::Admin).await?;
        Chat::restore(&self.db, chat_id).await
    }

    /// Sweeps hubs with no attached sockets and no activity for
    /// `idle_timeout`, dropping them from the registry. Spawned once per
    /// process, the same way `training-coordinator::run_worker_loop` is.
    pub async fn run_reaper_loop(self: Arc<Self>, interval: Duration) {
        loop {
            tokio::time::sleep(interval).await;
            let mut hubs = self.hubs.lock().await;
            let mut drained = Vec::new();
            for (chat_id, hub) in hubs.iter() {
                if hub.is_idle_for(self.idle_timeout).await {
                    drained.push(chat_id.clone());
                }
            }
            for chat_id in &drained {
                hubs.remove(chat_id);
            }
            drop(hubs);
            for chat_id in &drained {
                match Chat::mark_inactive(&self.db, chat_id).await {
                    Ok(Some(_)) => info!(chat_id, "idle chat marked inactive"),
                    Ok(None) => {}
                    Err(err) => warn!(chat_id, error = %err, "failed to mark idle chat inactive"),
                }
            }
            if !drained.is_empty() {
                info!(count = drained.len(), "reaped idle chat hubs");
            }
        }
    }

    /// Marks a chat whose status is still `active` but whose hub has been
    /// idle past the configured timeout as `inactive` (distinct from the
    /// in-memory hub reap above, which only frees hub memory). The CAS guard
    /// on `Chat::mark_inactive` means a message arriving between the idle
    /// check and the write just loses the race harmlessly.
    pub async fn mark_inactive_if_idle(&self, chat_id: &str) -> Result<(), AppError> {
        let chat = Chat::get(&self.db, chat_id).await?;
        if chat.status != ChatStatus::Active {
            return Ok(());
        }
        let hub = self.hub_for(chat_id).await;
        if hub.is_idle_for(self.idle_timeout).await {
            if Chat::mark_inactive(&self.db, chat_id).await?.is_some() {
                info!(chat_id, "chat idle past timeout, marked inactive");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_openai::config::OpenAIConfig;
    use common::{
        storage::{
            db::SurrealDbClient,
            types::{
                kb_membership::{KbMembership, Permission},
                knowledge_base::{KnowledgeBase, LlmConfig},
            },
            vector_store::{SurrealVectorStore, VectorStore},
        },
        utils::{config::AppConfig, embedding::EmbeddingProvider},
    };
    use uuid::Uuid;

    async fn test_db() -> Arc<SurrealDbClient> {
        let db = SurrealDbClient::memory("chat_session_test", &Uuid::new_v4().to_string())
            .await
            .expect("memory db");
        db.apply_migrations().await.expect("migrations");
        Arc::new(db)
    }

    fn test_openai_client() -> Arc<Client<OpenAIConfig>> {
        Arc::new(Client::with_config(OpenAIConfig::new().with_api_key("test-key")))
    }

    async fn test_manager(db: Arc<SurrealDbClient>) -> Arc<ChatSessionManager> {
        let embedding_provider = Arc::new(EmbeddingProvider::new_hashed(16).expect("provider"));
        let vector_store: Arc<dyn VectorStore> = Arc::new(SurrealVectorStore::new((*db).clone()));
        let retrieval = Arc::new(RetrievalEngine::new(
            Arc::clone(&db),
            embedding_provider,
            vector_store,
            None,
            &AppConfig::default(),
        ));
        ChatSessionManager::with_defaults(db, retrieval, test_openai_client())
    }

    async fn seed_kb(db: &SurrealDbClient, owner: &str) -> KnowledgeBase {
        KnowledgeBase::create_with_owner(db, owner.into(), "kb".into(), "support".into(), LlmConfig::default())
            .await
            .expect("create kb")
    }

    async fn seed_membership(db: &SurrealDbClient, kb_id: &str, user_id: &str, permission: Permission) {
        db.store_item(KbMembership::new(kb_id.to_string(), user_id.to_string(), permission))
            .await
            .expect("store membership");
    }

    #[tokio::test]
    async fn manual_mode_delivers_only_to_admins() {
        let db = test_db().await;
        let kb = seed_kb(&db, "owner-1").await;
        let manager = test_manager(Arc::clone(&db)).await;

        let chat = manager.open(kb.id.clone(), 42, ChatMode::Manual).await.expect("open chat");

        let mut user_socket = manager.join_as_user(&chat.id, 0).await.expect("join user");
        seed_membership(&db, &kb.id, "admin-1", Permission::Editor).await;
        let mut admin_socket = manager.join_as_admin(&chat.id, "admin-1", 0).await.expect("join admin");

        // both sockets first observe the admin's join notification.
        assert!(matches!(
            user_socket.receiver.try_recv().expect("joined frame"),
            OutboundFrame::Joined { .. }
        ));
        assert!(matches!(
            admin_socket.receiver.try_recv().expect("joined frame"),
            OutboundFrame::Joined { .. }
        ));

        manager
            .send(&chat.id, SenderKind::ThirdParty, "42", "hello".into())
            .await
            .expect("send");

        let admin_frame = admin_socket.receiver.try_recv().expect("admin receives message");
        assert!(matches!(admin_frame, OutboundFrame::Message { .. }));

        // manual mode restricts delivery to admins only.
        assert!(user_socket.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn switch_mode_requires_editor_permission() {
        let db = test_db().await;
        let kb = seed_kb(&db, "owner-1").await;
        let manager = test_manager(Arc::clone(&db)).await;
        let chat = manager.open(kb.id.clone(), 7, ChatMode::Auto).await.expect("open chat");

        seed_membership(&db, &kb.id, "viewer-1", Permission::Viewer).await;

        let err = manager
            .switch_mode(&chat.id, "viewer-1", ChatMode::Manual)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn delete_requires_admin_and_closes_sockets() {
        let db = test_db().await;
        let kb = seed_kb(&db, "owner-1").await;
        let manager = test_manager(Arc::clone(&db)).await;
        let chat = manager.open(kb.id.clone(), 9, ChatMode::Manual).await.expect("open chat");

        let mut socket = manager.join_as_user(&chat.id, 0).await.expect("join user");
        let updated = manager.delete(&chat.id, "owner-1").await.expect("delete");
        assert_eq!(updated.status, ChatStatus::Deleted);

        let frame = socket.receiver.recv().await.expect("closed frame delivered");
        assert!(matches!(frame, OutboundFrame::Closed { code: CloseCode::ChatDeleted }));
    }

    #[tokio::test]
    async fn send_to_deleted_chat_is_rejected() {
        let db = test_db().await;
        let kb = seed_kb(&db, "owner-1").await;
        let manager = test_manager(Arc::clone(&db)).await;
        let chat = manager.open(kb.id.clone(), 1, ChatMode::Manual).await.expect("open chat");
        manager.delete(&chat.id, "owner-1").await.expect("delete");

        let err = manager
            .send(&chat.id, SenderKind::ThirdParty, "1", "hi".into())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }
}
