//! Auto-mode reply generation (§4.5 `auto`/`mixed` dispatch): retrieval
//! context plus a streaming chat completion.
//!
//! Grounded on the teacher's `ingestion-pipeline/src/enricher.rs` (structured
//! completion over retrieved context) and `html-router/src/routes/chat/
//! message_response_stream.rs` (`create_stream` token-by-token delivery),
//! generalized from the teacher's SSE transport to a plain `mpsc::Sender`
//! the hub forwards onto whichever sockets are subscribed.

use std::sync::Arc;

use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessage,
        ChatCompletionRequestUserMessage, CreateChatCompletionRequestArgs,
    },
    Client,
};
use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{chat::Chat, chat_message::ChatMessage, knowledge_base::KnowledgeBase},
    },
};
use futures::StreamExt;
use retrieval_pipeline::{QueryRequest, RetrievalEngine};
use tokio::sync::mpsc;

/// How many prior messages are folded into the completion request as history.
const HISTORY_LIMIT: u32 = 10;

const DEFAULT_CHAT_MODEL: &str = "gpt-4o-mini";

const SYSTEM_PROMPT_PREFIX: &str = "You are a support assistant. Answer using only the \
knowledge base context provided below; if the context does not contain the answer, say so \
plainly instead of guessing.";

/// Runs the retrieval + streaming-completion half of `auto`/`mixed` dispatch,
/// forwarding each token to `token_tx` as it arrives and returning the full
/// accumulated reply once the stream ends (so the caller can persist it).
pub async fn generate_reply(
    db: &SurrealDbClient,
    retrieval: &RetrievalEngine,
    openai_client: &Arc<Client<OpenAIConfig>>,
    chat: &Chat,
    user_message: &str,
    token_tx: mpsc::Sender<String>,
) -> Result<String, AppError> {
    let kb = KnowledgeBase::get(db, &chat.kb_id).await?;

    let retrieval_result = retrieval
        .query(&QueryRequest {
            kb_id: chat.kb_id.clone(),
            text: user_message.to_string(),
            ..Default::default()
        })
        .await?;

    let context = retrieval_result
        .chunks
        .iter()
        .map(|c| format!("[{}] {}: {}", c.chunk_id, c.document.title, c.text))
        .collect::<Vec<_>>()
        .join("\n\n");

    let history = ChatMessage::last_n(db, &chat.id, HISTORY_LIMIT).await?;

    let mut messages: Vec<ChatCompletionRequestMessage> = vec![ChatCompletionRequestSystemMessage::from(format!(
        "{SYSTEM_PROMPT_PREFIX}\n\nDomain: {}\n\nContext:\n{}",
        kb.domain,
        if context.is_empty() {
            "(no matching context found)"
        } else {
            &context
        }
    ))
    .into()];

    for past in &history {
        messages.push(
            ChatCompletionRequestUserMessage::from(format!("{:?}: {}", past.sender_kind, past.content)).into(),
        );
    }
    messages.push(ChatCompletionRequestUserMessage::from(user_message.to_string()).into());

    let model = if kb.llm_config.chat_model.is_empty() {
        DEFAULT_CHAT_MODEL.to_string()
    } else {
        kb.llm_config.chat_model.clone()
    };

    let request = CreateChatCompletionRequestArgs::default()
        .model(model)
        .messages(messages)
        .build()?;

    let mut stream = openai_client.chat().create_stream(request).await?;

    let mut full = String::new();
    while let Some(result) = stream.next().await {
        let response = result?;
        if let Some(content) = response.choices.first().and_then(|choice| choice.delta.content.clone()) {
            if !content.is_empty() {
                full.push_str(&content);
                // Receiver gone just means every socket already disconnected; the
                // reply still finishes so it can be persisted for replay.
                let _ = token_tx.send(content).await;
            }
        }
    }

    Ok(full)
}
