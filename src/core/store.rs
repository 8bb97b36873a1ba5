use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::core::message::{Conversation, Message, Tag};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Unknown conversation: {0}")]
    UnknownConversation(String),
    #[error("Unknown message {message_id} in conversation {conversation_id}")]
    UnknownMessage {
        conversation_id: String,
        message_id: String,
    },
    #[error("Tag {0} is already terminal and cannot return to running")]
    TagRegression(String),
}

/// Persistence consumed by the round orchestrator. Implementations must give
/// read-your-writes within one process.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn load(&self, conversation_id: &str) -> Result<Conversation, StoreError>;

    async fn save(&self, conversation: Conversation);

    async fn append_message(
        &self,
        conversation_id: &str,
        message: Message,
    ) -> Result<(), StoreError>;

    async fn replace_message_content(
        &self,
        conversation_id: &str,
        message_id: &str,
        content: &str,
    ) -> Result<(), StoreError>;

    async fn set_message_reasoning(
        &self,
        conversation_id: &str,
        message_id: &str,
        reasoning: Option<String>,
    ) -> Result<(), StoreError>;

    /// Inserts the tag or replaces the one with the same id.
    async fn upsert_tag(
        &self,
        conversation_id: &str,
        message_id: &str,
        tag: Tag,
    ) -> Result<(), StoreError>;
}

#[derive(Default)]
pub struct MemoryConversationStore {
    conversations: RwLock<HashMap<String, Conversation>>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn with_message<F>(
        &self,
        conversation_id: &str,
        message_id: &str,
        update: F,
    ) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Message) -> Result<(), StoreError> + Send,
    {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .get_mut(conversation_id)
            .ok_or_else(|| StoreError::UnknownConversation(conversation_id.to_string()))?;
        let message =
            conversation
                .message_mut(message_id)
                .ok_or_else(|| StoreError::UnknownMessage {
                    conversation_id: conversation_id.to_string(),
                    message_id: message_id.to_string(),
                })?;
        update(message)?;
        conversation.touch();
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn load(&self, conversation_id: &str) -> Result<Conversation, StoreError> {
        self.conversations
            .read()
            .await
            .get(conversation_id)
            .cloned()
            .ok_or_else(|| StoreError::UnknownConversation(conversation_id.to_string()))
    }

    async fn save(&self, conversation: Conversation) {
        self.conversations
            .write()
            .await
            .insert(conversation.id.clone(), conversation);
    }

    async fn append_message(
        &self,
        conversation_id: &str,
        message: Message,
    ) -> Result<(), StoreError> {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .get_mut(conversation_id)
            .ok_or_else(|| StoreError::UnknownConversation(conversation_id.to_string()))?;
        conversation.messages.push(message);
        conversation.touch();
        Ok(())
    }

    async fn replace_message_content(
        &self,
        conversation_id: &str,
        message_id: &str,
        content: &str,
    ) -> Result<(), StoreError> {
        self.with_message(conversation_id, message_id, |message| {
            message.content = content.to_string();
            Ok(())
        })
        .await
    }

    async fn set_message_reasoning(
        &self,
        conversation_id: &str,
        message_id: &str,
        reasoning: Option<String>,
    ) -> Result<(), StoreError> {
        self.with_message(conversation_id, message_id, |message| {
            message.reasoning = reasoning.filter(|text| !text.is_empty());
            Ok(())
        })
        .await
    }

    async fn upsert_tag(
        &self,
        conversation_id: &str,
        message_id: &str,
        tag: Tag,
    ) -> Result<(), StoreError> {
        self.with_message(conversation_id, message_id, |message| {
            let tag_id = tag.id.clone();
            if message.upsert_tag(tag) {
                Ok(())
            } else {
                Err(StoreError::TagRegression(tag_id))
            }
        })
        .await
    }
}
