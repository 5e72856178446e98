//! # Conversation Store
//!
//! Durable turn history keyed by conversation id. The voice session only ever
//! appends to it through the gateway's persistence hook; the trait keeps the
//! backing technology swappable. [`MemoryStore`] is the implementation the server
//! ships with.

use crate::error::{AppError, AppResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use uuid::Uuid;

/// Who said something.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message in the in-memory conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl From<&StoredMessage> for Turn {
    fn from(message: &StoredMessage) -> Self {
        Turn::new(message.role, message.content.clone())
    }
}

/// Create/read/update/delete operations over conversations and their messages.
///
/// Implementations must be callable from any actix worker thread.
pub trait ConversationStore: Send + Sync {
    fn create_conversation(&self, title: &str) -> AppResult<Conversation>;

    fn get_conversation(&self, conversation_id: &str) -> AppResult<Option<Conversation>>;

    /// Most recently updated first.
    fn list_conversations(&self) -> AppResult<Vec<Conversation>>;

    /// Appends a message and bumps the conversation's `updated_at`.
    fn add_message(&self, conversation_id: &str, role: Role, content: &str) -> AppResult<StoredMessage>;

    /// Messages in insertion order.
    fn list_messages(&self, conversation_id: &str) -> AppResult<Vec<StoredMessage>>;

    fn update_title(&self, conversation_id: &str, title: &str) -> AppResult<()>;

    /// Returns whether anything was deleted.
    fn delete_conversation(&self, conversation_id: &str) -> AppResult<bool>;
}

#[derive(Debug, Default)]
struct StoreInner {
    conversations: HashMap<String, Conversation>,
    messages: HashMap<String, Vec<StoredMessage>>,
}

/// In-process store guarded by a single `RwLock`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<StoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn missing(conversation_id: &str) -> AppError {
    AppError::NotFound(format!("Conversation {} not found.", conversation_id))
}

impl ConversationStore for MemoryStore {
    fn create_conversation(&self, title: &str) -> AppResult<Conversation> {
        let now = Utc::now();
        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            title: title.to_string(),
            created_at: now,
            updated_at: now,
        };

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner
            .conversations
            .insert(conversation.id.clone(), conversation.clone());
        inner.messages.insert(conversation.id.clone(), Vec::new());
        Ok(conversation)
    }

    fn get_conversation(&self, conversation_id: &str) -> AppResult<Option<Conversation>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(inner.conversations.get(conversation_id).cloned())
    }

    fn list_conversations(&self) -> AppResult<Vec<Conversation>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut conversations: Vec<Conversation> = inner.conversations.values().cloned().collect();
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(conversations)
    }

    fn add_message(&self, conversation_id: &str, role: Role, content: &str) -> AppResult<StoredMessage> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let now = Utc::now();

        let conversation = inner
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| missing(conversation_id))?;
        conversation.updated_at = now;

        let message = StoredMessage {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            role,
            content: content.to_string(),
            created_at: now,
        };
        inner
            .messages
            .entry(conversation_id.to_string())
            .or_default()
            .push(message.clone());
        Ok(message)
    }

    fn list_messages(&self, conversation_id: &str) -> AppResult<Vec<StoredMessage>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        if !inner.conversations.contains_key(conversation_id) {
            return Err(missing(conversation_id));
        }
        Ok(inner.messages.get(conversation_id).cloned().unwrap_or_default())
    }

    fn update_title(&self, conversation_id: &str, title: &str) -> AppResult<()> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let conversation = inner
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| missing(conversation_id))?;
        conversation.title = title.to_string();
        conversation.updated_at = Utc::now();
        Ok(())
    }

    fn delete_conversation(&self, conversation_id: &str) -> AppResult<bool> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.messages.remove(conversation_id);
        Ok(inner.conversations.remove(conversation_id).is_some())
    }
}
