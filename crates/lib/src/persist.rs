//! Entity persistence collaborator.
//!
//! The conversation controller mirrors threads and messages through [`EntityStore`]. The core
//! only queries and upserts; deletion belongs to whoever owns the store.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::thread::{Message, Thread};

/// A persisted record. Wire shape carries `entityType: "Thread" | "Message"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entityType")]
pub enum Entity {
    Thread(Thread),
    Message(Message),
}

impl Entity {
    pub fn id(&self) -> &str {
        match self {
            Entity::Thread(t) => &t.id,
            Entity::Message(m) => &m.id,
        }
    }
}

/// Query shapes the controller needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityFilter {
    /// All threads owned by a user.
    ThreadsForUser(String),
    /// All messages whose thread id matches.
    MessagesInThread(String),
}

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("entity store unavailable: {0}")]
    Unavailable(String),
    #[error("entity store rejected write: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn query_entities(&self, filter: &EntityFilter) -> Result<Vec<Entity>, PersistError>;
    async fn batch_upsert(&self, entities: Vec<Entity>) -> Result<(), PersistError>;
}

/// In-memory entity store (upsert by id). Used by the CLI and tests.
pub struct InMemoryEntityStore {
    inner: Arc<RwLock<HashMap<String, Entity>>>,
}

impl Default for InMemoryEntityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEntityStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Return a clone of the entity if it exists.
    pub async fn get(&self, id: &str) -> Option<Entity> {
        self.inner.read().await.get(id).cloned()
    }

    pub async fn message(&self, id: &str) -> Option<Message> {
        match self.get(id).await {
            Some(Entity::Message(m)) => Some(m),
            _ => None,
        }
    }

    pub async fn thread(&self, id: &str) -> Option<Thread> {
        match self.get(id).await {
            Some(Entity::Thread(t)) => Some(t),
            _ => None,
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

#[async_trait]
impl EntityStore for InMemoryEntityStore {
    async fn query_entities(&self, filter: &EntityFilter) -> Result<Vec<Entity>, PersistError> {
        let g = self.inner.read().await;
        let mut out: Vec<Entity> = g
            .values()
            .filter(|e| match (filter, e) {
                (EntityFilter::ThreadsForUser(user), Entity::Thread(t)) => &t.user_id == user,
                (EntityFilter::MessagesInThread(thread), Entity::Message(m)) => {
                    &m.thread_id == thread
                }
                _ => false,
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            let key = |e: &Entity| match e {
                Entity::Thread(t) => t.created_at,
                Entity::Message(m) => m.created_at,
            };
            key(a).cmp(&key(b)).then_with(|| a.id().cmp(b.id()))
        });
        Ok(out)
    }

    async fn batch_upsert(&self, entities: Vec<Entity>) -> Result<(), PersistError> {
        let mut g = self.inner.write().await;
        for e in entities {
            g.insert(e.id().to_string(), e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::{ChatMode, ContentBlock};

    #[tokio::test]
    async fn upsert_replaces_by_id_and_filters() {
        let store = InMemoryEntityStore::new();
        let mut thread = Thread::new("u1", ChatMode::Chat, "New Chat");
        let mut msg = Message::user("u1", ContentBlock::text("hi"), &thread.id);
        thread.link(&msg.id);
        store
            .batch_upsert(vec![Entity::Thread(thread.clone()), Entity::Message(msg.clone())])
            .await
            .unwrap();

        msg.content.push(ContentBlock::text("again"));
        store.batch_upsert(vec![Entity::Message(msg.clone())]).await.unwrap();
        assert_eq!(store.len().await, 2);
        assert_eq!(store.message(&msg.id).await.unwrap().content.len(), 2);

        let threads = store
            .query_entities(&EntityFilter::ThreadsForUser("u1".into()))
            .await
            .unwrap();
        assert_eq!(threads, vec![Entity::Thread(thread.clone())]);
        let none = store
            .query_entities(&EntityFilter::ThreadsForUser("u2".into()))
            .await
            .unwrap();
        assert!(none.is_empty());
        let msgs = store
            .query_entities(&EntityFilter::MessagesInThread(thread.id.clone()))
            .await
            .unwrap();
        assert_eq!(msgs.len(), 1);
    }

    #[test]
    fn entity_wire_tag() {
        let t = Thread::new("u", ChatMode::Editor, "New Document");
        let v = serde_json::to_value(Entity::Thread(t)).unwrap();
        assert_eq!(v["entityType"], "Thread");
        assert_eq!(v["mode"], "editor");
        assert!(v["messageIds"].is_array());
    }
}
