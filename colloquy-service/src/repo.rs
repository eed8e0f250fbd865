//! Collaborator repository interfaces.
//!
//! The session core persists nothing relational itself; users are resolved
//! and messages durably stored through these traits. The in-memory
//! implementations back tests and standalone runs; production deployments
//! wire real stores here.

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use crate::error::ServiceResult;
use crate::websocket::ChatMessage;

/// A stored user record.
#[derive(Debug, Clone)]
pub struct User {
    pub id: String,
    pub is_active: bool,
    pub is_admin: bool,
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn find_by_id(&self, user_id: &str) -> ServiceResult<Option<User>>;
}

/// Durable message sink, called fire-and-forget after fan-out.
#[async_trait]
pub trait MessageRepository: Send + Sync {
    async fn persist(&self, message: &ChatMessage) -> ServiceResult<()>;
}

/// In-memory user store.
#[derive(Default)]
pub struct MemoryUserRepository {
    users: DashMap<String, User>,
}

impl MemoryUserRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, user: User) {
        self.users.insert(user.id.clone(), user);
    }

    pub fn seeded(users: impl IntoIterator<Item = User>) -> Self {
        let repo = Self::new();
        for user in users {
            repo.insert(user);
        }
        repo
    }
}

#[async_trait]
impl UserRepository for MemoryUserRepository {
    async fn find_by_id(&self, user_id: &str) -> ServiceResult<Option<User>> {
        Ok(self.users.get(user_id).map(|u| u.clone()))
    }
}

/// Message sink that records nothing. Persistence failures are logged only,
/// so a discarding sink is a valid deployment choice.
#[derive(Default)]
pub struct NullMessageRepository;

impl NullMessageRepository {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MessageRepository for NullMessageRepository {
    async fn persist(&self, message: &ChatMessage) -> ServiceResult<()> {
        debug!(message_id = %message.id, "Discarding message (null repository)");
        Ok(())
    }
}
