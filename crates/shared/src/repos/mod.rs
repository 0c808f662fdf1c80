use std::future::Future;
use std::pin::Pin;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use thiserror::Error;

use crate::models::{Message, NewMessage, Session, UserProfile};

mod memory;
mod messages;
mod profiles;
mod sessions;

pub use memory::MemoryStore;

pub const DEFAULT_SESSION_LIST_LIMIT: usize = 50;

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid persisted data: {0}")]
    InvalidData(String),
}

/// Append-only message log keyed by session.
pub trait ConversationStore: Send + Sync {
    fn append<'a>(&'a self, message: NewMessage) -> StoreFuture<'a, Message>;

    /// The most recent `limit` messages of a session, oldest first.
    fn recent_history<'a>(
        &'a self,
        session_id: &'a str,
        limit: usize,
    ) -> StoreFuture<'a, Vec<Message>>;

    fn ping<'a>(&'a self) -> StoreFuture<'a, ()>;
}

/// Session bookkeeping used by the surrounding application, never by the relay.
pub trait SessionStore: Send + Sync {
    fn create_session<'a>(
        &'a self,
        user_id: &'a str,
        personality: &'a str,
    ) -> StoreFuture<'a, Session>;

    /// Sessions of a user, newest `started_at` first, each with its current
    /// message count.
    fn list_sessions<'a>(&'a self, user_id: &'a str, limit: usize)
    -> StoreFuture<'a, Vec<Session>>;

    fn session_messages<'a>(&'a self, session_id: &'a str) -> StoreFuture<'a, Vec<Message>>;

    /// Marks the session ended (first call wins) and recounts its messages.
    fn end_session<'a>(&'a self, session_id: &'a str) -> StoreFuture<'a, Option<Session>>;

    /// Removes the session and its messages; `false` when it did not exist,
    /// in which case nothing is removed.
    fn delete_session<'a>(&'a self, session_id: &'a str) -> StoreFuture<'a, bool>;
}

pub trait ProfileStore: Send + Sync {
    fn get_profile<'a>(&'a self, user_id: &'a str) -> StoreFuture<'a, Option<UserProfile>>;

    /// Creates the profile on first save.
    fn save_profile<'a>(
        &'a self,
        user_id: &'a str,
        display_name: Option<&'a str>,
    ) -> StoreFuture<'a, UserProfile>;
}

#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        let _: i32 = sqlx::query_scalar("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }
}

fn limit_to_i64(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}
