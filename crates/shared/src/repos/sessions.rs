use sqlx::Row;
use sqlx::postgres::PgRow;
use uuid::Uuid;

use crate::models::{Message, Session};

use super::{SessionStore, Store, StoreError, StoreFuture, limit_to_i64};

const SESSION_COLUMNS: &str =
    "id, user_id, personality_used, message_count, started_at, ended_at";

impl Store {
    pub async fn insert_session(
        &self,
        user_id: &str,
        personality: &str,
    ) -> Result<Session, StoreError> {
        let row = sqlx::query(&format!(
            "INSERT INTO sessions (id, user_id, personality_used)
             VALUES ($1, $2, $3)
             RETURNING {SESSION_COLUMNS}"
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(user_id)
        .bind(personality)
        .fetch_one(&self.pool)
        .await?;

        session_from_row(&row)
    }

    pub async fn load_sessions_for_user(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<Session>, StoreError> {
        let rows = sqlx::query(
            "SELECT s.id, s.user_id, s.personality_used, s.started_at, s.ended_at,
                    (SELECT COUNT(*)::INTEGER FROM messages m WHERE m.session_id = s.id)
                      AS message_count
             FROM sessions s
             WHERE s.user_id = $1
             ORDER BY s.started_at DESC
             LIMIT $2",
        )
        .bind(user_id)
        .bind(limit_to_i64(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(session_from_row).collect()
    }

    pub async fn mark_session_ended(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE sessions
             SET ended_at = COALESCE(ended_at, NOW()),
                 message_count = (
                   SELECT COUNT(*)::INTEGER FROM messages WHERE session_id = $1
                 )
             WHERE id = $1
             RETURNING {SESSION_COLUMNS}"
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(session_from_row).transpose()
    }

    pub async fn remove_session(&self, session_id: &str) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query("DELETE FROM sessions WHERE id = $1")
            .bind(session_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if deleted == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query("DELETE FROM messages WHERE session_id = $1")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }
}

impl SessionStore for Store {
    fn create_session<'a>(
        &'a self,
        user_id: &'a str,
        personality: &'a str,
    ) -> StoreFuture<'a, Session> {
        Box::pin(self.insert_session(user_id, personality))
    }

    fn list_sessions<'a>(
        &'a self,
        user_id: &'a str,
        limit: usize,
    ) -> StoreFuture<'a, Vec<Session>> {
        Box::pin(self.load_sessions_for_user(user_id, limit))
    }

    fn session_messages<'a>(&'a self, session_id: &'a str) -> StoreFuture<'a, Vec<Message>> {
        Box::pin(self.load_session_messages(session_id))
    }

    fn end_session<'a>(&'a self, session_id: &'a str) -> StoreFuture<'a, Option<Session>> {
        Box::pin(self.mark_session_ended(session_id))
    }

    fn delete_session<'a>(&'a self, session_id: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(self.remove_session(session_id))
    }
}

fn session_from_row(row: &PgRow) -> Result<Session, StoreError> {
    Ok(Session {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        personality_used: row.try_get("personality_used")?,
        message_count: row.try_get("message_count")?,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
    })
}
