use sqlx::Row;
use sqlx::postgres::PgRow;
use uuid::Uuid;

use crate::models::{Message, MessageRole, NewMessage};

use super::{ConversationStore, Store, StoreError, StoreFuture, limit_to_i64};

const MESSAGE_COLUMNS: &str = "id, session_id, user_id, role, content, created_at";

impl Store {
    pub async fn append_message(&self, message: NewMessage) -> Result<Message, StoreError> {
        let row = sqlx::query(&format!(
            "INSERT INTO messages (id, session_id, user_id, role, content)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(&message.session_id)
        .bind(&message.user_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .fetch_one(&self.pool)
        .await?;

        message_from_row(&row)
    }

    pub async fn load_recent_history(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM (
               SELECT {MESSAGE_COLUMNS}, seq
               FROM messages
               WHERE session_id = $1
               ORDER BY created_at DESC, seq DESC
               LIMIT $2
             ) recent
             ORDER BY created_at ASC, seq ASC"
        ))
        .bind(session_id)
        .bind(limit_to_i64(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(message_from_row).collect()
    }

    pub async fn load_session_messages(&self, session_id: &str) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages
             WHERE session_id = $1
             ORDER BY created_at ASC, seq ASC"
        ))
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(message_from_row).collect()
    }
}

impl ConversationStore for Store {
    fn append<'a>(&'a self, message: NewMessage) -> StoreFuture<'a, Message> {
        Box::pin(self.append_message(message))
    }

    fn recent_history<'a>(
        &'a self,
        session_id: &'a str,
        limit: usize,
    ) -> StoreFuture<'a, Vec<Message>> {
        Box::pin(self.load_recent_history(session_id, limit))
    }

    fn ping<'a>(&'a self) -> StoreFuture<'a, ()> {
        Box::pin(Store::ping(self))
    }
}

fn message_from_row(row: &PgRow) -> Result<Message, StoreError> {
    let role_raw: String = row.try_get("role")?;
    let role = MessageRole::parse(&role_raw).ok_or_else(|| {
        StoreError::InvalidData(format!("unknown message role persisted: {role_raw}"))
    })?;

    Ok(Message {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        user_id: row.try_get("user_id")?,
        role,
        content: row.try_get("content")?,
        created_at: row.try_get("created_at")?,
    })
}
