//! In-process store backing tests and local runs without Postgres.
//! Not durable: everything is lost when the process exits.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{Message, NewMessage, Session, UserProfile};

use super::{ConversationStore, ProfileStore, SessionStore, StoreFuture};

#[derive(Debug, Default)]
struct MemoryState {
    messages: Vec<Message>,
    sessions: Vec<Session>,
    profiles: HashMap<String, UserProfile>,
    last_created_at: Option<DateTime<Utc>>,
}

impl MemoryState {
    // Wall clocks can step backwards; creation times handed out here never do.
    fn next_timestamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let created_at = match self.last_created_at {
            Some(last) if last > now => last,
            _ => now,
        };
        self.last_created_at = Some(created_at);
        created_at
    }

    fn count_messages(&self, session_id: &str) -> i32 {
        let count = self
            .messages
            .iter()
            .filter(|message| message.session_id == session_id)
            .count();
        i32::try_from(count).unwrap_or(i32::MAX)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored message across sessions, in insertion order.
    pub async fn all_messages(&self) -> Vec<Message> {
        self.state.read().await.messages.clone()
    }

    pub async fn message_count(&self, session_id: &str) -> usize {
        self.state
            .read()
            .await
            .messages
            .iter()
            .filter(|message| message.session_id == session_id)
            .count()
    }
}

impl ConversationStore for MemoryStore {
    fn append<'a>(&'a self, message: NewMessage) -> StoreFuture<'a, Message> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let stored = Message {
                id: Uuid::new_v4(),
                session_id: message.session_id,
                user_id: message.user_id,
                role: message.role,
                content: message.content,
                created_at: state.next_timestamp(),
            };
            state.messages.push(stored.clone());
            Ok(stored)
        })
    }

    fn recent_history<'a>(
        &'a self,
        session_id: &'a str,
        limit: usize,
    ) -> StoreFuture<'a, Vec<Message>> {
        Box::pin(async move {
            let state = self.state.read().await;
            let session_messages = state
                .messages
                .iter()
                .filter(|message| message.session_id == session_id)
                .collect::<Vec<_>>();
            let skip = session_messages.len().saturating_sub(limit);
            Ok(session_messages.into_iter().skip(skip).cloned().collect())
        })
    }

    fn ping<'a>(&'a self) -> StoreFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }
}

impl SessionStore for MemoryStore {
    fn create_session<'a>(
        &'a self,
        user_id: &'a str,
        personality: &'a str,
    ) -> StoreFuture<'a, Session> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let session = Session {
                id: Uuid::new_v4().to_string(),
                user_id: user_id.to_string(),
                personality_used: personality.to_string(),
                message_count: 0,
                started_at: state.next_timestamp(),
                ended_at: None,
            };
            state.sessions.push(session.clone());
            Ok(session)
        })
    }

    fn list_sessions<'a>(
        &'a self,
        user_id: &'a str,
        limit: usize,
    ) -> StoreFuture<'a, Vec<Session>> {
        Box::pin(async move {
            let state = self.state.read().await;
            // Later insertions win ties on started_at.
            let mut sessions = state
                .sessions
                .iter()
                .enumerate()
                .filter(|(_, session)| session.user_id == user_id)
                .collect::<Vec<_>>();
            sessions.sort_by(|(left_pos, left), (right_pos, right)| {
                right
                    .started_at
                    .cmp(&left.started_at)
                    .then(right_pos.cmp(left_pos))
            });
            Ok(sessions
                .into_iter()
                .take(limit)
                .map(|(_, session)| Session {
                    message_count: state.count_messages(&session.id),
                    ..session.clone()
                })
                .collect())
        })
    }

    fn session_messages<'a>(&'a self, session_id: &'a str) -> StoreFuture<'a, Vec<Message>> {
        Box::pin(async move {
            let state = self.state.read().await;
            Ok(state
                .messages
                .iter()
                .filter(|message| message.session_id == session_id)
                .cloned()
                .collect())
        })
    }

    fn end_session<'a>(&'a self, session_id: &'a str) -> StoreFuture<'a, Option<Session>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let message_count = state.count_messages(session_id);
            let ended_at = state.next_timestamp();

            let Some(session) = state
                .sessions
                .iter_mut()
                .find(|session| session.id == session_id)
            else {
                return Ok(None);
            };

            session.message_count = message_count;
            if session.ended_at.is_none() {
                session.ended_at = Some(ended_at);
            }
            Ok(Some(session.clone()))
        })
    }

    fn delete_session<'a>(&'a self, session_id: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let sessions_before = state.sessions.len();
            state.sessions.retain(|session| session.id != session_id);
            let deleted = state.sessions.len() != sessions_before;
            if deleted {
                state
                    .messages
                    .retain(|message| message.session_id != session_id);
            }
            Ok(deleted)
        })
    }
}

impl ProfileStore for MemoryStore {
    fn get_profile<'a>(&'a self, user_id: &'a str) -> StoreFuture<'a, Option<UserProfile>> {
        Box::pin(async move { Ok(self.state.read().await.profiles.get(user_id).cloned()) })
    }

    fn save_profile<'a>(
        &'a self,
        user_id: &'a str,
        display_name: Option<&'a str>,
    ) -> StoreFuture<'a, UserProfile> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let now = state.next_timestamp();
            let profile = state
                .profiles
                .entry(user_id.to_string())
                .or_insert_with(|| UserProfile {
                    user_id: user_id.to_string(),
                    display_name: None,
                    created_at: now,
                    updated_at: now,
                });
            profile.display_name = display_name.map(ToString::to_string);
            profile.updated_at = now;
            Ok(profile.clone())
        })
    }
}
