use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One async mutex per session id, so turns on the same session run one at a
/// time within this process. Entries are dropped once nobody holds or waits.
#[derive(Clone, Default)]
pub struct SessionTurnLocks {
    sessions: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl SessionTurnLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, session_id: &str) -> SessionTurnGuard {
        let session_lock = {
            let mut sessions = self.lock_sessions();
            sessions
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };

        let guard = session_lock.lock_owned().await;
        SessionTurnGuard {
            locks: self.clone(),
            session_id: session_id.to_string(),
            guard: Some(guard),
        }
    }

    pub fn tracked_sessions(&self) -> usize {
        self.lock_sessions().len()
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<AsyncMutex<()>>>> {
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn release(&self, session_id: &str) {
        let mut sessions = self.lock_sessions();
        let unused = sessions
            .get(session_id)
            .is_some_and(|session_lock| Arc::strong_count(session_lock) == 1);
        if unused {
            sessions.remove(session_id);
        }
    }
}

pub struct SessionTurnGuard {
    locks: SessionTurnLocks,
    session_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for SessionTurnGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks.release(&self.session_id);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::SessionTurnLocks;

    #[tokio::test]
    async fn same_session_turns_do_not_overlap() {
        let locks = SessionTurnLocks::new();
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let locks = locks.clone();
            let active = active.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire("s1").await;
                let now_active = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now_active, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.expect("task should finish");
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(locks.tracked_sessions(), 0);
    }

    #[tokio::test]
    async fn different_sessions_do_not_block_each_other() {
        let locks = SessionTurnLocks::new();
        let _first = locks.acquire("s1").await;

        let second = tokio::time::timeout(Duration::from_millis(100), locks.acquire("s2")).await;
        assert!(second.is_ok());
        assert_eq!(locks.tracked_sessions(), 2);
    }
}
