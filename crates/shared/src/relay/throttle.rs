use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::config::ConfigError;
use crate::config_env::{EnvLookup, parse_u32_env, parse_u64_env, process_env};
use crate::llm::retry_after_seconds;

const DEFAULT_WINDOW_SECONDS: u64 = 60;
const DEFAULT_GLOBAL_MAX_TURNS: u32 = 120;
const DEFAULT_PER_USER_MAX_TURNS: u32 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnThrottleConfig {
    pub window_seconds: u64,
    pub global_max_turns: u32,
    pub per_user_max_turns: u32,
}

impl Default for TurnThrottleConfig {
    fn default() -> Self {
        Self {
            window_seconds: DEFAULT_WINDOW_SECONDS,
            global_max_turns: DEFAULT_GLOBAL_MAX_TURNS,
            per_user_max_turns: DEFAULT_PER_USER_MAX_TURNS,
        }
    }
}

impl TurnThrottleConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&process_env)
    }

    pub fn from_lookup(lookup: EnvLookup<'_>) -> Result<Self, ConfigError> {
        let config = Self {
            window_seconds: parse_u64_env(
                lookup,
                "TURN_RATE_LIMIT_WINDOW_SECONDS",
                DEFAULT_WINDOW_SECONDS,
            )?,
            global_max_turns: parse_u32_env(
                lookup,
                "TURN_RATE_LIMIT_GLOBAL_MAX",
                DEFAULT_GLOBAL_MAX_TURNS,
            )?,
            per_user_max_turns: parse_u32_env(
                lookup,
                "TURN_RATE_LIMIT_PER_USER_MAX",
                DEFAULT_PER_USER_MAX_TURNS,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (value, key) in [
            (self.window_seconds, "TURN_RATE_LIMIT_WINDOW_SECONDS"),
            (u64::from(self.global_max_turns), "TURN_RATE_LIMIT_GLOBAL_MAX"),
            (u64::from(self.per_user_max_turns), "TURN_RATE_LIMIT_PER_USER_MAX"),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidConfiguration(format!(
                    "{key} must be greater than 0"
                )));
            }
        }
        Ok(())
    }

    fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleScope {
    Global,
    User,
}

impl ThrottleScope {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::User => "user",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleRejection {
    pub scope: ThrottleScope,
    pub retry_after_seconds: u64,
}

#[derive(Debug, Clone, Copy)]
struct TurnWindow {
    opened_at: Instant,
    admitted: u32,
}

impl TurnWindow {
    fn opened(now: Instant) -> Self {
        Self {
            opened_at: now,
            admitted: 0,
        }
    }

    fn roll(&mut self, now: Instant, window: Duration) {
        if now.saturating_duration_since(self.opened_at) >= window {
            *self = Self::opened(now);
        }
    }

    fn remaining(&self, now: Instant, window: Duration) -> Duration {
        window.saturating_sub(now.saturating_duration_since(self.opened_at))
    }
}

#[derive(Debug)]
struct ThrottleState {
    global: TurnWindow,
    per_user: HashMap<String, TurnWindow>,
}

/// Fixed-window turn admission checked before a turn writes anything.
///
/// Keys on the caller-supplied `userId`, which is not authenticated: the
/// per-user limit slows down honest clients, the global limit is the actual
/// cap on upstream spend. Counters are process local and reset on restart.
#[derive(Clone)]
pub struct TurnThrottle {
    config: TurnThrottleConfig,
    state: Arc<Mutex<ThrottleState>>,
}

impl TurnThrottle {
    pub fn new(config: TurnThrottleConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            state: Arc::new(Mutex::new(ThrottleState {
                global: TurnWindow::opened(Instant::now()),
                per_user: HashMap::new(),
            })),
        })
    }

    pub fn admit(&self, user_id: &str) -> Result<(), ThrottleRejection> {
        self.admit_at(user_id, Instant::now())
    }

    fn admit_at(&self, user_id: &str, now: Instant) -> Result<(), ThrottleRejection> {
        let window = self.config.window();
        let mut state = self.lock_state();

        let global_rolled = {
            let before = state.global.opened_at;
            state.global.roll(now, window);
            state.global.opened_at != before
        };
        if global_rolled {
            state
                .per_user
                .retain(|_, user| now.saturating_duration_since(user.opened_at) < window);
        }

        if state.global.admitted >= self.config.global_max_turns {
            return Err(rejection(ThrottleScope::Global, state.global.remaining(now, window)));
        }

        let user = state
            .per_user
            .entry(user_id.to_string())
            .or_insert_with(|| TurnWindow::opened(now));
        user.roll(now, window);
        if user.admitted >= self.config.per_user_max_turns {
            return Err(rejection(ThrottleScope::User, user.remaining(now, window)));
        }

        // Both windows have room; only now is a slot taken from either.
        user.admitted += 1;
        state.global.admitted += 1;
        Ok(())
    }

    fn lock_state(&self) -> MutexGuard<'_, ThrottleState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    #[cfg(test)]
    fn tracked_users(&self) -> usize {
        self.lock_state().per_user.len()
    }
}

fn rejection(scope: ThrottleScope, wait: Duration) -> ThrottleRejection {
    ThrottleRejection {
        scope,
        retry_after_seconds: retry_after_seconds(wait),
    }
}
