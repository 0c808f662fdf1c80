use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::warn;

use super::gateway::{
    LlmCompletion, LlmGateway, LlmGatewayError, LlmGatewayFuture, LlmGatewayRequest,
};
use crate::config::ConfigError;
use crate::config_env::{EnvLookup, parse_u32_env, parse_u64_env, process_env};

const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
const DEFAULT_COOLDOWN_SECONDS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub cooldown_seconds: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            cooldown_seconds: DEFAULT_COOLDOWN_SECONDS,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&process_env)
    }

    pub fn from_lookup(lookup: EnvLookup<'_>) -> Result<Self, ConfigError> {
        let config = Self {
            failure_threshold: parse_u32_env(
                lookup,
                "LLM_CIRCUIT_BREAKER_FAILURE_THRESHOLD",
                DEFAULT_FAILURE_THRESHOLD,
            )?,
            cooldown_seconds: parse_u64_env(
                lookup,
                "LLM_CIRCUIT_BREAKER_COOLDOWN_SECONDS",
                DEFAULT_COOLDOWN_SECONDS,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::InvalidConfiguration(
                "LLM_CIRCUIT_BREAKER_FAILURE_THRESHOLD must be greater than 0".to_string(),
            ));
        }
        if self.cooldown_seconds == 0 {
            return Err(ConfigError::InvalidConfiguration(
                "LLM_CIRCUIT_BREAKER_COOLDOWN_SECONDS must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_seconds)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed { consecutive_failures: u32 },
    Open { until: Instant },
    /// One trial call is in flight. A trial older than the cooldown is
    /// treated as abandoned so a dropped request cannot wedge the breaker.
    HalfOpen { trial_started: Instant },
}

/// How a finished provider call counts against the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallOutcome {
    Healthy,
    Unhealthy,
    Ignored,
}

impl CallOutcome {
    fn of(result: &Result<LlmCompletion, LlmGatewayError>) -> Self {
        match result {
            Ok(_) => Self::Healthy,
            // The provider answered 2xx; the turn degrades to the fallback reply.
            Err(LlmGatewayError::InvalidProviderPayload(_)) => Self::Healthy,
            Err(LlmGatewayError::Timeout | LlmGatewayError::ProviderFailure(_)) => Self::Unhealthy,
            Err(LlmGatewayError::CircuitOpen { .. }) => Self::Ignored,
        }
    }
}

#[derive(Debug)]
struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState::Closed {
                consecutive_failures: 0,
            }),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, BreakerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Reports whether a call would be let through, without claiming the
    /// half-open trial.
    fn peek(&self, now: Instant) -> Result<(), Duration> {
        match *self.lock_state() {
            BreakerState::Closed { .. } => Ok(()),
            BreakerState::Open { until } if now >= until => Ok(()),
            BreakerState::Open { until } => Err(until.saturating_duration_since(now)),
            BreakerState::HalfOpen { trial_started } => self.trial_wait(trial_started, now),
        }
    }

    fn try_enter(&self, now: Instant) -> Result<(), Duration> {
        let mut state = self.lock_state();
        match *state {
            BreakerState::Closed { .. } => Ok(()),
            BreakerState::Open { until } if now >= until => {
                *state = BreakerState::HalfOpen { trial_started: now };
                Ok(())
            }
            BreakerState::Open { until } => Err(until.saturating_duration_since(now)),
            BreakerState::HalfOpen { trial_started } => {
                self.trial_wait(trial_started, now)?;
                *state = BreakerState::HalfOpen { trial_started: now };
                Ok(())
            }
        }
    }

    fn record(&self, outcome: CallOutcome, now: Instant) {
        let mut state = self.lock_state();
        *state = match (outcome, *state) {
            (CallOutcome::Ignored, current) => current,
            (CallOutcome::Healthy, _) => BreakerState::Closed {
                consecutive_failures: 0,
            },
            (CallOutcome::Unhealthy, BreakerState::Closed { consecutive_failures }) => {
                let consecutive_failures = consecutive_failures.saturating_add(1);
                if consecutive_failures >= self.config.failure_threshold {
                    BreakerState::Open {
                        until: now + self.config.cooldown(),
                    }
                } else {
                    BreakerState::Closed {
                        consecutive_failures,
                    }
                }
            }
            (CallOutcome::Unhealthy, _) => BreakerState::Open {
                until: now + self.config.cooldown(),
            },
        };
    }

    fn trial_wait(&self, trial_started: Instant, now: Instant) -> Result<(), Duration> {
        let elapsed = now.saturating_duration_since(trial_started);
        if elapsed >= self.config.cooldown() {
            Ok(())
        } else {
            Err(self.config.cooldown() - elapsed)
        }
    }
}

/// Stops calling the provider for a cooldown after a run of consecutive
/// transport failures, timeouts or non-2xx answers. State is process local.
#[derive(Clone)]
pub struct CircuitBreakerGateway<G> {
    inner: G,
    breaker: Arc<CircuitBreaker>,
}

impl<G> CircuitBreakerGateway<G>
where
    G: LlmGateway,
{
    pub fn new(inner: G, config: CircuitBreakerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            inner,
            breaker: Arc::new(CircuitBreaker::new(config)),
        })
    }
}

impl<G> LlmGateway for CircuitBreakerGateway<G>
where
    G: LlmGateway,
{
    fn check_available(&self) -> Result<(), LlmGatewayError> {
        self.breaker.peek(Instant::now()).map_err(circuit_open_error)?;
        self.inner.check_available()
    }

    fn generate<'a>(&'a self, request: LlmGatewayRequest) -> LlmGatewayFuture<'a> {
        Box::pin(async move {
            self.breaker
                .try_enter(Instant::now())
                .map_err(circuit_open_error)?;

            let result = self.inner.generate(request).await;
            let outcome = CallOutcome::of(&result);
            if outcome == CallOutcome::Unhealthy {
                if let Err(err) = &result {
                    warn!(
                        error_kind = err.kind(),
                        "llm provider call counted against circuit breaker"
                    );
                }
            }
            self.breaker.record(outcome, Instant::now());
            result
        })
    }
}

fn circuit_open_error(wait: Duration) -> LlmGatewayError {
    LlmGatewayError::CircuitOpen {
        retry_after_seconds: retry_after_seconds(wait),
    }
}

/// Whole seconds, rounded up, never zero.
pub fn retry_after_seconds(wait: Duration) -> u64 {
    let seconds = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
    seconds.max(1)
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::{
        BreakerState, CallOutcome, CircuitBreaker, CircuitBreakerConfig, retry_after_seconds,
    };

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            cooldown_seconds: 30,
        })
    }

    #[test]
    fn opens_after_consecutive_failures_only() {
        let breaker = breaker(2);
        let now = Instant::now();

        breaker.record(CallOutcome::Unhealthy, now);
        breaker.record(CallOutcome::Healthy, now);
        breaker.record(CallOutcome::Unhealthy, now);
        assert!(breaker.try_enter(now).is_ok());

        breaker.record(CallOutcome::Unhealthy, now);
        let wait = breaker.try_enter(now).expect_err("breaker should be open");
        assert_eq!(wait, Duration::from_secs(30));
    }

    #[test]
    fn half_open_admits_a_single_trial() {
        let breaker = breaker(1);
        let now = Instant::now();
        breaker.record(CallOutcome::Unhealthy, now);

        let after_cooldown = now + Duration::from_secs(30);
        assert!(breaker.peek(after_cooldown).is_ok());
        assert!(breaker.try_enter(after_cooldown).is_ok());
        assert!(breaker.try_enter(after_cooldown).is_err());
        assert!(breaker.peek(after_cooldown).is_err());

        breaker.record(CallOutcome::Unhealthy, after_cooldown);
        assert!(matches!(*breaker.lock_state(), BreakerState::Open { .. }));
    }

    #[test]
    fn abandoned_trial_expires_after_cooldown() {
        let breaker = breaker(1);
        let now = Instant::now();
        breaker.record(CallOutcome::Unhealthy, now);

        let trial_at = now + Duration::from_secs(30);
        assert!(breaker.try_enter(trial_at).is_ok());
        assert!(breaker.try_enter(trial_at + Duration::from_secs(29)).is_err());
        assert!(breaker.try_enter(trial_at + Duration::from_secs(30)).is_ok());
    }

    #[test]
    fn ignored_outcome_leaves_state_untouched() {
        let breaker = breaker(1);
        let now = Instant::now();
        breaker.record(CallOutcome::Unhealthy, now);
        breaker.record(CallOutcome::Ignored, now);
        assert!(breaker.peek(now).is_err());
    }

    #[test]
    fn retry_after_rounds_up_and_is_never_zero() {
        assert_eq!(retry_after_seconds(Duration::ZERO), 1);
        assert_eq!(retry_after_seconds(Duration::from_millis(1_500)), 2);
        assert_eq!(retry_after_seconds(Duration::from_secs(7)), 7);
    }
}
