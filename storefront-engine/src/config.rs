//! Configuration for the conversational shopping engine.
//!
//! Loaded from environment variables with the defaults the source spec
//! fixes explicitly (turn budget, reservation TTLs, history window, ...).
//! Mirrors the flat `Config::from_env()` style used elsewhere in this
//! workspace rather than a builder, since every field here has a spec-given
//! default and no field depends on another at construction time.

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Per-turn deadlines and history windowing (C5).
    pub turn: TurnConfig,
    /// Reservation TTLs and sweeper cadence (C1).
    pub reservation: ReservationConfig,
    /// NLU call deadline and circuit breaker tuning (C4).
    pub nlu: NluConfig,
    /// Fan-out Hub backpressure (C7).
    pub hub: HubConfig,
    /// Session idle/absolute lifetime tuning (C2).
    pub session: SessionConfig,
}

/// Dialogue Controller (C5) timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnConfig {
    /// Overall per-turn deadline; every port call inside a turn is bounded
    /// by a remaining-budget derivative of this value.
    pub deadline_secs: u64,
    /// Number of most-recent turns included in the prompt window handed to
    /// the NLU Adapter.
    pub history_window: usize,
}

impl TurnConfig {
    /// `deadline_secs` as a [`Duration`].
    #[must_use]
    pub const fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }
}

/// Reservation Ledger (C1) timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationConfig {
    /// Soft TTL applied when a cart line is first reserved.
    pub soft_cart_ttl_secs: u64,
    /// Extended TTL applied when checkout begins.
    pub checkout_ttl_secs: u64,
    /// Sweeper scan interval; spec requires this never exceed `ttl / 4`.
    pub sweep_interval_secs: u64,
}

impl ReservationConfig {
    /// `soft_cart_ttl_secs` as a [`Duration`].
    #[must_use]
    pub const fn soft_cart_ttl(&self) -> Duration {
        Duration::from_secs(self.soft_cart_ttl_secs)
    }

    /// `checkout_ttl_secs` as a [`Duration`].
    #[must_use]
    pub const fn checkout_ttl(&self) -> Duration {
        Duration::from_secs(self.checkout_ttl_secs)
    }

    /// `sweep_interval_secs` as a [`Duration`].
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Whether the configured sweep interval honors the `ttl / 4` bound
    /// relative to the shorter of the two TTLs.
    #[must_use]
    pub const fn sweep_interval_is_valid(&self) -> bool {
        self.sweep_interval_secs * 4 <= self.soft_cart_ttl_secs
    }
}

/// NLU Adapter (C4) timing and reliability tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NluConfig {
    /// Hard wall-clock deadline per model call.
    pub call_deadline_secs: u64,
    /// Consecutive failures before the circuit opens.
    pub circuit_failure_threshold: usize,
    /// How long the circuit stays open before probing again.
    pub circuit_timeout_secs: u64,
}

impl NluConfig {
    /// `call_deadline_secs` as a [`Duration`].
    #[must_use]
    pub const fn call_deadline(&self) -> Duration {
        Duration::from_secs(self.call_deadline_secs)
    }

    /// `circuit_timeout_secs` as a [`Duration`].
    #[must_use]
    pub const fn circuit_timeout(&self) -> Duration {
        Duration::from_secs(self.circuit_timeout_secs)
    }
}

/// Fan-out Hub (C7) backpressure tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Bounded per-connection outbox capacity; overflow detaches the
    /// subscription (§4.7 backpressure guarantee).
    pub outbox_capacity: usize,
}

/// Session Store (C2) lifetime tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// A session with no recorded turn for this long is swept to
    /// `Abandoned`.
    pub idle_timeout_secs: u64,
    /// A session is swept to `Expired` this long after creation,
    /// regardless of activity.
    pub absolute_ttl_secs: u64,
}

impl SessionConfig {
    /// `idle_timeout_secs` as a [`Duration`].
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// `absolute_ttl_secs` as a [`Duration`].
    #[must_use]
    pub const fn absolute_ttl(&self) -> Duration {
        Duration::from_secs(self.absolute_ttl_secs)
    }
}

/// A configuration value failed validation.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    /// The NLU call deadline must be strictly less than the turn deadline
    /// so the controller has time left over for fallback handling (§5).
    #[error(
        "nlu.call_deadline_secs ({nlu}) must be strictly less than turn.deadline_secs ({turn})"
    )]
    NluDeadlineNotLessThanTurn {
        /// Configured NLU deadline.
        nlu: u64,
        /// Configured turn deadline.
        turn: u64,
    },
    /// The sweeper must run at least every `ttl / 4` (§4.1).
    #[error("reservation.sweep_interval_secs ({sweep}) exceeds ttl/4 ({bound})")]
    SweepIntervalTooSlow {
        /// Configured sweep interval.
        sweep: u64,
        /// Required upper bound (`soft_cart_ttl_secs / 4`).
        bound: u64,
    },
    /// Zero-capacity outboxes can never deliver anything.
    #[error("hub.outbox_capacity must be greater than zero")]
    ZeroOutboxCapacity,
    /// An idle timeout at or past the absolute TTL would make the absolute
    /// sweep unreachable.
    #[error(
        "session.idle_timeout_secs ({idle}) must be strictly less than session.absolute_ttl_secs ({absolute})"
    )]
    IdleTimeoutNotLessThanAbsoluteTtl {
        /// Configured idle timeout.
        idle: u64,
        /// Configured absolute TTL.
        absolute: u64,
    },
}

impl EngineConfig {
    /// Load configuration from environment variables, falling back to the
    /// spec-mandated defaults (§11) for anything unset.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            turn: TurnConfig {
                deadline_secs: env_parse("ENGINE_TURN_DEADLINE_SECS", 12),
                history_window: env_parse("ENGINE_HISTORY_WINDOW", 16),
            },
            reservation: ReservationConfig {
                soft_cart_ttl_secs: env_parse("ENGINE_SOFT_CART_TTL_SECS", 600),
                checkout_ttl_secs: env_parse("ENGINE_CHECKOUT_TTL_SECS", 900),
                sweep_interval_secs: env_parse("ENGINE_SWEEP_INTERVAL_SECS", 5),
            },
            nlu: NluConfig {
                call_deadline_secs: env_parse("ENGINE_NLU_CALL_DEADLINE_SECS", 10),
                circuit_failure_threshold: env_parse("ENGINE_NLU_CIRCUIT_FAILURE_THRESHOLD", 5),
                circuit_timeout_secs: env_parse("ENGINE_NLU_CIRCUIT_TIMEOUT_SECS", 60),
            },
            hub: HubConfig {
                outbox_capacity: env_parse("ENGINE_HUB_OUTBOX_CAPACITY", 64),
            },
            session: SessionConfig {
                idle_timeout_secs: env_parse("ENGINE_SESSION_IDLE_TIMEOUT_SECS", 1800),
                absolute_ttl_secs: env_parse("ENGINE_SESSION_ABSOLUTE_TTL_SECS", 3600 * 24),
            },
        }
    }

    /// Cross-field validation the spec calls out explicitly.
    ///
    /// # Errors
    ///
    /// Returns the first violated [`ConfigError`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nlu.call_deadline_secs >= self.turn.deadline_secs {
            return Err(ConfigError::NluDeadlineNotLessThanTurn {
                nlu: self.nlu.call_deadline_secs,
                turn: self.turn.deadline_secs,
            });
        }
        if !self.reservation.sweep_interval_is_valid() {
            return Err(ConfigError::SweepIntervalTooSlow {
                sweep: self.reservation.sweep_interval_secs,
                bound: self.reservation.soft_cart_ttl_secs / 4,
            });
        }
        if self.hub.outbox_capacity == 0 {
            return Err(ConfigError::ZeroOutboxCapacity);
        }
        if self.session.idle_timeout_secs >= self.session.absolute_ttl_secs {
            return Err(ConfigError::IdleTimeoutNotLessThanAbsoluteTtl {
                idle: self.session.idle_timeout_secs,
                absolute: self.session.absolute_ttl_secs,
            });
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            turn: TurnConfig {
                deadline_secs: 12,
                history_window: 16,
            },
            reservation: ReservationConfig {
                soft_cart_ttl_secs: 600,
                checkout_ttl_secs: 900,
                sweep_interval_secs: 5,
            },
            nlu: NluConfig {
                call_deadline_secs: 10,
                circuit_failure_threshold: 5,
                circuit_timeout_secs: 60,
            },
            hub: HubConfig { outbox_capacity: 64 },
            session: SessionConfig {
                idle_timeout_secs: 1800,
                absolute_ttl_secs: 3600 * 24,
            },
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_satisfy_their_own_invariants() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_nlu_deadline_not_less_than_turn_deadline() {
        let mut config = EngineConfig::default();
        config.nlu.call_deadline_secs = config.turn.deadline_secs;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NluDeadlineNotLessThanTurn { .. })
        ));
    }

    #[test]
    fn rejects_sweep_interval_slower_than_ttl_over_four() {
        let mut config = EngineConfig::default();
        config.reservation.sweep_interval_secs = config.reservation.soft_cart_ttl_secs;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::SweepIntervalTooSlow { .. })
        ));
    }

    #[test]
    fn rejects_zero_outbox_capacity() {
        let mut config = EngineConfig::default();
        config.hub.outbox_capacity = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroOutboxCapacity));
    }

    #[test]
    fn rejects_idle_timeout_not_less_than_absolute_ttl() {
        let mut config = EngineConfig::default();
        config.session.idle_timeout_secs = config.session.absolute_ttl_secs;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::IdleTimeoutNotLessThanAbsoluteTtl { .. })
        ));
    }
}
