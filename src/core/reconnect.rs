//! Reconnection after transport loss.
//!
//! The supervisor re-establishes the transport with exponential backoff and a
//! fresh credential per attempt. It only ever drives the state machine and the
//! transport; cart and transcript are left alone.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::session::state::{SessionState, SessionStateMachine, StateEvent};
use crate::core::transport::signaling::DEFAULT_CREDENTIAL_TIMEOUT;
use crate::core::transport::{DEFAULT_CONNECT_TIMEOUT, TokenBroker, TransportConnection};
use crate::errors::{ConnectionError, SessionError, SessionResult};

// =============================================================================
// Backoff policy
// =============================================================================

/// Retry budget and backoff curve for a lost connection.
///
/// Attempt `n` (1-based) waits `initial_delay_ms * backoff_multiplier^(n-1)`,
/// capped at `max_delay_ms`. The budget is always finite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectionConfig {
    pub enabled: bool,
    /// Attempts before the session gives up (at least 1 when enabled)
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f32,
    /// Spread each delay by up to ±25%; off keeps retries deterministic
    pub jitter: bool,
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 5,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }
}

impl ReconnectionConfig {
    /// Never reconnect; the first loss is final.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Wait before `attempt` (1-based).
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let mut millis = (self.initial_delay_ms as f64
            * f64::from(self.backoff_multiplier).powi(exponent))
        .min(self.max_delay_ms as f64);

        if self.jitter {
            millis += millis * 0.25 * unit_noise();
        }
        Duration::from_millis(millis.max(0.0) as u64)
    }

    /// Whether attempt `attempts_made + 1` is within budget.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        self.enabled && attempts_made < self.max_attempts
    }
}

/// Uniform noise in `[-1, 1)` drawn from a v4 UUID's random bits.
fn unit_noise() -> f64 {
    let bits = (uuid::Uuid::new_v4().as_u128() >> 75) as u64;
    bits as f64 / (1u64 << 53) as f64 * 2.0 - 1.0
}

/// Outcome of a successful recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectionEvent {
    /// Attempt that succeeded (1-based)
    pub attempt: u32,
    pub success: bool,
    /// Connection generation now live
    pub generation: u64,
}

// =============================================================================
// Supervisor
// =============================================================================

/// Restores a lost transport.
pub struct ReconnectionSupervisor {
    config: ReconnectionConfig,
    broker: Arc<dyn TokenBroker>,
    connect_timeout: Duration,
    credential_timeout: Duration,
}

impl ReconnectionSupervisor {
    pub fn new(config: ReconnectionConfig, broker: Arc<dyn TokenBroker>) -> Self {
        Self {
            config,
            broker,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            credential_timeout: DEFAULT_CREDENTIAL_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_credential_timeout(mut self, timeout: Duration) -> Self {
        self.credential_timeout = timeout;
        self
    }

    pub fn config(&self) -> &ReconnectionConfig {
        &self.config
    }

    /// Bring the transport back.
    ///
    /// Expects the machine in `TIMEOUT` (a connected state is moved there
    /// first). On success the machine is in `AWAITING_SESSION_READY`. When the
    /// budget runs out the machine is forced to `ERROR` and
    /// [`ConnectionError::ReconnectExhausted`] returned. Cancelling `cancel`
    /// aborts with [`SessionError::Stopped`].
    pub async fn recover(
        &self,
        machine: &mut SessionStateMachine,
        transport: &TransportConnection,
        cancel: &CancellationToken,
    ) -> SessionResult<ReconnectionEvent> {
        if machine.state() != SessionState::Timeout {
            machine.transition(StateEvent::TransportLost)?;
        }
        transport.disconnect().await;

        let mut attempts = 0u32;
        while self.config.should_retry(attempts) {
            attempts += 1;
            let delay = self.config.calculate_delay(attempts);
            info!(
                attempt = attempts,
                max_attempts = self.config.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Scheduling reconnection attempt"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SessionError::Stopped),
                _ = tokio::time::sleep(delay) => {}
            }

            machine.transition(StateEvent::Reconnect)?;

            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SessionError::Stopped),
                result = self.attempt(transport) => result,
            };

            match attempt {
                Ok(generation) => {
                    machine.transition(StateEvent::TransportConnected)?;
                    info!(attempt = attempts, generation, "Reconnected");
                    return Ok(ReconnectionEvent {
                        attempt: attempts,
                        success: true,
                        generation,
                    });
                }
                Err(e) => {
                    warn!(attempt = attempts, error = %e, "Reconnection attempt failed");
                    machine.transition(StateEvent::ConnectFailed)?;
                }
            }
        }

        warn!(attempts, "Reconnection attempts exhausted");
        machine.force_state(SessionState::Error, "reconnection attempts exhausted");
        Err(ConnectionError::ReconnectExhausted { attempts }.into())
    }

    async fn attempt(&self, transport: &TransportConnection) -> Result<u64, ConnectionError> {
        let credential = tokio::time::timeout(self.credential_timeout, self.broker.fetch())
            .await
            .map_err(|_| {
                ConnectionError::Credential(format!(
                    "no credential within {}ms",
                    self.credential_timeout.as_millis()
                ))
            })??;
        transport.connect(&credential, self.connect_timeout).await
    }
}
