use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Healthy,
    Down { retry_at: Instant },
    /// One turn is testing whether the provider is back.
    Probing,
}

/// Completion provider availability as seen by the orchestrator.
///
/// After an unavailable error every turn fails fast until the cooldown expires. The first turn
/// after that probes the provider; others keep failing fast until the probe settles.
#[derive(Debug)]
pub struct ProviderHealth {
    cooldown: Duration,
    state: Mutex<State>,
}

impl ProviderHealth {
    #[must_use]
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            state: Mutex::new(State::Healthy),
        }
    }

    /// Admit a turn, or return how long until the provider may be tried again.
    ///
    /// # Errors
    ///
    /// Returns the remaining cooldown while the provider is considered down.
    pub fn admit(&self) -> Result<(), Duration> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match *state {
            State::Healthy => Ok(()),
            State::Down { retry_at } => {
                let now = Instant::now();
                if now >= retry_at {
                    *state = State::Probing;
                    tracing::info!("probing completion provider after cooldown");
                    Ok(())
                } else {
                    Err(retry_at - now)
                }
            }
            State::Probing => Err(Duration::ZERO),
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != State::Healthy {
            tracing::info!("completion provider recovered");
        }
        *state = State::Healthy;
    }

    pub fn record_unavailable(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        tracing::warn!(
            cooldown_secs = self.cooldown.as_secs(),
            "completion provider unavailable, failing fast during cooldown"
        );
        *state = State::Down {
            retry_at: Instant::now() + self.cooldown,
        };
    }

    /// A probing turn ended without reaching the provider; let the next turn probe.
    pub fn release_probe(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == State::Probing {
            *state = State::Down {
                retry_at: Instant::now(),
            };
        }
    }

    #[must_use]
    pub fn is_healthy(&self) -> bool {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) == State::Healthy
    }
}
