// Connection supervisor - keeps a session alive forever, backing off between failures

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{PipeError, Result};
use crate::session::{ConnectionSession, SessionEnd};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter_fraction: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(600),
            jitter_fraction: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.initial_backoff.is_zero() {
            return Err(PipeError::Config("initial backoff must be positive".into()));
        }
        if self.max_backoff < self.initial_backoff {
            return Err(PipeError::Config(format!(
                "max backoff {:?} is below initial backoff {:?}",
                self.max_backoff, self.initial_backoff
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter_fraction) {
            return Err(PipeError::Config(format!(
                "jitter fraction {} must be within 0..=1",
                self.jitter_fraction
            )));
        }
        Ok(())
    }

    /// Stretch `base` by `jitter_fraction * sample`, with `sample` in `[0, 1)`.
    pub fn jittered(&self, base: Duration, sample: f64) -> Duration {
        base.mul_f64(1.0 + self.jitter_fraction * sample)
    }
}

/// Attempt counter and back-off, touched only between sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryState {
    attempt_count: u32,
    current_backoff: Duration,
}

impl RetryState {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            attempt_count: 0,
            current_backoff: config.initial_backoff,
        }
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn current_backoff(&self) -> Duration {
        self.current_backoff
    }

    /// Count a failed session. Returns the un-jittered wait before the next
    /// attempt and doubles the back-off for the one after, up to the ceiling.
    pub fn record_failure(&mut self, config: &RetryConfig) -> Duration {
        self.attempt_count = self.attempt_count.saturating_add(1);
        let wait = self.current_backoff;
        self.current_backoff = self
            .current_backoff
            .saturating_mul(2)
            .min(config.max_backoff);
        wait
    }

    pub fn record_success(&mut self, config: &RetryConfig) {
        *self = Self::new(config);
    }
}

pub struct ConnectionSupervisor {
    config: RetryConfig,
    state: RetryState,
    rng: fastrand::Rng,
}

impl ConnectionSupervisor {
    pub fn new(config: RetryConfig) -> Self {
        let state = RetryState::new(&config);
        Self {
            config,
            state,
            rng: fastrand::Rng::new(),
        }
    }

    /// Fix the jitter sequence, for reproducible runs.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = fastrand::Rng::with_seed(seed);
        self
    }

    pub fn state(&self) -> &RetryState {
        &self.state
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Keep `session` connected to `endpoint` until `cancel` fires.
    pub async fn run(
        &mut self,
        session: &ConnectionSession,
        endpoint: &str,
        cancel: &CancellationToken,
    ) {
        self.run_with(cancel, move |cancel| async move {
            session.run(endpoint, &cancel).await
        })
        .await
    }

    /// Retry loop over an arbitrary session runner. Returns only on cancellation.
    pub async fn run_with<F, Fut>(&mut self, cancel: &CancellationToken, mut session: F)
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<SessionEnd>>,
    {
        let mut wait: Option<Duration> = None;

        while !cancel.is_cancelled() {
            if let Some(wait) = wait.take() {
                info!(
                    "Waiting {:.2} seconds before reconnection attempt {}...",
                    wait.as_secs_f64(),
                    self.state.attempt_count()
                );
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(wait) => {}
                }
            }

            match session(cancel.clone()).await {
                Ok(SessionEnd::Cancelled) if cancel.is_cancelled() => break,
                Ok(end) => {
                    info!("Connection closed ({:?}), reconnecting", end);
                    self.state.record_success(&self.config);
                }
                Err(e) => {
                    let base = self.state.record_failure(&self.config);
                    warn!(
                        "Connection closed (attempt: {}): {}",
                        self.state.attempt_count(),
                        e
                    );
                    wait = Some(self.config.jittered(base, self.rng.f64()));
                }
            }
        }

        info!("Supervisor stopped");
    }
}
