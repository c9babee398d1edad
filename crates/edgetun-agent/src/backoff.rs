//! Reconnect backoff

use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

/// Bounded exponential backoff between reconnect attempts.
#[derive(Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    attempt: usize,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
            attempt: 0,
        }
    }

    /// Sleep for the current delay, then double it up to the cap.
    pub async fn wait(&mut self) {
        self.attempt += 1;
        debug!(
            attempt = self.attempt,
            delay_ms = self.current.as_millis() as u64,
            "Waiting before reconnect"
        );
        sleep(self.current).await;
        self.current = (self.current * 2).min(self.max);
    }

    /// Reset after a successful connection.
    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempt = 0;
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }
}
