//! Confirmation-email delivery.
//!
//! Sending is a capability behind [`ConfirmationSender`] so the consumer can
//! be driven by deterministic or fault-injecting fakes. The production
//! implementation only simulates the external call with a random delay.

use crate::config::WorkerConfig;
use crate::decoder::OrderTask;
use crate::error::SendError;
use async_trait::async_trait;
use rand::Rng;
use std::time::Duration;
use tracing::debug;

/// Sends the confirmation email for one order.
#[async_trait]
pub trait ConfirmationSender: Send + Sync {
    /// Resolve once the email is sent, or with a classified failure.
    async fn send_confirmation(&self, task: &OrderTask) -> Result<(), SendError>;
}

/// Stand-in for an SMTP/API call: waits a random whole number of seconds.
#[derive(Debug, Clone)]
pub struct SimulatedMailer {
    delay_min: Duration,
    delay_max: Duration,
}

impl SimulatedMailer {
    pub fn new(delay_min: Duration, delay_max: Duration) -> Self {
        Self {
            delay_min,
            delay_max: delay_max.max(delay_min),
        }
    }

    pub fn from_config(config: &WorkerConfig) -> Self {
        Self::new(config.send_delay_min, config.send_delay_max)
    }

    /// Pick a latency in `[delay_min, delay_max]`, in whole seconds when the
    /// range spans at least one second.
    fn pick_delay(&self) -> Duration {
        let min_ms = self.delay_min.as_millis() as u64;
        let max_ms = self.delay_max.as_millis() as u64;
        let mut rng = rand::thread_rng();

        let (min_s, max_s) = (min_ms.div_ceil(1000), max_ms / 1000);
        if min_s <= max_s && min_s > 0 {
            Duration::from_secs(rng.gen_range(min_s..=max_s))
        } else {
            Duration::from_millis(rng.gen_range(min_ms..=max_ms))
        }
    }
}

#[async_trait]
impl ConfirmationSender for SimulatedMailer {
    async fn send_confirmation(&self, task: &OrderTask) -> Result<(), SendError> {
        let delay = self.pick_delay();
        debug!(order_id = task.id, delay_ms = delay.as_millis() as u64, "Simulating email send");
        tokio::time::sleep(delay).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> OrderTask {
        OrderTask {
            id: 1,
            email: "a@b.com".to_string(),
        }
    }

    #[test]
    fn test_default_delay_is_one_or_two_seconds() {
        let mailer = SimulatedMailer::from_config(&WorkerConfig::default());
        for _ in 0..64 {
            let delay = mailer.pick_delay();
            assert!(
                delay == Duration::from_secs(1) || delay == Duration::from_secs(2),
                "unexpected delay {:?}",
                delay
            );
        }
    }

    #[test]
    fn test_sub_second_range_uses_millis() {
        let mailer = SimulatedMailer::new(Duration::from_millis(10), Duration::from_millis(20));
        for _ in 0..64 {
            let delay = mailer.pick_delay();
            assert!(delay >= Duration::from_millis(10) && delay <= Duration::from_millis(20));
        }
    }

    #[test]
    fn test_zero_range() {
        let mailer = SimulatedMailer::new(Duration::ZERO, Duration::ZERO);
        assert_eq!(mailer.pick_delay(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_send_waits_then_succeeds() {
        let mailer = SimulatedMailer::new(Duration::from_secs(1), Duration::from_secs(1));

        let start = tokio::time::Instant::now();
        mailer.send_confirmation(&task()).await.unwrap();

        assert!(start.elapsed() >= Duration::from_secs(1));
    }
}
