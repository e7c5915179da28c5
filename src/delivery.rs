mod smtp;

use std::time::Duration;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::SmtpConfig;
use crate::report::{RenderedReport, Report};

pub use self::smtp::SmtpTransport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub subject: String,
    pub text: String,
    pub html: String,
}

#[derive(Error, Debug)]
pub enum DeliveryError {
    /// Retrying will not help, e.g. the server rejected the credentials or a recipient.
    #[error("{0:#}")]
    Permanent(anyhow::Error),

    #[error("{0:#}")]
    Transient(anyhow::Error),
}

impl DeliveryError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, message: &Message) -> Result<(), DeliveryError>;
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_delay)
            .with_multiplier(self.multiplier)
            .with_randomization_factor(0.0)
            .with_max_interval(Duration::from_secs(60))
            .with_max_elapsed_time(None)
            .build()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }
}

/// Sends the message, retrying transient failures with exponential backoff.
pub async fn deliver(
    transport: &dyn Transport,
    message: &Message,
    policy: &RetryPolicy,
) -> Result<(), DeliveryError> {
    let mut backoff = policy.backoff();
    let mut attempt = 1;

    loop {
        let e = match transport.send(message).await {
            Ok(()) => {
                info!(attempt, "Delivered the report");

                return Ok(());
            }

            Err(e) => e,
        };

        if e.is_permanent() {
            error!(attempt, "Delivery failed permanently: {e}");

            return Err(e);
        }

        if attempt >= policy.max_attempts {
            error!(attempt, "Giving up on delivery: {e}");

            return Err(e);
        }

        let delay = backoff.next_backoff().unwrap_or(policy.initial_delay);
        warn!(
            attempt,
            "Delivery failed; retrying in {:.1}s: {e}",
            delay.as_secs_f64()
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

/// Emails the rendered report. An empty report is skipped only when `send-empty-report` is off.
pub async fn send_report(
    transport: &dyn Transport,
    cfg: &SmtpConfig,
    report: &Report,
    rendered: RenderedReport,
    policy: &RetryPolicy,
) -> Result<(), DeliveryError> {
    if !report.has_items() && !cfg.send_empty_report {
        info!("No new items; skipping the empty report");

        return Ok(());
    }

    let message = Message {
        subject: cfg.subject.clone(),
        text: rendered.text,
        html: rendered.html,
    };

    deliver(transport, &message, policy).await
}
