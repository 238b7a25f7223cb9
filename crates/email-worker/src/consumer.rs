//! Per-delivery acknowledgment state machine.
//!
//! Each delivery goes through filter, decode, process and settle, and ends
//! in exactly one [`Settlement`]:
//!
//! | Condition                           | Settlement                 |
//! |-------------------------------------|----------------------------|
//! | Unauthorized sender                 | Unsettled (ignored)        |
//! | Malformed payload                   | Rejected, no requeue       |
//! | Channel closed during processing    | Unsettled                  |
//! | Any other processing failure        | Unsettled                  |
//! | Shutdown during processing          | Unsettled                  |
//! | Successful processing               | Acknowledged               |
//!
//! Unsettled messages stay with the broker, which redelivers them after the
//! channel goes away. Nothing here retries.

use crate::broker::{AckChannel, DeliveredMessage};
use crate::config::WorkerConfig;
use crate::decoder::{self, OrderTask};
use crate::error::{SendError, TransportError};
use crate::mailer::ConfirmationSender;
use chrono::{Local, TimeZone};
use tokio::sync::watch;
use tracing::{error, info};

/// Why a delivery was left for the broker to redeliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsettledReason {
    /// Sender identity did not match the authorized producer.
    UnauthorizedSender,
    /// The channel was closed, so ack/nack could not be sent.
    TransportUnavailable,
    /// Any other failure during processing or settlement.
    Unclassified,
    /// Shutdown was signalled while the task was processing.
    Cancelled,
}

/// Terminal state of one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// `basic.ack`, single delivery.
    Acknowledged,
    /// `basic.nack` with `requeue = false`.
    Rejected,
    /// No settlement frame was sent.
    Unsettled(UnsettledReason),
}

/// Drives deliveries through the acknowledgment state machine.
pub struct Consumer<C, S> {
    channel: C,
    sender: S,
    authorized_sender: String,
    preview_len: usize,
    shutdown: watch::Receiver<bool>,
}

impl<C, S> Consumer<C, S>
where
    C: AckChannel,
    S: ConfirmationSender,
{
    pub fn new(channel: C, sender: S, config: &WorkerConfig, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            channel,
            sender,
            authorized_sender: config.authorized_sender.clone(),
            preview_len: config.preview_len,
            shutdown,
        }
    }

    /// Whether shutdown has been signalled.
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Handle one delivery and return how it was settled.
    ///
    /// Never fails: every error is classified into a [`Settlement`].
    pub async fn handle_delivery(&self, msg: DeliveredMessage) -> Settlement {
        let tag = msg.delivery_tag;

        let sender = msg.sender_identity.as_deref().unwrap_or("");
        if sender != self.authorized_sender {
            info!(
                delivery_tag = tag,
                sender = %sender,
                "Ignored a message sent by [{}]",
                sender
            );
            return Settlement::Unsettled(UnsettledReason::UnauthorizedSender);
        }

        let sent_at = msg
            .timestamp
            .and_then(local_time)
            .unwrap_or_else(|| "-".to_string());
        let message_id = msg.message_id.as_deref().unwrap_or("-");
        info!(
            delivery_tag = tag,
            message_id = %message_id,
            redelivered = msg.redelivered,
            "{} ID=[{}]",
            sent_at,
            message_id
        );
        info!(
            delivery_tag = tag,
            payload_len = msg.body.len(),
            "Processing msg: '{}'",
            preview(&msg.body, self.preview_len)
        );

        let task = match decoder::decode(&msg.body) {
            Ok(task) => task,
            Err(e) => {
                error!(
                    delivery_tag = tag,
                    error = %e,
                    "JSON parse error: '{}'",
                    String::from_utf8_lossy(&msg.body)
                );
                return self.settle_reject(tag).await;
            }
        };

        self.process(tag, &task).await
    }

    async fn process(&self, tag: u64, task: &OrderTask) -> Settlement {
        info!(
            delivery_tag = tag,
            order_id = task.id,
            "Sending order #{} confirmation email to [{}]",
            task.id,
            task.email
        );

        let mut shutdown = self.shutdown.clone();
        let result = tokio::select! {
            result = self.sender.send_confirmation(task) => result,
            _ = wait_for_shutdown(&mut shutdown) => {
                info!(
                    delivery_tag = tag,
                    order_id = task.id,
                    "Shutdown requested while sending order #{}, leaving message unsettled",
                    task.id
                );
                return Settlement::Unsettled(UnsettledReason::Cancelled);
            }
        };

        match result {
            Ok(()) => {
                info!(
                    delivery_tag = tag,
                    order_id = task.id,
                    "Order #{} confirmation email sent",
                    task.id
                );
                self.settle_ack(tag).await
            }
            Err(SendError::TransportUnavailable(reason)) => {
                info!(delivery_tag = tag, reason = %reason, "RabbitMQ channel is closed!");
                Settlement::Unsettled(UnsettledReason::TransportUnavailable)
            }
            Err(SendError::Other(e)) => {
                error!(
                    delivery_tag = tag,
                    order_id = task.id,
                    error = ?e,
                    "Failed to send order #{} confirmation: {:#}",
                    task.id,
                    e
                );
                Settlement::Unsettled(UnsettledReason::Unclassified)
            }
        }
    }

    async fn settle_ack(&self, tag: u64) -> Settlement {
        if !self.channel.is_open() {
            info!(delivery_tag = tag, "RabbitMQ channel is closed!");
            return Settlement::Unsettled(UnsettledReason::TransportUnavailable);
        }
        match self.channel.ack(tag).await {
            Ok(()) => Settlement::Acknowledged,
            Err(e) => self.settlement_failed(tag, "ack", e),
        }
    }

    async fn settle_reject(&self, tag: u64) -> Settlement {
        if !self.channel.is_open() {
            info!(delivery_tag = tag, "RabbitMQ channel is closed!");
            return Settlement::Unsettled(UnsettledReason::TransportUnavailable);
        }
        match self.channel.reject(tag).await {
            Ok(()) => Settlement::Rejected,
            Err(e) => self.settlement_failed(tag, "reject", e),
        }
    }

    fn settlement_failed(&self, tag: u64, action: &str, err: TransportError) -> Settlement {
        if err.is_closed() {
            info!(delivery_tag = tag, action, error = %err, "RabbitMQ channel is closed!");
            Settlement::Unsettled(UnsettledReason::TransportUnavailable)
        } else {
            error!(delivery_tag = tag, action, error = %err, "Settlement call failed");
            Settlement::Unsettled(UnsettledReason::Unclassified)
        }
    }
}

/// Resolves once shutdown is signalled. Pends forever if the signal's
/// sender is gone without having fired.
pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let fired = shutdown.wait_for(|stop| *stop).await.is_ok();
    if !fired {
        std::future::pending::<()>().await;
    }
}

/// Render an epoch-seconds timestamp in local time.
fn local_time(secs: u64) -> Option<String> {
    let secs = i64::try_from(secs).ok()?;
    Local
        .timestamp_opt(secs, 0)
        .single()
        .map(|t| t.to_rfc3339())
}

/// Lossy UTF-8 view of `body`, cut to at most `max` bytes on a char boundary.
fn preview(body: &[u8], max: usize) -> String {
    let text = String::from_utf8_lossy(body);
    if text.len() <= max {
        return text.into_owned();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}
