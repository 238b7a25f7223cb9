//! Email worker: consumes order-confirmation tasks from RabbitMQ.
//!
//! Each delivery is filtered by sender, decoded, processed and then settled
//! under manual acknowledgment.
//!
//! # Core Invariants
//!
//! 1. **One In-Flight**: at most one delivery is processed at a time (prefetch = 1)
//! 2. **No Silent Drops**: malformed payloads are rejected without requeue and logged verbatim
//! 3. **No Destructive Guessing**: unknown failures leave the message unsettled
//! 4. **Never Force-ACK**: shutdown during processing leaves the message to the broker
//!
//! # Architecture
//!
//! ```text
//! RabbitMQ queue -> Worker -> Consumer -> ConfirmationSender
//!       ^                        |
//!       |___ ack / nack <________|
//! ```

pub mod broker;
pub mod config;
pub mod consumer;
pub mod decoder;
pub mod error;
pub mod logging;
pub mod mailer;
pub mod worker;

#[cfg(test)]
mod tests;

pub use broker::{
    AckChannel, BrokerConnection, BrokerSession, DeliveredMessage, DeliveryStream, LapinAckChannel,
};
pub use config::WorkerConfig;
pub use consumer::{Consumer, Settlement, UnsettledReason};
pub use decoder::{decode, DecodeError, OrderTask};
pub use error::{SendError, TransportError, WorkerError, WorkerResult};
pub use mailer::{ConfirmationSender, SimulatedMailer};
pub use worker::{run_pipeline, InFlightSlot, PipelineStats, Worker};
