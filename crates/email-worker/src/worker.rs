//! Worker lifecycle and the delivery loop.
//!
//! ```text
//! broker stream -> pump --mpsc(1)--> processor -> ack / nack / nothing
//!                   ^                    |
//!                   |__ slot permit <____|
//! ```
//!
//! The pump takes the single [`InFlightSlot`] permit before it pulls a
//! delivery off the transport. The permit travels with the delivery and is
//! released only after the consumer has settled it, so a second delivery is
//! never accepted while one is being processed, whatever the transport's own
//! flow control does.

use crate::broker::{AckChannel, BrokerConnection, BrokerSession, DeliveredMessage, PREFETCH_COUNT};
use crate::config::WorkerConfig;
use crate::consumer::{wait_for_shutdown, Consumer, Settlement, UnsettledReason};
use crate::error::WorkerResult;
use crate::mailer::ConfirmationSender;
use futures_util::{Stream, StreamExt};
use std::fmt::Display;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

/// Capacity-one gate over deliveries being processed.
#[derive(Clone)]
pub struct InFlightSlot {
    permits: Arc<Semaphore>,
}

impl InFlightSlot {
    pub fn new() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(PREFETCH_COUNT as usize)),
        }
    }

    /// Wait until the slot is free. `None` once the slot is closed.
    pub async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.permits.clone().acquire_owned().await.ok()
    }

    pub fn is_free(&self) -> bool {
        self.permits.available_permits() > 0
    }

    /// Stop handing out permits; pending and future `acquire` calls get `None`.
    ///
    /// The pipeline closes its slot on shutdown. Closing it from outside
    /// stops the pipeline from taking further deliveries.
    pub fn close(&self) {
        self.permits.close();
    }
}

impl Default for InFlightSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// A delivery holding the in-flight slot.
struct InFlight {
    message: DeliveredMessage,
    permit: OwnedSemaphorePermit,
}

/// Settlement counts for one run of the loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub acknowledged: u64,
    pub rejected: u64,
    pub unsettled: u64,
}

impl PipelineStats {
    fn record(&mut self, settlement: Settlement) {
        match settlement {
            Settlement::Acknowledged => self.acknowledged += 1,
            Settlement::Rejected => self.rejected += 1,
            Settlement::Unsettled(_) => self.unsettled += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.acknowledged + self.rejected + self.unsettled
    }
}

/// Consume `deliveries` one at a time until the stream ends, fails, the
/// slot is closed, or shutdown is signalled.
pub async fn run_pipeline<St, E, C, S>(
    deliveries: St,
    consumer: &Consumer<C, S>,
    slot: &InFlightSlot,
    shutdown: watch::Receiver<bool>,
) -> PipelineStats
where
    St: Stream<Item = Result<DeliveredMessage, E>>,
    E: Display,
    C: AckChannel,
    S: ConfirmationSender,
{
    let (tx, rx) = mpsc::channel(PREFETCH_COUNT as usize);

    let (_, stats) = tokio::join!(pump(deliveries, slot, tx, shutdown), process(consumer, rx));
    stats
}

async fn pump<St, E>(
    deliveries: St,
    slot: &InFlightSlot,
    tx: mpsc::Sender<InFlight>,
    mut shutdown: watch::Receiver<bool>,
) where
    St: Stream<Item = Result<DeliveredMessage, E>>,
    E: Display,
{
    tokio::pin!(deliveries);

    loop {
        let permit = tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut shutdown) => {
                slot.close();
                break;
            }
            permit = slot.acquire() => match permit {
                Some(permit) => permit,
                None => {
                    debug!("In-flight slot closed");
                    break;
                }
            },
        };

        let next = tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut shutdown) => break,
            next = deliveries.next() => next,
        };

        let message = match next {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                error!(error = %e, "Delivery stream failed, no further deliveries will be accepted");
                break;
            }
            None => {
                warn!("Delivery stream ended");
                break;
            }
        };

        debug!(delivery_tag = message.delivery_tag, "Delivery took the in-flight slot");

        if tx.send(InFlight { message, permit }).await.is_err() {
            break;
        }
    }

    debug!("Delivery pump stopped");
}

async fn process<C, S>(consumer: &Consumer<C, S>, mut rx: mpsc::Receiver<InFlight>) -> PipelineStats
where
    C: AckChannel,
    S: ConfirmationSender,
{
    let mut stats = PipelineStats::default();

    while let Some(InFlight { message, permit }) = rx.recv().await {
        let tag = message.delivery_tag;

        let settlement = if consumer.is_shutting_down() {
            info!(delivery_tag = tag, "Shutdown in progress, leaving delivery unsettled");
            Settlement::Unsettled(UnsettledReason::Cancelled)
        } else {
            consumer.handle_delivery(message).await
        };

        debug!(delivery_tag = tag, settlement = ?settlement, "Delivery settled");
        stats.record(settlement);

        // Free the slot only after settlement has completed
        drop(permit);
    }

    stats
}

/// The email worker: owns the broker session for its whole lifetime.
pub struct Worker<B, S> {
    config: WorkerConfig,
    broker: B,
    sender: S,
}

impl<S: ConfirmationSender> Worker<BrokerConnection, S> {
    /// Connect to the broker and check the queue. Any failure here is fatal.
    pub async fn connect(config: WorkerConfig, sender: S) -> WorkerResult<Self> {
        config.validate()?;
        let broker = BrokerConnection::connect(config.clone()).await?;
        Ok(Self::new(config, broker, sender))
    }
}

impl<B, S> Worker<B, S>
where
    B: BrokerSession,
    S: ConfirmationSender,
{
    /// Wrap an already-open broker session.
    pub fn new(config: WorkerConfig, broker: B, sender: S) -> Self {
        Self {
            config,
            broker,
            sender,
        }
    }

    /// Consume until shutdown is signalled or the broker goes away, then
    /// close the channel and connection.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> WorkerResult<PipelineStats> {
        let Worker {
            config,
            broker,
            sender,
        } = self;

        info!(queue = %config.queue, "Queue [{}] is waiting for messages.", config.queue);

        let pending = broker.message_count();
        if pending > 0 {
            info!(queue = %config.queue, pending, "Detected {} message(s).", pending);
        }

        let deliveries = match broker.consume().await {
            Ok(deliveries) => deliveries,
            Err(e) => {
                close_session(broker).await;
                return Err(e);
            }
        };

        let consumer = Consumer::new(broker.ack_channel(), sender, &config, shutdown.clone());
        let slot = InFlightSlot::new();

        // Returns only once the in-flight delivery, if any, has been settled
        let stats = run_pipeline(deliveries, &consumer, &slot, shutdown).await;

        info!(
            acknowledged = stats.acknowledged,
            rejected = stats.rejected,
            unsettled = stats.unsettled,
            "Consumer stopped"
        );

        close_session(broker).await;
        Ok(stats)
    }
}

/// Close the channel, then the connection.
///
/// The broker requeues anything left unsettled.
async fn close_session<B: BrokerSession>(broker: B) {
    broker.close_channel().await;
    broker.close_connection().await;
    info!("RabbitMQ connection is closed.");
}
