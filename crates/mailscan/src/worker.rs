//! The queue-consumer loop: read one batch, dispatch each delivery, ack.
//!
//! Every outcome of [`JobDispatcher::dispatch`] is acknowledged. A
//! [`DispatchFault`] leaves the delivery pending so the stream redelivers it;
//! that is the only case in which a delivery is not acked.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use crate::jobs::dispatcher::{DispatchFault, JobDispatcher, Outcome};
use crate::jobs::model::JobPayload;
use crate::queue::{ConsumerGroup, Delivery, GroupStatus, QueueConsumer, QueueError};

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Deliveries per read. One keeps a poison message from holding others.
    pub read_count: usize,
    pub block: Duration,
    /// Pause after a backend failure or an unacked delivery.
    pub error_backoff: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            read_count: 1,
            block: Duration::from_secs(5),
            error_backoff: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error(transparent)]
    Dispatch(#[from] DispatchFault),

    #[error("ack failed: {0}")]
    Ack(#[from] QueueError),
}

pub struct Worker {
    queue: Arc<dyn QueueConsumer>,
    dispatcher: JobDispatcher,
    target: ConsumerGroup,
    settings: WorkerSettings,
}

impl Worker {
    pub fn new(
        queue: Arc<dyn QueueConsumer>,
        dispatcher: JobDispatcher,
        target: ConsumerGroup,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            queue,
            dispatcher,
            target,
            settings,
        }
    }

    pub fn target(&self) -> &ConsumerGroup {
        &self.target
    }

    /// Make sure the consumer group exists. Failures are logged, never fatal:
    /// reads will report the problem again if the group is really missing.
    pub async fn start(&self) {
        let (stream, group) = (self.target.stream.as_str(), self.target.group.as_str());
        match self.queue.ensure_group(stream, group).await {
            Ok(GroupStatus::Created) => info!(stream, group, "consumer group created"),
            Ok(GroupStatus::AlreadyExists) => {}
            Err(e) => warn!(stream, group, error = %e, "could not create consumer group"),
        }
    }

    /// Run until `shutdown` flips to true (or its sender is dropped).
    ///
    /// Shutdown only interrupts the blocking read or a backoff pause; a
    /// delivery that has been read is always dispatched and acked first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        self.start().await;

        let stream = self.target.stream.as_str();
        let group = self.target.group.as_str();
        let consumer = self.target.consumer.as_str();
        info!(stream, group, consumer, "worker started, listening");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let read = tokio::select! {
                res = self.queue.read(
                    stream,
                    group,
                    consumer,
                    self.settings.read_count,
                    self.settings.block,
                ) => res,
                _ = stopped(&mut shutdown) => break,
            };

            let deliveries = match read {
                Ok(deliveries) => deliveries,
                Err(e) => {
                    error!(stream, group, consumer, error = %e, "queue read failed");
                    self.pause(&mut shutdown).await;
                    continue;
                }
            };

            let mut left_pending = false;
            for delivery in &deliveries {
                if let Err(e) = self.handle_delivery(delivery).await {
                    error!(
                        delivery_id = %delivery.id,
                        consumer,
                        error = %e,
                        "delivery not acknowledged, left for redelivery"
                    );
                    left_pending = true;
                }
            }
            if left_pending {
                self.pause(&mut shutdown).await;
            }
        }

        info!(consumer, "worker stopped");
    }

    /// Validate, dispatch and acknowledge a single delivery.
    ///
    /// Returns the acknowledged outcome, or the error that kept the delivery
    /// pending.
    #[instrument(skip_all, fields(delivery_id = %delivery.id, consumer = %self.target.consumer))]
    pub async fn handle_delivery(&self, delivery: &Delivery) -> Result<Outcome, DeliveryError> {
        let outcome = match JobPayload::from_fields(&delivery.fields) {
            Err(e) => {
                warn!(error = %e, "malformed payload, dropping delivery");
                Outcome::MalformedPayload
            }
            Ok(payload) => {
                info!(job_id = %payload.job_id, "processing delivery");
                self.dispatcher.dispatch(&payload).await?
            }
        };

        self.queue
            .ack(&self.target.stream, &self.target.group, &delivery.id)
            .await?;
        info!(%outcome, "delivery acknowledged");

        Ok(outcome)
    }

    async fn pause(&self, shutdown: &mut watch::Receiver<bool>) {
        tokio::select! {
            _ = tokio::time::sleep(self.settings.error_backoff) => {}
            _ = stopped(shutdown) => {}
        }
    }
}

/// Resolves once the flag is true or the sender is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
