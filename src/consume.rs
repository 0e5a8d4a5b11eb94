//! Consuming primitive.
//!
//! Starts one delivery-loop task per queue. The loop recovers transparently
//! from a queue that does not exist yet (bounded backoff) and from a
//! channel failure (re-subscription); handler errors are logged and never
//! stop the loop.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use backon::BackoffBuilder;
use futures::{FutureExt, StreamExt};
use lapin::acker::Acker;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicRejectOptions};
use lapin::types::FieldTable;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ConnectionConfig;
use crate::connection::ConnectionHolder;
use crate::error::{BusError, Result};
use crate::message::DeliveryMeta;
use crate::metrics::{DeliveryLabels, MetricsSink};
use crate::retry;

/// Settlement handle for manual-ack subscriptions.
pub struct Confirmation {
    acker: Acker,
}

impl Confirmation {
    fn new(acker: Acker) -> Self {
        Self { acker }
    }

    /// Acknowledges the delivery.
    pub async fn confirm(&self) -> Result<()> {
        self.acker.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    /// Rejects the delivery without requeueing it.
    pub async fn reject(&self) -> Result<()> {
        self.acker.reject(BasicRejectOptions::default()).await?;
        Ok(())
    }
}

/// Receives raw deliveries from a queue's delivery loop.
///
/// `confirmation` is `Some` only for manual-ack subscriptions. An error
/// return is logged and contained; one bad message must not starve the
/// queue.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn on_delivery(
        &self,
        meta: &DeliveryMeta,
        payload: &[u8],
        confirmation: Option<Confirmation>,
    ) -> Result<()>;

    /// Invoked once when the subscription is torn down.
    async fn on_close(&self) -> Result<()> {
        Ok(())
    }
}

/// Handle for one active subscription. Stopping it detaches the handler
/// and ends the delivery loop after a final drain.
pub struct SubscriptionHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    /// Stops consumption and waits for the loop to drain and exit.
    pub async fn stop(self) -> Result<()> {
        let _ = self.stop_tx.send(true);
        self.task
            .await
            .map_err(|err| BusError::Subscribe(format!("delivery loop panicked: {err}")))
    }
}

/// Counts live delivery loops so shutdown can wait for their final drain.
#[derive(Clone, Default)]
pub(crate) struct LoopGauge {
    inner: Arc<GaugeInner>,
}

#[derive(Default)]
struct GaugeInner {
    active: AtomicUsize,
    idle: Notify,
}

impl LoopGauge {
    fn enter(&self) -> LoopGuard {
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        LoopGuard(self.inner.clone())
    }

    /// Waits until every loop has exited, up to `timeout`. Returns false
    /// if loops were still running when the timeout elapsed.
    pub(crate) async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.inner.active.load(Ordering::SeqCst) > 0 {
            if tokio::time::timeout_at(deadline, self.inner.idle.notified())
                .await
                .is_err()
            {
                return self.inner.active.load(Ordering::SeqCst) == 0;
            }
        }
        true
    }
}

struct LoopGuard(Arc<GaugeInner>);

impl Drop for LoopGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
        // notify_one stores a permit, so a waiter that checks the count
        // after this drop still wakes.
        self.0.idle.notify_one();
    }
}

/// Delivers broker messages to per-queue handlers.
#[derive(Clone)]
pub struct Consumer {
    holder: Arc<ConnectionHolder>,
    config: Arc<ConnectionConfig>,
    metrics: Arc<dyn MetricsSink>,
    done_rx: watch::Receiver<bool>,
    fatal_tx: mpsc::UnboundedSender<BusError>,
    gauge: LoopGauge,
}

impl Consumer {
    pub fn new(
        holder: Arc<ConnectionHolder>,
        config: Arc<ConnectionConfig>,
        metrics: Arc<dyn MetricsSink>,
        done_rx: watch::Receiver<bool>,
        fatal_tx: mpsc::UnboundedSender<BusError>,
    ) -> Self {
        Self {
            holder,
            config,
            metrics,
            done_rx,
            fatal_tx,
            gauge: LoopGauge::default(),
        }
    }

    /// Gauge tracking this consumer's live delivery loops. Shared across
    /// clones.
    pub(crate) fn gauge(&self) -> LoopGauge {
        self.gauge.clone()
    }

    /// Starts consuming `queue` and dispatching deliveries to `handler`.
    ///
    /// If the broker reports the queue missing, opening is retried with
    /// exponential backoff up to the configured attempt budget; exhausting
    /// it surfaces the error instead of waiting forever for a queue that
    /// may never appear.
    pub async fn consume(
        &self,
        queue: &str,
        pin: &str,
        type_label: &str,
        handler: Arc<dyn DeliveryHandler>,
        auto_ack: bool,
    ) -> Result<SubscriptionHandle> {
        let consumer = self.open_consumer(queue, auto_ack).await?;
        info!(queue, pin, "Consuming");

        let (stop_tx, stop_rx) = watch::channel(false);
        let ctx = LoopCtx {
            consumer: self.clone(),
            queue: queue.to_string(),
            pin: pin.to_string(),
            type_label: type_label.to_string(),
            auto_ack,
            handler,
        };
        let guard = self.gauge.enter();
        let task = tokio::spawn(async move {
            let _guard = guard;
            ctx.run(consumer, stop_rx).await;
        });

        Ok(SubscriptionHandle { stop_tx, task })
    }

    async fn open_consumer(&self, queue: &str, auto_ack: bool) -> Result<lapin::Consumer> {
        let mut backoff = retry::consume_backoff(
            self.config.min_recovery_timeout(),
            self.config.max_recovery_timeout(),
            self.config.max_recovery_attempts,
        )
        .build();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let channel = self.holder.channel(queue).await?;
            let tag = format!("pinbus-{}-{}", queue, Uuid::new_v4());
            match channel
                .basic_consume(
                    queue,
                    &tag,
                    BasicConsumeOptions {
                        no_ack: auto_ack,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
            {
                Ok(consumer) => return Ok(consumer),
                Err(err) if is_queue_not_found(&err) => match backoff.next() {
                    Some(delay) => {
                        warn!(
                            queue,
                            attempt = attempts,
                            backoff_ms = delay.as_millis() as u64,
                            "Queue not found, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        return Err(BusError::QueueNotFound {
                            queue: queue.to_string(),
                            attempts,
                            source: err,
                        })
                    }
                },
                Err(err) => return Err(err.into()),
            }
        }
    }
}

/// True for the AMQP 404 a broker replies with when the queue is missing.
fn is_queue_not_found(err: &lapin::Error) -> bool {
    matches!(err, lapin::Error::ProtocolError(e) if e.get_id() == 404)
}

/// True when an operation failed only because its channel or connection
/// was already torn down, the expected outcome of a racing shutdown.
fn is_already_closed(err: &BusError) -> bool {
    matches!(
        err,
        BusError::Transport(
            lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_)
        ) | BusError::Connection(_)
    )
}

struct LoopCtx {
    consumer: Consumer,
    queue: String,
    pin: String,
    type_label: String,
    auto_ack: bool,
    handler: Arc<dyn DeliveryHandler>,
}

impl LoopCtx {
    /// The delivery loop: selects among the process-level done signal, the
    /// subscription's own stop signal, and the consumer stream.
    async fn run(self, mut consumer: lapin::Consumer, mut stop_rx: watch::Receiver<bool>) {
        let mut done_rx = self.consumer.done_rx.clone();
        let mut tag = consumer.tag().to_string();

        loop {
            tokio::select! {
                _ = done_rx.changed() => {
                    debug!(queue = %self.queue, "Shutdown, draining");
                    self.drain(&mut consumer, &tag).await;
                    self.finish().await;
                    return;
                }
                _ = stop_rx.changed() => {
                    debug!(queue = %self.queue, "Unsubscribed, draining");
                    self.drain(&mut consumer, &tag).await;
                    self.finish().await;
                    return;
                }
                next = consumer.next() => match next {
                    Some(Ok(delivery)) => self.dispatch(delivery, &tag).await,
                    other => {
                        if let Some(Err(err)) = other {
                            warn!(queue = %self.queue, error = %err, "Consumer stream failed");
                        } else {
                            warn!(queue = %self.queue, "Consumer stream ended");
                        }
                        // The channel is gone; buffered deliveries were
                        // drained by the failed stream itself. Re-subscribe
                        // through the missing-queue-aware open.
                        match self.consumer.open_consumer(&self.queue, self.auto_ack).await {
                            Ok(next_consumer) => {
                                consumer = next_consumer;
                                tag = consumer.tag().to_string();
                                info!(queue = %self.queue, "Re-subscribed after channel loss");
                            }
                            Err(err) if is_already_closed(&err) => {
                                debug!(queue = %self.queue, "Not re-subscribing, bus is closing");
                                self.finish().await;
                                return;
                            }
                            Err(err) => {
                                // Anything else here means the environment
                                // broke an invariant; this must not be
                                // masked as a routine retry.
                                let fatal = BusError::Unrecoverable(format!(
                                    "re-subscription to '{}' failed: {err}",
                                    self.queue
                                ));
                                error!(queue = %self.queue, error = %fatal, "Delivery loop aborting");
                                let _ = self.consumer.fatal_tx.send(fatal);
                                self.finish().await;
                                return;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Hands already-buffered deliveries to the handler before exiting.
    async fn drain(&self, consumer: &mut lapin::Consumer, tag: &str) {
        while let Some(Some(Ok(delivery))) = consumer.next().now_or_never() {
            self.dispatch(delivery, tag).await;
        }
    }

    async fn dispatch(&self, delivery: Delivery, tag: &str) {
        let meta = DeliveryMeta {
            pin: self.pin.clone(),
            queue: self.queue.clone(),
            consumer_tag: tag.to_string(),
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            redelivered: delivery.redelivered,
        };
        let bytes = delivery.data.len();
        let confirmation = if self.auto_ack {
            None
        } else {
            Some(Confirmation::new(delivery.acker.clone()))
        };

        let started = Instant::now();
        if let Err(err) = self
            .handler
            .on_delivery(&meta, &delivery.data, confirmation)
            .await
        {
            // Contained: the loop keeps going.
            error!(queue = %self.queue, pin = %self.pin, error = %err, "Handler failed");
        }
        self.consumer.metrics.observe_delivery(
            &DeliveryLabels {
                pin: self.pin.clone(),
                message_type: self.type_label.clone(),
                queue: self.queue.clone(),
            },
            bytes,
            started.elapsed(),
        );
    }

    async fn finish(&self) {
        if let Err(err) = self.handler.on_close().await {
            warn!(queue = %self.queue, error = %err, "Handler close failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::protocol::AMQPError;

    #[test]
    fn test_queue_not_found_detection() {
        let not_found = AMQPError::from_id(404, "NOT_FOUND - no queue 'q'".into()).unwrap();
        assert!(is_queue_not_found(&lapin::Error::ProtocolError(not_found)));

        let access_refused = AMQPError::from_id(403, "ACCESS_REFUSED".into()).unwrap();
        assert!(!is_queue_not_found(&lapin::Error::ProtocolError(access_refused)));
        assert!(!is_queue_not_found(&lapin::Error::ChannelsLimitReached));
    }

    #[tokio::test]
    async fn test_gauge_waits_for_live_loops() {
        let gauge = LoopGauge::default();
        let guard = gauge.enter();
        assert!(!gauge.wait_idle(Duration::from_millis(20)).await);

        let waiter = gauge.clone();
        let task = tokio::spawn(async move { waiter.wait_idle(Duration::from_secs(1)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(guard);
        assert!(task.await.unwrap());
    }

    #[tokio::test]
    async fn test_gauge_idle_without_loops() {
        let gauge = LoopGauge::default();
        assert!(gauge.wait_idle(Duration::from_millis(1)).await);
    }

    #[test]
    fn test_already_closed_detection() {
        assert!(is_already_closed(&BusError::Connection(
            "connection holder is closed".to_string()
        )));
        assert!(!is_already_closed(&BusError::Unrecoverable("boom".to_string())));
        assert!(!is_already_closed(&BusError::Transport(
            lapin::Error::ChannelsLimitReached
        )));
    }
}
