//! Attribute-addressed message router.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::{RouterConfig, PUBLISH_ATTRIBUTE, SUBSCRIBE_ATTRIBUTE};
use crate::connection::ConnectionManager;
use crate::consume::DeliveryHandler;
use crate::error::{BusError, Result};
use crate::filter;
use crate::message::{MessageBatch, RawMessage};
use crate::router::listener::{
    BatchHandler, ManualAckBatchHandler, ManualAckMessageListener, MessageListener,
};
use crate::router::pin::{PinRegistry, SubscriberMonitor};
use crate::router::{required_attributes, TYPE_MESSAGE, TYPE_RAW};

/// Routes message batches to and from pins selected by attributes.
///
/// Sending fans out to every pin carrying the requested attributes whose
/// content filters pass; subscribing attaches one listener to every
/// matching pin's queue. Delivery to multiple pins is at least once per
/// pin with no rollback: a failure partway through a fan-out leaves
/// earlier pins already published.
pub struct MessageRouter {
    config: Arc<RouterConfig>,
    registry: PinRegistry,
}

impl MessageRouter {
    pub fn new(manager: &ConnectionManager, config: Arc<RouterConfig>) -> Self {
        let registry = PinRegistry::new(
            manager.publisher(),
            manager.consumer(),
            manager.config().exchange_name.clone(),
        );
        Self { config, registry }
    }

    /// Publishes `batch` to every publish pin carrying `attributes` whose
    /// filters accept the batch.
    pub async fn send_all<S: AsRef<str>>(
        &self,
        batch: &MessageBatch,
        attributes: &[S],
    ) -> Result<()> {
        let requested = required_attributes(attributes, &[PUBLISH_ATTRIBUTE]);
        let pins = self.config.resolve(&requested);
        if pins.is_empty() {
            return Err(BusError::NoPinFound(requested));
        }

        let body = batch.encode()?;
        for (name, pin) in pins {
            if !filter::batch_matches(batch, &pin.filters) {
                debug!(pin = name, "Batch rejected by pin filters");
                continue;
            }
            let sender = self.registry.sender(name, pin).await;
            sender.send(&body, TYPE_MESSAGE).await?;
        }
        Ok(())
    }

    /// Publishes a raw message to every publish pin carrying `attributes`.
    /// Raw bodies are opaque, so content filters do not apply.
    pub async fn send_raw_all<S: AsRef<str>>(
        &self,
        message: &RawMessage,
        attributes: &[S],
    ) -> Result<()> {
        let requested = required_attributes(attributes, &[PUBLISH_ATTRIBUTE]);
        let pins = self.config.resolve(&requested);
        if pins.is_empty() {
            return Err(BusError::NoPinFound(requested));
        }

        for (name, pin) in pins {
            let sender = self.registry.sender(name, pin).await;
            sender.send(&message.body, TYPE_RAW).await?;
        }
        Ok(())
    }

    /// Attaches `listener` to every subscribe pin carrying `attributes`.
    /// Deliveries are acknowledged automatically. A pin already consuming
    /// for an earlier caller is reused as-is, not restarted.
    pub async fn subscribe_all<S: AsRef<str>>(
        &self,
        listener: Arc<dyn MessageListener>,
        attributes: &[S],
    ) -> Result<SubscriberMonitor> {
        let handler = Arc::new(BatchHandler { listener });
        self.subscribe_pins(attributes, handler, true).await
    }

    /// Attaches `listener` to every subscribe pin carrying `attributes`.
    /// The listener settles each delivery through its confirmation.
    pub async fn subscribe_all_with_manual_ack<S: AsRef<str>>(
        &self,
        listener: Arc<dyn ManualAckMessageListener>,
        attributes: &[S],
    ) -> Result<SubscriberMonitor> {
        let handler = Arc::new(ManualAckBatchHandler { listener });
        self.subscribe_pins(attributes, handler, false).await
    }

    async fn subscribe_pins<S: AsRef<str>>(
        &self,
        attributes: &[S],
        handler: Arc<dyn DeliveryHandler>,
        auto_ack: bool,
    ) -> Result<SubscriberMonitor> {
        let requested = required_attributes(attributes, &[SUBSCRIBE_ATTRIBUTE]);
        let pins = self.config.resolve(&requested);
        if pins.is_empty() {
            return Err(BusError::NoSubscriber(requested));
        }

        let mut covered = Vec::new();
        let mut fresh = Vec::new();
        for (name, pin) in pins {
            let subscriber = self.registry.subscriber(name, pin).await;
            match subscriber.start(handler.clone(), TYPE_MESSAGE, auto_ack).await {
                Ok(()) => fresh.push(subscriber.clone()),
                // Already consuming for an earlier caller; reuse it.
                Err(BusError::AlreadyStarted(pin_name)) => {
                    info!(pin = %pin_name, "Subscriber already running, reusing");
                }
                Err(err) => {
                    // Roll back loops this call started; reused ones
                    // belong to their original caller.
                    for subscriber in &fresh {
                        if let Err(stop_err) = subscriber.stop().await {
                            warn!(pin = subscriber.pin(), error = %stop_err, "Rollback stop failed");
                        }
                    }
                    return Err(err);
                }
            }
            covered.push(subscriber);
        }
        Ok(SubscriberMonitor::new(covered))
    }

    /// Stops every subscriber this router started. Best effort; sending
    /// through the router remains possible until the connection closes.
    pub async fn close(&self) {
        info!("Closing message router");
        self.registry.stop_all().await;
    }
}
