//! Attribute-addressed event router.
//!
//! Same addressing model as the message router, but over event batches
//! and with the `event` attribute implied on every call, so callers never
//! spell it out. Events carry no message metadata, so content filters do
//! not apply.

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::{RouterConfig, EVENT_ATTRIBUTE, PUBLISH_ATTRIBUTE, SUBSCRIBE_ATTRIBUTE};
use crate::connection::ConnectionManager;
use crate::error::{BusError, Result};
use crate::message::EventBatch;
use crate::router::listener::{EventBatchHandler, EventListener};
use crate::router::pin::{PinRegistry, SubscriberMonitor};
use crate::router::{required_attributes, TYPE_EVENT};

pub struct EventRouter {
    config: Arc<RouterConfig>,
    registry: PinRegistry,
}

impl EventRouter {
    pub fn new(manager: &ConnectionManager, config: Arc<RouterConfig>) -> Self {
        let registry = PinRegistry::new(
            manager.publisher(),
            manager.consumer(),
            manager.config().exchange_name.clone(),
        );
        Self { config, registry }
    }

    /// Publishes `batch` to every event pin carrying `attributes`.
    pub async fn send_all<S: AsRef<str>>(
        &self,
        batch: &EventBatch,
        attributes: &[S],
    ) -> Result<()> {
        let requested = required_attributes(attributes, &[EVENT_ATTRIBUTE, PUBLISH_ATTRIBUTE]);
        let pins = self.config.resolve(&requested);
        if pins.is_empty() {
            return Err(BusError::NoPinFound(requested));
        }

        let body = batch.encode()?;
        for (name, pin) in pins {
            let sender = self.registry.sender(name, pin).await;
            sender.send(&body, TYPE_EVENT).await?;
        }
        Ok(())
    }

    /// Attaches `listener` to every event pin carrying `attributes`.
    /// Deliveries are acknowledged automatically. A pin already consuming
    /// for an earlier caller is reused as-is, not restarted.
    pub async fn subscribe_all<S: AsRef<str>>(
        &self,
        listener: Arc<dyn EventListener>,
        attributes: &[S],
    ) -> Result<SubscriberMonitor> {
        let requested = required_attributes(attributes, &[EVENT_ATTRIBUTE, SUBSCRIBE_ATTRIBUTE]);
        let pins = self.config.resolve(&requested);
        if pins.is_empty() {
            return Err(BusError::NoSubscriber(requested));
        }

        let handler = Arc::new(EventBatchHandler { listener });
        let mut covered = Vec::new();
        let mut fresh = Vec::new();
        for (name, pin) in pins {
            let subscriber = self.registry.subscriber(name, pin).await;
            match subscriber.start(handler.clone(), TYPE_EVENT, true).await {
                Ok(()) => fresh.push(subscriber.clone()),
                Err(BusError::AlreadyStarted(pin_name)) => {
                    info!(pin = %pin_name, "Subscriber already running, reusing");
                }
                Err(err) => {
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

    /// Stops every subscriber this router started.
    pub async fn close(&self) {
        info!("Closing event router");
        self.registry.stop_all().await;
    }
}
