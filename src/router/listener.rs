//! Listener contracts and the adapters that decode deliveries for them.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::consume::{Confirmation, DeliveryHandler};
use crate::error::{BusError, Result};
use crate::message::{DeliveryMeta, EventBatch, MessageBatch};

/// Auto-ack message listener. The delivery is acknowledged by the broker
/// on receipt; the listener only processes it.
#[async_trait]
pub trait MessageListener: Send + Sync {
    async fn on_batch(&self, meta: &DeliveryMeta, batch: MessageBatch) -> Result<()>;

    /// Invoked when the subscription is torn down.
    async fn on_close(&self) -> Result<()> {
        Ok(())
    }
}

/// Manual-ack message listener. The listener must settle each delivery
/// through the confirmation handle.
#[async_trait]
pub trait ManualAckMessageListener: Send + Sync {
    async fn on_batch(
        &self,
        meta: &DeliveryMeta,
        batch: MessageBatch,
        confirmation: Confirmation,
    ) -> Result<()>;

    /// Invoked when the subscription is torn down.
    async fn on_close(&self) -> Result<()> {
        Ok(())
    }
}

/// Auto-ack event listener.
#[async_trait]
pub trait EventListener: Send + Sync {
    async fn on_events(&self, meta: &DeliveryMeta, batch: EventBatch) -> Result<()>;

    /// Invoked when the subscription is torn down.
    async fn on_close(&self) -> Result<()> {
        Ok(())
    }
}

/// Decodes deliveries into message batches for an auto-ack listener.
pub(crate) struct BatchHandler {
    pub listener: Arc<dyn MessageListener>,
}

#[async_trait]
impl DeliveryHandler for BatchHandler {
    async fn on_delivery(
        &self,
        meta: &DeliveryMeta,
        payload: &[u8],
        _confirmation: Option<Confirmation>,
    ) -> Result<()> {
        let batch = MessageBatch::decode(payload)?;
        self.listener.on_batch(meta, batch).await
    }

    async fn on_close(&self) -> Result<()> {
        self.listener.on_close().await
    }
}

/// Decodes deliveries for a manual-ack listener. A payload that does not
/// decode is rejected without requeueing; redelivering it cannot help.
pub(crate) struct ManualAckBatchHandler {
    pub listener: Arc<dyn ManualAckMessageListener>,
}

#[async_trait]
impl DeliveryHandler for ManualAckBatchHandler {
    async fn on_delivery(
        &self,
        meta: &DeliveryMeta,
        payload: &[u8],
        confirmation: Option<Confirmation>,
    ) -> Result<()> {
        let confirmation = confirmation.ok_or_else(|| {
            BusError::Subscribe("manual-ack subscription delivered without an acker".to_string())
        })?;
        match MessageBatch::decode(payload) {
            Ok(batch) => self.listener.on_batch(meta, batch, confirmation).await,
            Err(err) => {
                warn!(queue = %meta.queue, error = %err, "Rejecting undecodable delivery");
                confirmation.reject().await?;
                Err(err)
            }
        }
    }

    async fn on_close(&self) -> Result<()> {
        self.listener.on_close().await
    }
}

/// Decodes deliveries into event batches.
pub(crate) struct EventBatchHandler {
    pub listener: Arc<dyn EventListener>,
}

#[async_trait]
impl DeliveryHandler for EventBatchHandler {
    async fn on_delivery(
        &self,
        meta: &DeliveryMeta,
        payload: &[u8],
        _confirmation: Option<Confirmation>,
    ) -> Result<()> {
        let batch = EventBatch::decode(payload)?;
        self.listener.on_events(meta, batch).await
    }

    async fn on_close(&self) -> Result<()> {
        self.listener.on_close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct CollectingListener {
        batches: Mutex<Vec<MessageBatch>>,
        closed: Mutex<bool>,
    }

    #[async_trait]
    impl MessageListener for CollectingListener {
        async fn on_batch(&self, _meta: &DeliveryMeta, batch: MessageBatch) -> Result<()> {
            self.batches.lock().unwrap().push(batch);
            Ok(())
        }

        async fn on_close(&self) -> Result<()> {
            *self.closed.lock().unwrap() = true;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_batch_handler_decodes_and_forwards() {
        let listener = Arc::new(CollectingListener {
            batches: Mutex::new(Vec::new()),
            closed: Mutex::new(false),
        });
        let handler = BatchHandler {
            listener: listener.clone(),
        };

        let batch = MessageBatch::default();
        let payload = batch.encode().unwrap();
        handler
            .on_delivery(&DeliveryMeta::default(), &payload, None)
            .await
            .unwrap();
        assert_eq!(listener.batches.lock().unwrap().len(), 1);

        handler.on_close().await.unwrap();
        assert!(*listener.closed.lock().unwrap());
    }

    #[tokio::test]
    async fn test_batch_handler_propagates_decode_error() {
        let listener = Arc::new(CollectingListener {
            batches: Mutex::new(Vec::new()),
            closed: Mutex::new(false),
        });
        let handler = BatchHandler { listener };
        let err = handler
            .on_delivery(&DeliveryMeta::default(), b"junk", None)
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Decode(_)));
    }
}
