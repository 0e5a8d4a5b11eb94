//! Publishing primitive.

use std::sync::Arc;

use lapin::options::BasicPublishOptions;
use lapin::BasicProperties;
use tracing::debug;

use crate::connection::ConnectionHolder;
use crate::error::Result;
use crate::metrics::{MetricsSink, PublishLabels};

/// Publishes opaque byte payloads onto a routing key/exchange pair using a
/// channel obtained from the shared [`ConnectionHolder`].
///
/// There is no internal retry: a transient transport error propagates to
/// the caller unwrapped. Retrying here would trade ordering for
/// availability, which is the caller's call to make.
pub struct Publisher {
    holder: Arc<ConnectionHolder>,
    metrics: Arc<dyn MetricsSink>,
}

impl Publisher {
    pub fn new(holder: Arc<ConnectionHolder>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self { holder, metrics }
    }

    /// Publishes `body` under `routing_key` on `exchange`.
    ///
    /// The channel is keyed by routing key, so repeated publishes to the
    /// same key preserve per-channel ordering. Non-mandatory,
    /// non-immediate.
    pub async fn publish(
        &self,
        body: &[u8],
        routing_key: &str,
        exchange: &str,
        pin: &str,
        type_label: &str,
    ) -> Result<()> {
        let channel = self.holder.channel(routing_key).await?;
        channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                BasicProperties::default(),
            )
            .await?
            .await?;

        debug!(pin, exchange, routing_key, bytes = body.len(), "Published");
        self.metrics.observe_publish(
            &PublishLabels {
                pin: pin.to_string(),
                message_type: type_label.to_string(),
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
            },
            body.len(),
        );
        Ok(())
    }
}
