//! Connection manager.
//!
//! Composes one publisher and one consumer over a shared connection
//! holder, owns the process-level done signal, and exposes the listener
//! that supervisors block on for unrecoverable consumer errors.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tracing::{info, warn};

use crate::config::ConnectionConfig;
use crate::connection::holder::{ChannelRecoveredCallback, ConnectionHolder};
use crate::consume::Consumer;
use crate::error::{BusError, Result};
use crate::metrics::MetricsSink;
use crate::publish::Publisher;

/// Owns the broker connection and the primitives built on it.
pub struct ConnectionManager {
    holder: Arc<ConnectionHolder>,
    config: Arc<ConnectionConfig>,
    publisher: Arc<Publisher>,
    consumer: Consumer,
    done_tx: watch::Sender<bool>,
    fatal_rx: Mutex<mpsc::UnboundedReceiver<BusError>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("config", &self.config)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Connects to the broker and wires up publisher and consumer.
    pub async fn connect(
        config: ConnectionConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        Self::connect_with_callback(config, metrics, None).await
    }

    /// Like [`connect`](Self::connect), with a callback invoked whenever a
    /// closed channel is transparently recreated.
    pub async fn connect_with_callback(
        config: ConnectionConfig,
        metrics: Arc<dyn MetricsSink>,
        channel_recovered: Option<ChannelRecoveredCallback>,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let holder = ConnectionHolder::connect((*config).clone(), channel_recovered).await?;

        let (done_tx, done_rx) = watch::channel(false);
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();

        let publisher = Arc::new(Publisher::new(holder.clone(), metrics.clone()));
        let consumer = Consumer::new(holder.clone(), config.clone(), metrics, done_rx, fatal_tx);

        Ok(Self {
            holder,
            config,
            publisher,
            consumer,
            done_tx,
            fatal_rx: Mutex::new(fatal_rx),
            closed: AtomicBool::new(false),
        })
    }

    /// Endpoint configuration the manager was connected with.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn publisher(&self) -> Arc<Publisher> {
        self.publisher.clone()
    }

    pub fn consumer(&self) -> Consumer {
        self.consumer.clone()
    }

    /// Blocks until a delivery loop reports an unrecoverable error.
    ///
    /// Returns `None` once the manager is closed. Intended for a
    /// supervisor task that decides whether to restart the process.
    /// `close()` never contends on the receiver lock, so a parked
    /// supervisor cannot stall shutdown.
    pub async fn blocked(&self) -> Option<BusError> {
        // Subscribe before the closed check so a close racing this call
        // is observed either way.
        let mut done_rx = self.done_tx.subscribe();
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        let mut fatal_rx = self.fatal_rx.lock().await;
        tokio::select! {
            fatal = fatal_rx.recv() => fatal,
            _ = done_rx.changed() => None,
        }
    }

    /// Signals every delivery loop to drain and stop, waits for the
    /// drains, then closes the connection. Idempotent; the done signal
    /// is sent exactly once.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Closing connection manager");
        let _ = self.done_tx.send(true);
        // The final drains must finish before the connection goes away
        // underneath them.
        if !self
            .consumer
            .gauge()
            .wait_idle(self.config.connection_close_timeout())
            .await
        {
            warn!("Delivery loops still running at close timeout");
        }
        self.holder.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoopMetrics;

    #[tokio::test]
    async fn test_connect_fails_fast_on_bad_config() {
        let config = ConnectionConfig {
            host: "rabbit".to_string(),
            username: "guest".to_string(),
            password: "guest".to_string(),
            min_connection_recovery_timeout_ms: 10,
            max_connection_recovery_timeout_ms: 1,
            ..Default::default()
        };
        let err = ConnectionManager::connect(config, Arc::new(NoopMetrics))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Config(_)));
    }
}
