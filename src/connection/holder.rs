//! Broker connection holder.
//!
//! Owns one physical connection and a cache of channels keyed by an
//! application-chosen string (a routing key or queue name). When the
//! connection drops abnormally, a background routine clears the cache,
//! redials with exponential backoff until it succeeds, and broadcasts a
//! recovery signal to every caller blocked in [`ConnectionHolder::channel`].
//! A single channel closing only evicts that cache entry; the connection
//! itself stays up.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use backon::BackoffBuilder;
use lapin::options::BasicQosOptions;
use lapin::{Channel, Connection, ConnectionProperties};
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;
use crate::error::{BusError, Result};
use crate::retry;

/// Invoked with the channel key after a closed channel has been recreated.
pub type ChannelRecoveredCallback = Arc<dyn Fn(&str) + Send + Sync>;

struct ConnState {
    connection: Connection,
    channels: HashMap<String, Channel>,
    /// Keys whose channel died and was evicted; the recovered callback
    /// fires when such a key gets its replacement channel.
    recovering: HashSet<String>,
    /// False from the moment a failure is observed until redial succeeds.
    healthy: bool,
}

/// Maintains one live broker connection and its channel cache.
pub struct ConnectionHolder {
    config: ConnectionConfig,
    state: RwLock<ConnState>,
    /// Recovery broadcast: a generation counter bumped after each
    /// successful reconnect. Subscribing before checking health guarantees
    /// a waiter never misses the wake-up.
    recovery_tx: watch::Sender<u64>,
    /// Failure signals from the active connection's error callback.
    failure_tx: mpsc::UnboundedSender<lapin::Error>,
    /// Keys of channels that reported an error; the recovery routine
    /// evicts them eagerly instead of waiting for the next lookup.
    chan_failure_tx: mpsc::UnboundedSender<String>,
    done_tx: watch::Sender<bool>,
    closed: AtomicBool,
    channel_recovered: Option<ChannelRecoveredCallback>,
}

impl std::fmt::Debug for ConnectionHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHolder")
            .field("config", &self.config)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl ConnectionHolder {
    /// Dials the broker and starts the connection-recovery routine.
    ///
    /// Fails fast with a configuration error before touching the network
    /// if the endpoint settings cannot work.
    pub async fn connect(
        config: ConnectionConfig,
        channel_recovered: Option<ChannelRecoveredCallback>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let connection = Self::dial(&config).await?;
        info!(host = %config.host, port = config.port, vhost = %config.vhost, "Connected to broker");

        let (failure_tx, failure_rx) = mpsc::unbounded_channel();
        let (chan_failure_tx, chan_failure_rx) = mpsc::unbounded_channel();
        let (recovery_tx, _) = watch::channel(0u64);
        let (done_tx, done_rx) = watch::channel(false);

        let holder = Arc::new(Self {
            config,
            state: RwLock::new(ConnState {
                connection,
                channels: HashMap::new(),
                recovering: HashSet::new(),
                healthy: true,
            }),
            recovery_tx,
            failure_tx,
            chan_failure_tx,
            done_tx,
            closed: AtomicBool::new(false),
            channel_recovered,
        });

        {
            let state = holder.state.read().await;
            holder.watch_connection(&state.connection);
        }

        let routine = holder.clone();
        tokio::spawn(async move {
            routine
                .run_connection_routine(failure_rx, chan_failure_rx, done_rx)
                .await;
        });

        Ok(holder)
    }

    /// Returns a channel for `key`, creating and caching one if needed.
    ///
    /// While a reconnection is in progress this suspends the caller until
    /// the new connection is up, then creates the channel against it; a
    /// cached channel is never returned for a superseded connection.
    pub async fn channel(&self, key: &str) -> Result<Channel> {
        loop {
            // Subscribe before checking health so a recovery broadcast
            // between the check and the wait cannot be missed.
            let mut recovery_rx = self.recovery_tx.subscribe();

            if self.closed.load(Ordering::SeqCst) {
                return Err(BusError::Connection("connection holder is closed".to_string()));
            }

            {
                let state = self.state.read().await;
                if state.healthy {
                    if let Some(ch) = state.channels.get(key) {
                        if ch.status().connected() {
                            return Ok(ch.clone());
                        }
                    }
                } else {
                    drop(state);
                    if recovery_rx.changed().await.is_err() {
                        return Err(BusError::Connection(
                            "connection holder is closed".to_string(),
                        ));
                    }
                    continue;
                }
            }

            let mut state = self.state.write().await;
            if !state.healthy {
                continue;
            }
            if let Some(ch) = state.channels.get(key) {
                if ch.status().connected() {
                    return Ok(ch.clone());
                }
                // Fallback for a death the eager watcher has not
                // processed yet.
                state.channels.remove(key);
                state.recovering.insert(key.to_string());
                debug!(key, "Evicted closed channel");
            }
            match state.connection.create_channel().await {
                Ok(ch) => {
                    if self.config.prefetch_count > 0 {
                        ch.basic_qos(self.config.prefetch_count, BasicQosOptions::default())
                            .await?;
                    }
                    self.watch_channel(key, &ch);
                    state.channels.insert(key.to_string(), ch.clone());
                    let recovered = state.recovering.remove(key);
                    drop(state);
                    if recovered {
                        if let Some(callback) = &self.channel_recovered {
                            callback(key);
                        }
                    }
                    return Ok(ch);
                }
                Err(lapin::Error::InvalidConnectionState(_)) => {
                    // The connection died under us; let the recovery
                    // routine take over and wait for its broadcast.
                    state.healthy = false;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Signals the recovery routine to stop and closes the connection.
    /// Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.done_tx.send(true);
        // Wake any caller blocked on recovery; they observe `closed`.
        self.recovery_tx.send_modify(|generation| *generation += 1);

        let state = self.state.read().await;
        if state.connection.status().connected() {
            let close = state.connection.close(200, "client shutdown");
            match tokio::time::timeout(self.config.connection_close_timeout(), close).await {
                Ok(Ok(())) => debug!("Broker connection closed"),
                Ok(Err(err)) => warn!(error = %err, "Broker connection close failed"),
                Err(_) => warn!("Broker connection close timed out"),
            }
        }
        Ok(())
    }

    /// Watches the active connection, recovering it on abnormal loss.
    async fn run_connection_routine(
        self: Arc<Self>,
        mut failure_rx: mpsc::UnboundedReceiver<lapin::Error>,
        mut chan_failure_rx: mpsc::UnboundedReceiver<String>,
        mut done_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = done_rx.changed() => {
                    debug!("Connection routine stopping");
                    return;
                }
                failure = failure_rx.recv() => {
                    let Some(err) = failure else { return };
                    if self.closed.load(Ordering::SeqCst) {
                        // Normal close; nothing to recover.
                        return;
                    }
                    warn!(error = %err, "Connection lost, recovering");
                    {
                        let mut state = self.state.write().await;
                        state.healthy = false;
                        state.channels.clear();
                        // The whole connection is being replaced; the
                        // per-channel callback does not apply.
                        state.recovering.clear();
                    }
                    if !self.reconnect(&mut done_rx, &mut failure_rx).await {
                        return;
                    }
                    self.recovery_tx.send_modify(|generation| *generation += 1);
                    info!("Connection recovered");
                }
                failed_key = chan_failure_rx.recv() => {
                    let Some(key) = failed_key else { return };
                    let mut state = self.state.write().await;
                    // Only this entry; the connection itself stays up.
                    if let Some(ch) = state.channels.get(&key) {
                        if !ch.status().connected() {
                            state.channels.remove(&key);
                            state.recovering.insert(key.clone());
                            debug!(key = %key, "Evicted failed channel");
                        }
                    }
                }
            }
        }
    }

    /// Redials until success, doubling the delay from the configured
    /// minimum up to the maximum. Returns false if shutdown interrupted
    /// the attempt.
    async fn reconnect(
        &self,
        done_rx: &mut watch::Receiver<bool>,
        failure_rx: &mut mpsc::UnboundedReceiver<lapin::Error>,
    ) -> bool {
        let max = self.config.max_recovery_timeout();
        let mut backoff = retry::recovery_backoff(self.config.min_recovery_timeout(), max).build();

        loop {
            if *done_rx.borrow() {
                return false;
            }
            match Self::dial(&self.config).await {
                Ok(connection) => {
                    // Signals still queued from the dead connection are
                    // stale; drop them before watching the new one.
                    while failure_rx.try_recv().is_ok() {}
                    self.watch_connection(&connection);

                    let mut state = self.state.write().await;
                    state.connection = connection;
                    state.healthy = true;
                    return true;
                }
                Err(err) => {
                    let delay = backoff.next().unwrap_or(max);
                    warn!(
                        error = %err,
                        backoff_ms = delay.as_millis() as u64,
                        "Reconnect failed, backing off"
                    );
                    tokio::select! {
                        _ = done_rx.changed() => return false,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Forwards a channel's errors into the recovery routine so the dead
    /// entry is evicted without waiting for the next lookup.
    fn watch_channel(&self, key: &str, channel: &Channel) {
        let tx = self.chan_failure_tx.clone();
        let key = key.to_string();
        channel.on_error(move |err| {
            warn!(key = %key, error = %err, "Channel failed");
            let _ = tx.send(key.clone());
        });
    }

    /// Forwards connection errors into the recovery routine.
    fn watch_connection(&self, connection: &Connection) {
        let tx = self.failure_tx.clone();
        connection.on_error(move |err| {
            let _ = tx.send(err);
        });
    }

    async fn dial(config: &ConnectionConfig) -> Result<Connection> {
        let uri = config.uri();
        let connect = Connection::connect(&uri, ConnectionProperties::default());
        let connection = tokio::time::timeout(config.connection_timeout(), connect)
            .await
            .map_err(|_| {
                BusError::Connection(format!(
                    "timed out dialing {}:{}",
                    config.host, config.port
                ))
            })??;
        Ok(connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_rejects_inverted_backoff_without_dialing() {
        let config = ConnectionConfig {
            host: "rabbit".to_string(),
            username: "guest".to_string(),
            password: "guest".to_string(),
            min_connection_recovery_timeout_ms: 10_000,
            max_connection_recovery_timeout_ms: 100,
            ..Default::default()
        };
        // An unreachable host would hang the dial; the config error must
        // surface before any network activity.
        let err = ConnectionHolder::connect(config, None).await.unwrap_err();
        assert!(matches!(err, BusError::Config(_)));
    }

    #[tokio::test]
    async fn test_connect_rejects_missing_credentials() {
        let config = ConnectionConfig {
            host: "rabbit".to_string(),
            ..Default::default()
        };
        let err = ConnectionHolder::connect(config, None).await.unwrap_err();
        assert!(matches!(err, BusError::Config(_)));
    }
}
