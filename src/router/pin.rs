//! Per-pin send/subscribe endpoints and their shared registry.
//!
//! Each pin gets at most one sender and at most one subscriber for the
//! lifetime of the registry. Creation is double-checked behind a
//! read/write lock so concurrent first uses converge on one instance.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::config::PinConfig;
use crate::consume::{Consumer, DeliveryHandler, SubscriptionHandle};
use crate::error::{BusError, Result};
use crate::publish::Publisher;

/// Sends pre-encoded payloads to one pin's routing key and exchange.
pub struct PinSender {
    pin: String,
    routing_key: String,
    exchange: String,
    publisher: Arc<Publisher>,
}

impl PinSender {
    pub async fn send(&self, body: &[u8], type_label: &str) -> Result<()> {
        self.publisher
            .publish(body, &self.routing_key, &self.exchange, &self.pin, type_label)
            .await
    }
}

/// Consumes one pin's queue. Started at most once at a time; starting an
/// already-running subscriber is reported, not silently tolerated.
pub struct PinSubscriber {
    pin: String,
    queue: String,
    consumer: Consumer,
    started: AtomicBool,
    handle: Mutex<Option<SubscriptionHandle>>,
}

impl std::fmt::Debug for PinSubscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinSubscriber")
            .field("pin", &self.pin)
            .field("queue", &self.queue)
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}

impl PinSubscriber {
    pub fn pin(&self) -> &str {
        &self.pin
    }

    pub(crate) async fn start(
        &self,
        handler: Arc<dyn DeliveryHandler>,
        type_label: &str,
        auto_ack: bool,
    ) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(BusError::AlreadyStarted(self.pin.clone()));
        }
        match self
            .consumer
            .consume(&self.queue, &self.pin, type_label, handler, auto_ack)
            .await
        {
            Ok(handle) => {
                *self.handle.lock().await = Some(handle);
                Ok(())
            }
            Err(err) => {
                self.started.store(false, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    /// Stops consumption and resets the subscriber for a later restart.
    pub(crate) async fn stop(&self) -> Result<()> {
        let handle = self.handle.lock().await.take();
        let result = match handle {
            Some(handle) => handle.stop().await,
            None => Ok(()),
        };
        self.started.store(false, Ordering::SeqCst);
        result
    }
}

/// Caches the per-pin sender and subscriber singletons.
pub(crate) struct PinRegistry {
    publisher: Arc<Publisher>,
    consumer: Consumer,
    default_exchange: String,
    senders: RwLock<HashMap<String, Arc<PinSender>>>,
    subscribers: RwLock<HashMap<String, Arc<PinSubscriber>>>,
}

impl PinRegistry {
    pub fn new(publisher: Arc<Publisher>, consumer: Consumer, default_exchange: String) -> Self {
        Self {
            publisher,
            consumer,
            default_exchange,
            senders: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    pub async fn sender(&self, name: &str, pin: &PinConfig) -> Arc<PinSender> {
        get_or_insert_with(&self.senders, name, || {
            let exchange = if pin.exchange.is_empty() {
                self.default_exchange.clone()
            } else {
                pin.exchange.clone()
            };
            debug!(pin = name, exchange = %exchange, routing_key = %pin.routing_key, "Creating sender");
            Arc::new(PinSender {
                pin: name.to_string(),
                routing_key: pin.routing_key.clone(),
                exchange,
                publisher: self.publisher.clone(),
            })
        })
        .await
    }

    pub async fn subscriber(&self, name: &str, pin: &PinConfig) -> Arc<PinSubscriber> {
        get_or_insert_with(&self.subscribers, name, || {
            debug!(pin = name, queue = %pin.queue_name, "Creating subscriber");
            Arc::new(PinSubscriber {
                pin: name.to_string(),
                queue: pin.queue_name.clone(),
                consumer: self.consumer.clone(),
                started: AtomicBool::new(false),
                handle: Mutex::new(None),
            })
        })
        .await
    }

    /// Stops every running subscriber, best effort.
    pub async fn stop_all(&self) {
        let subscribers: Vec<_> = self.subscribers.read().await.values().cloned().collect();
        for subscriber in subscribers {
            if let Err(err) = subscriber.stop().await {
                warn!(pin = subscriber.pin(), error = %err, "Failed to stop subscriber");
            }
        }
    }
}

/// Double-checked create: a read-locked fast path, then a write-locked
/// re-check before inserting, so concurrent first uses for a key converge
/// on exactly one instance.
async fn get_or_insert_with<T, F>(
    map: &RwLock<HashMap<String, Arc<T>>>,
    key: &str,
    create: F,
) -> Arc<T>
where
    T: Send + Sync,
    F: FnOnce() -> Arc<T>,
{
    if let Some(value) = map.read().await.get(key) {
        return value.clone();
    }
    let mut map = map.write().await;
    if let Some(value) = map.get(key) {
        return value.clone();
    }
    let value = create();
    map.insert(key.to_string(), value.clone());
    value
}

/// Handle over the subscribers one subscribe call started. Dropping it
/// leaves them running; unsubscribing stops them all.
#[derive(Debug)]
pub struct SubscriberMonitor {
    subscribers: Vec<Arc<PinSubscriber>>,
}

impl SubscriberMonitor {
    pub(crate) fn new(subscribers: Vec<Arc<PinSubscriber>>) -> Self {
        Self { subscribers }
    }

    /// Pins this monitor covers.
    pub fn pins(&self) -> Vec<&str> {
        self.subscribers.iter().map(|s| s.pin()).collect()
    }

    /// Stops every covered subscriber. Failures are aggregated rather
    /// than aborting the teardown early.
    pub async fn unsubscribe(self) -> Result<()> {
        let mut failures = Vec::new();
        for subscriber in &self.subscribers {
            if let Err(err) = subscriber.stop().await {
                failures.push(format!("{}: {err}", subscriber.pin()));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(BusError::Subscribe(format!(
                "unsubscribe failed for {}",
                failures.join("; ")
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_concurrent_first_use_creates_one_instance() {
        let map = Arc::new(RwLock::new(HashMap::new()));
        let created = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let map = map.clone();
            let created = created.clone();
            tasks.push(tokio::spawn(async move {
                get_or_insert_with(&map, "pin", || {
                    created.fetch_add(1, Ordering::SeqCst);
                    Arc::new(7usize)
                })
                .await
            }));
        }
        let mut instances = Vec::new();
        for task in tasks {
            instances.push(task.await.unwrap());
        }

        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert!(instances.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
    }

    #[tokio::test]
    async fn test_distinct_keys_get_distinct_instances() {
        let map = RwLock::new(HashMap::new());
        let a = get_or_insert_with(&map, "a", || Arc::new(1usize)).await;
        let b = get_or_insert_with(&map, "b", || Arc::new(2usize)).await;
        assert!(!Arc::ptr_eq(&a, &b));

        let again = get_or_insert_with(&map, "a", || Arc::new(3usize)).await;
        assert!(Arc::ptr_eq(&a, &again));
        assert_eq!(*again, 1);
    }
}
