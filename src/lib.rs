//! Pinbus - resilient AMQP client middleware.
//!
//! Holds one broker connection that recovers itself with exponential
//! backoff, builds publish/consume primitives on top of it, and routes
//! batches through attribute-addressed pins with content filtering.

pub mod bootstrap;
pub mod config;
pub mod connection;
pub mod consume;
pub mod error;
pub mod filter;
pub mod message;
pub mod metrics;
pub mod publish;
pub mod retry;
pub mod router;

pub use config::Config;
pub use connection::ConnectionManager;
pub use error::{BusError, Result};
pub use router::{EventRouter, MessageRouter, SubscriberMonitor};
