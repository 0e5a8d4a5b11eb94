//! Broker connection lifecycle.

mod holder;
mod manager;

pub use holder::{ChannelRecoveredCallback, ConnectionHolder};
pub use manager::ConnectionManager;
