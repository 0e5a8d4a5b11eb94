//! Error types for bus operations.

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("No pin found for attributes {0:?}")]
    NoPinFound(Vec<String>),

    #[error("No subscriber found for attributes {0:?}")]
    NoSubscriber(Vec<String>),

    #[error("Subscriber for pin '{0}' already started")]
    AlreadyStarted(String),

    #[error("Consumer budget exhausted for queue '{queue}' after {attempts} attempts: {source}")]
    QueueNotFound {
        queue: String,
        attempts: u32,
        #[source]
        source: lapin::Error,
    },

    #[error("Malformed payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Handler failed: {0}")]
    Handler(String),

    #[error("Unrecoverable: {0}")]
    Unrecoverable(String),

    #[error(transparent)]
    Transport(#[from] lapin::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_pin_found_lists_attributes() {
        let err = BusError::NoPinFound(vec!["publish".into(), "raw".into()]);
        assert!(err.to_string().contains("publish"));
        assert!(err.to_string().contains("raw"));
    }

    #[test]
    fn test_transport_error_unwrapped() {
        let err = BusError::from(lapin::Error::ChannelsLimitReached);
        // The transparent variant must surface the lapin message verbatim.
        assert_eq!(err.to_string(), lapin::Error::ChannelsLimitReached.to_string());
    }
}
