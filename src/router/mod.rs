//! Attribute-addressed routing over the connection primitives.

mod event;
mod listener;
mod message;
mod pin;

pub use event::EventRouter;
pub use listener::{EventListener, ManualAckMessageListener, MessageListener};
pub use message::MessageRouter;
pub use pin::{PinSender, PinSubscriber, SubscriberMonitor};

/// Type label recorded for routed message batches.
pub(crate) const TYPE_MESSAGE: &str = "MESSAGE";
/// Type label recorded for raw passthrough sends.
pub(crate) const TYPE_RAW: &str = "RAW";
/// Type label recorded for event batches.
pub(crate) const TYPE_EVENT: &str = "EVENT";

/// Caller attributes plus the implicit ones an operation requires,
/// without duplicates.
pub(crate) fn required_attributes<S: AsRef<str>>(
    attributes: &[S],
    implicit: &[&str],
) -> Vec<String> {
    let mut requested: Vec<String> = attributes
        .iter()
        .map(|attr| attr.as_ref().to_string())
        .collect();
    for attr in implicit {
        if !requested.iter().any(|a| a == attr) {
            requested.push((*attr).to_string());
        }
    }
    requested
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_attributes_appends_missing() {
        let requested = required_attributes(&["raw", "first"], &["publish"]);
        assert_eq!(requested, vec!["raw", "first", "publish"]);
    }

    #[test]
    fn test_required_attributes_no_duplicates() {
        let requested = required_attributes(&["publish", "raw"], &["publish"]);
        assert_eq!(requested, vec!["publish", "raw"]);
    }
}
