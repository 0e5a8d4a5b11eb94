//! Content filter engine.
//!
//! Decides, per pin, whether an outgoing batch is eligible for that pin's
//! destination. Specs are OR-ed: the batch is eligible if at least one spec
//! holds. Within a spec every field condition must hold for every message
//! in every group of the batch.

use crate::config::{FieldFilter, FilterSpec, Operation};
use crate::message::{AnyMessage, MessageBatch};

/// Returns true if the batch is eligible under the given specs.
///
/// No specs means always eligible. Evaluation short-circuits per spec on
/// the first failing message and overall on the first satisfied spec.
pub fn batch_matches(batch: &MessageBatch, specs: &[FilterSpec]) -> bool {
    if specs.is_empty() {
        return true;
    }
    specs.iter().any(|spec| spec_matches(batch, spec))
}

/// True if every message in every group satisfies all of the spec's fields.
fn spec_matches(batch: &MessageBatch, spec: &FilterSpec) -> bool {
    batch
        .groups
        .iter()
        .flat_map(|group| group.messages.iter())
        .all(|message| check_values(message, &spec.fields))
}

/// True if the message satisfies every field condition.
fn check_values(message: &AnyMessage, fields: &[FieldFilter]) -> bool {
    fields
        .iter()
        .all(|filter| value_matches(message.field_value(&filter.field_name), filter))
}

/// Applies one field condition to an extracted value.
///
/// An empty value fails every operation except EMPTY. That covers both a
/// genuinely empty field and a key the message does not carry; the two are
/// indistinguishable on purpose.
pub fn value_matches(value: &str, filter: &FieldFilter) -> bool {
    match filter.operation {
        Operation::Empty => value.is_empty(),
        _ if value.is_empty() => false,
        Operation::Equal => value == filter.expected_value,
        Operation::NotEqual => value != filter.expected_value,
        Operation::NotEmpty => true,
        Operation::Wildcard => wildcard_match(&filter.expected_value, value),
    }
}

/// Shell-glob match: `*` matches any run of characters, `?` matches exactly
/// one. Everything else is literal.
fn wildcard_match(pattern: &str, value: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let value: Vec<char> = value.chars().collect();

    // Iterative matcher with star backtracking.
    let (mut p, mut v) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while v < value.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == value[v]) {
            p += 1;
            v += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, v));
            p += 1;
        } else if let Some((sp, sv)) = star {
            // Let the last star absorb one more character and retry.
            p = sp + 1;
            v = sv + 1;
            star = Some((sp, sv + 1));
        } else {
            return false;
        }
    }

    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Direction, MessageGroup, ParsedMessage};

    fn filter(field: &str, expected: &str, operation: Operation) -> FieldFilter {
        FieldFilter {
            field_name: field.to_string(),
            expected_value: expected.to_string(),
            operation,
        }
    }

    fn batch_of(messages: Vec<AnyMessage>) -> MessageBatch {
        MessageBatch {
            groups: vec![MessageGroup { messages }],
        }
    }

    fn parsed(alias: &str, msg_type: &str) -> AnyMessage {
        AnyMessage::Parsed(ParsedMessage {
            session_alias: alias.to_string(),
            direction: Direction::First,
            message_type: msg_type.to_string(),
            protocol: String::new(),
            fields: Default::default(),
        })
    }

    #[test]
    fn test_equal_and_not_equal() {
        let f = filter("session_alias", "conn-a", Operation::Equal);
        assert!(value_matches("conn-a", &f));
        assert!(!value_matches("conn-b", &f));

        let f = filter("session_alias", "conn-a", Operation::NotEqual);
        assert!(!value_matches("conn-a", &f));
        assert!(value_matches("conn-b", &f));
    }

    #[test]
    fn test_empty_and_not_empty() {
        assert!(value_matches("", &filter("protocol", "", Operation::Empty)));
        assert!(!value_matches("fix", &filter("protocol", "", Operation::Empty)));
        assert!(value_matches("fix", &filter("protocol", "", Operation::NotEmpty)));
        assert!(!value_matches("", &filter("protocol", "", Operation::NotEmpty)));
    }

    #[test]
    fn test_empty_value_fails_everything_but_empty() {
        assert!(!value_matches("", &filter("x", "", Operation::Equal)));
        assert!(!value_matches("", &filter("x", "", Operation::NotEqual)));
        assert!(!value_matches("", &filter("x", "*", Operation::Wildcard)));
        assert!(value_matches("", &filter("x", "", Operation::Empty)));
    }

    #[test]
    fn test_wildcard_patterns() {
        assert!(wildcard_match("Heart*", "Heartbeat"));
        assert!(wildcard_match("*beat", "Heartbeat"));
        assert!(wildcard_match("H*t", "Heartbeat"));
        assert!(wildcard_match("conn-?", "conn-a"));
        assert!(wildcard_match("*", "anything"));
        assert!(!wildcard_match("Heart*", "Logon"));
        assert!(!wildcard_match("conn-?", "conn-ab"));
        assert!(!wildcard_match("", "x"));
        assert!(wildcard_match("", ""));
        assert!(wildcard_match("a*b*c", "aXXbYYc"));
        assert!(!wildcard_match("a*b*c", "aXXbYY"));
    }

    #[test]
    fn test_no_filters_always_eligible() {
        let batch = batch_of(vec![parsed("conn-a", "X")]);
        assert!(batch_matches(&batch, &[]));
    }

    #[test]
    fn test_or_across_specs() {
        let batch = batch_of(vec![parsed("conn-a", "X")]);
        let miss = FilterSpec {
            fields: vec![filter("session_alias", "conn-z", Operation::Equal)],
        };
        let hit = FilterSpec {
            fields: vec![filter("session_alias", "conn-a", Operation::Equal)],
        };
        assert!(batch_matches(&batch, &[miss.clone(), hit]));
        assert!(!batch_matches(&batch, &[miss]));
    }

    #[test]
    fn test_and_across_fields_and_batch_members() {
        let spec = FilterSpec {
            fields: vec![
                filter("session_alias", "conn-a", Operation::Equal),
                filter("message_type", "NewOrderSingle", Operation::Equal),
            ],
        };

        let all_match = batch_of(vec![
            parsed("conn-a", "NewOrderSingle"),
            parsed("conn-a", "NewOrderSingle"),
        ]);
        assert!(batch_matches(&all_match, std::slice::from_ref(&spec)));

        // One group member off spec fails the whole spec.
        let one_off = batch_of(vec![
            parsed("conn-a", "NewOrderSingle"),
            parsed("conn-a", "Heartbeat"),
        ]);
        assert!(!batch_matches(&one_off, std::slice::from_ref(&spec)));
    }

    #[test]
    fn test_operations_are_pure() {
        let f = filter("message_type", "Heart*", Operation::Wildcard);
        for _ in 0..3 {
            assert!(value_matches("Heartbeat", &f));
            assert!(!value_matches("Logon", &f));
        }
    }
}
