//! Pin routing configuration types.
//!
//! A "pin" is a logical, attribute-tagged destination bound to a concrete
//! routing key / queue / exchange. The pin map is loaded once at startup and
//! never mutated; routers share it read-only behind an `Arc`.

use std::collections::{BTreeMap, HashMap};

use serde::Deserialize;

/// Attribute marking a pin as usable for publishing.
pub const PUBLISH_ATTRIBUTE: &str = "publish";
/// Attribute marking a pin as usable for subscribing.
pub const SUBSCRIBE_ATTRIBUTE: &str = "subscribe";
/// Attribute implicitly added when routing event batches.
pub const EVENT_ATTRIBUTE: &str = "event";

/// Comparison operation applied to one metadata field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Equal,
    NotEqual,
    Empty,
    NotEmpty,
    /// Shell-glob match (`*` and `?`) of the expected pattern against the value.
    Wildcard,
}

/// One field condition inside a filter spec.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldFilter {
    pub field_name: String,
    #[serde(default)]
    pub expected_value: String,
    pub operation: Operation,
}

/// Shorthand form: filters keyed by field name.
#[derive(Debug, Clone, Deserialize)]
struct FieldCondition {
    #[serde(default)]
    value: String,
    operation: Operation,
}

/// A group of field conditions that must all hold for the spec to match.
///
/// Deserializes from either wire form:
/// - an array of `{"fieldName", "expectedValue", "operation"}` objects, or
/// - an object keyed by field name with `{"value", "operation"}` entries.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "FilterSpecRepr")]
pub struct FilterSpec {
    pub fields: Vec<FieldFilter>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FilterSpecRepr {
    List(Vec<FieldFilter>),
    // BTreeMap keeps field order deterministic across loads.
    Map(BTreeMap<String, FieldCondition>),
}

impl From<FilterSpecRepr> for FilterSpec {
    fn from(repr: FilterSpecRepr) -> Self {
        let fields = match repr {
            FilterSpecRepr::List(fields) => fields,
            FilterSpecRepr::Map(map) => map
                .into_iter()
                .map(|(field_name, cond)| FieldFilter {
                    field_name,
                    expected_value: cond.value,
                    operation: cond.operation,
                })
                .collect(),
        };
        FilterSpec { fields }
    }
}

/// Configuration for a single pin.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PinConfig {
    /// Routing key published under.
    #[serde(rename = "name")]
    pub routing_key: String,
    /// Queue consumed from.
    #[serde(rename = "queue", default)]
    pub queue_name: String,
    /// Exchange published to. Empty means the endpoint's default exchange.
    #[serde(default)]
    pub exchange: String,
    /// Attribute tags matched against caller-requested capabilities.
    #[serde(default)]
    pub attributes: Vec<String>,
    /// Ordered content filters. Empty means always eligible.
    #[serde(default)]
    pub filters: Vec<FilterSpec>,
}

impl PinConfig {
    /// True if this pin carries every requested attribute.
    pub fn has_attributes<S: AsRef<str>>(&self, requested: &[S]) -> bool {
        requested
            .iter()
            .all(|attr| self.attributes.iter().any(|a| a == attr.as_ref()))
    }
}

/// Mapping from pin name to pin configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub queues: HashMap<String, PinConfig>,
}

impl RouterConfig {
    /// Parses a router config from its JSON wire form.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Returns pins carrying every requested attribute, sorted by pin name
    /// so fan-out order is stable.
    pub fn resolve<S: AsRef<str>>(&self, requested: &[S]) -> Vec<(&str, &PinConfig)> {
        let mut pins: Vec<_> = self
            .queues
            .iter()
            .filter(|(_, pin)| pin.has_attributes(requested))
            .map(|(name, pin)| (name.as_str(), pin))
            .collect();
        pins.sort_by_key(|(name, _)| *name);
        pins
    }
}
