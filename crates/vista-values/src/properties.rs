//! Concrete property sets attached to result descriptors

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// An immutable, ordered set of key → value properties
///
/// Properties fully qualify a computed quantity: the same value name on the
/// same target may be produced under several property sets (different
/// currencies, curve names, aggregation styles). Ordering is part of the
/// representation so descriptors hash and compare deterministically.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ValueProperties {
    properties: BTreeMap<String, String>,
}

impl ValueProperties {
    /// The empty property set
    pub fn none() -> Self {
        Self::default()
    }

    /// Start building a property set
    pub fn builder() -> ValuePropertiesBuilder {
        ValuePropertiesBuilder::default()
    }

    /// Look up a property value
    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Whether the property is present
    pub fn contains(&self, key: &str) -> bool {
        self.properties.contains_key(key)
    }

    /// Number of properties
    pub fn len(&self) -> usize {
        self.properties.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    /// Iterate in key order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.properties
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// A copy with one property added or replaced
    #[must_use]
    pub fn with(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut properties = self.properties.clone();
        properties.insert(key.into(), value.into());
        Self { properties }
    }
}

impl fmt::Display for ValueProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (k, v)) in self.properties.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{k}={v}")?;
        }
        write!(f, "}}")
    }
}

/// Builder for [`ValueProperties`]
#[derive(Default)]
pub struct ValuePropertiesBuilder {
    properties: BTreeMap<String, String>,
}

impl ValuePropertiesBuilder {
    /// Add a property
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Finish building
    pub fn build(self) -> ValueProperties {
        ValueProperties {
            properties: self.properties,
        }
    }
}
