//! Market data addressing, overrides and snapshots

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use vista_values::{ResultDescriptor, UniqueId};

/// Names a source of market data for a view execution
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarketDataSpecification {
    /// A live feed, by provider name
    Live {
        /// Provider name, e.g. `Activ` or `Bloomberg`
        provider: String,
    },
    /// Historical data as of a fixed date
    Historical {
        /// The observation date
        date: NaiveDate,
        /// Time-series resolver key
        resolver: String,
    },
    /// A previously captured snapshot
    Snapshot {
        /// The snapshot's identity
        snapshot_id: UniqueId,
    },
}

/// The named market-data source specifications a processor offers
///
/// Read-only after construction; remote callers list and describe these to
/// populate their execution options.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NamedMarketDataSpecs {
    specs: BTreeMap<String, MarketDataSpecification>,
}

impl NamedMarketDataSpecs {
    /// Build from named entries
    pub fn new(entries: impl IntoIterator<Item = (String, MarketDataSpecification)>) -> Self {
        Self {
            specs: entries.into_iter().collect(),
        }
    }

    /// The known names, in order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.specs.keys().map(String::as_str)
    }

    /// Look up a specification by name
    pub fn get(&self, name: &str) -> Option<&MarketDataSpecification> {
        self.specs.get(name)
    }

    /// All entries
    pub fn entries(&self) -> impl Iterator<Item = (&str, &MarketDataSpecification)> {
        self.specs.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Write path for ad hoc market data overrides on a running process
///
/// Overrides shadow the subscribed value until removed; the next cycle picks
/// them up. Safe under concurrent mutation from any session.
#[derive(Debug, Default)]
pub struct MarketDataInjector {
    overrides: DashMap<ResultDescriptor, serde_json::Value>,
}

impl MarketDataInjector {
    /// An injector with no overrides
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an override
    pub fn add_override(&self, descriptor: ResultDescriptor, value: serde_json::Value) {
        self.overrides.insert(descriptor, value);
    }

    /// Remove an override; no-op when absent
    pub fn remove_override(&self, descriptor: &ResultDescriptor) {
        self.overrides.remove(descriptor);
    }

    /// The override for a descriptor, if any
    pub fn get(&self, descriptor: &ResultDescriptor) -> Option<serde_json::Value> {
        self.overrides.get(descriptor).map(|v| v.clone())
    }

    /// A point-in-time copy of all overrides
    pub fn snapshot(&self) -> BTreeMap<ResultDescriptor, serde_json::Value> {
        self.overrides
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }
}

/// A captured, immutable set of market data values
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MarketDataSnapshot {
    /// Snapshot identity
    pub id: UniqueId,
    /// Valuation time of the cycle the snapshot was taken from
    pub valuation_time: DateTime<Utc>,
    /// The captured values
    pub values: BTreeMap<ResultDescriptor, serde_json::Value>,
}
