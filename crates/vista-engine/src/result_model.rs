//! Computed results of a view cycle and the queries over them

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vista_values::{ResultDescriptor, UniqueId};

/// One computed value, addressed by its descriptor
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ComputedValue {
    /// What the value is
    pub descriptor: ResultDescriptor,
    /// The value itself; producers are opaque to this layer
    pub value: serde_json::Value,
}

/// All values computed by one cycle for one calculation configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConfigResults {
    values: BTreeMap<ResultDescriptor, serde_json::Value>,
    terminals: BTreeSet<ResultDescriptor>,
}

impl ConfigResults {
    /// Record a value; `terminal` marks it as directly requested by the view
    pub fn insert(&mut self, descriptor: ResultDescriptor, value: serde_json::Value, terminal: bool) {
        if terminal {
            self.terminals.insert(descriptor.clone());
        }
        self.values.insert(descriptor, value);
    }

    /// Any value, terminal or intermediate
    pub fn get(&self, descriptor: &ResultDescriptor) -> Option<&serde_json::Value> {
        self.values.get(descriptor)
    }

    /// Whether the descriptor is a terminal output
    pub fn is_terminal(&self, descriptor: &ResultDescriptor) -> bool {
        self.terminals.contains(descriptor)
    }

    /// All values
    pub fn values(&self) -> impl Iterator<Item = (&ResultDescriptor, &serde_json::Value)> {
        self.values.iter()
    }

    /// Terminal values only
    pub fn terminal_values(&self) -> impl Iterator<Item = (&ResultDescriptor, &serde_json::Value)> {
        self.values
            .iter()
            .filter(|(d, _)| self.terminals.contains(*d))
    }
}

/// The full result model of one cycle: every value per configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ResultModel {
    configs: BTreeMap<String, ConfigResults>,
}

impl ResultModel {
    /// An empty model
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a value for a configuration
    pub fn insert(
        &mut self,
        config: impl Into<String>,
        descriptor: ResultDescriptor,
        value: serde_json::Value,
        terminal: bool,
    ) {
        self.configs
            .entry(config.into())
            .or_default()
            .insert(descriptor, value, terminal);
    }

    /// One configuration's results
    pub fn config(&self, name: &str) -> Option<&ConfigResults> {
        self.configs.get(name)
    }

    /// All configurations
    pub fn configs(&self) -> impl Iterator<Item = (&str, &ConfigResults)> {
        self.configs.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Terminal values across all configurations, keyed by configuration
    pub fn terminal_values(&self) -> BTreeMap<String, BTreeMap<ResultDescriptor, serde_json::Value>> {
        self.configs
            .iter()
            .map(|(name, results)| {
                (
                    name.clone(),
                    results
                        .terminal_values()
                        .map(|(d, v)| (d.clone(), v.clone()))
                        .collect(),
                )
            })
            .collect()
    }
}

/// Names exactly which values a targeted cycle query wants
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CycleQuery {
    /// The calculation configuration to query
    pub calculation_config: String,
    /// The wanted values
    pub descriptors: BTreeSet<ResultDescriptor>,
}

/// Answer to a targeted cycle query: only the requested values
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CycleQueryResponse {
    /// The values found; requested descriptors with no value are absent
    pub values: Vec<ComputedValue>,
}

/// The client-facing summary of one completed cycle
///
/// Carries terminal values only; intermediate values stay on the server and
/// are reached through a leased cycle reference.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ViewResultSnapshot {
    /// The cycle that produced this result
    pub cycle_id: UniqueId,
    /// The owning process
    pub process_id: UniqueId,
    /// Valuation time of the cycle
    pub valuation_time: DateTime<Utc>,
    /// How long the cycle took
    pub duration: Duration,
    /// Terminal values per calculation configuration
    pub values: BTreeMap<String, BTreeMap<ResultDescriptor, serde_json::Value>>,
}

impl ViewResultSnapshot {
    /// The delta against a previous snapshot: values added or changed since
    ///
    /// Values that disappeared are not represented; a recompiled view
    /// delivers a fresh full result instead.
    #[must_use]
    pub fn delta_since(&self, previous: &ViewResultSnapshot) -> ViewResultSnapshot {
        let values = self
            .values
            .iter()
            .map(|(config, current)| {
                let before = previous.values.get(config);
                let changed: BTreeMap<_, _> = current
                    .iter()
                    .filter(|(desc, value)| {
                        before.and_then(|b| b.get(*desc)) != Some(*value)
                    })
                    .map(|(d, v)| (d.clone(), v.clone()))
                    .collect();
                (config.clone(), changed)
            })
            .collect();
        ViewResultSnapshot {
            cycle_id: self.cycle_id.clone(),
            process_id: self.process_id.clone(),
            valuation_time: self.valuation_time,
            duration: self.duration,
            values,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vista_values::{ComputationTargetRef, TargetKind, ValueProperties};

    fn desc(name: &str) -> ResultDescriptor {
        ResultDescriptor::new(
            name,
            ComputationTargetRef::new(TargetKind::Position, UniqueId::new("Pos", "1")),
            ValueProperties::none(),
        )
    }

    fn snapshot(values: &[(&str, f64)]) -> ViewResultSnapshot {
        let mut map = BTreeMap::new();
        for (name, value) in values {
            map.insert(desc(name), serde_json::json!(value));
        }
        ViewResultSnapshot {
            cycle_id: UniqueId::new("ViewCycle", "c"),
            process_id: UniqueId::new("ViewProcess", "p"),
            valuation_time: Utc::now(),
            duration: Duration::from_millis(10),
            values: BTreeMap::from([("Default".to_string(), map)]),
        }
    }

    #[test]
    fn terminal_values_exclude_intermediates() {
        let mut model = ResultModel::new();
        model.insert("Default", desc("Pv"), serde_json::json!(100.0), true);
        model.insert("Default", desc("Curve"), serde_json::json!("curve-data"), false);

        let terminals = model.terminal_values();
        assert!(terminals["Default"].contains_key(&desc("Pv")));
        assert!(!terminals["Default"].contains_key(&desc("Curve")));
        assert!(model.config("Default").unwrap().get(&desc("Curve")).is_some());
    }

    #[test]
    fn delta_contains_only_changes() {
        let first = snapshot(&[("Pv", 100.0), ("Delta", 0.5)]);
        let second = snapshot(&[("Pv", 101.0), ("Delta", 0.5)]);

        let delta = second.delta_since(&first);
        let changed = &delta.values["Default"];
        assert!(changed.contains_key(&desc("Pv")));
        assert!(!changed.contains_key(&desc("Delta")));
    }
}
