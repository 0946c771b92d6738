//! The immutable artifact of one view compilation pass

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vista_values::{ComputationTargetRef, ResultDescriptor, UniqueId, VersionCorrection};

use crate::graph::DependencyGraph;
use crate::portfolio::PortfolioSnapshot;

/// One calculation configuration's compiled output
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompiledCalculationConfig {
    /// Configuration name
    pub name: String,
    /// The compiled dependency graph; shared, never mutated
    pub graph: Arc<DependencyGraph>,
}

impl CompiledCalculationConfig {
    /// Wrap a freshly built graph
    pub fn new(graph: DependencyGraph) -> Self {
        Self {
            name: graph.calculation_config().to_string(),
            graph: Arc::new(graph),
        }
    }
}

/// The immutable result of compiling a view definition
///
/// Holds one dependency graph per calculation configuration, the portfolio
/// snapshot the compilation resolved against, and the half-open validity
/// window `[valid_from, valid_to)`. A new resolver version/correction yields
/// a logically distinct compiled definition sharing the same graphs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompiledViewDefinition {
    /// The view definition this was compiled from
    pub definition_id: UniqueId,
    /// Portfolio snapshot, when the view has one
    pub portfolio: Option<PortfolioSnapshot>,
    /// Per-configuration compiled graphs, keyed by configuration name
    pub configs: BTreeMap<String, CompiledCalculationConfig>,
    /// Start of the validity window, inclusive; open when `None`
    pub valid_from: Option<DateTime<Utc>>,
    /// End of the validity window, exclusive; open when `None`
    pub valid_to: Option<DateTime<Utc>>,
    /// The resolver version/correction the compilation used
    pub version_correction: VersionCorrection,
}

impl CompiledViewDefinition {
    /// Assemble a compiled definition with an open validity window
    pub fn new(
        definition_id: UniqueId,
        portfolio: Option<PortfolioSnapshot>,
        configs: impl IntoIterator<Item = CompiledCalculationConfig>,
        version_correction: VersionCorrection,
    ) -> Self {
        Self {
            definition_id,
            portfolio,
            configs: configs
                .into_iter()
                .map(|c| (c.name.clone(), c))
                .collect(),
            valid_from: None,
            valid_to: None,
            version_correction,
        }
    }

    /// Restrict the validity window
    #[must_use]
    pub fn with_validity(
        mut self,
        valid_from: Option<DateTime<Utc>>,
        valid_to: Option<DateTime<Utc>>,
    ) -> Self {
        self.valid_from = valid_from;
        self.valid_to = valid_to;
        self
    }

    /// The compiled configuration by name
    pub fn config(&self, name: &str) -> Option<&CompiledCalculationConfig> {
        self.configs.get(name)
    }

    /// Configuration names in order
    pub fn config_names(&self) -> impl Iterator<Item = &str> {
        self.configs.keys().map(String::as_str)
    }

    /// Whether the instant falls inside `[valid_from, valid_to)`
    pub fn is_valid_at(&self, instant: DateTime<Utc>) -> bool {
        self.valid_from.is_none_or(|from| from <= instant)
            && self.valid_to.is_none_or(|to| instant < to)
    }

    /// Union of market-data requirements across all configurations
    pub fn market_data_requirements(&self) -> BTreeSet<ResultDescriptor> {
        self.configs
            .values()
            .flat_map(|c| c.graph.market_data_requirements())
            .collect()
    }

    /// Union of computation targets across all configurations
    pub fn computation_targets(&self) -> BTreeSet<ComputationTargetRef> {
        self.configs
            .values()
            .flat_map(|c| c.graph.nodes())
            .flat_map(|n| n.outputs.iter().map(|o| o.target.clone()))
            .collect()
    }

    /// Union of terminal outputs across all configurations
    pub fn terminal_outputs(&self) -> BTreeSet<ResultDescriptor> {
        self.configs
            .values()
            .flat_map(|c| c.graph.terminal_outputs().keys().cloned())
            .collect()
    }

    /// A logically retagged view of the same compilation
    ///
    /// Shares the underlying graphs; no recomputation happens. Used when a
    /// caller needs to reason about the data as of a different correction.
    #[must_use]
    pub fn with_version_correction(&self, version_correction: VersionCorrection) -> Self {
        Self {
            definition_id: self.definition_id.clone(),
            portfolio: self.portfolio.clone(),
            configs: self.configs.clone(),
            valid_from: self.valid_from,
            valid_to: self.valid_to,
            version_correction,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::DependencyGraphBuilder;
    use chrono::TimeZone;
    use vista_values::{TargetKind, ValueProperties};

    fn desc(name: &str) -> ResultDescriptor {
        ResultDescriptor::new(
            name,
            ComputationTargetRef::new(TargetKind::Primitive, UniqueId::new("Prim", "1")),
            ValueProperties::none(),
        )
    }

    fn compiled() -> CompiledViewDefinition {
        let mut builder = DependencyGraphBuilder::new("Default");
        builder
            .add_node("Curve", vec![desc("Quote")], vec![desc("Curve")])
            .unwrap();
        CompiledViewDefinition::new(
            UniqueId::new("ViewDef", "test"),
            None,
            [CompiledCalculationConfig::new(builder.build())],
            VersionCorrection::LATEST,
        )
    }

    #[test]
    fn validity_window_is_half_open() {
        let from = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let def = compiled().with_validity(Some(from), Some(to));
        assert!(def.is_valid_at(from));
        assert!(!def.is_valid_at(to));
        assert!(def.is_valid_at(from + chrono::Duration::hours(12)));
        assert!(!def.is_valid_at(from - chrono::Duration::seconds(1)));
    }

    #[test]
    fn open_window_is_always_valid() {
        assert!(compiled().is_valid_at(Utc::now()));
    }

    #[test]
    fn retagging_shares_graphs() {
        let original = compiled();
        let retagged = original.with_version_correction(VersionCorrection::of(
            Utc::now(),
            Utc::now(),
        ));
        assert!(Arc::ptr_eq(
            &original.config("Default").unwrap().graph,
            &retagged.config("Default").unwrap().graph,
        ));
        assert_ne!(original.version_correction, retagged.version_correction);
    }

    #[test]
    fn market_data_union() {
        let def = compiled();
        assert!(def.market_data_requirements().contains(&desc("Quote")));
    }
}
