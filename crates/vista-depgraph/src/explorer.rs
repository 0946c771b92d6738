//! Capability interface for querying one configuration's dependency graph
//!
//! Two implementations exist, selected by composition: [`LocalGraphExplorer`]
//! here answers from an in-process graph; the engine crate's remote explorer
//! answers over the call boundary, fetching the whole graph once and caching
//! it (safe because graphs are immutable after compilation).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use vista_values::{ResultDescriptor, ResultRequest};

use crate::graph::{DependencyGraph, DependencyNode};

/// Errors surfaced by graph exploration
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// No graph exists for the named calculation configuration
    #[error("unknown calculation configuration '{0}'")]
    UnknownConfig(String),
    /// The call boundary failed
    #[error("graph transport failure: {0}")]
    Transport(String),
}

/// Queries over one compiled dependency graph
#[async_trait]
pub trait GraphExplorer: Send + Sync {
    /// The whole graph
    async fn whole_graph(&self) -> Result<Arc<DependencyGraph>, GraphError>;

    /// The node producing the given output, or `None`
    async fn producer_of(
        &self,
        output: &ResultDescriptor,
    ) -> Result<Option<DependencyNode>, GraphError>;

    /// The minimal subgraph producing the given output, or `None` for an
    /// output nothing produces
    async fn subgraph_producing(
        &self,
        output: &ResultDescriptor,
    ) -> Result<Option<DependencyGraph>, GraphError>;

    /// Terminal outputs mapped to the requests that generated them
    async fn terminal_outputs(
        &self,
    ) -> Result<BTreeMap<ResultDescriptor, BTreeSet<ResultRequest>>, GraphError>;
}

/// In-process explorer over a shared graph
pub struct LocalGraphExplorer {
    graph: Arc<DependencyGraph>,
}

impl LocalGraphExplorer {
    /// Explore a shared graph
    pub fn new(graph: Arc<DependencyGraph>) -> Self {
        Self { graph }
    }
}

#[async_trait]
impl GraphExplorer for LocalGraphExplorer {
    async fn whole_graph(&self) -> Result<Arc<DependencyGraph>, GraphError> {
        Ok(self.graph.clone())
    }

    async fn producer_of(
        &self,
        output: &ResultDescriptor,
    ) -> Result<Option<DependencyNode>, GraphError> {
        Ok(self.graph.producer_of(output).cloned())
    }

    async fn subgraph_producing(
        &self,
        output: &ResultDescriptor,
    ) -> Result<Option<DependencyGraph>, GraphError> {
        Ok(self.graph.subgraph_producing(output))
    }

    async fn terminal_outputs(
        &self,
    ) -> Result<BTreeMap<ResultDescriptor, BTreeSet<ResultRequest>>, GraphError> {
        Ok(self.graph.terminal_outputs().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::DependencyGraphBuilder;
    use vista_values::{ComputationTargetRef, TargetKind, UniqueId, ValueProperties};

    fn desc(name: &str) -> ResultDescriptor {
        ResultDescriptor::new(
            name,
            ComputationTargetRef::new(TargetKind::Primitive, UniqueId::new("Prim", "1")),
            ValueProperties::none(),
        )
    }

    #[tokio::test]
    async fn local_explorer_answers_from_the_graph() {
        let mut builder = DependencyGraphBuilder::new("Default");
        builder
            .add_node("Curve", vec![desc("Quote")], vec![desc("Curve")])
            .unwrap();
        builder
            .add_node("Pv", vec![desc("Curve")], vec![desc("Pv")])
            .unwrap();
        let explorer = LocalGraphExplorer::new(Arc::new(builder.build()));

        let producer = explorer.producer_of(&desc("Pv")).await.unwrap().unwrap();
        assert_eq!(producer.function, "Pv");

        let sub = explorer
            .subgraph_producing(&desc("Pv"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sub.node_count(), 2);

        assert!(
            explorer
                .subgraph_producing(&desc("Missing"))
                .await
                .unwrap()
                .is_none()
        );
    }
}
