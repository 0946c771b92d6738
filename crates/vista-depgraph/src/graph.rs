//! Dependency graphs of result-producing nodes

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use vista_values::{ResultDescriptor, ResultRequest};

/// Identifier of a node, unique within one graph
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct NodeId(pub u64);

/// One result-producing node
///
/// A node applies a named function to zero or more input values (consumed
/// from other nodes, or from market data when no node produces them) and
/// produces at least one output value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyNode {
    /// Node identifier within the owning graph
    pub id: NodeId,
    /// The function the node applies
    pub function: String,
    /// Values the node consumes
    pub inputs: Vec<ResultDescriptor>,
    /// Values the node produces; never empty
    pub outputs: Vec<ResultDescriptor>,
}

/// Errors raised while assembling a graph
#[derive(Debug, thiserror::Error)]
pub enum GraphBuildError {
    /// A node declared no outputs
    #[error("node for function '{0}' produces no outputs")]
    NoOutputs(String),
    /// Two nodes claimed the same output descriptor
    #[error("output {0} is produced by more than one node")]
    DuplicateProducer(ResultDescriptor),
    /// A terminal output is not produced by any node
    #[error("terminal output {0} is not produced by any node")]
    UnknownTerminal(ResultDescriptor),
}

/// The compiled, immutable dependency graph for one calculation configuration
///
/// Construction goes through [`DependencyGraphBuilder`]; once built, a graph
/// is read-only. Inputs no node produces are market-data leaves.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyGraph {
    calculation_config: String,
    nodes: Vec<DependencyNode>,
    producers: BTreeMap<ResultDescriptor, NodeId>,
    terminal_outputs: BTreeMap<ResultDescriptor, BTreeSet<ResultRequest>>,
}

impl DependencyGraph {
    /// The calculation configuration this graph was compiled for
    pub fn calculation_config(&self) -> &str {
        &self.calculation_config
    }

    /// Number of nodes in the graph
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Iterate over all nodes
    pub fn nodes(&self) -> impl Iterator<Item = &DependencyNode> {
        self.nodes.iter()
    }

    /// Look up a node by id
    pub fn node(&self, id: NodeId) -> Option<&DependencyNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// The node producing the given output, if any
    pub fn producer_of(&self, output: &ResultDescriptor) -> Option<&DependencyNode> {
        let id = self.producers.get(output)?;
        self.node(*id)
    }

    /// The terminal outputs mapped to the requests that generated them
    pub fn terminal_outputs(&self) -> &BTreeMap<ResultDescriptor, BTreeSet<ResultRequest>> {
        &self.terminal_outputs
    }

    /// Inputs consumed by some node but produced by none: the graph's
    /// market-data requirements
    pub fn market_data_requirements(&self) -> BTreeSet<ResultDescriptor> {
        self.nodes
            .iter()
            .flat_map(|n| n.inputs.iter())
            .filter(|input| !self.producers.contains_key(input))
            .cloned()
            .collect()
    }

    /// The minimal closed subgraph producing the given output
    ///
    /// Contains the producing node and its transitive inputs, nothing else.
    /// Returns `None` for a descriptor nothing in this graph produces; an
    /// unknown output is an empty answer, not an error.
    pub fn subgraph_producing(&self, output: &ResultDescriptor) -> Option<DependencyGraph> {
        let root = self.producer_of(output)?;

        let mut keep: BTreeSet<NodeId> = BTreeSet::new();
        let mut queue: VecDeque<&DependencyNode> = VecDeque::new();
        keep.insert(root.id);
        queue.push_back(root);
        while let Some(node) = queue.pop_front() {
            for input in &node.inputs {
                if let Some(producer) = self.producer_of(input) {
                    if keep.insert(producer.id) {
                        queue.push_back(producer);
                    }
                }
            }
        }

        let nodes: Vec<DependencyNode> = self
            .nodes
            .iter()
            .filter(|n| keep.contains(&n.id))
            .cloned()
            .collect();
        let producers = nodes
            .iter()
            .flat_map(|n| n.outputs.iter().map(move |o| (o.clone(), n.id)))
            .collect();
        let terminal_outputs = self
            .terminal_outputs
            .iter()
            .filter(|(desc, _)| *desc == output)
            .map(|(desc, reqs)| (desc.clone(), reqs.clone()))
            .collect();

        Some(DependencyGraph {
            calculation_config: self.calculation_config.clone(),
            nodes,
            producers,
            terminal_outputs,
        })
    }
}

/// Assembles a [`DependencyGraph`]; consumed by `build`
pub struct DependencyGraphBuilder {
    calculation_config: String,
    nodes: Vec<DependencyNode>,
    producers: BTreeMap<ResultDescriptor, NodeId>,
    terminal_outputs: BTreeMap<ResultDescriptor, BTreeSet<ResultRequest>>,
}

impl DependencyGraphBuilder {
    /// Start a graph for one calculation configuration
    pub fn new(calculation_config: impl Into<String>) -> Self {
        Self {
            calculation_config: calculation_config.into(),
            nodes: Vec::new(),
            producers: BTreeMap::new(),
            terminal_outputs: BTreeMap::new(),
        }
    }

    /// Add a node producing `outputs` from `inputs`
    pub fn add_node(
        &mut self,
        function: impl Into<String>,
        inputs: Vec<ResultDescriptor>,
        outputs: Vec<ResultDescriptor>,
    ) -> Result<NodeId, GraphBuildError> {
        let function = function.into();
        if outputs.is_empty() {
            return Err(GraphBuildError::NoOutputs(function));
        }
        for output in &outputs {
            if self.producers.contains_key(output) {
                return Err(GraphBuildError::DuplicateProducer(output.clone()));
            }
        }
        let id = NodeId(self.nodes.len() as u64);
        for output in &outputs {
            self.producers.insert(output.clone(), id);
        }
        self.nodes.push(DependencyNode {
            id,
            function,
            inputs,
            outputs,
        });
        Ok(id)
    }

    /// Mark a produced output as terminal, recording the originating request
    pub fn mark_terminal(
        &mut self,
        output: ResultDescriptor,
        request: ResultRequest,
    ) -> Result<(), GraphBuildError> {
        if !self.producers.contains_key(&output) {
            return Err(GraphBuildError::UnknownTerminal(output));
        }
        self.terminal_outputs.entry(output).or_default().insert(request);
        Ok(())
    }

    /// Finish; the graph is immutable from here on
    pub fn build(self) -> DependencyGraph {
        DependencyGraph {
            calculation_config: self.calculation_config,
            nodes: self.nodes,
            producers: self.producers,
            terminal_outputs: self.terminal_outputs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vista_values::{ComputationTargetRef, TargetKind, UniqueId, ValueProperties};

    fn desc(name: &str) -> ResultDescriptor {
        ResultDescriptor::new(
            name,
            ComputationTargetRef::new(TargetKind::Position, UniqueId::new("Pos", "1")),
            ValueProperties::none(),
        )
    }

    fn request(name: &str) -> ResultRequest {
        ResultRequest::new(
            name,
            ComputationTargetRef::new(TargetKind::Position, UniqueId::new("Pos", "1")),
        )
    }

    /// MarketData -> Curve -> {Pv, Delta}; Pv is terminal.
    fn sample_graph() -> DependencyGraph {
        let mut builder = DependencyGraphBuilder::new("Default");
        builder
            .add_node("CurveConstruction", vec![desc("MarketData")], vec![desc("Curve")])
            .unwrap();
        builder
            .add_node("Discounting", vec![desc("Curve")], vec![desc("Pv")])
            .unwrap();
        builder
            .add_node("DeltaCalc", vec![desc("Curve")], vec![desc("Delta")])
            .unwrap();
        builder.mark_terminal(desc("Pv"), request("Pv")).unwrap();
        builder.build()
    }

    #[test]
    fn producer_lookup() {
        let graph = sample_graph();
        assert_eq!(graph.producer_of(&desc("Pv")).unwrap().function, "Discounting");
        assert!(graph.producer_of(&desc("Gamma")).is_none());
    }

    #[test]
    fn terminal_outputs_are_a_subset_of_produced_outputs() {
        let graph = sample_graph();
        for output in graph.terminal_outputs().keys() {
            assert!(graph.producer_of(output).is_some());
        }
    }

    #[test]
    fn subgraph_contains_only_the_transitive_closure() {
        let graph = sample_graph();
        let sub = graph.subgraph_producing(&desc("Pv")).unwrap();
        assert_eq!(sub.node_count(), 2);
        assert!(sub.producer_of(&desc("Pv")).is_some());
        assert!(sub.producer_of(&desc("Curve")).is_some());
        assert!(sub.producer_of(&desc("Delta")).is_none());
    }

    #[test]
    fn subgraph_root_is_the_producer_of_the_requested_output() {
        let graph = sample_graph();
        let sub = graph.subgraph_producing(&desc("Pv")).unwrap();
        // The only node whose outputs nothing in the subgraph consumes is
        // the producer of the requested output.
        let consumed: BTreeSet<_> = sub.nodes().flat_map(|n| n.inputs.iter().cloned()).collect();
        let roots: Vec<_> = sub
            .nodes()
            .filter(|n| n.outputs.iter().all(|o| !consumed.contains(o)))
            .collect();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].id, graph.producer_of(&desc("Pv")).unwrap().id);
    }

    #[test]
    fn subgraph_of_unknown_output_is_absent_not_an_error() {
        let graph = sample_graph();
        assert!(graph.subgraph_producing(&desc("Nonexistent")).is_none());
    }

    #[test]
    fn market_data_requirements_are_unproduced_inputs() {
        let graph = sample_graph();
        let md = graph.market_data_requirements();
        assert_eq!(md.len(), 1);
        assert!(md.contains(&desc("MarketData")));
    }

    #[test]
    fn duplicate_producer_is_rejected() {
        let mut builder = DependencyGraphBuilder::new("Default");
        builder.add_node("A", vec![], vec![desc("X")]).unwrap();
        assert!(matches!(
            builder.add_node("B", vec![], vec![desc("X")]),
            Err(GraphBuildError::DuplicateProducer(_))
        ));
    }

    #[test]
    fn terminal_must_be_produced() {
        let mut builder = DependencyGraphBuilder::new("Default");
        builder.add_node("A", vec![], vec![desc("X")]).unwrap();
        assert!(matches!(
            builder.mark_terminal(desc("Y"), request("Y")),
            Err(GraphBuildError::UnknownTerminal(_))
        ));
    }
}
