//! Compiled view definitions and their dependency graphs
//!
//! A compiled view definition is the immutable artifact of one compilation
//! pass: per calculation configuration, a directed acyclic graph of
//! result-producing nodes, the terminal outputs the view directly asked for,
//! and the market data the graph consumes at its leaves, all bounded by a
//! validity window.
//!
//! Graphs are never mutated after compilation. That immutability is what
//! justifies the remote explorer's strategy of fetching the whole graph once
//! and answering every later query locally (see the engine crate).

mod compiled;
mod explorer;
mod graph;
mod portfolio;

pub use compiled::{CompiledCalculationConfig, CompiledViewDefinition};
pub use explorer::{GraphError, GraphExplorer, LocalGraphExplorer};
pub use graph::{DependencyGraph, DependencyGraphBuilder, DependencyNode, GraphBuildError, NodeId};
pub use portfolio::{PortfolioPosition, PortfolioSnapshot};
