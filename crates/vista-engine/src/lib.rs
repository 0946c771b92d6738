//! Access layer of the continuously-recomputing valuation engine
//!
//! A [`processor::ViewProcessor`] owns view processes, each the running
//! instance of one view definition. Clients attach through
//! [`client::ViewClient`] sessions, observe results by push or poll, and
//! lease completed [`cycle::ViewCycle`]s for drill-down queries. The
//! [`remote`] module exposes the same capability traits across a call
//! boundary.

pub mod client;
pub mod config;
pub mod cycle;
pub mod error;
pub mod execution;
pub mod listener;
pub mod market_data;
pub mod process;
pub mod processor;
pub mod remote;
pub mod result_model;

pub use client::{CycleTarget, LocalViewClient, UserPrincipal, ViewClient, ViewClientState};
pub use config::EngineConfig;
pub use cycle::{ViewCycle, ViewCycleAccess, ViewCycleReference, ViewCycleState};
pub use error::{EngineResult, Error, ErrorKind};
pub use execution::{
    CycleExecutionOptions, ExecutionLogMode, ViewExecutionOptions, ViewResultMode,
};
pub use listener::ViewResultListener;
pub use market_data::{
    MarketDataInjector, MarketDataSnapshot, MarketDataSpecification, NamedMarketDataSpecs,
};
pub use process::{ViewProcess, ViewProcessState};
pub use processor::ViewProcessor;
pub use result_model::{
    ComputedValue, CycleQuery, CycleQueryResponse, ResultModel, ViewResultSnapshot,
};
