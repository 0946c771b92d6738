//! Execution options and delivery modes

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vista_values::VersionCorrection;

use crate::market_data::MarketDataSpecification;

/// How a view process executes its cycles
///
/// Part of the shared-process identity: two clients asking for the same
/// definition with equal options join the same shared process.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ViewExecutionOptions {
    /// Where market data comes from
    pub market_data: MarketDataSpecification,
    /// Recompute schedule; `None` means recompute on market data changes
    pub update_period: Option<Duration>,
    /// Resolver version/correction the process compiles against
    pub version_correction: VersionCorrection,
    /// Run cycles back to back, ignoring the update period
    pub run_as_fast_as_possible: bool,
}

impl ViewExecutionOptions {
    /// Options for live execution against a named market data source
    pub fn live(market_data: MarketDataSpecification) -> Self {
        Self {
            market_data,
            update_period: None,
            version_correction: VersionCorrection::LATEST,
            run_as_fast_as_possible: false,
        }
    }
}

/// Per-cycle execution detail, fixed once the cycle starts
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CycleExecutionOptions {
    /// The instant the cycle values against
    pub valuation_time: DateTime<Utc>,
    /// Where the cycle's market data came from
    pub market_data: MarketDataSpecification,
    /// Resolver version/correction the cycle used
    pub version_correction: VersionCorrection,
}

/// What the push channel emits to a client
///
/// Affects the shape of delivered results, not whether the channel is open;
/// channel lifetime follows listener demand alone.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViewResultMode {
    /// Deliver the full result of every cycle
    #[default]
    FullOnly,
    /// Deliver only the changes since the previous cycle
    DeltaOnly,
    /// Full result for the first cycle after attaching, deltas after
    FullThenDelta,
    /// Deliver both full and delta results
    Both,
}

impl ViewResultMode {
    /// Whether the full result should be delivered for cycle `n` (0-based)
    pub fn wants_full(self, cycle_index: u64) -> bool {
        match self {
            Self::FullOnly | Self::Both => true,
            Self::DeltaOnly => false,
            Self::FullThenDelta => cycle_index == 0,
        }
    }

    /// Whether the delta should be delivered for cycle `n` (0-based)
    pub fn wants_delta(self, cycle_index: u64) -> bool {
        match self {
            Self::DeltaOnly | Self::Both => true,
            Self::FullOnly => false,
            Self::FullThenDelta => cycle_index > 0,
        }
    }
}

/// Floor on the execution log detail retained for an output
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ExecutionLogMode {
    /// Only pass/fail indicators are retained
    #[default]
    Indicators,
    /// Full log output is retained
    FullLogs,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_then_delta_switches_after_first_cycle() {
        let mode = ViewResultMode::FullThenDelta;
        assert!(mode.wants_full(0));
        assert!(!mode.wants_delta(0));
        assert!(!mode.wants_full(1));
        assert!(mode.wants_delta(1));
    }

    #[test]
    fn both_always_delivers_both() {
        let mode = ViewResultMode::Both;
        assert!(mode.wants_full(0) && mode.wants_delta(0));
        assert!(mode.wants_full(5) && mode.wants_delta(5));
    }
}
