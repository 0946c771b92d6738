//! Push-result delivery to attached clients

use std::sync::Arc;

use chrono::{DateTime, Utc};
use vista_depgraph::CompiledViewDefinition;
use vista_values::UniqueId;

use crate::result_model::ViewResultSnapshot;

/// Receives push notifications from a view process
///
/// All methods have empty defaults; implement the ones you care about. The
/// push path is a performance optimization over polling; nothing in the
/// synchronous surface depends on it.
pub trait ViewResultListener: Send + Sync {
    /// A new compiled definition became current
    fn view_definition_compiled(&self, _compiled: &Arc<CompiledViewDefinition>) {}

    /// A computation cycle started
    fn cycle_started(&self, _cycle_id: &UniqueId, _valuation_time: DateTime<Utc>) {}

    /// A partial result became available mid-cycle
    fn cycle_fragment_completed(&self, _fragment: &ViewResultSnapshot) {}

    /// A cycle finished; both shapes are offered, delivery mode filtering
    /// happens per client
    fn cycle_completed(&self, _full: &Arc<ViewResultSnapshot>, _delta: Option<&Arc<ViewResultSnapshot>>) {
    }

    /// The process ran to its natural end (bounded executions)
    fn process_completed(&self) {}

    /// The process was shut down
    fn process_terminated(&self) {}

    /// The client session is gone; terminal, synthesized locally when the
    /// push transport fails
    fn client_shutdown(&self, _reason: &str) {}
}
