//! Engine configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for a view processor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Processor name, used in generated identifiers
    pub name: String,

    /// Lease timeout for checked-out view cycles
    ///
    /// The expiry sweep runs on this schedule and reclaims references whose
    /// last heartbeat is older than this. Holders heartbeat at half of it.
    pub cycle_reference_timeout: Duration,

    /// Timeout for client registrations
    ///
    /// Independent of the cycle lease timeout and typically much longer; a
    /// registration not renewed within this window is expired and removed.
    pub client_registration_timeout: Duration,

    /// Recompute period for processes whose execution options leave it unset
    pub default_update_period: Duration,

    /// How many completed cycles a process retains for leasing
    pub retained_cycles: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: "main".to_string(),
            cycle_reference_timeout: Duration::from_millis(5000),
            client_registration_timeout: Duration::from_millis(30000),
            default_update_period: Duration::from_millis(1000),
            retained_cycles: 2,
        }
    }
}
