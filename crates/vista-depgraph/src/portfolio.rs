//! Minimal immutable portfolio snapshot carried by a compiled definition

use serde::{Deserialize, Serialize};
use vista_values::UniqueId;

/// One position held in the portfolio at compilation time
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PortfolioPosition {
    /// Position identity
    pub id: UniqueId,
    /// The held security
    pub security: UniqueId,
    /// Quantity held
    pub quantity: f64,
}

/// The portfolio as resolved at compilation time
///
/// The view computes against this snapshot for the lifetime of the compiled
/// definition; portfolio changes surface as a recompilation, never as a
/// mutation of an existing snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    /// Portfolio identity, versioned per resolution
    pub id: UniqueId,
    /// Display name
    pub name: String,
    /// Resolved positions
    pub positions: Vec<PortfolioPosition>,
}
