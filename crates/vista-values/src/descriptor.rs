//! Resolved identities of computed quantities

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::id::UniqueId;
use crate::properties::ValueProperties;

/// Kinds of computation target a value can be produced for
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TargetKind {
    /// A whole portfolio
    Portfolio,
    /// An aggregation node within a portfolio
    PortfolioNode,
    /// A single position
    Position,
    /// A single trade within a position
    Trade,
    /// A security independent of any holding
    Security,
    /// A currency
    Currency,
    /// An opaque primitive (curve, surface, index level, ...)
    Primitive,
}

/// Reference to the thing a value is computed for
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ComputationTargetRef {
    /// What kind of target this is
    pub kind: TargetKind,
    /// The target's identity
    pub id: UniqueId,
}

impl ComputationTargetRef {
    /// Create a target reference
    pub fn new(kind: TargetKind, id: UniqueId) -> Self {
        Self { kind, id }
    }
}

impl fmt::Display for ComputationTargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{}", self.kind, self.id)
    }
}

/// The fully resolved, globally addressable identity of one computed quantity
///
/// Two descriptors are the same quantity iff value name, target and every
/// property agree. Descriptors are immutable; the engine never rewrites one
/// after graph compilation.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResultDescriptor {
    /// The named quantity, e.g. `Present Value`
    pub value_name: String,
    /// What the quantity is computed for
    pub target: ComputationTargetRef,
    /// Fully resolved properties qualifying the quantity
    pub properties: ValueProperties,
}

impl ResultDescriptor {
    /// Create a descriptor
    pub fn new(
        value_name: impl Into<String>,
        target: ComputationTargetRef,
        properties: ValueProperties,
    ) -> Self {
        Self {
            value_name: value_name.into(),
            target,
            properties,
        }
    }
}

impl fmt::Display for ResultDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {} {}", self.value_name, self.target, self.properties)
    }
}
