//! Addressing model for computed quantities
//!
//! Every other crate in the workspace consumes these types:
//! - [`ResultDescriptor`] is the fully resolved identity of one computed
//!   quantity (value name + computation target + concrete properties).
//! - [`ResultRequest`] is a possibly under-specified ask for a quantity,
//!   resolved against a dependency graph. Constraints are an explicit sum
//!   type ([`PropertyConstraint`]) so resolution is exhaustive and testable.
//! - [`UniqueId`] / [`VersionCorrection`] are the identity and temporal
//!   addressing primitives shared across the engine.

mod descriptor;
mod id;
mod properties;
mod request;

pub use descriptor::{ComputationTargetRef, ResultDescriptor, TargetKind};
pub use id::{ParseUniqueIdError, UniqueId, VersionCorrection};
pub use properties::ValueProperties;
pub use request::{PropertyConstraint, ResultRequest};
