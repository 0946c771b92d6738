//! Reference-counted leasing of ephemeral engine resources
//!
//! The engine keeps completed computation cycles in memory only while
//! someone needs them. A server-side [`EngineResourceManager`] hands out
//! counted references; holders keep them alive with periodic heartbeats and
//! release them explicitly when done. A reference whose holder disappears is
//! reclaimed by the expiry sweep; that is the self-healing path for
//! abandoned leases, not an error.
//!
//! Two holder shapes exist, selected by composition:
//! - [`LocalResourceLease`] for in-process holders,
//! - [`RemoteLease`] for holders on the far side of a call boundary, driving
//!   a [`LeaseEndpoint`].
//!
//! Both heartbeat at half the lease timeout, guaranteeing at least one
//! renewal per timeout window under non-degenerate conditions, and both
//! treat explicit release as the primary contract: `Drop` performs a
//! best-effort release with a warning, nothing more.

mod error;
mod local;
mod manager;
mod remote;

pub use error::LeaseError;
pub use local::LocalResourceLease;
pub use manager::{EngineResource, EngineResourceManager, ReferenceId, spawn_expiry_sweep};
pub use remote::{LeaseEndpoint, RemoteLease};
