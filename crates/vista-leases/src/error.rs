use vista_values::UniqueId;

use crate::manager::ReferenceId;

/// Errors surfaced by the leasing layer
#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    /// No resource with the given id is managed here
    #[error("no managed resource with id {0}")]
    UnknownResource(UniqueId),
    /// The reference does not exist (never issued, released, or expired)
    #[error("no reference {0}")]
    NotFound(ReferenceId),
    /// The holder-side handle was already released locally
    #[error("reference {0} already released")]
    AlreadyReleased(ReferenceId),
    /// The call boundary failed
    #[error("lease transport failure: {0}")]
    Transport(String),
}
