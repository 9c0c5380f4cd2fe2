//! Idempotent deletion.
//!
//! Deleting something that is already gone is success. Only
//! [`AdapterError::NotFound`] is swallowed; every other failure propagates.

use std::future::Future;
use yurt_vm::AdapterError;

/// Whether an idempotent delete removed something.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Removed,
    AlreadyAbsent,
}

/// Await `delete`, mapping a NotFound failure to [`Removal::AlreadyAbsent`].
pub async fn remove_idempotent<F>(what: &str, delete: F) -> Result<Removal, AdapterError>
where
    F: Future<Output = Result<(), AdapterError>>,
{
    match delete.await {
        Ok(()) => {
            tracing::debug!(what, "Removed");
            Ok(Removal::Removed)
        }
        Err(e) if e.is_not_found() => {
            tracing::debug!(what, error = %e, "Already absent");
            Ok(Removal::AlreadyAbsent)
        }
        Err(e) => Err(e),
    }
}
