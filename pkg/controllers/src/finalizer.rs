//! Finalizer and status writes shared by the reconcilers.
//!
//! Each helper writes only when something changes, so a pass that finds
//! everything in place produces no store event.

use pkg_state::registry::{Registry, StoreError};
use pkg_types::meta::Resource;

/// Add `finalizer` if missing. Returns the stored object.
pub(crate) async fn ensure<T: Resource>(
    registry: &Registry,
    obj: T,
    finalizer: &str,
) -> Result<T, StoreError> {
    if obj.meta().has_finalizer(finalizer) {
        return Ok(obj);
    }
    let mut next = obj;
    next.meta_mut().add_finalizer(finalizer);
    registry.update(&next).await
}

/// Remove `finalizer`. An object pending deletion disappears with its last finalizer.
pub(crate) async fn clear<T: Resource>(
    registry: &Registry,
    obj: T,
    finalizer: &str,
) -> Result<(), StoreError> {
    if !obj.meta().has_finalizer(finalizer) {
        return Ok(());
    }
    let mut next = obj;
    next.meta_mut().remove_finalizer(finalizer);
    registry.update(&next).await?;
    Ok(())
}

/// Persist `status` unless it is already the stored one.
pub(crate) async fn set_status<T>(registry: &Registry, obj: T, status: T::Status) -> Result<T, StoreError>
where
    T: Resource,
    T::Status: PartialEq,
{
    if *obj.status() == status {
        return Ok(obj);
    }
    let mut next = obj;
    next.set_status(status);
    registry.update_status(&next).await
}
