use pkg_iam::IamError;
use pkg_state::registry::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Iam(IamError),

    /// Fatal for the pass, reported and counted separately from retries
    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl From<IamError> for ReconcileError {
    fn from(e: IamError) -> Self {
        if e.is_invariant_violation() {
            ReconcileError::Invariant(e.to_string())
        } else {
            ReconcileError::Iam(e)
        }
    }
}
