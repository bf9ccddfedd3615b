use thiserror::Error;

/// Errors returned by the raw IAM API, classified the way IAM reports them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IamApiError {
    /// 404
    #[error("no such entity: {0}")]
    NoSuchEntity(String),
    /// 409 on create
    #[error("entity already exists: {0}")]
    EntityAlreadyExists(String),
    /// 409 on delete, the entity still has dependents
    #[error("delete conflict: {0}")]
    DeleteConflict(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(String),
    #[error("service failure: {0}")]
    Service(String),
}

impl IamApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, IamApiError::NoSuchEntity(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, IamApiError::EntityAlreadyExists(_))
    }

    pub fn status_code(&self) -> u16 {
        match self {
            IamApiError::NoSuchEntity(_) => 404,
            IamApiError::EntityAlreadyExists(_)
            | IamApiError::DeleteConflict(_)
            | IamApiError::LimitExceeded(_) => 409,
            IamApiError::Service(_) => 500,
        }
    }
}

/// Errors surfaced by the IAM manager to the controllers.
#[derive(Debug, Error)]
pub enum IamError {
    #[error(transparent)]
    Api(#[from] IamApiError),

    #[error("policy document error: {0}")]
    Document(#[from] serde_json::Error),

    #[error("cannot decode policy document: {0}")]
    Decode(String),

    /// The stored document holds a statement the operator never writes
    #[error("remote policy has a {effect} statement on {resource}")]
    UnmanagedStatement { effect: String, resource: String },

    #[error("IAM returned no role payload for {0}")]
    EmptyRole(String),

    /// A policy created by the operator is attached to more than one role
    #[error("policy {arn} is attached to several roles ({roles:?})")]
    PolicyAttachedToSeveralRoles { arn: String, roles: Vec<String> },
}

impl IamError {
    /// Violations are not retried blindly, they are reported as such.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, IamError::PolicyAttachedToSeveralRoles { .. })
    }

    pub fn is_unmanaged_statement(&self) -> bool {
        matches!(self, IamError::UnmanagedStatement { .. })
    }
}
