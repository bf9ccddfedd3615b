//! IAM side of the operator: the raw API seam, the idempotent manager the
//! controllers talk to, and a simulated in-process account.

pub mod api;
pub mod document;
pub mod error;
pub mod local;
pub mod manager;

pub use api::IamApi;
pub use error::{IamApiError, IamError};
pub use local::LocalIamAccount;
pub use manager::{AwsIamManager, IamManager};
