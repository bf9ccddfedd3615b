use std::sync::Arc;

use crate::runtime::ControllerConfig;
use pkg_iam::IamManager;
use pkg_state::registry::Registry;

/// Everything a reconciler needs besides the key it is working on.
pub struct Context {
    pub registry: Registry,
    pub iam: Arc<dyn IamManager>,
    /// Embedded in every IAM name and path
    pub cluster_name: String,
    pub permissions_boundary: Option<String>,
    pub config: ControllerConfig,
}
