use serde::{Deserialize, Serialize};

use crate::meta::{ObjectMeta, Resource, ResourceKind};
use pkg_constants::naming::ROLE_ARN_ANNOTATION;

/// Cluster-native workload identity, bound to an IAM role through an annotation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceAccount {
    pub metadata: ObjectMeta,
}

impl ServiceAccount {
    pub fn new(name: &str, namespace: &str) -> Self {
        Self {
            metadata: ObjectMeta::new(name, namespace),
        }
    }

    /// Service account annotated with the role it may assume.
    pub fn for_role(name: &str, namespace: &str, role_arn: &str) -> Self {
        let mut sa = Self::new(name, namespace);
        sa.metadata
            .annotations
            .insert(ROLE_ARN_ANNOTATION.to_string(), role_arn.to_string());
        sa
    }

    pub fn role_arn(&self) -> Option<&str> {
        self.metadata
            .annotations
            .get(ROLE_ARN_ANNOTATION)
            .map(String::as_str)
    }
}

impl Resource for ServiceAccount {
    const KIND: ResourceKind = ResourceKind::ServiceAccount;
    type Spec = ();
    type Status = ();

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }
    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
    fn spec(&self) -> &() {
        &()
    }
    fn status(&self) -> &() {
        &()
    }
    fn set_status(&mut self, _status: ()) {}
}
