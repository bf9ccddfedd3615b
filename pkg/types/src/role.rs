use anyhow::bail;
use serde::{Deserialize, Serialize};

use crate::condition::CrStatus;
use crate::meta::{ObjectMeta, Resource, ResourceKind};
use crate::naming;

// --- Role spec ---

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleSpec {
    pub service_account_name: String,
    /// ARN of the sibling Policy, copied once it is resolved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_arn: Option<String>,
    /// ARN of the IAM role once it has been found or created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_arn: Option<String>,
}

// --- Role ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub metadata: ObjectMeta,
    pub spec: RoleSpec,
    #[serde(default)]
    pub status: CrStatus,
}

impl Role {
    pub fn new(name: &str, namespace: &str, service_account_name: &str) -> Self {
        Self {
            metadata: ObjectMeta::new(name, namespace),
            spec: RoleSpec {
                service_account_name: service_account_name.to_string(),
                policy_arn: None,
                role_arn: None,
            },
            status: CrStatus::default(),
        }
    }

    pub fn role_arn(&self) -> Option<&str> {
        self.spec.role_arn.as_deref().filter(|a| !a.is_empty())
    }

    pub fn policy_arn(&self) -> Option<&str> {
        self.spec.policy_arn.as_deref().filter(|a| !a.is_empty())
    }

    pub fn aws_name(&self, cluster: &str) -> String {
        naming::aws_name(cluster, &self.metadata.namespace, &self.metadata.name)
    }

    pub fn validate(&self, cluster: &str) -> anyhow::Result<()> {
        if self.spec.service_account_name.is_empty() {
            bail!("empty string provided as spec.serviceAccountName");
        }
        naming::validate_aws_name(&self.aws_name(cluster))
    }
}

impl Resource for Role {
    const KIND: ResourceKind = ResourceKind::Role;
    type Spec = RoleSpec;
    type Status = CrStatus;

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }
    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
    fn spec(&self) -> &RoleSpec {
        &self.spec
    }
    fn status(&self) -> &CrStatus {
        &self.status
    }
    fn set_status(&mut self, status: CrStatus) {
        self.status = status;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation() {
        assert!(Role::new("reader", "team-a", "reader").validate("prod").is_ok());
        assert!(Role::new("reader", "team-a", "").validate("prod").is_err());
        assert!(Role::new(&"r".repeat(60), "team-a", "sa").validate("prod").is_err());
    }

    #[test]
    fn aws_name_embeds_cluster_namespace_and_name() {
        let role = Role::new("reader", "team-a", "reader");
        assert_eq!(role.aws_name("prod"), "irsa-op-prod-team-a.reader");
    }
}
