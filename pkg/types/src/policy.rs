use serde::{Deserialize, Serialize};

use crate::condition::CrStatus;
use crate::meta::{ObjectMeta, Resource, ResourceKind};
use crate::naming;
use crate::statement::StatementSpec;
use crate::validate::validate_statements;

// --- Policy spec ---

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicySpec {
    #[serde(default)]
    pub statement: Vec<StatementSpec>,
    /// ARN of the IAM policy once it has been found or created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arn: Option<String>,
}

impl PolicySpec {
    pub fn new(statement: Vec<StatementSpec>) -> Self {
        Self {
            statement,
            arn: None,
        }
    }
}

// --- Policy ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub metadata: ObjectMeta,
    pub spec: PolicySpec,
    #[serde(default)]
    pub status: CrStatus,
}

impl Policy {
    pub fn new(name: &str, namespace: &str, statement: Vec<StatementSpec>) -> Self {
        Self {
            metadata: ObjectMeta::new(name, namespace),
            spec: PolicySpec::new(statement),
            status: CrStatus::default(),
        }
    }

    /// The resolved ARN, if any. An empty string counts as unresolved.
    pub fn arn(&self) -> Option<&str> {
        self.spec.arn.as_deref().filter(|a| !a.is_empty())
    }

    pub fn aws_name(&self, cluster: &str) -> String {
        naming::aws_name(cluster, &self.metadata.namespace, &self.metadata.name)
    }

    pub fn path(&self, cluster: &str) -> String {
        naming::policy_path(cluster, &self.metadata.namespace)
    }

    pub fn path_prefix(&self, cluster: &str) -> String {
        naming::policy_path_prefix(cluster)
    }

    pub fn validate(&self, cluster: &str) -> anyhow::Result<()> {
        validate_statements(&self.spec.statement)?;
        naming::validate_aws_name(&self.aws_name(cluster))
    }
}

impl Resource for Policy {
    const KIND: ResourceKind = ResourceKind::Policy;
    type Spec = PolicySpec;
    type Status = CrStatus;

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }
    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
    fn spec(&self) -> &PolicySpec {
        &self.spec
    }
    fn status(&self) -> &CrStatus {
        &self.status
    }
    fn set_status(&mut self, status: CrStatus) {
        self.status = status;
    }
}
