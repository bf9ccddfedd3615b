//! Raw IAM API seam. One method per IAM call the manager needs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::IamApiError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyInfo {
    pub arn: String,
    pub name: String,
    pub path: String,
    pub default_version_id: String,
    pub attachment_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyVersionInfo {
    pub version_id: String,
    pub is_default_version: bool,
    pub create_date: DateTime<Utc>,
    /// URL-encoded document, only filled by GetPolicyVersion
    pub document: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleInfo {
    pub name: String,
    pub arn: String,
    /// URL-encoded trust document
    pub assume_role_policy_document: String,
    pub permissions_boundary: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CreatePolicyInput {
    pub name: String,
    pub path: String,
    pub document: String,
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct CreateRoleInput {
    pub name: String,
    pub assume_role_policy_document: String,
    pub description: String,
    pub permissions_boundary: Option<String>,
}

#[async_trait]
pub trait IamApi: Send + Sync {
    async fn create_policy(&self, input: CreatePolicyInput) -> Result<PolicyInfo, IamApiError>;
    async fn get_policy(&self, arn: &str) -> Result<PolicyInfo, IamApiError>;
    async fn list_policies(&self, path_prefix: &str) -> Result<Vec<PolicyInfo>, IamApiError>;
    async fn get_policy_version(
        &self,
        arn: &str,
        version_id: &str,
    ) -> Result<PolicyVersionInfo, IamApiError>;
    async fn create_policy_version(
        &self,
        arn: &str,
        document: &str,
        set_as_default: bool,
    ) -> Result<PolicyVersionInfo, IamApiError>;
    async fn list_policy_versions(&self, arn: &str) -> Result<Vec<PolicyVersionInfo>, IamApiError>;
    async fn delete_policy_version(&self, arn: &str, version_id: &str) -> Result<(), IamApiError>;
    async fn delete_policy(&self, arn: &str) -> Result<(), IamApiError>;
    /// Names of the roles the policy is attached to.
    async fn list_entities_for_policy(&self, arn: &str) -> Result<Vec<String>, IamApiError>;

    async fn create_role(&self, input: CreateRoleInput) -> Result<RoleInfo, IamApiError>;
    /// `Ok(None)` models a success response without a role payload.
    async fn get_role(&self, name: &str) -> Result<Option<RoleInfo>, IamApiError>;
    async fn delete_role(&self, name: &str) -> Result<(), IamApiError>;
    async fn attach_role_policy(&self, role_name: &str, policy_arn: &str) -> Result<(), IamApiError>;
    async fn detach_role_policy(&self, role_name: &str, policy_arn: &str) -> Result<(), IamApiError>;
    /// ARNs of the managed policies attached to the role.
    async fn list_attached_role_policies(&self, role_name: &str) -> Result<Vec<String>, IamApiError>;
}
