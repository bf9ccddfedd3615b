//! In-process IAM account.
//!
//! Behaves like IAM for everything the manager uses: policies live under
//! paths and keep at most five versions, roles carry trust documents and
//! permissions boundaries, and deletes of entities that still have
//! attachments or versions fail with a delete conflict. Stored documents are
//! returned URL-encoded.
//!
//! Failures can be injected per operation and target, and every successful
//! mutating call is appended to a journal.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use tokio::sync::Mutex;
use tracing::debug;

use crate::api::{
    CreatePolicyInput, CreateRoleInput, IamApi, PolicyInfo, PolicyVersionInfo, RoleInfo,
};
use crate::error::IamApiError;
use pkg_constants::iam::{DEFAULT_ACCOUNT_ID, MAX_POLICY_VERSIONS};

/// Calls of the raw IAM API, used to address injected failures and journal entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IamOperation {
    CreatePolicy,
    GetPolicy,
    ListPolicies,
    GetPolicyVersion,
    CreatePolicyVersion,
    ListPolicyVersions,
    DeletePolicyVersion,
    DeletePolicy,
    ListEntitiesForPolicy,
    CreateRole,
    GetRole,
    DeleteRole,
    AttachRolePolicy,
    DetachRolePolicy,
    ListAttachedRolePolicies,
}

/// A successful mutating call.
///
/// `target` is the policy name for `CreatePolicy`, the policy ARN for other
/// policy calls and the role name for role calls. Attach and detach also
/// record the policy ARN in `related`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub operation: IamOperation,
    pub target: String,
    pub related: Option<String>,
}

struct InjectedFailure {
    operation: IamOperation,
    /// `None` matches any target
    target: Option<String>,
    error: IamApiError,
}

struct StoredVersion {
    id: String,
    document: String,
    create_date: chrono::DateTime<Utc>,
}

struct StoredPolicy {
    name: String,
    path: String,
    versions: Vec<StoredVersion>,
    default_version_id: String,
    next_version: u64,
}

struct StoredRole {
    arn: String,
    trust_document: String,
    permissions_boundary: Option<String>,
    attached: Vec<String>,
}

#[derive(Default)]
struct AccountState {
    /// keyed by ARN
    policies: BTreeMap<String, StoredPolicy>,
    /// keyed by name
    roles: BTreeMap<String, StoredRole>,
    failures: Vec<InjectedFailure>,
    journal: Vec<JournalEntry>,
}

impl AccountState {
    fn check_failure(&mut self, operation: IamOperation, target: &str) -> Result<(), IamApiError> {
        let hit = self.failures.iter().position(|f| {
            f.operation == operation && f.target.as_deref().is_none_or(|t| t == target)
        });
        match hit {
            Some(i) => {
                let failure = self.failures.remove(i);
                debug!("injected failure on {:?} {}: {}", operation, target, failure.error);
                Err(failure.error)
            }
            None => Ok(()),
        }
    }

    fn record(&mut self, operation: IamOperation, target: &str, related: Option<&str>) {
        self.journal.push(JournalEntry {
            operation,
            target: target.to_string(),
            related: related.map(str::to_string),
        });
    }

    fn policy(&self, arn: &str) -> Result<&StoredPolicy, IamApiError> {
        self.policies
            .get(arn)
            .ok_or_else(|| IamApiError::NoSuchEntity(format!("policy {}", arn)))
    }

    fn policy_mut(&mut self, arn: &str) -> Result<&mut StoredPolicy, IamApiError> {
        self.policies
            .get_mut(arn)
            .ok_or_else(|| IamApiError::NoSuchEntity(format!("policy {}", arn)))
    }

    fn role_mut(&mut self, name: &str) -> Result<&mut StoredRole, IamApiError> {
        self.roles
            .get_mut(name)
            .ok_or_else(|| IamApiError::NoSuchEntity(format!("role {}", name)))
    }

    fn roles_attached_to(&self, arn: &str) -> Vec<String> {
        self.roles
            .iter()
            .filter(|(_, r)| r.attached.iter().any(|a| a == arn))
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn policy_info(&self, arn: &str, policy: &StoredPolicy) -> PolicyInfo {
        PolicyInfo {
            arn: arn.to_string(),
            name: policy.name.clone(),
            path: policy.path.clone(),
            default_version_id: policy.default_version_id.clone(),
            attachment_count: self.roles_attached_to(arn).len(),
        }
    }
}

impl StoredPolicy {
    fn push_version(&mut self, document: &str, set_as_default: bool) -> PolicyVersionInfo {
        let id = format!("v{}", self.next_version);
        self.next_version += 1;
        let version = StoredVersion {
            id: id.clone(),
            document: document.to_string(),
            create_date: Utc::now(),
        };
        let info = PolicyVersionInfo {
            version_id: id.clone(),
            is_default_version: set_as_default,
            create_date: version.create_date,
            document: None,
        };
        self.versions.push(version);
        if set_as_default {
            self.default_version_id = id;
        }
        info
    }

    fn version_info(&self, v: &StoredVersion, with_document: bool) -> PolicyVersionInfo {
        PolicyVersionInfo {
            version_id: v.id.clone(),
            is_default_version: v.id == self.default_version_id,
            create_date: v.create_date,
            document: with_document.then(|| urlencoding::encode(&v.document).into_owned()),
        }
    }
}

fn role_info(name: &str, role: &StoredRole) -> RoleInfo {
    RoleInfo {
        name: name.to_string(),
        arn: role.arn.clone(),
        assume_role_policy_document: urlencoding::encode(&role.trust_document).into_owned(),
        permissions_boundary: role.permissions_boundary.clone(),
    }
}

pub struct LocalIamAccount {
    account_id: String,
    state: Mutex<AccountState>,
}

impl Default for LocalIamAccount {
    fn default() -> Self {
        Self::new(DEFAULT_ACCOUNT_ID)
    }
}

impl LocalIamAccount {
    pub fn new(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            state: Mutex::new(AccountState::default()),
        }
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn policy_arn(&self, path: &str, name: &str) -> String {
        format!("arn:aws:iam::{}:policy{}{}", self.account_id, path, name)
    }

    pub fn role_arn(&self, name: &str) -> String {
        format!("arn:aws:iam::{}:role/{}", self.account_id, name)
    }

    /// Make the next call of `operation` on `target` (or on anything, when
    /// `target` is `None`) fail with `error`. Each injection fires once.
    pub async fn fail_next(&self, operation: IamOperation, target: Option<&str>, error: IamApiError) {
        self.state.lock().await.failures.push(InjectedFailure {
            operation,
            target: target.map(str::to_string),
            error,
        });
    }

    pub async fn journal(&self) -> Vec<JournalEntry> {
        self.state.lock().await.journal.clone()
    }

    pub async fn policy_arns(&self) -> Vec<String> {
        self.state.lock().await.policies.keys().cloned().collect()
    }

    pub async fn role_names(&self) -> Vec<String> {
        self.state.lock().await.roles.keys().cloned().collect()
    }
}

#[async_trait]
impl IamApi for LocalIamAccount {
    async fn create_policy(&self, input: CreatePolicyInput) -> Result<PolicyInfo, IamApiError> {
        let mut state = self.state.lock().await;
        state.check_failure(IamOperation::CreatePolicy, &input.name)?;
        if state.policies.values().any(|p| p.name == input.name) {
            return Err(IamApiError::EntityAlreadyExists(format!("policy {}", input.name)));
        }

        let arn = self.policy_arn(&input.path, &input.name);
        let mut policy = StoredPolicy {
            name: input.name.clone(),
            path: input.path,
            versions: Vec::new(),
            default_version_id: String::new(),
            next_version: 1,
        };
        policy.push_version(&input.document, true);
        let info = state.policy_info(&arn, &policy);
        state.policies.insert(arn, policy);
        state.record(IamOperation::CreatePolicy, &input.name, None);
        Ok(info)
    }

    async fn get_policy(&self, arn: &str) -> Result<PolicyInfo, IamApiError> {
        let mut state = self.state.lock().await;
        state.check_failure(IamOperation::GetPolicy, arn)?;
        let policy = state.policy(arn)?;
        Ok(state.policy_info(arn, policy))
    }

    async fn list_policies(&self, path_prefix: &str) -> Result<Vec<PolicyInfo>, IamApiError> {
        let mut state = self.state.lock().await;
        state.check_failure(IamOperation::ListPolicies, path_prefix)?;
        Ok(state
            .policies
            .iter()
            .filter(|(_, p)| p.path.starts_with(path_prefix))
            .map(|(arn, p)| state.policy_info(arn, p))
            .collect())
    }

    async fn get_policy_version(&self, arn: &str, version_id: &str) -> Result<PolicyVersionInfo, IamApiError> {
        let mut state = self.state.lock().await;
        state.check_failure(IamOperation::GetPolicyVersion, arn)?;
        let policy = state.policy(arn)?;
        policy
            .versions
            .iter()
            .find(|v| v.id == version_id)
            .map(|v| policy.version_info(v, true))
            .ok_or_else(|| IamApiError::NoSuchEntity(format!("version {} of {}", version_id, arn)))
    }

    async fn create_policy_version(
        &self,
        arn: &str,
        document: &str,
        set_as_default: bool,
    ) -> Result<PolicyVersionInfo, IamApiError> {
        let mut state = self.state.lock().await;
        state.check_failure(IamOperation::CreatePolicyVersion, arn)?;
        let policy = state.policy_mut(arn)?;
        if policy.versions.len() >= MAX_POLICY_VERSIONS {
            return Err(IamApiError::LimitExceeded(format!(
                "policy {} already has {} versions",
                arn, MAX_POLICY_VERSIONS
            )));
        }
        let info = policy.push_version(document, set_as_default);
        state.record(IamOperation::CreatePolicyVersion, arn, None);
        Ok(info)
    }

    async fn list_policy_versions(&self, arn: &str) -> Result<Vec<PolicyVersionInfo>, IamApiError> {
        let mut state = self.state.lock().await;
        state.check_failure(IamOperation::ListPolicyVersions, arn)?;
        let policy = state.policy(arn)?;
        Ok(policy
            .versions
            .iter()
            .map(|v| policy.version_info(v, false))
            .collect())
    }

    async fn delete_policy_version(&self, arn: &str, version_id: &str) -> Result<(), IamApiError> {
        let mut state = self.state.lock().await;
        state.check_failure(IamOperation::DeletePolicyVersion, arn)?;
        let policy = state.policy_mut(arn)?;
        if policy.default_version_id == version_id {
            return Err(IamApiError::DeleteConflict(format!(
                "cannot delete the default version of {}",
                arn
            )));
        }
        let before = policy.versions.len();
        policy.versions.retain(|v| v.id != version_id);
        if policy.versions.len() == before {
            return Err(IamApiError::NoSuchEntity(format!("version {} of {}", version_id, arn)));
        }
        state.record(IamOperation::DeletePolicyVersion, arn, Some(version_id));
        Ok(())
    }

    async fn delete_policy(&self, arn: &str) -> Result<(), IamApiError> {
        let mut state = self.state.lock().await;
        state.check_failure(IamOperation::DeletePolicy, arn)?;
        let policy = state.policy(arn)?;
        if policy.versions.len() > 1 {
            return Err(IamApiError::DeleteConflict(format!(
                "policy {} still has non-default versions",
                arn
            )));
        }
        if !state.roles_attached_to(arn).is_empty() {
            return Err(IamApiError::DeleteConflict(format!("policy {} is still attached", arn)));
        }
        state.policies.remove(arn);
        state.record(IamOperation::DeletePolicy, arn, None);
        Ok(())
    }

    async fn list_entities_for_policy(&self, arn: &str) -> Result<Vec<String>, IamApiError> {
        let mut state = self.state.lock().await;
        state.check_failure(IamOperation::ListEntitiesForPolicy, arn)?;
        state.policy(arn)?;
        Ok(state.roles_attached_to(arn))
    }

    async fn create_role(&self, input: CreateRoleInput) -> Result<RoleInfo, IamApiError> {
        let mut state = self.state.lock().await;
        state.check_failure(IamOperation::CreateRole, &input.name)?;
        if state.roles.contains_key(&input.name) {
            return Err(IamApiError::EntityAlreadyExists(format!("role {}", input.name)));
        }
        let role = StoredRole {
            arn: self.role_arn(&input.name),
            trust_document: input.assume_role_policy_document,
            permissions_boundary: input.permissions_boundary,
            attached: Vec::new(),
        };
        let info = role_info(&input.name, &role);
        state.roles.insert(input.name.clone(), role);
        state.record(IamOperation::CreateRole, &input.name, None);
        Ok(info)
    }

    async fn get_role(&self, name: &str) -> Result<Option<RoleInfo>, IamApiError> {
        let mut state = self.state.lock().await;
        state.check_failure(IamOperation::GetRole, name)?;
        match state.roles.get(name) {
            Some(role) => Ok(Some(role_info(name, role))),
            None => Err(IamApiError::NoSuchEntity(format!("role {}", name))),
        }
    }

    async fn delete_role(&self, name: &str) -> Result<(), IamApiError> {
        let mut state = self.state.lock().await;
        state.check_failure(IamOperation::DeleteRole, name)?;
        let role = state.role_mut(name)?;
        if !role.attached.is_empty() {
            return Err(IamApiError::DeleteConflict(format!(
                "role {} still has attached policies",
                name
            )));
        }
        state.roles.remove(name);
        state.record(IamOperation::DeleteRole, name, None);
        Ok(())
    }

    async fn attach_role_policy(&self, role_name: &str, policy_arn: &str) -> Result<(), IamApiError> {
        let mut state = self.state.lock().await;
        state.check_failure(IamOperation::AttachRolePolicy, role_name)?;
        state.policy(policy_arn)?;
        let role = state.role_mut(role_name)?;
        if !role.attached.iter().any(|a| a == policy_arn) {
            role.attached.push(policy_arn.to_string());
        }
        state.record(IamOperation::AttachRolePolicy, role_name, Some(policy_arn));
        Ok(())
    }

    async fn detach_role_policy(&self, role_name: &str, policy_arn: &str) -> Result<(), IamApiError> {
        let mut state = self.state.lock().await;
        state.check_failure(IamOperation::DetachRolePolicy, role_name)?;
        let role = state.role_mut(role_name)?;
        let before = role.attached.len();
        role.attached.retain(|a| a != policy_arn);
        if role.attached.len() == before {
            return Err(IamApiError::NoSuchEntity(format!(
                "policy {} is not attached to role {}",
                policy_arn, role_name
            )));
        }
        state.record(IamOperation::DetachRolePolicy, role_name, Some(policy_arn));
        Ok(())
    }

    async fn list_attached_role_policies(&self, role_name: &str) -> Result<Vec<String>, IamApiError> {
        let mut state = self.state.lock().await;
        state.check_failure(IamOperation::ListAttachedRolePolicies, role_name)?;
        Ok(state.role_mut(role_name)?.attached.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy_input(name: &str) -> CreatePolicyInput {
        CreatePolicyInput {
            name: name.to_string(),
            path: "/irsa-op/prod/team-a/".to_string(),
            document: r#"{"Version":"2012-10-17","Statement":[]}"#.to_string(),
            description: "test".to_string(),
        }
    }

    fn role_input(name: &str) -> CreateRoleInput {
        CreateRoleInput {
            name: name.to_string(),
            assume_role_policy_document: "{}".to_string(),
            description: "test".to_string(),
            permissions_boundary: None,
        }
    }

    #[tokio::test]
    async fn duplicate_creates_conflict() {
        let account = LocalIamAccount::default();
        let info = account.create_policy(policy_input("p")).await.unwrap();
        assert_eq!(info.arn, "arn:aws:iam::000000000000:policy/irsa-op/prod/team-a/p");
        assert!(
            account
                .create_policy(policy_input("p"))
                .await
                .unwrap_err()
                .is_already_exists()
        );

        account.create_role(role_input("r")).await.unwrap();
        assert!(account.create_role(role_input("r")).await.unwrap_err().is_already_exists());
    }

    #[tokio::test]
    async fn documents_are_returned_url_encoded() {
        let account = LocalIamAccount::default();
        let info = account.create_policy(policy_input("p")).await.unwrap();
        let version = account
            .get_policy_version(&info.arn, &info.default_version_id)
            .await
            .unwrap();
        let document = version.document.unwrap();
        assert!(document.starts_with("%7B"));
    }

    #[tokio::test]
    async fn attached_entities_block_deletion() {
        let account = LocalIamAccount::default();
        let policy = account.create_policy(policy_input("p")).await.unwrap();
        account.create_role(role_input("r")).await.unwrap();
        account.attach_role_policy("r", &policy.arn).await.unwrap();
        account.attach_role_policy("r", &policy.arn).await.unwrap();
        assert_eq!(account.list_attached_role_policies("r").await.unwrap().len(), 1);

        assert!(matches!(
            account.delete_policy(&policy.arn).await,
            Err(IamApiError::DeleteConflict(_))
        ));
        assert!(matches!(account.delete_role("r").await, Err(IamApiError::DeleteConflict(_))));

        account.detach_role_policy("r", &policy.arn).await.unwrap();
        assert!(account.detach_role_policy("r", &policy.arn).await.unwrap_err().is_not_found());
        account.delete_policy(&policy.arn).await.unwrap();
        account.delete_role("r").await.unwrap();
        assert!(account.policy_arns().await.is_empty());
        assert!(account.role_names().await.is_empty());
    }

    #[tokio::test]
    async fn version_limit_and_default_protection() {
        let account = LocalIamAccount::default();
        let policy = account.create_policy(policy_input("p")).await.unwrap();
        for _ in 1..MAX_POLICY_VERSIONS {
            account.create_policy_version(&policy.arn, "{}", true).await.unwrap();
        }
        assert!(matches!(
            account.create_policy_version(&policy.arn, "{}", true).await,
            Err(IamApiError::LimitExceeded(_))
        ));
        let default = account.get_policy(&policy.arn).await.unwrap().default_version_id;
        assert_eq!(default, format!("v{}", MAX_POLICY_VERSIONS));
        assert!(matches!(
            account.delete_policy_version(&policy.arn, &default).await,
            Err(IamApiError::DeleteConflict(_))
        ));
        account.delete_policy_version(&policy.arn, "v1").await.unwrap();
    }

    #[tokio::test]
    async fn failures_match_on_operation_and_target() {
        let account = LocalIamAccount::default();
        account
            .fail_next(IamOperation::CreateRole, Some("other"), IamApiError::Service("boom".into()))
            .await;
        account.create_role(role_input("r")).await.unwrap();
        assert!(account.create_role(role_input("other")).await.is_err());
        account.create_role(role_input("other")).await.unwrap();

        account
            .fail_next(IamOperation::GetRole, None, IamApiError::Service("boom".into()))
            .await;
        assert!(account.get_role("r").await.is_err());
        assert!(account.get_role("r").await.unwrap().is_some());

        let journal = account.journal().await;
        assert_eq!(journal.len(), 2);
        assert!(journal.iter().all(|e| e.operation == IamOperation::CreateRole));
    }
}
