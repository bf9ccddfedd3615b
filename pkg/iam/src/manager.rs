use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::api::{CreatePolicyInput, CreateRoleInput, IamApi, PolicyVersionInfo};
use crate::document::{decode_policy_document, policy_document, trust_document};
use crate::error::{IamApiError, IamError};
use pkg_constants::iam::{MAX_POLICY_VERSIONS, RESOURCE_DESCRIPTION};
use pkg_types::policy::Policy;
use pkg_types::role::Role;
use pkg_types::statement::StatementSpec;

/// IAM operations the Policy and Role controllers rely on.
///
/// Every call is idempotent: absent entities read as absent rather than as
/// errors, and creating something that already exists succeeds.
#[async_trait]
pub trait IamManager: Send + Sync {
    async fn policy_exists(&self, policy_arn: &str) -> Result<bool, IamError>;
    /// Statements of the default version of a policy.
    async fn get_statement(&self, policy_arn: &str) -> Result<Vec<StatementSpec>, IamError>;
    async fn get_policy_arn(&self, path_prefix: &str, aws_name: &str) -> Result<Option<String>, IamError>;
    async fn create_policy(&self, policy: &Policy) -> Result<(), IamError>;
    /// Push the desired statements as the new default version.
    async fn update_policy(&self, policy: &Policy) -> Result<(), IamError>;
    async fn delete_policy(&self, policy_arn: &str) -> Result<(), IamError>;

    async fn role_exists(&self, role_name: &str) -> Result<bool, IamError>;
    async fn get_role_arn(&self, role_name: &str) -> Result<String, IamError>;
    async fn create_role(&self, role: &Role, permissions_boundary: Option<&str>) -> Result<(), IamError>;
    async fn delete_role(&self, role_name: &str) -> Result<(), IamError>;
    async fn attach_role_policy(&self, role_name: &str, policy_arn: &str) -> Result<(), IamError>;
    async fn detach_role_policy(&self, role_name: &str, policy_arn: &str) -> Result<(), IamError>;
    async fn get_attached_role_policy_arns(&self, role_name: &str) -> Result<Vec<String>, IamError>;
}

/// [`IamManager`] over a raw [`IamApi`], naming everything after the cluster.
pub struct AwsIamManager<A: IamApi> {
    api: Arc<A>,
    cluster_name: String,
    oidc_provider_arn: String,
}

impl<A: IamApi> AwsIamManager<A> {
    pub fn new(api: Arc<A>, cluster_name: impl Into<String>, oidc_provider_arn: impl Into<String>) -> Self {
        Self {
            api,
            cluster_name: cluster_name.into(),
            oidc_provider_arn: oidc_provider_arn.into(),
        }
    }

    /// Make room for a new version by dropping the oldest non-default one.
    async fn prune_oldest_version(&self, policy_arn: &str) -> Result<(), IamError> {
        let versions = self.api.list_policy_versions(policy_arn).await?;
        if versions.len() < MAX_POLICY_VERSIONS {
            return Ok(());
        }
        if let Some(oldest) = versions
            .iter()
            .filter(|v| !v.is_default_version)
            .min_by_key(|v| (v.create_date, version_number(v)))
        {
            debug!("pruning version {} of {}", oldest.version_id, policy_arn);
            self.api
                .delete_policy_version(policy_arn, &oldest.version_id)
                .await?;
        }
        Ok(())
    }
}

fn version_number(v: &PolicyVersionInfo) -> u64 {
    v.version_id
        .trim_start_matches('v')
        .parse()
        .unwrap_or(u64::MAX)
}

/// Map "not found" to `None` and keep every other outcome.
fn absent_as_none<T>(res: Result<T, IamApiError>) -> Result<Option<T>, IamApiError> {
    match res {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl<A: IamApi> IamManager for AwsIamManager<A> {
    async fn policy_exists(&self, policy_arn: &str) -> Result<bool, IamError> {
        Ok(absent_as_none(self.api.get_policy(policy_arn).await)?.is_some())
    }

    async fn get_statement(&self, policy_arn: &str) -> Result<Vec<StatementSpec>, IamError> {
        let policy = self.api.get_policy(policy_arn).await?;
        let version = self
            .api
            .get_policy_version(policy_arn, &policy.default_version_id)
            .await?;
        let document = version.document.unwrap_or_default();
        decode_policy_document(&document)
    }

    async fn get_policy_arn(&self, path_prefix: &str, aws_name: &str) -> Result<Option<String>, IamError> {
        let policies = self.api.list_policies(path_prefix).await?;
        Ok(policies
            .into_iter()
            .find(|p| p.name == aws_name)
            .map(|p| p.arn))
    }

    async fn create_policy(&self, policy: &Policy) -> Result<(), IamError> {
        let input = CreatePolicyInput {
            name: policy.aws_name(&self.cluster_name),
            path: policy.path(&self.cluster_name),
            document: policy_document(&policy.spec.statement)?,
            description: RESOURCE_DESCRIPTION.to_string(),
        };
        let name = input.name.clone();
        match self.api.create_policy(input).await {
            Ok(created) => {
                info!("policy {} created on IAM ({})", name, created.arn);
                Ok(())
            }
            Err(e) if e.is_already_exists() => {
                info!("policy {} already created on IAM", name);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update_policy(&self, policy: &Policy) -> Result<(), IamError> {
        let Some(arn) = policy.arn() else {
            return Err(IamApiError::NoSuchEntity(format!(
                "policy {} has no ARN yet",
                policy.aws_name(&self.cluster_name)
            ))
            .into());
        };
        let document = policy_document(&policy.spec.statement)?;
        self.prune_oldest_version(arn).await?;
        let version = self.api.create_policy_version(arn, &document, true).await?;
        info!("policy {} updated to version {}", arn, version.version_id);
        Ok(())
    }

    async fn delete_policy(&self, policy_arn: &str) -> Result<(), IamError> {
        if absent_as_none(self.api.get_policy(policy_arn).await)?.is_none() {
            info!("policy {} already deleted on IAM", policy_arn);
            return Ok(());
        }

        let Some(roles) = absent_as_none(self.api.list_entities_for_policy(policy_arn).await)? else {
            return Ok(());
        };
        if roles.len() > 1 {
            return Err(IamError::PolicyAttachedToSeveralRoles {
                arn: policy_arn.to_string(),
                roles,
            });
        }
        for role in &roles {
            self.detach_role_policy(role, policy_arn).await?;
        }

        let Some(versions) = absent_as_none(self.api.list_policy_versions(policy_arn).await)? else {
            return Ok(());
        };
        for version in versions.iter().filter(|v| !v.is_default_version) {
            // a leftover version makes the delete below fail and be retried
            if let Err(e) = self
                .api
                .delete_policy_version(policy_arn, &version.version_id)
                .await
            {
                warn!("failed to delete version {} of {}: {}", version.version_id, policy_arn, e);
            }
        }

        match self.api.delete_policy(policy_arn).await {
            Ok(()) => {
                info!("policy {} deleted on IAM", policy_arn);
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn role_exists(&self, role_name: &str) -> Result<bool, IamError> {
        Ok(matches!(
            absent_as_none(self.api.get_role(role_name).await)?,
            Some(Some(_))
        ))
    }

    async fn get_role_arn(&self, role_name: &str) -> Result<String, IamError> {
        match self.api.get_role(role_name).await? {
            Some(role) => Ok(role.arn),
            None => Err(IamError::EmptyRole(role_name.to_string())),
        }
    }

    async fn create_role(&self, role: &Role, permissions_boundary: Option<&str>) -> Result<(), IamError> {
        let input = CreateRoleInput {
            name: role.aws_name(&self.cluster_name),
            assume_role_policy_document: trust_document(
                &self.oidc_provider_arn,
                &role.metadata.namespace,
                &role.spec.service_account_name,
            )?,
            description: RESOURCE_DESCRIPTION.to_string(),
            permissions_boundary: permissions_boundary
                .filter(|b| !b.is_empty())
                .map(str::to_string),
        };
        let name = input.name.clone();
        match self.api.create_role(input).await {
            Ok(_) => {
                info!("role {} created on IAM", name);
                Ok(())
            }
            Err(e) if e.is_already_exists() => {
                info!("role {} already created on IAM", name);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_role(&self, role_name: &str) -> Result<(), IamError> {
        match self.api.delete_role(role_name).await {
            Ok(()) => {
                info!("role {} deleted on IAM", role_name);
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn attach_role_policy(&self, role_name: &str, policy_arn: &str) -> Result<(), IamError> {
        self.api.attach_role_policy(role_name, policy_arn).await?;
        info!("attached policy {} to role {}", policy_arn, role_name);
        Ok(())
    }

    async fn detach_role_policy(&self, role_name: &str, policy_arn: &str) -> Result<(), IamError> {
        match self.api.detach_role_policy(role_name, policy_arn).await {
            Ok(()) => {
                info!("detached policy {} from role {}", policy_arn, role_name);
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_attached_role_policy_arns(&self, role_name: &str) -> Result<Vec<String>, IamError> {
        Ok(absent_as_none(self.api.list_attached_role_policies(role_name).await)?.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::{IamOperation, LocalIamAccount};
    use pkg_types::statement::statements_equal;

    const PROVIDER: &str = "arn:aws:iam::111122223333:oidc-provider/oidc.example.com/id/ABC";

    fn setup() -> (Arc<LocalIamAccount>, AwsIamManager<LocalIamAccount>) {
        let account = Arc::new(LocalIamAccount::new("111122223333"));
        let manager = AwsIamManager::new(account.clone(), "prod", PROVIDER);
        (account, manager)
    }

    fn policy(statement: Vec<StatementSpec>) -> Policy {
        Policy::new("reader", "team-a", statement)
    }

    fn bucket_read() -> Vec<StatementSpec> {
        vec![StatementSpec::new("arn:aws:s3:::b/*", ["s3:GetObject"])]
    }

    async fn created_policy(manager: &AwsIamManager<LocalIamAccount>) -> Policy {
        let mut p = policy(bucket_read());
        manager.create_policy(&p).await.unwrap();
        p.spec.arn = manager
            .get_policy_arn(&p.path_prefix("prod"), &p.aws_name("prod"))
            .await
            .unwrap();
        p
    }

    #[tokio::test]
    async fn policy_create_is_idempotent() {
        let (account, manager) = setup();
        let p = created_policy(&manager).await;
        manager.create_policy(&p).await.unwrap();

        let arn = p.arn().unwrap();
        assert!(arn.ends_with(":policy/irsa-op/prod/team-a/irsa-op-prod-team-a.reader"));
        assert!(manager.policy_exists(arn).await.unwrap());
        assert_eq!(account.policy_arns().await, vec![arn.to_string()]);
        assert!(statements_equal(&manager.get_statement(arn).await.unwrap(), &bucket_read()));
    }

    #[tokio::test]
    async fn unknown_policy_lookups_are_not_errors() {
        let (_, manager) = setup();
        assert!(!manager.policy_exists("arn:aws:iam::1:policy/missing").await.unwrap());
        assert_eq!(manager.get_policy_arn("/irsa-op/prod/", "missing").await.unwrap(), None);
        manager.delete_policy("arn:aws:iam::1:policy/missing").await.unwrap();
    }

    #[tokio::test]
    async fn update_prunes_the_oldest_version_at_the_limit() {
        let (account, manager) = setup();
        let mut p = created_policy(&manager).await;
        for i in 0..6 {
            p.spec.statement = vec![StatementSpec::new("arn:aws:s3:::b/*", [format!("s3:Action{}", i)])];
            manager.update_policy(&p).await.unwrap();
        }
        let arn = p.arn().unwrap();
        let versions = account.list_policy_versions(arn).await.unwrap();
        assert_eq!(versions.len(), MAX_POLICY_VERSIONS);
        assert!(statements_equal(&manager.get_statement(arn).await.unwrap(), &p.spec.statement));
    }

    #[tokio::test]
    async fn delete_policy_detaches_and_purges_versions() {
        let (account, manager) = setup();
        let mut p = created_policy(&manager).await;
        p.spec.statement = vec![StatementSpec::new("*", ["s3:ListAllMyBuckets"])];
        manager.update_policy(&p).await.unwrap();

        let role = Role::new("reader", "team-a", "reader");
        manager.create_role(&role, None).await.unwrap();
        let arn = p.arn().unwrap();
        manager.attach_role_policy(&role.aws_name("prod"), arn).await.unwrap();

        manager.delete_policy(arn).await.unwrap();
        assert!(account.policy_arns().await.is_empty());
        assert!(
            manager
                .get_attached_role_policy_arns(&role.aws_name("prod"))
                .await
                .unwrap()
                .is_empty()
        );
        let ops: Vec<_> = account.journal().await.into_iter().map(|e| e.operation).collect();
        let detach = ops.iter().position(|o| *o == IamOperation::DetachRolePolicy).unwrap();
        let delete = ops.iter().position(|o| *o == IamOperation::DeletePolicy).unwrap();
        assert!(detach < delete);
    }

    #[tokio::test]
    async fn policy_on_several_roles_is_refused() {
        let (account, manager) = setup();
        let p = created_policy(&manager).await;
        let arn = p.arn().unwrap();
        for name in ["reader", "writer"] {
            let role = Role::new(name, "team-a", name);
            manager.create_role(&role, None).await.unwrap();
            manager.attach_role_policy(&role.aws_name("prod"), arn).await.unwrap();
        }

        let err = manager.delete_policy(arn).await.unwrap_err();
        assert!(err.is_invariant_violation());
        assert_eq!(account.policy_arns().await.len(), 1);
    }

    #[tokio::test]
    async fn role_lifecycle() {
        let (account, manager) = setup();
        let role = Role::new("reader", "team-a", "reader");
        let name = role.aws_name("prod");

        assert!(!manager.role_exists(&name).await.unwrap());
        assert!(manager.get_attached_role_policy_arns(&name).await.unwrap().is_empty());

        manager
            .create_role(&role, Some("arn:aws:iam::111122223333:policy/boundary"))
            .await
            .unwrap();
        manager.create_role(&role, None).await.unwrap();
        assert!(manager.role_exists(&name).await.unwrap());
        let arn = manager.get_role_arn(&name).await.unwrap();
        assert_eq!(arn, format!("arn:aws:iam::111122223333:role/{}", name));

        let stored = account.get_role(&name).await.unwrap().unwrap();
        assert_eq!(
            stored.permissions_boundary.as_deref(),
            Some("arn:aws:iam::111122223333:policy/boundary")
        );
        let trust = crate::document::decode_trust_document(&stored.assume_role_policy_document).unwrap();
        assert!(
            trust.statement[0]
                .condition
                .string_equals
                .values()
                .any(|v| v == "system:serviceaccount:team-a:reader")
        );

        manager.delete_role(&name).await.unwrap();
        manager.delete_role(&name).await.unwrap();
        assert!(!manager.role_exists(&name).await.unwrap());
    }

    #[tokio::test]
    async fn detach_of_unattached_policy_succeeds() {
        let (_, manager) = setup();
        let role = Role::new("reader", "team-a", "reader");
        manager.create_role(&role, None).await.unwrap();
        manager
            .detach_role_policy(&role.aws_name("prod"), "arn:aws:iam::1:policy/none")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn injected_failures_surface_once() {
        let (account, manager) = setup();
        let p = policy(bucket_read());
        account
            .fail_next(
                IamOperation::CreatePolicy,
                Some(&p.aws_name("prod")),
                IamApiError::Service("throttled".into()),
            )
            .await;
        assert!(manager.create_policy(&p).await.is_err());
        manager.create_policy(&p).await.unwrap();
    }
}
