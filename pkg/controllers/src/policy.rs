use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use crate::context::Context;
use crate::error::ReconcileError;
use crate::finalizer;
use crate::runtime::{Action, Reconciler};
use pkg_constants::naming::POLICY_FINALIZER;
use pkg_iam::IamError;
use pkg_types::condition::{CrCondition, CrStatus};
use pkg_types::meta::{ObjectKey, Resource, ResourceKind};
use pkg_types::policy::Policy;
use pkg_types::statement::statements_equal;

/// Keeps one IAM managed policy in line with each Policy object.
///
/// `Submitted → Error | Progressing → OK`, and `Deleting` while the remote
/// policy is torn down.
pub struct PolicyReconciler {
    ctx: Arc<Context>,
}

impl PolicyReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    async fn status(&self, policy: Policy, condition: CrCondition, reason: &str) -> Result<Policy, ReconcileError> {
        let observed = policy.status.observed_generation;
        let status = CrStatus::new(condition, reason, observed);
        Ok(finalizer::set_status(&self.ctx.registry, policy, status).await?)
    }

    /// Record a remote failure on the object, then hand it to the runtime.
    async fn remote_failure(&self, policy: Policy, err: IamError) -> Result<Action, ReconcileError> {
        let condition = if policy.metadata.is_pending_deletion() {
            CrCondition::Deleting
        } else {
            CrCondition::Error
        };
        self.status(policy, condition, &err.to_string()).await?;
        Err(err.into())
    }

    async fn admit(&self, policy: Policy) -> Result<Action, ReconcileError> {
        let generation = policy.metadata.generation;
        let status = match policy.validate(&self.ctx.cluster_name) {
            Ok(()) => CrStatus::new(CrCondition::Progressing, "", generation),
            Err(e) => {
                info!("policy {} rejected: {}", policy.key(), e);
                let status = CrStatus::new(CrCondition::Error, e.to_string(), generation);
                finalizer::set_status(&self.ctx.registry, policy, status).await?;
                return Ok(Action::Done);
            }
        };
        finalizer::set_status(&self.ctx.registry, policy, status).await?;
        Ok(Action::Requeue)
    }

    async fn converge(&self, policy: Policy) -> Result<Action, ReconcileError> {
        let cluster = &self.ctx.cluster_name;
        let iam = &self.ctx.iam;

        let Some(arn) = policy.arn().map(str::to_string) else {
            let found = match iam
                .get_policy_arn(&policy.path_prefix(cluster), &policy.aws_name(cluster))
                .await
            {
                Ok(found) => found,
                Err(e) => return self.remote_failure(policy, e).await,
            };
            if let Some(arn) = found {
                debug!("policy {} resolved to {}", policy.key(), arn);
                let mut next = policy;
                next.spec.arn = Some(arn);
                self.ctx.registry.update(&next).await?;
                return Ok(Action::Done);
            }
            if let Err(e) = iam.create_policy(&policy).await {
                return self.remote_failure(policy, e).await;
            }
            self.status(policy, CrCondition::Progressing, "").await?;
            return Ok(Action::Requeue);
        };

        let in_sync = match iam.get_statement(&arn).await {
            Ok(remote) => statements_equal(&remote, &policy.spec.statement),
            // only Allow statements are ever written, anything else is drift
            Err(e) if e.is_unmanaged_statement() => false,
            Err(e) => return self.remote_failure(policy, e).await,
        };
        if !in_sync {
            if let Err(e) = iam.update_policy(&policy).await {
                return self.remote_failure(policy, e).await;
            }
            self.status(policy, CrCondition::Progressing, "").await?;
            return Ok(Action::Requeue);
        }

        if policy.status.condition != CrCondition::Ok {
            info!("policy {} is in sync ({})", policy.key(), arn);
            self.status(policy, CrCondition::Ok, "").await?;
        }
        Ok(Action::Done)
    }

    async fn finalize(&self, policy: Policy) -> Result<Action, ReconcileError> {
        let policy = match policy.status.condition {
            CrCondition::Deleting => policy,
            _ => self.status(policy, CrCondition::Deleting, "").await?,
        };
        let cluster = &self.ctx.cluster_name;
        // created in an earlier pass but the ARN was never written back
        let arn = match policy.arn().map(str::to_string) {
            Some(arn) => Some(arn),
            None => match self
                .ctx
                .iam
                .get_policy_arn(&policy.path_prefix(cluster), &policy.aws_name(cluster))
                .await
            {
                Ok(found) => found,
                Err(e) => return self.remote_failure(policy, e).await,
            },
        };
        if let Some(arn) = arn {
            let exists = match self.ctx.iam.policy_exists(&arn).await {
                Ok(exists) => exists,
                Err(e) => return self.remote_failure(policy, e).await,
            };
            if exists && let Err(e) = self.ctx.iam.delete_policy(&arn).await {
                return self.remote_failure(policy, e).await;
            }
        }
        info!("policy {} released", policy.key());
        finalizer::clear(&self.ctx.registry, policy, POLICY_FINALIZER).await?;
        Ok(Action::Done)
    }
}

#[async_trait]
impl Reconciler for PolicyReconciler {
    fn name(&self) -> &'static str {
        "policy"
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Policy
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        let registry = &self.ctx.registry;
        let Some(policy) = registry.get::<Policy>(&key.namespace, &key.name).await? else {
            return Ok(Action::Done);
        };
        if policy.metadata.is_pending_deletion() {
            return self.finalize(policy).await;
        }

        let policy = finalizer::ensure(registry, policy, POLICY_FINALIZER).await?;
        if policy.status.condition == CrCondition::Submitted
            || policy.status.observed_generation != policy.metadata.generation
        {
            return self.admit(policy).await;
        }
        // rejected specs wait for a new generation
        if policy.validate(&self.ctx.cluster_name).is_err() {
            return Ok(Action::Done);
        }
        self.converge(policy).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CLUSTER, fixture, settle};
    use pkg_iam::{IamApi, IamApiError, IamManager};
    use pkg_iam::local::IamOperation;
    use pkg_types::statement::StatementSpec;

    fn read() -> Vec<StatementSpec> {
        vec![StatementSpec::new("arn:aws:s3:::bucket/*", ["s3:GetObject"])]
    }

    async fn stored(registry: &pkg_state::registry::Registry) -> Option<Policy> {
        registry.get("team-a", "reader").await.unwrap()
    }

    #[tokio::test]
    async fn converges_to_a_remote_policy() {
        let fx = fixture().await;
        let reconciler = PolicyReconciler::new(fx.ctx.clone());
        let created = fx
            .registry
            .create(&Policy::new("reader", "team-a", read()))
            .await
            .unwrap();

        let action = settle::<Policy>(&reconciler, &fx.registry, &created.key()).await;
        assert_eq!(action, Action::Done);

        let policy = stored(&fx.registry).await.unwrap();
        assert_eq!(policy.status.condition, CrCondition::Ok);
        assert!(policy.metadata.has_finalizer(POLICY_FINALIZER));
        let arn = policy.arn().unwrap();
        assert_eq!(fx.account.policy_arns().await, vec![arn.to_string()]);
        assert!(statements_equal(&fx.iam.get_statement(arn).await.unwrap(), &read()));
    }

    #[tokio::test]
    async fn invalid_policy_never_reaches_iam() {
        let fx = fixture().await;
        let reconciler = PolicyReconciler::new(fx.ctx.clone());
        let created = fx
            .registry
            .create(&Policy::new("reader", "team-a", vec![]))
            .await
            .unwrap();

        settle::<Policy>(&reconciler, &fx.registry, &created.key()).await;
        let policy = stored(&fx.registry).await.unwrap();
        assert_eq!(policy.status.condition, CrCondition::Error);
        assert!(!policy.status.reason.is_empty());
        assert!(fx.account.journal().await.is_empty());
    }

    #[tokio::test]
    async fn remote_drift_is_reverted() {
        let fx = fixture().await;
        let reconciler = PolicyReconciler::new(fx.ctx.clone());
        let created = fx
            .registry
            .create(&Policy::new("reader", "team-a", read()))
            .await
            .unwrap();
        settle::<Policy>(&reconciler, &fx.registry, &created.key()).await;
        let policy = stored(&fx.registry).await.unwrap();
        let arn = policy.arn().unwrap().to_string();

        // someone edits the policy behind our back
        let mut tampered = policy.clone();
        tampered.spec.statement = vec![StatementSpec::new("*", ["*"])];
        fx.iam.update_policy(&tampered).await.unwrap();
        assert!(!statements_equal(&fx.iam.get_statement(&arn).await.unwrap(), &read()));

        settle::<Policy>(&reconciler, &fx.registry, &created.key()).await;
        assert!(statements_equal(&fx.iam.get_statement(&arn).await.unwrap(), &read()));
        assert_eq!(stored(&fx.registry).await.unwrap().status.condition, CrCondition::Ok);
    }

    #[tokio::test]
    async fn remote_deny_statement_is_overwritten() {
        let fx = fixture().await;
        let reconciler = PolicyReconciler::new(fx.ctx.clone());
        let key = fx
            .registry
            .create(&Policy::new("reader", "team-a", read()))
            .await
            .unwrap()
            .key();
        settle::<Policy>(&reconciler, &fx.registry, &key).await;
        let arn = stored(&fx.registry).await.unwrap().arn().unwrap().to_string();

        // same resource and actions, opposite effect
        let deny = r#"{"Version":"2012-10-17","Statement":[{"Effect":"Deny","Action":["s3:GetObject"],"Resource":"arn:aws:s3:::bucket/*"}]}"#;
        fx.account.create_policy_version(&arn, deny, true).await.unwrap();
        assert!(fx.iam.get_statement(&arn).await.unwrap_err().is_unmanaged_statement());

        settle::<Policy>(&reconciler, &fx.registry, &key).await;
        assert!(statements_equal(&fx.iam.get_statement(&arn).await.unwrap(), &read()));
        assert_eq!(stored(&fx.registry).await.unwrap().status.condition, CrCondition::Ok);
    }

    #[tokio::test]
    async fn deletion_before_the_arn_is_recorded_still_cleans_up() {
        let fx = fixture().await;
        let reconciler = PolicyReconciler::new(fx.ctx.clone());
        let key = fx
            .registry
            .create(&Policy::new("reader", "team-a", read()))
            .await
            .unwrap()
            .key();

        // admission, then the create pass
        assert_eq!(reconciler.reconcile(&key).await.unwrap(), Action::Requeue);
        assert_eq!(reconciler.reconcile(&key).await.unwrap(), Action::Requeue);
        assert!(stored(&fx.registry).await.unwrap().arn().is_none());
        assert_eq!(fx.account.policy_arns().await.len(), 1);

        fx.registry.delete::<Policy>("team-a", "reader").await.unwrap();
        assert_eq!(reconciler.reconcile(&key).await.unwrap(), Action::Done);

        assert!(stored(&fx.registry).await.is_none());
        assert!(fx.account.policy_arns().await.is_empty());
    }

    #[tokio::test]
    async fn failed_create_is_reported_then_retried() {
        let fx = fixture().await;
        let reconciler = PolicyReconciler::new(fx.ctx.clone());
        let policy = Policy::new("reader", "team-a", read());
        fx.account
            .fail_next(
                IamOperation::CreatePolicy,
                Some(&policy.aws_name(CLUSTER)),
                IamApiError::Service("throttled".into()),
            )
            .await;
        let key = fx.registry.create(&policy).await.unwrap().key();

        assert_eq!(reconciler.reconcile(&key).await.unwrap(), Action::Requeue);
        let err = reconciler.reconcile(&key).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Iam(_)));
        let failed = stored(&fx.registry).await.unwrap();
        assert_eq!(failed.status.condition, CrCondition::Error);
        assert!(failed.status.reason.contains("throttled"));

        settle::<Policy>(&reconciler, &fx.registry, &key).await;
        assert_eq!(stored(&fx.registry).await.unwrap().status.condition, CrCondition::Ok);
    }

    #[tokio::test]
    async fn deletion_removes_the_remote_policy_first() {
        let fx = fixture().await;
        let reconciler = PolicyReconciler::new(fx.ctx.clone());
        let key = fx
            .registry
            .create(&Policy::new("reader", "team-a", read()))
            .await
            .unwrap()
            .key();
        settle::<Policy>(&reconciler, &fx.registry, &key).await;

        fx.registry.delete::<Policy>("team-a", "reader").await.unwrap();
        // held back by the finalizer until the pass runs
        assert!(stored(&fx.registry).await.unwrap().metadata.is_pending_deletion());

        settle::<Policy>(&reconciler, &fx.registry, &key).await;
        assert!(stored(&fx.registry).await.is_none());
        assert!(fx.account.policy_arns().await.is_empty());
    }
}
