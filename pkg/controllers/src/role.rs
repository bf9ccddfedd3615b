use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use crate::context::Context;
use crate::error::ReconcileError;
use crate::finalizer;
use crate::runtime::{Action, Reconciler};
use pkg_constants::naming::ROLE_FINALIZER;
use pkg_iam::IamError;
use pkg_types::condition::{CrCondition, CrStatus};
use pkg_types::meta::{ObjectKey, Resource, ResourceKind};
use pkg_types::policy::Policy;
use pkg_types::role::Role;

/// Keeps one IAM role per Role object, trusted by the service account and
/// carrying the sibling Policy.
///
/// `Submitted → Error | Progressing → OK`, and `Deleting` while the remote
/// role is detached and removed.
pub struct RoleReconciler {
    ctx: Arc<Context>,
}

impl RoleReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    async fn status(&self, role: Role, condition: CrCondition, reason: &str) -> Result<Role, ReconcileError> {
        let observed = role.status.observed_generation;
        let status = CrStatus::new(condition, reason, observed);
        Ok(finalizer::set_status(&self.ctx.registry, role, status).await?)
    }

    async fn remote_failure(&self, role: Role, err: IamError) -> Result<Action, ReconcileError> {
        let condition = if role.metadata.is_pending_deletion() {
            CrCondition::Deleting
        } else {
            CrCondition::Error
        };
        self.status(role, condition, &err.to_string()).await?;
        Err(err.into())
    }

    async fn admit(&self, role: Role) -> Result<Action, ReconcileError> {
        let generation = role.metadata.generation;
        if let Err(e) = role.validate(&self.ctx.cluster_name) {
            info!("role {} rejected: {}", role.key(), e);
            let status = CrStatus::new(CrCondition::Error, e.to_string(), generation);
            finalizer::set_status(&self.ctx.registry, role, status).await?;
            return Ok(Action::Done);
        }
        let status = CrStatus::new(CrCondition::Progressing, "", generation);
        finalizer::set_status(&self.ctx.registry, role, status).await?;
        Ok(Action::Requeue)
    }

    async fn converge(&self, role: Role) -> Result<Action, ReconcileError> {
        let iam = &self.ctx.iam;
        let role_name = role.aws_name(&self.ctx.cluster_name);

        if role.role_arn().is_none() {
            let exists = match iam.role_exists(&role_name).await {
                Ok(exists) => exists,
                Err(e) => return self.remote_failure(role, e).await,
            };
            if exists {
                let arn = match iam.get_role_arn(&role_name).await {
                    Ok(arn) => arn,
                    Err(e) => return self.remote_failure(role, e).await,
                };
                debug!("role {} resolved to {}", role.key(), arn);
                let mut next = role;
                next.spec.role_arn = Some(arn);
                let next = self.ctx.registry.update(&next).await?;
                self.status(next, CrCondition::Progressing, "").await?;
                return Ok(Action::Requeue);
            }
            let boundary = self.ctx.permissions_boundary.as_deref();
            if let Err(e) = iam.create_role(&role, boundary).await {
                return self.remote_failure(role, e).await;
            }
            self.status(role, CrCondition::Progressing, "").await?;
            return Ok(Action::Requeue);
        }

        let Some(policy_arn) = role.policy_arn().map(str::to_string) else {
            let sibling = self
                .ctx
                .registry
                .get::<Policy>(&role.metadata.namespace, &role.metadata.name)
                .await?;
            return match sibling.as_ref().and_then(Policy::arn) {
                Some(arn) => {
                    debug!("role {} picked up policy {}", role.key(), arn);
                    let mut next = role;
                    next.spec.policy_arn = Some(arn.to_string());
                    self.ctx.registry.update(&next).await?;
                    Ok(Action::Requeue)
                }
                None => Ok(Action::RequeueAfter(self.ctx.config.policy_poll_interval)),
            };
        };

        let attached = match iam.get_attached_role_policy_arns(&role_name).await {
            Ok(attached) => attached,
            Err(e) => return self.remote_failure(role, e).await,
        };
        if !attached.contains(&policy_arn) {
            if let Err(e) = iam.attach_role_policy(&role_name, &policy_arn).await {
                return self.remote_failure(role, e).await;
            }
            self.status(role, CrCondition::Progressing, "").await?;
            // confirmed on the next pass
            return Ok(Action::Requeue);
        }

        if role.status.condition != CrCondition::Ok {
            info!("role {} is bound to {}", role.key(), policy_arn);
            self.status(role, CrCondition::Ok, "").await?;
        }
        Ok(Action::Done)
    }

    async fn finalize(&self, role: Role) -> Result<Action, ReconcileError> {
        let role = match role.status.condition {
            CrCondition::Deleting => role,
            _ => self.status(role, CrCondition::Deleting, "").await?,
        };
        let iam = &self.ctx.iam;
        let role_name = role.aws_name(&self.ctx.cluster_name);

        let attached = match iam.get_attached_role_policy_arns(&role_name).await {
            Ok(attached) => attached,
            Err(e) => return self.remote_failure(role, e).await,
        };
        if !attached.is_empty() {
            for policy_arn in &attached {
                if let Err(e) = iam.detach_role_policy(&role_name, policy_arn).await {
                    return self.remote_failure(role, e).await;
                }
            }
            return Ok(Action::RequeueAfter(self.ctx.config.detach_retry_interval));
        }

        if let Err(e) = iam.delete_role(&role_name).await {
            return self.remote_failure(role, e).await;
        }
        info!("role {} released", role.key());
        finalizer::clear(&self.ctx.registry, role, ROLE_FINALIZER).await?;
        Ok(Action::Done)
    }
}

#[async_trait]
impl Reconciler for RoleReconciler {
    fn name(&self) -> &'static str {
        "role"
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Role
    }

    /// The sibling Policy resolving its ARN unblocks the role.
    fn siblings(&self) -> &'static [ResourceKind] {
        &[ResourceKind::Policy]
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        let registry = &self.ctx.registry;
        let Some(role) = registry.get::<Role>(&key.namespace, &key.name).await? else {
            return Ok(Action::Done);
        };
        if role.metadata.is_pending_deletion() {
            return self.finalize(role).await;
        }

        let role = finalizer::ensure(registry, role, ROLE_FINALIZER).await?;
        if role.status.condition == CrCondition::Submitted
            || role.status.observed_generation != role.metadata.generation
        {
            return self.admit(role).await;
        }
        if role.validate(&self.ctx.cluster_name).is_err() {
            return Ok(Action::Done);
        }
        self.converge(role).await
    }
}
