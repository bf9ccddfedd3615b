use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use crate::context::Context;
use crate::error::ReconcileError;
use crate::finalizer;
use crate::runtime::{Action, Reconciler};
use pkg_constants::naming::{IRSA_FINALIZER, ROLE_ARN_ANNOTATION};
use pkg_state::registry::StoreError;
use pkg_types::condition::{CrCondition, CrStatus, IrsaCondition};
use pkg_types::irsa::{IamRoleServiceAccount, IamRoleServiceAccountStatus};
use pkg_types::meta::{ObjectKey, ObjectMeta, Resource, ResourceKind};
use pkg_types::policy::Policy;
use pkg_types::role::Role;
use pkg_types::service_account::ServiceAccount;
use pkg_types::statement::statements_equal;

/// OK for the generation currently stored, not an earlier one.
fn is_ready(meta: &ObjectMeta, status: &CrStatus) -> bool {
    status.condition == CrCondition::Ok && status.observed_generation == meta.generation
}

enum ServiceAccountState {
    Missing,
    Owned(ServiceAccount),
    /// Same name, not created for this request
    Foreign,
}

/// Turns an IamRoleServiceAccount into a Policy, a Role and finally the
/// annotated ServiceAccount. Never talks to IAM itself.
///
/// `Submitted → Failed | SaNameConflict | Progressing → OK`
pub struct IrsaReconciler {
    ctx: Arc<Context>,
}

impl IrsaReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    async fn status(
        &self,
        irsa: IamRoleServiceAccount,
        condition: IrsaCondition,
        reason: &str,
        observed_generation: u64,
    ) -> Result<IamRoleServiceAccount, ReconcileError> {
        let status = IamRoleServiceAccountStatus::new(condition, reason, observed_generation);
        Ok(finalizer::set_status(&self.ctx.registry, irsa, status).await?)
    }

    /// The service account named after the request.
    async fn service_account(&self, irsa: &IamRoleServiceAccount) -> Result<ServiceAccountState, StoreError> {
        let sa = self
            .ctx
            .registry
            .get::<ServiceAccount>(&irsa.metadata.namespace, &irsa.metadata.name)
            .await?;
        Ok(match sa {
            None => ServiceAccountState::Missing,
            Some(sa) if sa.metadata.is_owned_by(&irsa.metadata.uid) => ServiceAccountState::Owned(sa),
            Some(_) => ServiceAccountState::Foreign,
        })
    }

    async fn admit(&self, irsa: IamRoleServiceAccount) -> Result<Action, ReconcileError> {
        let generation = irsa.metadata.generation;
        if let Err(e) = irsa.validate() {
            info!("request {} rejected: {}", irsa.key(), e);
            self.status(irsa, IrsaCondition::Failed, &e.to_string(), generation)
                .await?;
            return Ok(Action::Done);
        }
        if let ServiceAccountState::Foreign = self.service_account(&irsa).await? {
            info!("request {}: service account name already taken", irsa.key());
            let reason = format!(
                "a service account named {} already exists in {}",
                irsa.metadata.name, irsa.metadata.namespace
            );
            self.status(irsa, IrsaCondition::SaNameConflict, &reason, generation)
                .await?;
            return Ok(Action::Done);
        }
        self.status(irsa, IrsaCondition::Progressing, "", generation)
            .await?;
        Ok(Action::Requeue)
    }

    /// Create the child Policy, or push the desired statements into it.
    async fn ensure_policy(&self, irsa: &IamRoleServiceAccount) -> Result<Policy, ReconcileError> {
        let registry = &self.ctx.registry;
        let desired = &irsa.spec.policy.statement;
        match registry
            .get::<Policy>(&irsa.metadata.namespace, &irsa.metadata.name)
            .await?
        {
            Some(policy) if statements_equal(&policy.spec.statement, desired) => Ok(policy),
            Some(mut policy) => {
                debug!("pushing new statements to policy {}", policy.key());
                policy.spec.statement = desired.clone();
                Ok(registry.update(&policy).await?)
            }
            None => {
                let mut policy = Policy::new(&irsa.metadata.name, &irsa.metadata.namespace, desired.clone());
                policy
                    .metadata
                    .set_controller_reference(irsa.metadata.controller_reference(ResourceKind::IamRoleServiceAccount))
                    .map_err(|e| ReconcileError::Invariant(e.to_string()))?;
                info!("creating policy {}", policy.key());
                Ok(registry.create(&policy).await?)
            }
        }
    }

    async fn ensure_role(&self, irsa: &IamRoleServiceAccount) -> Result<Role, ReconcileError> {
        let registry = &self.ctx.registry;
        if let Some(role) = registry
            .get::<Role>(&irsa.metadata.namespace, &irsa.metadata.name)
            .await?
        {
            return Ok(role);
        }
        let mut role = Role::new(&irsa.metadata.name, &irsa.metadata.namespace, &irsa.metadata.name);
        role.metadata
            .set_controller_reference(irsa.metadata.controller_reference(ResourceKind::IamRoleServiceAccount))
            .map_err(|e| ReconcileError::Invariant(e.to_string()))?;
        info!("creating role {}", role.key());
        Ok(registry.create(&role).await?)
    }

    async fn converge(&self, irsa: IamRoleServiceAccount) -> Result<Action, ReconcileError> {
        let registry = &self.ctx.registry;
        let policy = self.ensure_policy(&irsa).await?;
        let role = self.ensure_role(&irsa).await?;
        let children_ready = is_ready(&policy.metadata, &policy.status) && is_ready(&role.metadata, &role.status);

        let sa = match self.service_account(&irsa).await? {
            ServiceAccountState::Owned(sa) => Some(sa),
            ServiceAccountState::Foreign => {
                let observed = irsa.status.observed_generation;
                let reason = format!(
                    "a service account named {} already exists in {}",
                    irsa.metadata.name, irsa.metadata.namespace
                );
                self.status(irsa, IrsaCondition::SaNameConflict, &reason, observed)
                    .await?;
                return Ok(Action::Done);
            }
            ServiceAccountState::Missing => None,
        };

        let sa = match (sa, role.role_arn()) {
            (None, Some(role_arn)) if children_ready => {
                let mut sa = ServiceAccount::for_role(&irsa.metadata.name, &irsa.metadata.namespace, role_arn);
                sa.metadata
                    .set_controller_reference(irsa.metadata.controller_reference(ResourceKind::IamRoleServiceAccount))
                    .map_err(|e| ReconcileError::Invariant(e.to_string()))?;
                info!("creating service account {} for {}", sa.key(), role_arn);
                Some(registry.create(&sa).await?)
            }
            (Some(mut sa), Some(role_arn)) if sa.role_arn() != Some(role_arn) => {
                sa.metadata
                    .annotations
                    .insert(ROLE_ARN_ANNOTATION.to_string(), role_arn.to_string());
                Some(registry.update(&sa).await?)
            }
            (sa, _) => sa,
        };

        if children_ready && sa.is_some() && irsa.status.condition != IrsaCondition::Ok {
            info!("request {} is bound", irsa.key());
            let observed = irsa.status.observed_generation;
            self.status(irsa, IrsaCondition::Ok, "", observed).await?;
        }
        Ok(Action::RequeueAfter(self.ctx.config.resync_interval))
    }

    async fn finalize(&self, irsa: IamRoleServiceAccount) -> Result<Action, ReconcileError> {
        if let ServiceAccountState::Owned(sa) = self.service_account(&irsa).await? {
            info!("deleting service account {}", sa.key());
            self.ctx
                .registry
                .delete::<ServiceAccount>(&sa.metadata.namespace, &sa.metadata.name)
                .await?;
        }
        info!("request {} released", irsa.key());
        finalizer::clear(&self.ctx.registry, irsa, IRSA_FINALIZER).await?;
        Ok(Action::Done)
    }
}

#[async_trait]
impl Reconciler for IrsaReconciler {
    fn name(&self) -> &'static str {
        "iamroleserviceaccount"
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::IamRoleServiceAccount
    }

    fn owns(&self) -> &'static [ResourceKind] {
        &[ResourceKind::Policy, ResourceKind::Role, ResourceKind::ServiceAccount]
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        let registry = &self.ctx.registry;
        let Some(irsa) = registry
            .get::<IamRoleServiceAccount>(&key.namespace, &key.name)
            .await?
        else {
            return Ok(Action::Done);
        };
        if irsa.metadata.is_pending_deletion() {
            return self.finalize(irsa).await;
        }

        let irsa = finalizer::ensure(registry, irsa, IRSA_FINALIZER).await?;
        if irsa.status.condition == IrsaCondition::Submitted
            || irsa.status.observed_generation != irsa.metadata.generation
        {
            return self.admit(irsa).await;
        }
        if irsa.status.condition.is_terminal() {
            return Ok(Action::Done);
        }
        self.converge(irsa).await
    }
}
