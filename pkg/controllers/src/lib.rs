//! Controllers of the operator and the runtime driving them.

pub mod context;
pub mod error;
mod finalizer;
pub mod irsa;
pub mod policy;
pub mod role;
pub mod runtime;
#[cfg(test)]
mod testing;

use std::sync::Arc;

use context::Context;
use irsa::IrsaReconciler;
use pkg_metrics::MetricsRegistry;
use policy::PolicyReconciler;
use role::RoleReconciler;
use runtime::Controller;

/// Start the IamRoleServiceAccount, Policy and Role controllers.
pub fn start_all(ctx: Arc<Context>, metrics: Arc<MetricsRegistry>) -> Vec<tokio::task::JoinHandle<()>> {
    let registry = ctx.registry.clone();
    let config = ctx.config.clone();
    vec![
        Controller::new(IrsaReconciler::new(ctx.clone()), registry.clone(), config.clone(), metrics.clone()).start(),
        Controller::new(PolicyReconciler::new(ctx.clone()), registry.clone(), config.clone(), metrics.clone()).start(),
        Controller::new(RoleReconciler::new(ctx), registry, config, metrics).start(),
    ]
}
