//! Fixture for driving one reconciler by hand against the simulated account.

use std::sync::Arc;

use crate::context::Context;
use crate::runtime::{Action, ControllerConfig, Reconciler};
use pkg_iam::{AwsIamManager, LocalIamAccount};
use pkg_state::client::StateStore;
use pkg_state::registry::Registry;
use pkg_types::meta::{ObjectKey, Resource};

pub(crate) const CLUSTER: &str = "prod";
pub(crate) const PROVIDER: &str = "arn:aws:iam::000000000000:oidc-provider/oidc.example.com/id/TEST";

pub(crate) struct Fixture {
    pub registry: Registry,
    pub account: Arc<LocalIamAccount>,
    pub iam: Arc<AwsIamManager<LocalIamAccount>>,
    pub ctx: Arc<Context>,
}

pub(crate) async fn fixture() -> Fixture {
    let registry = Registry::new(StateStore::in_memory().await.unwrap());
    let account = Arc::new(LocalIamAccount::default());
    let iam = Arc::new(AwsIamManager::new(account.clone(), CLUSTER, PROVIDER));
    let ctx = Arc::new(Context {
        registry: registry.clone(),
        iam: iam.clone(),
        cluster_name: CLUSTER.to_string(),
        permissions_boundary: None,
        config: ControllerConfig::default(),
    });
    Fixture {
        registry,
        account,
        iam,
        ctx,
    }
}

async fn version<T: Resource>(registry: &Registry, key: &ObjectKey) -> Option<u64> {
    registry
        .get::<T>(&key.namespace, &key.name)
        .await
        .unwrap()
        .map(|o| o.meta().resource_version)
}

/// Run passes over `key` until one asks for no immediate requeue and leaves
/// the stored object untouched. Returns that pass's action.
pub(crate) async fn settle<T: Resource>(reconciler: &impl Reconciler, registry: &Registry, key: &ObjectKey) -> Action {
    for _ in 0..30 {
        let before = version::<T>(registry, key).await;
        let action = reconciler.reconcile(key).await.unwrap();
        if action != Action::Requeue && version::<T>(registry, key).await == before {
            return action;
        }
    }
    panic!("{} never settled", key);
}
