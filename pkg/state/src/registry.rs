//! Typed object registry on top of [`StateStore`].
//!
//! Objects are stored as JSON under `/registry/<plural>/<namespace>/<name>`.
//! The registry enforces optimistic concurrency through `resource_version`,
//! tracks spec changes through `generation`, honours finalizers and removes
//! dependents through owner references once their owner is gone.

use chrono::Utc;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info};

use crate::client::StateStore;
use crate::watch::{WatchEvent, parse_registry_key, registry_key, registry_prefix};
use pkg_types::meta::{ObjectKey, ObjectMeta, Resource, ResourceKind};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} {key} not found")]
    NotFound { kind: ResourceKind, key: ObjectKey },
    #[error("{kind} {key} was modified concurrently (expected version {expected}, found {found})")]
    Conflict {
        kind: ResourceKind,
        key: ObjectKey,
        expected: u64,
        found: u64,
    },
    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: ResourceKind, key: ObjectKey },
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("store backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Typed access to the objects in a [`StateStore`].
#[derive(Clone)]
pub struct Registry {
    store: StateStore,
    /// Serialises read-check-write sequences so version checks are atomic
    write_lock: Arc<Mutex<()>>,
}

impl Registry {
    pub fn new(store: StateStore) -> Self {
        Self {
            store,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Subscribe to every mutation of the underlying store.
    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.store.event_log.subscribe()
    }

    pub async fn get<T: Resource>(&self, namespace: &str, name: &str) -> Result<Option<T>, StoreError> {
        let key = registry_key(T::KIND, namespace, name);
        match self.store.get(&key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Namespaced names of every stored object of `kind`.
    pub async fn list_keys(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
    ) -> Result<Vec<ObjectKey>, StoreError> {
        let prefix = registry_prefix(kind, namespace);
        Ok(self
            .store
            .list_prefix(&prefix)
            .await?
            .into_iter()
            .filter_map(|(key, _)| parse_registry_key(&key).map(|(_, k)| k))
            .collect())
    }

    /// Store a new object. Assigns uid, version 1, generation 1 and the creation time.
    pub async fn create<T: Resource>(&self, obj: &T) -> Result<T, StoreError> {
        let _guard = self.write_lock.lock().await;
        let meta = obj.meta();
        let key = registry_key(T::KIND, &meta.namespace, &meta.name);
        if self.store.get(&key).await?.is_some() {
            return Err(StoreError::AlreadyExists {
                kind: T::KIND,
                key: meta.key(),
            });
        }

        let mut created = obj.clone();
        let m = created.meta_mut();
        m.uid = uuid::Uuid::new_v4().to_string();
        m.resource_version = 1;
        m.generation = 1;
        m.creation_timestamp = Some(Utc::now());
        m.deletion_timestamp = None;

        self.store.put(&key, &serde_json::to_vec(&created)?).await?;
        debug!("created {} {}", T::KIND, created.key());
        Ok(created)
    }

    /// Write metadata and spec. The stored status is kept as is.
    ///
    /// Clearing the last finalizer of an object pending deletion removes it.
    pub async fn update<T: Resource>(&self, obj: &T) -> Result<T, StoreError> {
        let _guard = self.write_lock.lock().await;
        let stored: T = self.read_for_write(obj.meta()).await?;

        let mut updated = obj.clone();
        updated.set_status(stored.status().clone());
        let spec_changed = obj.spec() != stored.spec();
        let s = stored.meta();
        let m = updated.meta_mut();
        m.uid = s.uid.clone();
        m.creation_timestamp = s.creation_timestamp;
        m.deletion_timestamp = s.deletion_timestamp;
        m.resource_version = s.resource_version + 1;
        m.generation = if spec_changed { s.generation + 1 } else { s.generation };

        if updated.meta().is_pending_deletion() && updated.meta().finalizers.is_empty() {
            self.remove_locked(T::KIND, updated.meta()).await?;
            return Ok(updated);
        }

        let key = registry_key(T::KIND, &s.namespace, &s.name);
        self.store.put(&key, &serde_json::to_vec(&updated)?).await?;
        Ok(updated)
    }

    /// Write only the status of an object.
    pub async fn update_status<T: Resource>(&self, obj: &T) -> Result<T, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut updated: T = self.read_for_write(obj.meta()).await?;
        updated.set_status(obj.status().clone());
        updated.meta_mut().resource_version += 1;

        let key = registry_key(T::KIND, &updated.meta().namespace, &updated.meta().name);
        self.store.put(&key, &serde_json::to_vec(&updated)?).await?;
        Ok(updated)
    }

    /// Request deletion. Objects holding finalizers are only marked; the rest
    /// are removed along with their dependents. Returns false if absent.
    pub async fn delete<T: Resource>(&self, namespace: &str, name: &str) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        let key = registry_key(T::KIND, namespace, name);
        let Some(bytes) = self.store.get(&key).await? else {
            return Ok(false);
        };
        let mut obj: T = serde_json::from_slice(&bytes)?;

        if obj.meta().finalizers.is_empty() {
            self.remove_locked(T::KIND, obj.meta()).await?;
            return Ok(true);
        }
        if !obj.meta().is_pending_deletion() {
            let m = obj.meta_mut();
            m.deletion_timestamp = Some(Utc::now());
            m.resource_version += 1;
            self.store.put(&key, &serde_json::to_vec(&obj)?).await?;
            info!("{} {} marked for deletion", T::KIND, obj.key());
        }
        Ok(true)
    }

    /// Load the stored copy of `meta`'s object and check the caller's version.
    async fn read_for_write<T: Resource>(&self, meta: &ObjectMeta) -> Result<T, StoreError> {
        let key = registry_key(T::KIND, &meta.namespace, &meta.name);
        let Some(bytes) = self.store.get(&key).await? else {
            return Err(StoreError::NotFound {
                kind: T::KIND,
                key: meta.key(),
            });
        };
        let stored: T = serde_json::from_slice(&bytes)?;
        let found = stored.meta().resource_version;
        if found != meta.resource_version {
            return Err(StoreError::Conflict {
                kind: T::KIND,
                key: meta.key(),
                expected: meta.resource_version,
                found,
            });
        }
        Ok(stored)
    }

    /// Physically remove an object, then cascade to everything it owns.
    async fn remove_locked(&self, kind: ResourceKind, meta: &ObjectMeta) -> Result<(), StoreError> {
        self.store
            .delete(&registry_key(kind, &meta.namespace, &meta.name))
            .await?;
        info!("{} {} removed", kind, meta.key());

        let mut orphaned_uids = VecDeque::from([meta.uid.clone()]);
        while let Some(owner_uid) = orphaned_uids.pop_front() {
            for dependent_kind in ResourceKind::ALL {
                let prefix = registry_prefix(dependent_kind, Some(&meta.namespace));
                for (key, bytes) in self.store.list_prefix(&prefix).await? {
                    let mut value: serde_json::Value = serde_json::from_slice(&bytes)?;
                    let Some(raw_meta) = value.get("metadata") else {
                        continue;
                    };
                    let mut dependent: ObjectMeta = serde_json::from_value(raw_meta.clone())?;
                    if !dependent.is_owned_by(&owner_uid) {
                        continue;
                    }

                    if dependent.finalizers.is_empty() {
                        self.store.delete(&key).await?;
                        info!("{} {} garbage collected", dependent_kind, dependent.key());
                        orphaned_uids.push_back(dependent.uid);
                    } else if !dependent.is_pending_deletion() {
                        dependent.deletion_timestamp = Some(Utc::now());
                        dependent.resource_version += 1;
                        value["metadata"] = serde_json::to_value(&dependent)?;
                        self.store.put(&key, &serde_json::to_vec(&value)?).await?;
                        debug!("{} {} marked for deletion by its owner", dependent_kind, dependent.key());
                    }
                }
            }
        }
        Ok(())
    }
}
