use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// --- Resource kinds ---

/// Every kind of object the registry knows how to store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    IamRoleServiceAccount,
    Policy,
    Role,
    ServiceAccount,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::IamRoleServiceAccount,
        ResourceKind::Policy,
        ResourceKind::Role,
        ResourceKind::ServiceAccount,
    ];

    /// Plural name used in registry keys.
    pub fn plural(&self) -> &'static str {
        match self {
            ResourceKind::IamRoleServiceAccount => "iamroleserviceaccounts",
            ResourceKind::Policy => "policies",
            ResourceKind::Role => "roles",
            ResourceKind::ServiceAccount => "serviceaccounts",
        }
    }

    pub fn from_plural(plural: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.plural() == plural)
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::IamRoleServiceAccount => write!(f, "IamRoleServiceAccount"),
            ResourceKind::Policy => write!(f, "Policy"),
            ResourceKind::Role => write!(f, "Role"),
            ResourceKind::ServiceAccount => write!(f, "ServiceAccount"),
        }
    }
}

// --- Object key ---

/// Namespaced name of an object, the unit of work of every controller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// --- Owner reference ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerReference {
    pub kind: ResourceKind,
    pub name: String,
    pub uid: String,
    /// Whether the owner is the managing controller of the dependent
    #[serde(default)]
    pub controller: bool,
}

// --- Object metadata ---

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    /// Assigned by the registry on create
    #[serde(default)]
    pub uid: String,
    /// Optimistic concurrency token, bumped on every write
    #[serde(default)]
    pub resource_version: u64,
    /// Bumped by the registry whenever the spec changes
    #[serde(default)]
    pub generation: u64,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub finalizers: Vec<String>,
    #[serde(default)]
    pub owner_references: Vec<OwnerReference>,
    #[serde(default)]
    pub creation_timestamp: Option<DateTime<Utc>>,
    /// Set when deletion was requested while finalizers were present
    #[serde(default)]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace, &self.name)
    }

    pub fn is_pending_deletion(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    /// Returns true if the finalizer was not already present.
    pub fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) {
            return false;
        }
        self.finalizers.push(finalizer.to_string());
        true
    }

    /// Returns true if the finalizer was present.
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|f| f != finalizer);
        before != self.finalizers.len()
    }

    pub fn is_owned_by(&self, uid: &str) -> bool {
        !uid.is_empty() && self.owner_references.iter().any(|o| o.uid == uid)
    }

    /// Reference to this object, to be placed on its dependents.
    pub fn controller_reference(&self, kind: ResourceKind) -> OwnerReference {
        OwnerReference {
            kind,
            name: self.name.clone(),
            uid: self.uid.clone(),
            controller: true,
        }
    }

    /// Mark `owner` as the managing controller. Fails if another controller owns it.
    pub fn set_controller_reference(&mut self, owner: OwnerReference) -> anyhow::Result<()> {
        if let Some(existing) = self
            .owner_references
            .iter()
            .find(|o| o.controller && o.uid != owner.uid)
        {
            anyhow::bail!(
                "{}/{} is already controlled by {} {}",
                self.namespace,
                self.name,
                existing.kind,
                existing.name
            );
        }
        if !self.is_owned_by(&owner.uid) {
            self.owner_references.push(owner);
        }
        Ok(())
    }
}

// --- Resource trait ---

/// A typed object stored by the registry.
///
/// Every resource serialises its metadata under `metadata` so the registry can
/// walk owner references across kinds without knowing the concrete type.
pub trait Resource: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: ResourceKind;

    type Spec: PartialEq;
    type Status: Clone;

    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;
    fn spec(&self) -> &Self::Spec;
    fn status(&self) -> &Self::Status;
    fn set_status(&mut self, status: Self::Status);

    fn key(&self) -> ObjectKey {
        self.meta().key()
    }
}
