use serde::{Deserialize, Serialize};

// --- Policy / Role condition ---

/// Lifecycle of a Policy or Role object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CrCondition {
    /// Freshly created, not yet admitted
    #[default]
    #[serde(rename = "")]
    Submitted,
    #[serde(rename = "progressing")]
    Progressing,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "created")]
    Ok,
    #[serde(rename = "deleting")]
    Deleting,
}

impl std::fmt::Display for CrCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CrCondition::Submitted => write!(f, "Submitted"),
            CrCondition::Progressing => write!(f, "Progressing"),
            CrCondition::Error => write!(f, "Error"),
            CrCondition::Ok => write!(f, "OK"),
            CrCondition::Deleting => write!(f, "Deleting"),
        }
    }
}

/// Status shared by Policy and Role.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrStatus {
    #[serde(default)]
    pub condition: CrCondition,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    /// Generation of the spec last admitted by the controller
    #[serde(default)]
    pub observed_generation: u64,
}

impl CrStatus {
    pub fn new(condition: CrCondition, reason: impl Into<String>, observed_generation: u64) -> Self {
        Self {
            condition,
            reason: reason.into(),
            observed_generation,
        }
    }
}

// --- IamRoleServiceAccount condition ---

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum IrsaCondition {
    #[default]
    #[serde(rename = "")]
    Submitted,
    #[serde(rename = "progressing")]
    Progressing,
    /// A service account with the requested name exists and is not ours
    #[serde(rename = "saNameConflict")]
    SaNameConflict,
    /// The spec failed validation
    #[serde(rename = "failed")]
    Failed,
    #[serde(rename = "created")]
    Ok,
}

impl IrsaCondition {
    /// Conditions that only a spec change can leave.
    pub fn is_terminal(&self) -> bool {
        matches!(self, IrsaCondition::Failed | IrsaCondition::SaNameConflict)
    }
}

impl std::fmt::Display for IrsaCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IrsaCondition::Submitted => write!(f, "Submitted"),
            IrsaCondition::Progressing => write!(f, "Progressing"),
            IrsaCondition::SaNameConflict => write!(f, "SaNameConflict"),
            IrsaCondition::Failed => write!(f, "Failed"),
            IrsaCondition::Ok => write!(f, "OK"),
        }
    }
}
