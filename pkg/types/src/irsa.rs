use serde::{Deserialize, Serialize};

use crate::condition::IrsaCondition;
use crate::meta::{ObjectMeta, Resource, ResourceKind};
use crate::policy::PolicySpec;
use crate::validate::{validate_service_account_name, validate_statements};

// --- IamRoleServiceAccount spec ---

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IamRoleServiceAccountSpec {
    pub policy: PolicySpec,
}

// --- IamRoleServiceAccount status ---

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IamRoleServiceAccountStatus {
    #[serde(default)]
    pub condition: IrsaCondition,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    /// Generation of the spec last admitted by the controller
    #[serde(default)]
    pub observed_generation: u64,
}

impl IamRoleServiceAccountStatus {
    pub fn new(condition: IrsaCondition, reason: impl Into<String>, observed_generation: u64) -> Self {
        Self {
            condition,
            reason: reason.into(),
            observed_generation,
        }
    }
}

// --- IamRoleServiceAccount ---

/// Request for a service account bound to an IAM role carrying the given policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IamRoleServiceAccount {
    pub metadata: ObjectMeta,
    pub spec: IamRoleServiceAccountSpec,
    #[serde(default)]
    pub status: IamRoleServiceAccountStatus,
}

impl IamRoleServiceAccount {
    pub fn new(name: &str, namespace: &str, policy: PolicySpec) -> Self {
        Self {
            metadata: ObjectMeta::new(name, namespace),
            spec: IamRoleServiceAccountSpec { policy },
            status: IamRoleServiceAccountStatus::default(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        validate_service_account_name(&self.metadata.name)?;
        validate_statements(&self.spec.policy.statement)
    }
}

impl Resource for IamRoleServiceAccount {
    const KIND: ResourceKind = ResourceKind::IamRoleServiceAccount;
    type Spec = IamRoleServiceAccountSpec;
    type Status = IamRoleServiceAccountStatus;

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }
    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
    fn spec(&self) -> &IamRoleServiceAccountSpec {
        &self.spec
    }
    fn status(&self) -> &IamRoleServiceAccountStatus {
        &self.status
    }
    fn set_status(&mut self, status: IamRoleServiceAccountStatus) {
        self.status = status;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statement::StatementSpec;

    #[test]
    fn empty_policy_fails_validation() {
        let irsa = IamRoleServiceAccount::new("reader", "team-a", PolicySpec::default());
        assert!(irsa.validate().is_err());
    }

    #[test]
    fn valid_policy_passes() {
        let irsa = IamRoleServiceAccount::new(
            "reader",
            "team-a",
            PolicySpec::new(vec![StatementSpec::new(
                "arn:aws:s3:::my_corporate_bucket/exampleobject.png",
                ["act1"],
            )]),
        );
        assert!(irsa.validate().is_ok());
    }

    #[test]
    fn name_must_fit_a_service_account() {
        let statement = vec![StatementSpec::new("arn:aws:s3:::bucket/*", ["s3:GetObject"])];
        let irsa = IamRoleServiceAccount::new("S3_Reader", "team-a", PolicySpec::new(statement));
        let err = irsa.validate().unwrap_err();
        assert!(err.to_string().contains("service account"));
    }

    #[test]
    fn manifest_parses_from_yaml() {
        let yaml = r#"
metadata:
  name: reader
  namespace: team-a
spec:
  policy:
    statement:
      - resource: "arn:aws:s3:::bucket/*"
        action: ["s3:GetObject"]
"#;
        let irsa: IamRoleServiceAccount = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(irsa.metadata.name, "reader");
        assert_eq!(irsa.spec.policy.statement.len(), 1);
        assert_eq!(irsa.status.condition, IrsaCondition::Submitted);
    }
}
