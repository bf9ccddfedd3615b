//! JSON documents exchanged with IAM: permission policies and role trust policies.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

use crate::error::IamError;
use pkg_constants::iam::{ASSUME_ROLE_WITH_WEB_IDENTITY, POLICY_DOCUMENT_VERSION};
use pkg_types::statement::StatementSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Effect {
    Allow,
    Deny,
}

// --- Permission policy ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PolicyDocument {
    pub version: String,
    pub statement: Vec<PolicyStatement>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PolicyStatement {
    pub effect: Effect,
    /// IAM accepts a bare string for a single action
    #[serde(deserialize_with = "one_or_many")]
    pub action: Vec<String>,
    pub resource: String,
}

impl PolicyStatement {
    /// Only Allow statements have a StatementSpec form.
    pub fn to_spec(&self) -> Result<StatementSpec, IamError> {
        if self.effect != Effect::Allow {
            return Err(IamError::UnmanagedStatement {
                effect: format!("{:?}", self.effect),
                resource: self.resource.clone(),
            });
        }
        Ok(StatementSpec::new(self.resource.clone(), self.action.iter().cloned()))
    }
}

impl PolicyDocument {
    pub fn allow(statements: &[StatementSpec]) -> Self {
        Self {
            version: POLICY_DOCUMENT_VERSION.to_string(),
            statement: statements
                .iter()
                .map(|s| PolicyStatement {
                    effect: Effect::Allow,
                    action: s.action.clone(),
                    resource: s.resource.clone(),
                })
                .collect(),
        }
    }

    pub fn to_specs(&self) -> Result<Vec<StatementSpec>, IamError> {
        self.statement.iter().map(PolicyStatement::to_spec).collect()
    }
}

fn one_or_many<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    })
}

/// Serialise the allow-only document for a statement list.
pub fn policy_document(statements: &[StatementSpec]) -> Result<String, IamError> {
    Ok(serde_json::to_string(&PolicyDocument::allow(statements))?)
}

/// Parse a document as returned by IAM, which URL-encodes stored documents.
pub fn decode_policy_document(encoded: &str) -> Result<Vec<StatementSpec>, IamError> {
    let decoded = url_decode(encoded)?;
    let doc: PolicyDocument = serde_json::from_str(&decoded)?;
    doc.to_specs()
}

// --- Trust policy ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TrustDocument {
    pub version: String,
    pub statement: Vec<TrustStatement>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TrustStatement {
    pub effect: Effect,
    pub principal: Principal,
    pub action: String,
    pub condition: TrustCondition,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Principal {
    pub federated: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TrustCondition {
    pub string_equals: BTreeMap<String, String>,
}

/// OIDC issuer host path: the provider ARN with everything up to the first `/` removed.
pub fn issuer_hostpath(oidc_provider_arn: &str) -> &str {
    oidc_provider_arn
        .split_once('/')
        .map(|(_, rest)| rest)
        .unwrap_or(oidc_provider_arn)
}

impl TrustDocument {
    /// Lets pods running as `namespace/service_account` assume the role
    /// through the cluster's OIDC provider.
    pub fn for_service_account(oidc_provider_arn: &str, namespace: &str, service_account: &str) -> Self {
        let mut string_equals = BTreeMap::new();
        string_equals.insert(
            format!("{}:sub", issuer_hostpath(oidc_provider_arn)),
            format!("system:serviceaccount:{}:{}", namespace, service_account),
        );
        Self {
            version: POLICY_DOCUMENT_VERSION.to_string(),
            statement: vec![TrustStatement {
                effect: Effect::Allow,
                principal: Principal {
                    federated: oidc_provider_arn.to_string(),
                },
                action: ASSUME_ROLE_WITH_WEB_IDENTITY.to_string(),
                condition: TrustCondition { string_equals },
            }],
        }
    }
}

pub fn trust_document(
    oidc_provider_arn: &str,
    namespace: &str,
    service_account: &str,
) -> Result<String, IamError> {
    Ok(serde_json::to_string(&TrustDocument::for_service_account(
        oidc_provider_arn,
        namespace,
        service_account,
    ))?)
}

pub fn decode_trust_document(encoded: &str) -> Result<TrustDocument, IamError> {
    let decoded = url_decode(encoded)?;
    Ok(serde_json::from_str(&decoded)?)
}

fn url_decode(encoded: &str) -> Result<String, IamError> {
    urlencoding::decode(encoded)
        .map(|s| s.into_owned())
        .map_err(|e| IamError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_types::statement::statements_equal;

    const PROVIDER: &str =
        "arn:aws:iam::111122223333:oidc-provider/oidc.eks.eu-west-1.amazonaws.com/id/ABC123";

    #[test]
    fn policy_document_wire_format() {
        let doc = policy_document(&[StatementSpec::new("arn:aws:s3:::b/*", ["s3:GetObject"])]).unwrap();
        let value: serde_json::Value = serde_json::from_str(&doc).unwrap();
        assert_eq!(value["Version"], "2012-10-17");
        assert_eq!(value["Statement"][0]["Effect"], "Allow");
        assert_eq!(value["Statement"][0]["Action"][0], "s3:GetObject");
        assert_eq!(value["Statement"][0]["Resource"], "arn:aws:s3:::b/*");
    }

    #[test]
    fn statements_survive_encoding() {
        let desired = vec![
            StatementSpec::new("arn:aws:s3:::b/*", ["s3:GetObject", "s3:ListBucket"]),
            StatementSpec::new("*", ["sts:GetCallerIdentity"]),
        ];
        let doc = policy_document(&desired).unwrap();
        let encoded = urlencoding::encode(&doc).into_owned();
        assert_ne!(encoded, doc);
        let decoded = decode_policy_document(&encoded).unwrap();
        assert!(statements_equal(&desired, &decoded));
    }

    #[test]
    fn single_action_string_is_accepted() {
        let raw = r#"{"Version":"2012-10-17","Statement":[{"Effect":"Allow","Action":"s3:GetObject","Resource":"*"}]}"#;
        let specs = decode_policy_document(raw).unwrap();
        assert_eq!(specs, vec![StatementSpec::new("*", ["s3:GetObject"])]);
    }

    #[test]
    fn deny_statement_has_no_spec_form() {
        let raw = r#"{"Version":"2012-10-17","Statement":[{"Effect":"Deny","Action":["s3:GetObject"],"Resource":"*"}]}"#;
        let err = decode_policy_document(raw).unwrap_err();
        assert!(err.is_unmanaged_statement());
    }

    #[test]
    fn trust_document_binds_the_service_account() {
        let doc = TrustDocument::for_service_account(PROVIDER, "team-a", "reader");
        let stmt = &doc.statement[0];
        assert_eq!(stmt.action, "sts:AssumeRoleWithWebIdentity");
        assert_eq!(stmt.principal.federated, PROVIDER);
        assert_eq!(
            stmt.condition
                .string_equals
                .get("oidc.eks.eu-west-1.amazonaws.com/id/ABC123:sub")
                .map(String::as_str),
            Some("system:serviceaccount:team-a:reader")
        );

        let raw = trust_document(PROVIDER, "team-a", "reader").unwrap();
        assert!(raw.contains("\"StringEquals\""));
        assert!(raw.contains("\"Federated\""));
    }

    #[test]
    fn hostpath_without_slash_is_unchanged() {
        assert_eq!(issuer_hostpath("no-slash"), "no-slash");
        assert_eq!(issuer_hostpath("a/b/c"), "b/c");
    }
}
