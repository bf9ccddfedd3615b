//! IAM document and account constants.

/// Policy language version used for every generated document.
pub const POLICY_DOCUMENT_VERSION: &str = "2012-10-17";

/// Action granted to the federated identity by the trust document.
pub const ASSUME_ROLE_WITH_WEB_IDENTITY: &str = "sts:AssumeRoleWithWebIdentity";

/// Description attached to every role and policy we create.
pub const RESOURCE_DESCRIPTION: &str = "created by the irsa-operator";

/// IAM keeps at most this many versions per managed policy.
pub const MAX_POLICY_VERSIONS: usize = 5;

/// Account id used by the simulated IAM account when none is configured.
pub const DEFAULT_ACCOUNT_ID: &str = "000000000000";
