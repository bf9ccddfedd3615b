//! Deterministic names of the IAM objects backing a Policy or Role.
//!
//! IAM names are unique per account, so they embed the cluster name, the
//! namespace and the object name. Namespaces cannot contain `.`, which makes
//! `<namespace>.<name>` unambiguous even when both parts contain hyphens.

use anyhow::{Result, bail};
use pkg_constants::naming::{AWS_NAME_MAX_LEN, AWS_NAME_PREFIX, AWS_PATH_ROOT};

/// Name of the role or policy on the IAM side.
pub fn aws_name(cluster: &str, namespace: &str, name: &str) -> String {
    format!("{}-{}-{}.{}", AWS_NAME_PREFIX, cluster, namespace, name)
}

/// IAM path every policy of this cluster lives under, used to list them.
pub fn policy_path_prefix(cluster: &str) -> String {
    format!("{}{}/", AWS_PATH_ROOT, cluster)
}

/// IAM path a policy is created with.
pub fn policy_path(cluster: &str, namespace: &str) -> String {
    format!("{}{}/", policy_path_prefix(cluster), namespace)
}

/// Reject names IAM would refuse, before any remote call is made.
pub fn validate_aws_name(aws_name: &str) -> Result<()> {
    if aws_name.len() > AWS_NAME_MAX_LEN {
        bail!(
            "aws name '{}' exceeds {} characters (got {})",
            aws_name,
            AWS_NAME_MAX_LEN,
            aws_name.len()
        );
    }
    Ok(())
}
