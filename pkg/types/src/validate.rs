use anyhow::{Result, bail};
use pkg_constants::naming::OBJECT_NAME_MAX_LEN;

use crate::statement::StatementSpec;

/// A request's name is reused verbatim as its ServiceAccount name, so it must
/// be a DNS-1123 label.
pub fn validate_service_account_name(name: &str) -> Result<()> {
    let well_formed = !name.is_empty()
        && name.len() <= OBJECT_NAME_MAX_LEN
        && !name.starts_with('-')
        && !name.ends_with('-')
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');
    if !well_formed {
        bail!(
            "'{}' cannot name a service account: expected at most {} lowercase alphanumerics or '-', starting and ending alphanumeric",
            name,
            OBJECT_NAME_MAX_LEN
        );
    }
    Ok(())
}

/// Validate an ARN used as a statement resource.
/// Accepts `*` or `arn:<partition>:<service>:<region>:<account>:<resource>`.
pub fn validate_resource_arn(arn: &str) -> Result<()> {
    if arn == "*" {
        return Ok(());
    }
    let parts: Vec<&str> = arn.splitn(6, ':').collect();
    if parts.len() != 6 || parts[0] != "arn" {
        bail!("resource '{}' is not a valid ARN", arn);
    }
    if parts[1].is_empty() || parts[2].is_empty() {
        bail!("resource '{}' is missing a partition or service", arn);
    }
    if parts[5].is_empty() {
        bail!("resource '{}' has an empty resource part", arn);
    }
    Ok(())
}

/// Validate a desired statement list.
pub fn validate_statements(statements: &[StatementSpec]) -> Result<()> {
    if statements.is_empty() {
        bail!("policy must contain at least one statement");
    }
    for (i, stmt) in statements.iter().enumerate() {
        if stmt.resource.is_empty() {
            bail!("statement[{}].resource must not be empty", i);
        }
        validate_resource_arn(&stmt.resource)
            .map_err(|e| anyhow::anyhow!("statement[{}]: {}", i, e))?;
        if stmt.action.is_empty() {
            bail!("statement[{}].action must contain at least one action", i);
        }
        if stmt.action.iter().any(|a| a.trim().is_empty()) {
            bail!("statement[{}].action contains an empty action", i);
        }
    }
    Ok(())
}
