use serde::{Deserialize, Serialize};

/// Operator configuration file (YAML).
///
/// Example `config.yaml`:
/// ```yaml
/// cluster-name: prod
/// oidc-provider-arn: arn:aws:iam::111122223333:oidc-provider/oidc.eks.eu-west-1.amazonaws.com/id/ABC
/// permissions-boundaries-policy-arn: arn:aws:iam::111122223333:policy/boundary
/// data-dir: /var/lib/irsa-operator/data
/// max-concurrent-reconciles: 4
/// resync-interval-secs: 20
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperatorConfigFile {
    #[serde(default, alias = "cluster-name")]
    pub cluster_name: Option<String>,
    #[serde(default, alias = "oidc-provider-arn")]
    pub oidc_provider_arn: Option<String>,
    #[serde(default, alias = "permissions-boundaries-policy-arn")]
    pub permissions_boundaries_policy_arn: Option<String>,
    #[serde(default, alias = "data-dir")]
    pub data_dir: Option<String>,
    #[serde(default, alias = "account-id")]
    pub account_id: Option<String>,
    #[serde(default, alias = "max-concurrent-reconciles")]
    pub max_concurrent_reconciles: Option<usize>,
    #[serde(default, alias = "resync-interval-secs")]
    pub resync_interval_secs: Option<u64>,
    #[serde(default, alias = "policy-poll-interval-secs")]
    pub policy_poll_interval_secs: Option<u64>,
    #[serde(default, alias = "detach-retry-interval-secs")]
    pub detach_retry_interval_secs: Option<u64>,
    #[serde(default, alias = "error-backoff-secs")]
    pub error_backoff_secs: Option<u64>,
}

/// Load a YAML config file, returning the default if the file doesn't exist.
pub fn load_config_file<T: serde::de::DeserializeOwned + Default>(path: &str) -> anyhow::Result<T> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(T::default());
        }
        Err(e) => return Err(e.into()),
    };
    let config: T = serde_yaml::from_str(&content)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let cfg: OperatorConfigFile = load_config_file("/nonexistent/irsa-operator.yaml").unwrap();
        assert!(cfg.cluster_name.is_none());
        assert!(cfg.max_concurrent_reconciles.is_none());
    }

    #[test]
    fn kebab_case_keys_are_accepted() {
        let yaml = "cluster-name: prod\nmax-concurrent-reconciles: 3\nerror-backoff-secs: 1\n";
        let cfg: OperatorConfigFile = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.cluster_name.as_deref(), Some("prod"));
        assert_eq!(cfg.max_concurrent_reconciles, Some(3));
        assert_eq!(cfg.error_backoff_secs, Some(1));
    }
}
