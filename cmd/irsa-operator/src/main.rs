use anyhow::{Context as _, bail};
use clap::Parser;
use pkg_constants::controller::{
    DETACH_RETRY_INTERVAL_SECS, ERROR_BACKOFF_SECS, MAX_CONCURRENT_RECONCILES, POLICY_POLL_INTERVAL_SECS,
    RESYNC_INTERVAL_SECS,
};
use pkg_constants::iam::DEFAULT_ACCOUNT_ID;
use pkg_constants::paths::DEFAULT_OPERATOR_CONFIG;
use pkg_controllers::context::Context;
use pkg_controllers::runtime::ControllerConfig;
use pkg_controllers::start_all;
use pkg_iam::{AwsIamManager, LocalIamAccount};
use pkg_metrics::MetricsRegistry;
use pkg_state::client::StateStore;
use pkg_state::registry::{Registry, StoreError};
use pkg_types::config::{OperatorConfigFile, load_config_file};
use pkg_types::irsa::IamRoleServiceAccount;
use pkg_types::meta::Resource;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug, Default)]
#[command(name = "irsa-operator", about = "Binds service accounts to IAM roles")]
struct Cli {
    /// Path to YAML config file
    #[arg(long, short, default_value = DEFAULT_OPERATOR_CONFIG)]
    config: String,

    /// Cluster name embedded in every IAM name
    #[arg(long)]
    cluster_name: Option<String>,

    /// ARN of the cluster's OIDC identity provider
    #[arg(long)]
    oidc_provider_arn: Option<String>,

    /// Permissions boundary attached to every created role
    #[arg(long)]
    permissions_boundaries_policy_arn: Option<String>,

    /// Directory for SlateDB state storage (in-memory when unset)
    #[arg(long)]
    data_dir: Option<String>,

    /// Account id of the simulated IAM account
    #[arg(long)]
    account_id: Option<String>,

    #[arg(long)]
    max_concurrent_reconciles: Option<usize>,

    #[arg(long)]
    resync_interval_secs: Option<u64>,

    #[arg(long)]
    policy_poll_interval_secs: Option<u64>,

    #[arg(long)]
    detach_retry_interval_secs: Option<u64>,

    #[arg(long)]
    error_backoff_secs: Option<u64>,

    /// IamRoleServiceAccount manifest to submit at start-up (repeatable)
    #[arg(long)]
    apply: Vec<String>,
}

#[derive(Debug)]
struct Settings {
    cluster_name: String,
    oidc_provider_arn: String,
    permissions_boundary: Option<String>,
    data_dir: Option<String>,
    account_id: String,
    controller: ControllerConfig,
}

impl Settings {
    /// Merge: CLI args > config file > defaults
    fn resolve(cli: &Cli, file: OperatorConfigFile) -> anyhow::Result<Self> {
        let Some(cluster_name) = cli.cluster_name.clone().or(file.cluster_name) else {
            bail!("cluster-name is required");
        };
        let Some(oidc_provider_arn) = cli.oidc_provider_arn.clone().or(file.oidc_provider_arn) else {
            bail!("oidc-provider-arn is required");
        };
        let secs = |flag: &str, cli: Option<u64>, file: Option<u64>, default: u64| {
            match cli.or(file).unwrap_or(default) {
                0 => bail!("{} must be at least 1", flag),
                n => Ok(Duration::from_secs(n)),
            }
        };
        Ok(Self {
            cluster_name,
            oidc_provider_arn,
            permissions_boundary: cli
                .permissions_boundaries_policy_arn
                .clone()
                .or(file.permissions_boundaries_policy_arn),
            data_dir: cli.data_dir.clone().or(file.data_dir),
            account_id: cli
                .account_id
                .clone()
                .or(file.account_id)
                .unwrap_or_else(|| DEFAULT_ACCOUNT_ID.to_string()),
            controller: ControllerConfig {
                max_concurrent_reconciles: cli
                    .max_concurrent_reconciles
                    .or(file.max_concurrent_reconciles)
                    .unwrap_or(MAX_CONCURRENT_RECONCILES),
                resync_interval: secs(
                    "resync-interval-secs",
                    cli.resync_interval_secs,
                    file.resync_interval_secs,
                    RESYNC_INTERVAL_SECS,
                )?,
                policy_poll_interval: secs(
                    "policy-poll-interval-secs",
                    cli.policy_poll_interval_secs,
                    file.policy_poll_interval_secs,
                    POLICY_POLL_INTERVAL_SECS,
                )?,
                detach_retry_interval: secs(
                    "detach-retry-interval-secs",
                    cli.detach_retry_interval_secs,
                    file.detach_retry_interval_secs,
                    DETACH_RETRY_INTERVAL_SECS,
                )?,
                error_backoff: secs(
                    "error-backoff-secs",
                    cli.error_backoff_secs,
                    file.error_backoff_secs,
                    ERROR_BACKOFF_SECS,
                )?,
            },
        })
    }
}

/// Every YAML document in `content`, parsed as a request.
fn parse_manifests(content: &str) -> anyhow::Result<Vec<IamRoleServiceAccount>> {
    let mut requests = Vec::new();
    for document in serde_yaml::Deserializer::from_str(content) {
        requests.push(IamRoleServiceAccount::deserialize(document)?);
    }
    Ok(requests)
}

async fn apply_manifest(registry: &Registry, path: &str) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(path).with_context(|| format!("reading {}", path))?;
    for request in parse_manifests(&content).with_context(|| format!("parsing {}", path))? {
        match registry.create(&request).await {
            Ok(created) => info!("Submitted {}", created.key()),
            Err(StoreError::AlreadyExists { key, .. }) => warn!("{} already exists, skipping", key),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Cli::parse();

    // Load config file (returns defaults if file not found)
    let file_cfg: OperatorConfigFile = load_config_file(&cli.config)?;
    info!("Config file: {}", cli.config);
    let settings = Settings::resolve(&cli, file_cfg)?;

    info!("Starting irsa-operator");
    info!("  Cluster:   {}", settings.cluster_name);
    info!("  OIDC:      {}", settings.oidc_provider_arn);
    info!("  Boundary:  {}", settings.permissions_boundary.as_deref().unwrap_or("-"));
    info!("  Data dir:  {}", settings.data_dir.as_deref().unwrap_or("(in-memory)"));
    info!("  Workers:   {}", settings.controller.workers());

    let store = match &settings.data_dir {
        Some(dir) => StateStore::new(dir).await?,
        None => StateStore::in_memory().await?,
    };
    let registry = Registry::new(store.clone());

    let account = Arc::new(LocalIamAccount::new(settings.account_id.clone()));
    let iam = Arc::new(AwsIamManager::new(
        account,
        settings.cluster_name.clone(),
        settings.oidc_provider_arn.clone(),
    ));
    let ctx = Arc::new(Context {
        registry: registry.clone(),
        iam,
        cluster_name: settings.cluster_name,
        permissions_boundary: settings.permissions_boundary,
        config: settings.controller,
    });
    let metrics = Arc::new(MetricsRegistry::new());
    let handles = start_all(ctx, metrics.clone());

    for path in &cli.apply {
        apply_manifest(&registry, path).await?;
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    for handle in &handles {
        handle.abort();
    }
    info!("Final metrics:\n{}", metrics.render());
    store.close().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli() -> Cli {
        Cli {
            config: DEFAULT_OPERATOR_CONFIG.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn cli_wins_over_file() {
        let mut cli = cli();
        cli.cluster_name = Some("from-cli".into());
        cli.resync_interval_secs = Some(7);
        let file = OperatorConfigFile {
            cluster_name: Some("from-file".into()),
            oidc_provider_arn: Some("arn:oidc".into()),
            resync_interval_secs: Some(30),
            error_backoff_secs: Some(1),
            ..Default::default()
        };
        let settings = Settings::resolve(&cli, file).unwrap();
        assert_eq!(settings.cluster_name, "from-cli");
        assert_eq!(settings.oidc_provider_arn, "arn:oidc");
        assert_eq!(settings.controller.resync_interval, Duration::from_secs(7));
        assert_eq!(settings.controller.error_backoff, Duration::from_secs(1));
        assert_eq!(settings.controller.detach_retry_interval, Duration::from_secs(DETACH_RETRY_INTERVAL_SECS));
        assert_eq!(settings.account_id, DEFAULT_ACCOUNT_ID);
        assert!(settings.data_dir.is_none());
    }

    #[test]
    fn cluster_and_provider_are_required() {
        let file = OperatorConfigFile {
            oidc_provider_arn: Some("arn:oidc".into()),
            ..Default::default()
        };
        assert!(Settings::resolve(&cli(), file).is_err());

        let file = OperatorConfigFile {
            cluster_name: Some("prod".into()),
            ..Default::default()
        };
        assert!(Settings::resolve(&cli(), file).is_err());
    }

    #[test]
    fn zero_intervals_are_rejected() {
        let file = OperatorConfigFile {
            cluster_name: Some("prod".into()),
            oidc_provider_arn: Some("arn:oidc".into()),
            resync_interval_secs: Some(0),
            ..Default::default()
        };
        let err = Settings::resolve(&cli(), file.clone()).unwrap_err();
        assert!(err.to_string().contains("resync-interval-secs"));

        let mut zero_backoff = cli();
        zero_backoff.error_backoff_secs = Some(0);
        let file = OperatorConfigFile {
            resync_interval_secs: None,
            ..file
        };
        assert!(Settings::resolve(&zero_backoff, file.clone()).is_err());
        assert!(Settings::resolve(&cli(), file).is_ok());
    }

    #[test]
    fn multi_document_manifest() {
        let yaml = r#"
metadata:
  name: reader
  namespace: team-a
spec:
  policy:
    statement:
      - resource: "arn:aws:s3:::bucket/*"
        action: ["s3:GetObject"]
---
metadata:
  name: writer
  namespace: team-a
spec:
  policy:
    statement:
      - resource: "arn:aws:s3:::bucket/*"
        action: ["s3:PutObject"]
"#;
        let requests = parse_manifests(yaml).unwrap();
        let names: Vec<_> = requests.iter().map(|r| r.metadata.name.as_str()).collect();
        assert_eq!(names, vec!["reader", "writer"]);
    }
}
