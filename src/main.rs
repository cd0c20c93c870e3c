//! Import Controller - runs the import-config controller against a cluster

use std::time::Duration;

use clap::Parser;
use kube::{Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;

use import_controller::config::{ControllerConfig, OsEnv};
use import_controller::controller::importconfig;
use import_controller::crd::ManagedCluster;
use import_controller::queue::BackoffPolicy;
use import_controller::telemetry::{init_telemetry, TelemetryConfig};

/// Import Controller - routes ManagedCluster related changes to a reconciler
#[derive(Parser, Debug)]
#[command(name = "import-controller", version, about, long_about = None)]
struct Cli {
    /// Print the ManagedCluster CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Number of reconcile workers (overrides MAX_CONCURRENT_RECONCILES)
    #[arg(long)]
    max_concurrent_reconciles: Option<usize>,

    /// Delay after the first failed reconcile, in milliseconds
    #[arg(long)]
    backoff_base_ms: Option<u64>,

    /// Upper bound for retry delays, in seconds
    #[arg(long)]
    backoff_max_secs: Option<u64>,

    /// Server-side timeout of each watch request, in seconds
    #[arg(long)]
    watch_timeout_secs: Option<u64>,

    /// Grace period for in-flight reconciles on shutdown, in seconds
    #[arg(long)]
    drain_timeout_secs: Option<u64>,

    /// Human-readable logs instead of JSON
    #[arg(long, env = "LOG_PRETTY")]
    pretty_logs: bool,
}

impl Cli {
    /// Apply command-line overrides on top of `config`
    fn apply(&self, mut config: ControllerConfig) -> ControllerConfig {
        if let Some(workers) = self.max_concurrent_reconciles {
            config.max_concurrent_reconciles = workers;
        }
        if self.backoff_base_ms.is_some() || self.backoff_max_secs.is_some() {
            let base = self
                .backoff_base_ms
                .map(Duration::from_millis)
                .unwrap_or(config.backoff.base);
            let max = self
                .backoff_max_secs
                .map(Duration::from_secs)
                .unwrap_or(config.backoff.max);
            config.backoff = BackoffPolicy::new(base, max);
        }
        if let Some(secs) = self.watch_timeout_secs {
            config.watch_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.drain_timeout_secs {
            config.drain_timeout = Duration::from_secs(secs);
        }
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&ManagedCluster::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        pretty: cli.pretty_logs,
        ..Default::default()
    })?;

    let config = cli.apply(ControllerConfig::from_env(&OsEnv)?);
    config.validate()?;
    tracing::info!(
        controller = %config.name,
        workers = config.max_concurrent_reconciles,
        watch_timeout_secs = config.watch_timeout.as_secs(),
        "Configuration loaded"
    );

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let controller = importconfig::controller(client, &config)?;

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Shutdown signal received");
                signal_cancel.cancel();
            }
            Err(e) => tracing::error!(error = %e, "Failed to listen for shutdown signal"),
        }
    });

    controller.run(cancel).await;
    Ok(())
}
