//! Dormant - scheduled shutdown and wake-up of Cluster API node groups

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use dormant::cluster::{Cluster, ClusterAccess, DryRunAccess, KubeClusterAccess};
use dormant::config::DormantConfig;
use dormant::context::Context;
use dormant::orchestrator::{Action, Orchestrator, ScaleOperation};
use dormant::state::{DryRunStateStore, FileStateStore, StateStore};
use dormant::DEFAULT_STATE_DIR;

/// Dormant - shut down and wake up a cluster's node groups
#[derive(Parser, Debug)]
#[command(name = "dormant", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Disable the autoscaler, drain every node group and scale it to zero
    Stop(CommonArgs),

    /// Restore node groups, wait for webhooks and services, re-enable the autoscaler
    Start(StartArgs),
}

/// Arguments shared by both actions
#[derive(Args, Debug)]
struct CommonArgs {
    /// Cluster identifier (the CAPI Cluster name)
    #[arg(long)]
    cluster: String,

    /// Log every mutation instead of executing it
    #[arg(long)]
    dry_run: bool,

    /// Directory holding captured state between stop and start
    #[arg(long, env = "DORMANT_STATE_DIR", default_value = DEFAULT_STATE_DIR)]
    state_dir: PathBuf,

    /// Path to kubeconfig (defaults to in-cluster or KUBECONFIG)
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Path to a YAML configuration file
    #[arg(long, env = "DORMANT_CONFIG")]
    config: Option<PathBuf>,

    /// Namespace of the cluster's CAPI resources (default capi-<cluster>)
    #[arg(long)]
    capi_namespace: Option<String>,

    /// Region, copied into the report
    #[arg(long)]
    region: Option<String>,

    /// Account, copied into the report
    #[arg(long)]
    account: Option<String>,

    /// Also write the report to this file
    #[arg(long)]
    report: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

/// Start arguments
#[derive(Args, Debug)]
struct StartArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Override the captured minimum size of every restored node group
    #[arg(long)]
    min_nodes: Option<u32>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let (action, args, min_override) = match cli.command {
        Commands::Stop(args) => (Action::Stop, args, None),
        Commands::Start(args) => (Action::Start, args.common, args.min_nodes),
    };

    init_tracing(args.log_format);

    let op = run(action, &args, min_override).await;

    let report = serde_json::to_string_pretty(&op)?;
    println!("{report}");
    if let Some(path) = &args.report {
        tokio::fs::write(path, &report)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to write report {:?}: {}", path, e))?;
        info!(path = %path.display(), "Report written");
    }

    if !op.succeeded() {
        std::process::exit(1);
    }
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }
}

/// Run the action; setup failures still produce a failed report
async fn run(action: Action, args: &CommonArgs, min_override: Option<u32>) -> ScaleOperation {
    let cluster = cluster_from_args(args);
    match prepare(cluster.clone(), args).await {
        Ok(orchestrator) => orchestrator.run(action, min_override).await,
        Err(e) => {
            error!(cluster = %cluster.name, error = %e, "Failed to set up operation");
            ScaleOperation::aborted(&cluster, action, args.dry_run, format!("{e:#}"))
        }
    }
}

fn cluster_from_args(args: &CommonArgs) -> Cluster {
    let mut cluster = Cluster::new(&args.cluster);
    if let Some(ns) = &args.capi_namespace {
        cluster.capi_namespace = ns.clone();
    }
    cluster.region = args.region.clone();
    cluster.account = args.account.clone();
    cluster
}

async fn prepare(cluster: Cluster, args: &CommonArgs) -> anyhow::Result<Orchestrator> {
    let config = match &args.config {
        Some(path) => DormantConfig::from_file(path)?,
        None => DormantConfig::default(),
    };

    let live = KubeClusterAccess::connect(cluster.clone(), args.kubeconfig.as_deref()).await?;
    let file_store: Arc<dyn StateStore> = Arc::new(FileStateStore::new(&args.state_dir));

    let live: Arc<dyn ClusterAccess> = Arc::new(live);
    let (access, store) = if args.dry_run {
        info!("Dry run: no mutation will be issued");
        let access: Arc<dyn ClusterAccess> = Arc::new(DryRunAccess::new(live));
        let store: Arc<dyn StateStore> = Arc::new(DryRunStateStore::new(file_store));
        (access, store)
    } else {
        (live, file_store)
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current step");
            on_signal.cancel();
        }
    });

    let ctx = Context::new(cluster, access, store, config, args.dry_run);
    Ok(Orchestrator::new(ctx, cancel))
}
