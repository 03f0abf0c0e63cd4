//! gate-operator - provisions gateway identities and permissions from GateServer CRDs

use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use gate_operator::controller::{error_policy, reconcile, Context, TeardownPolicy};
use gate_operator::crd::GateServer;
use gate_operator::FIELD_MANAGER;

/// gate-operator - turns GateServer resources into service accounts, keys and RBAC
#[derive(Parser, Debug)]
#[command(name = "gate-operator", version, about, long_about = None)]
struct Cli {
    /// Print the GateServer CRD manifest and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the GateServer controller (default mode)
    Controller(ControllerArgs),
}

/// Log output format
#[derive(Clone, Copy, Debug, Default, ValueEnum)]
enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

/// Controller mode arguments
#[derive(Parser, Debug, Default)]
struct ControllerArgs {
    /// Only watch GateServers in this namespace (default: all namespaces)
    #[arg(long, env = "GATE_OPERATOR_NAMESPACE")]
    namespace: Option<String>,

    /// Keep the finalizer until every cluster-scoped dependent is deleted
    #[arg(long, env = "GATE_OPERATOR_STRICT_TEARDOWN")]
    strict_teardown: bool,

    /// Install or update the GateServer CRD on startup
    #[arg(long, env = "GATE_OPERATOR_INSTALL_CRD")]
    install_crd: bool,

    /// Log output format
    #[arg(long, env = "GATE_OPERATOR_LOG_FORMAT", value_enum, default_value_t)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&GateServer::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    let args = match cli.command {
        Some(Commands::Controller(args)) => args,
        None => ControllerArgs::default(),
    };

    init_tracing(args.log_format);
    run_controller(args).await
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Text => registry.with(fmt::layer()).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }
}

/// Server-side apply the GateServer CRD
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    tracing::info!("Installing GateServer CRD...");
    crds.patch(
        "gateservers.ocgate.rh-fieldwork.com",
        &params,
        &Patch::Apply(&GateServer::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install GateServer CRD: {}", e))?;

    tracing::info!("GateServer CRD installed/updated");
    Ok(())
}

/// Run the GateServer controller until interrupted
async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    tracing::info!("gate-operator starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    if args.install_crd {
        ensure_crd_installed(&client).await?;
    }

    let teardown_policy = if args.strict_teardown {
        TeardownPolicy::Strict
    } else {
        TeardownPolicy::BestEffort
    };
    let ctx = Arc::new(
        Context::builder(client.clone())
            .teardown_policy(teardown_policy)
            .build(),
    );

    let gate_servers: Api<GateServer> = match args.namespace.as_deref() {
        Some(namespace) => {
            tracing::info!(namespace, "Watching GateServers in one namespace");
            Api::namespaced(client, namespace)
        }
        None => {
            tracing::info!("Watching GateServers in all namespaces");
            Api::all(client)
        }
    };

    tracing::info!(?teardown_policy, "Starting GateServer controller");

    Controller::new(gate_servers, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => tracing::debug!(?action, "Reconciliation completed"),
                Err(e) => tracing::error!(error = ?e, "Reconciliation error"),
            }
        })
        .await;

    tracing::info!("gate-operator shutting down");
    Ok(())
}
