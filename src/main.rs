//! Foundry Operator - bare-metal Kubernetes machine lifecycle management

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use kube::{Api, Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use foundry::config::ReconcilerConfig;
use foundry::controller::{self, Context};
use foundry::crd::{FoundryCluster, FoundryMachine};
use foundry::provisioner::{MaasConfig, MaasCredentials, MaasProvisioner};
use foundry::remote::{SshExecutor, SshExecutorConfig};
use foundry::CONTROLLER_NAME;

/// Foundry - provisions, bootstraps, upgrades and tears down cluster machines
#[derive(Parser, Debug)]
#[command(name = "foundry", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Emit logs as JSON lines
    #[arg(long, env = "FOUNDRY_LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    ///
    /// Watches FoundryMachine and FoundryCluster records and drives every
    /// machine through create, bootstrap, upgrade and delete.
    Controller(ControllerArgs),
}

/// Controller mode arguments
#[derive(Parser, Debug)]
struct ControllerArgs {
    /// MAAS endpoint, e.g. http://maas.example:5240/MAAS
    #[arg(long, env = "MAAS_URL")]
    maas_url: Option<String>,

    /// MAAS API key in consumer:token:secret form
    #[arg(long, env = "MAAS_API_KEY", hide_env_values = true)]
    maas_api_key: Option<String>,

    /// Upper bound on a single bootstrap, upgrade or teardown, in seconds
    #[arg(long, env = "FOUNDRY_OPERATION_TIMEOUT_SECS", default_value = "1800")]
    operation_timeout_secs: u64,

    /// ssh binary used for remote execution
    #[arg(long, env = "FOUNDRY_SSH_BINARY", default_value = "ssh")]
    ssh_binary: PathBuf,

    /// TCP connect timeout for ssh, in seconds
    #[arg(long, default_value = "10")]
    ssh_connect_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider for the API client and the MAAS client.
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();
    init_tracing(cli.log_json);

    if cli.crd {
        for crd in [FoundryCluster::crd(), FoundryMachine::crd()] {
            let yaml = serde_yaml::to_string(&crd)
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
            println!("---\n{yaml}");
        }
        return Ok(());
    }

    match cli.command {
        Some(Commands::Controller(args)) => run_controller(args).await,
        None => run_controller(ControllerArgs::parse_from(["controller"])).await,
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

/// Ensure the Foundry CRDs are installed
///
/// The operator installs its own CRDs on startup using server-side apply.
/// This ensures the CRD versions always match the operator version.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(CONTROLLER_NAME).force();

    tracing::info!("Installing FoundryCluster CRD...");
    crds.patch(
        "foundryclusters.foundry.dev",
        &params,
        &Patch::Apply(&FoundryCluster::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install FoundryCluster CRD: {}", e))?;

    tracing::info!("Installing FoundryMachine CRD...");
    crds.patch(
        "foundrymachines.foundry.dev",
        &params,
        &Patch::Apply(&FoundryMachine::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install FoundryMachine CRD: {}", e))?;

    tracing::info!("All Foundry CRDs installed/updated");
    Ok(())
}

/// Run in controller mode
async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    let maas_url = args
        .maas_url
        .ok_or_else(|| anyhow::anyhow!("MAAS_URL must be set in controller mode"))?;
    let credentials: MaasCredentials = args
        .maas_api_key
        .ok_or_else(|| anyhow::anyhow!("MAAS_API_KEY must be set in controller mode"))?
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid MAAS_API_KEY: {}", e))?;

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crds_installed(&client).await?;

    let provisioner = MaasProvisioner::new(MaasConfig::new(maas_url, credentials))
        .map_err(|e| anyhow::anyhow!("Failed to create MAAS client: {}", e))?;
    let executor = SshExecutor::new(SshExecutorConfig {
        ssh_binary: args.ssh_binary,
        connect_timeout: Duration::from_secs(args.ssh_connect_timeout_secs),
    });
    let config = ReconcilerConfig::default()
        .with_operation_timeout(Duration::from_secs(args.operation_timeout_secs));

    let ctx = Arc::new(
        Context::builder(client.clone(), Arc::new(provisioner))
            .executor(Arc::new(executor))
            .config(config)
            .build(),
    );

    tracing::info!(
        operation_timeout_secs = args.operation_timeout_secs,
        "Starting Foundry controller"
    );
    controller::run(client, ctx).await;

    tracing::info!("Foundry controller shutting down");
    Ok(())
}
