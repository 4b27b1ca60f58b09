//! cluster-bootstrap - bootstrap a self-hosted control plane

use std::path::PathBuf;

use bootstrap_common::events::EventRef;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cluster_bootstrap::assets::{DEFAULT_BOOTSTRAP_SECRETS_DIR, DEFAULT_POD_MANIFEST_PATH};
use cluster_bootstrap::config::{default_required_pods, parse_required_pods, BootstrapConfig};

/// Bootstrap a control plane!
#[derive(Parser, Debug)]
#[command(name = "cluster-bootstrap", about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Output version information
    Version,

    /// Start the temporary control plane and wait for the self-hosted one
    ///
    /// Stages the bootstrap manifests as static pods, creates the assets
    /// through the temporary API server, signals success once the required
    /// pods are running and ready, and tears the temporary control plane down.
    Start(StartArgs),
}

/// Start mode arguments
#[derive(Args, Debug)]
struct StartArgs {
    /// Path to the rendered bootstrap assets
    #[arg(long, env = "CLUSTER_BOOTSTRAP_ASSET_DIR")]
    asset_dir: PathBuf,

    /// Directory the kubelet loads static pod manifests from
    #[arg(
        long,
        env = "CLUSTER_BOOTSTRAP_POD_MANIFEST_PATH",
        default_value = DEFAULT_POD_MANIFEST_PATH
    )]
    pod_manifest_path: PathBuf,

    /// Fail on asset manifests that cannot be parsed
    #[arg(long, env = "CLUSTER_BOOTSTRAP_STRICT")]
    strict: bool,

    /// Required pod role as ROLE=PREFIX[,PREFIX...], matched against
    /// `namespace/name`; repeatable
    #[arg(long = "required-pods", env = "CLUSTER_BOOTSTRAP_REQUIRED_PODS", value_delimiter = ';')]
    required_pods: Vec<String>,

    /// Wait for this NAMESPACE/NAME event before tearing down
    #[arg(long, env = "CLUSTER_BOOTSTRAP_TEAR_DOWN_EVENT")]
    tear_down_event: Option<String>,

    /// Tear down the temporary control plane before the remaining assets
    /// are created
    #[arg(long, env = "CLUSTER_BOOTSTRAP_TEAR_DOWN_EARLY")]
    tear_down_early: bool,

    /// Where the temporary control plane's secrets are staged
    #[arg(
        long,
        env = "CLUSTER_BOOTSTRAP_SECRETS_DIR",
        default_value = DEFAULT_BOOTSTRAP_SECRETS_DIR
    )]
    bootstrap_secrets_dir: PathBuf,
}

impl StartArgs {
    fn into_config(self) -> anyhow::Result<BootstrapConfig> {
        let required_pods = if self.required_pods.is_empty() {
            default_required_pods()
        } else {
            parse_required_pods(&self.required_pods)?
        };
        let tear_down_event = self
            .tear_down_event
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<EventRef>())
            .transpose()?;

        Ok(BootstrapConfig {
            asset_dir: self.asset_dir,
            pod_manifest_path: self.pod_manifest_path,
            bootstrap_secrets_dir: self.bootstrap_secrets_dir,
            strict: self.strict,
            required_pods,
            tear_down_event,
            early_tear_down: self.tear_down_early,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("Failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Version => {
            println!("Version: {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Start(args) => {
            let config = args.into_config()?;
            cluster_bootstrap::start::run(config).await?;
            Ok(())
        }
    }
}
