use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, trace};
use tracing_subscriber::EnvFilter;
use wormhole::controller::{Config, Controller};
use wormhole::kube::KubeStore;
use wormhole::version_info::VersionInfo;

type CliError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Parser, Debug)]
#[command(name = "wormhole")]
#[command(about = "Wireguard based overlay network for kubernetes pods")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Runs the controller that builds the wireguard overlay on this node
    Controller {
        /// Path to a kubeconfig file for state exchange and node monitoring
        #[arg(long, value_name = "file")]
        kubeconfig: Option<PathBuf>,
        /// The name of the kubernetes node this instance is running on
        #[arg(long, short = 'n')]
        node_name: Option<String>,
        /// The CIDR assigned to the overlay network
        #[arg(long)]
        overlay_cidr: Option<String>,
        /// The CIDR assigned to this node
        #[arg(long)]
        node_cidr: Option<String>,
        /// The IPv4 address other nodes use to reach this node
        #[arg(long)]
        endpoint: Option<String>,
        /// The external port to use for wireguard connections
        #[arg(long, default_value_t = 9806)]
        port: u16,
        /// The name of the wireguard interface to create
        #[arg(long, default_value = "wormhole-wg0")]
        wireguard_iface: String,
        /// The name of the bridge to create
        #[arg(long, default_value = "wormhole-br0")]
        bridge_iface: String,
        /// The MTU of the pod bridge
        #[arg(long, default_value_t = 65535, value_parser = clap::value_parser!(u16).range(68..))]
        bridge_mtu: u16,
        /// The namespace holding the wormhole state objects
        #[arg(long, default_value = "kube-system", env = "POD_NAMESPACE")]
        namespace: String,
        /// Enables verbose logging
        #[arg(long)]
        debug: bool,
    },
    /// Prints version information
    Version {
        /// Output format. One of: text|json|yaml
        #[arg(short, long, default_value = "text")]
        output: String,
    },
}

fn main() -> Result<(), CliError> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Controller {
            kubeconfig,
            node_name,
            overlay_cidr,
            node_cidr,
            endpoint,
            port,
            wireguard_iface,
            bridge_iface,
            bridge_mtu,
            namespace,
            debug,
        } => {
            setup_logging(debug)?;
            run_controller(
                kubeconfig,
                Config {
                    node_name,
                    namespace: namespace.clone(),
                    overlay_cidr,
                    node_cidr,
                    endpoint,
                    listen_port: port,
                    wireguard_iface,
                    bridge_iface,
                    bridge_mtu,
                    resync_period: Duration::from_secs(60),
                },
                namespace,
            )
        }
        Commands::Version { output } => show_version(&output),
    }
}

fn setup_logging(debug: bool) -> Result<(), CliError> {
    let filter = if debug {
        EnvFilter::try_new("wormhole=debug,info")?
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .init();
    Ok(())
}

fn run_controller(
    kubeconfig: Option<PathBuf>,
    config: Config,
    namespace: String,
) -> Result<(), CliError> {
    let rt = Runtime::new()?;

    rt.block_on(async {
        let store = Arc::new(KubeStore::new(kubeconfig.as_deref(), &namespace).await?);
        let controller = Controller::new(config, store);

        let shutdown = CancellationToken::new();
        let signal_token = shutdown.clone();
        tokio::spawn(async move {
            let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(sig) => sig,
                Err(e) => {
                    tracing::error!(error = %e, "failed to install SIGTERM handler");
                    return;
                }
            };
            let mut sigint = match signal::unix::signal(signal::unix::SignalKind::interrupt()) {
                Ok(sig) => sig,
                Err(e) => {
                    tracing::error!(error = %e, "failed to install SIGINT handler");
                    return;
                }
            };
            tokio::select! {
                _ = sigterm.recv() => info!("shutdown initiated via SIGTERM"),
                _ = sigint.recv() => info!("shutdown initiated via SIGINT"),
            }
            signal_token.cancel();
        });

        controller.run(shutdown).await?;
        trace!("controller finished");
        Ok(())
    })
}

fn show_version(output: &str) -> Result<(), CliError> {
    let info = VersionInfo::new();

    match output.to_lowercase().as_str() {
        "text" => println!("{info}"),
        "json" => println!("{}", serde_json::to_string_pretty(&info)?),
        "yaml" => print!("{}", serde_yaml::to_string(&info)?),
        other => return Err(format!("unsupported output format: {other}").into()),
    }
    Ok(())
}
