use anyhow::Result;
use clap::{Parser, Subcommand};
use dispatch_cluster::{Dispatch, DispatchOptions, NodeRegistrarDriver};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{Level, error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dispatch-cluster")]
#[command(about = "Work dispatcher for concolic VM and SVM nodes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the dispatcher until the work is drained
    Dispatch {
        /// JSON options file (falls back to DISPATCH_CONFIG, then ./dispatch.json)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Master port nodes register on
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Ask a running dispatcher to shut down
    Shutdown {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(short, long, default_value = "10012")]
        port: u16,
        /// Connection timeout in seconds
        #[arg(long, default_value_t = 10)]
        timeout: u64,
    },
    /// Print the resolved options
    ShowConfig {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("dispatch_cluster=info".parse()?))
        .with_max_level(Level::INFO)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Dispatch { config, port } => {
            let mut options = DispatchOptions::load(config)?;
            if let Some(port) = port {
                options.master_port = port;
            }
            info!(
                "Starting dispatcher on port {} (root {})",
                options.master_port, options.root_dir
            );

            let mut dispatch = Dispatch::new(options);
            if !dispatch.run().await {
                error!("Dispatch ended without draining any node");
                std::process::exit(1);
            }
            info!("Dispatch complete");
        }
        Commands::Shutdown { host, port, timeout } => {
            NodeRegistrarDriver::request_shutdown(&host, port, Duration::from_secs(timeout)).await?;
            info!("Shutdown sent to {}:{}", host, port);
        }
        Commands::ShowConfig { config } => {
            let options = DispatchOptions::load(config)?;
            println!("{}", serde_json::to_string_pretty(&options)?);
        }
    }

    Ok(())
}
