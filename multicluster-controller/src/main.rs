//! Command line entrypoint for the multicluster controller
use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kube::{Client, CustomResourceExt};
use kube_multicluster::{controller, Config, MultiClusterResource};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(version, about)]
struct App {
    /// Log line format
    #[arg(long, value_enum, default_value_t, global = true)]
    log_format: LogFormat,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Reconcile declarations until interrupted
    Run {
        /// Controller configuration file
        #[arg(long, short)]
        config: PathBuf,
    },
    /// Print the MultiClusterResource CustomResourceDefinition
    Crd,
}

#[derive(ValueEnum, Clone, Copy, Default)]
enum LogFormat {
    #[default]
    Text,
    Json,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,kube=warn"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let app = App::parse();
    match app.command {
        Command::Crd => {
            print!("{}", serde_yaml::to_string(&MultiClusterResource::crd())?);
        }
        Command::Run { config } => {
            init_tracing(app.log_format);
            let config = Config::load(&config).with_context(|| format!("loading {}", config.display()))?;
            let client = Client::try_default().await.context("connecting to the control cluster")?;

            let cancel = CancellationToken::new();
            tokio::spawn({
                let cancel = cancel.clone();
                async move {
                    match tokio::signal::ctrl_c().await {
                        Ok(()) => {
                            info!("interrupted, cancelling in-flight passes");
                            cancel.cancel();
                        }
                        Err(err) => warn!(error = %err, "cannot listen for ctrl-c"),
                    }
                }
            });
            controller::run(client, config, cancel).await?;
        }
    }
    Ok(())
}
