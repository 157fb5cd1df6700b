use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::EnvFilter;

mod client;

use client::{LaunchOptions, PluginClient};

/// kv-host - launch a kv-plugin and drive it over gRPC
#[derive(Parser, Debug)]
#[command(name = "kv-host")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Plugin executable to launch
    #[arg(long, env = "KV_PLUGIN_PATH")]
    plugin: PathBuf,

    /// Magic cookie handed to the plugin, as KEY=VALUE
    #[arg(long, value_parser = parse_cookie)]
    cookie: Option<(String, String)>,

    /// App protocol versions this host speaks
    #[arg(long, value_delimiter = ',', default_value = "1")]
    versions: Vec<u32>,

    /// Seconds to wait for the plugin handshake
    #[arg(long, default_value_t = 10)]
    start_timeout: u64,

    /// Seconds to wait for the plugin to exit
    #[arg(long, default_value_t = 5)]
    stop_timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Commands {
    /// Store a value
    Put { key: String, value: String },
    /// Print a stored value
    Get { key: String },
    /// Print the serving status of a health entry
    Health {
        #[arg(default_value = "plugin")]
        service: String,
    },
}

fn parse_cookie(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {raw:?}")),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    match execute(cli).await {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);

            if let Some(source) = e.source() {
                eprintln!("\n{} {}", "Caused by:".yellow(), source);
            }

            std::process::exit(1);
        }
    }
}

async fn execute(cli: Cli) -> Result<()> {
    let options = LaunchOptions {
        plugin: cli.plugin,
        versions: cli.versions,
        cookie: cli.cookie,
        start_timeout: Duration::from_secs(cli.start_timeout),
    };
    let plugin = PluginClient::launch(&options).await?;

    let status = plugin.ping("plugin").await?;
    tracing::info!(
        address = %plugin.handshake().address(),
        status = status.as_str_name(),
        "plugin ready"
    );

    let result = match cli.command {
        Commands::Put { key, value } => plugin.put(&key, value.into_bytes()).await,
        Commands::Get { key } => match plugin.get(&key).await {
            Ok(value) => {
                let mut stdout = std::io::stdout();
                stdout.write_all(&value)?;
                stdout.flush()?;
                Ok(())
            }
            Err(e) => Err(e),
        },
        Commands::Health { service } => match plugin.ping(&service).await {
            Ok(status) => {
                println!("{service}: {}", status.as_str_name());
                Ok(())
            }
            Err(e) => Err(e),
        },
    };

    let exit = plugin.kill(Duration::from_secs(cli.stop_timeout)).await?;
    tracing::debug!(%exit, "plugin exited");

    result
}
