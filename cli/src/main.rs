//! Command-line entry point wiring the dataset model and driver crates
//! together: load configuration, build the daemon/ledger clients, and
//! dispatch one of a handful of operator subcommands.

use std::collections::HashMap;
use std::time::Duration;

use clap::{Parser, Subcommand};
use common::config::Settings;
use common::telemetry;
use driver::automation::{Automation, CallMethodRequest, MaybeScoped};
use driver::daemon::DaemonClient;
use driver::urd::UrdClient;
use tracing::info;

#[derive(Parser)]
#[command(name = "accel", about = "Automation driver CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Submit a method and wait for it to go idle.
    Build {
        method: String,
        #[arg(long)]
        why_build: bool,
    },
    /// Print the daemon's current status once.
    Status,
    /// List the daemon's registered methods and their declared dependencies.
    Methods,
    /// Fetch the latest ledger entry for a path without registering a dependency.
    UrdLatest { path: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load().unwrap_or_else(|e| {
        eprintln!("warning: failed to load config ({e}), using defaults");
        Settings::default()
    });
    settings
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;

    telemetry::init_logging(&settings.observability.log_level, settings.observability.json)?;
    if let Some(port) = settings.observability.metrics_port {
        telemetry::init_metrics(port)?;
    }

    info!(daemon_url = %settings.daemon.url, "starting accel cli");

    let cli = Cli::parse();

    let daemon = DaemonClient::new(
        settings.daemon.url.clone(),
        Duration::from_secs(settings.daemon.request_timeout_seconds),
    )?;

    match cli.command {
        Command::Build { method, why_build } => {
            let mut automation = Automation::new(daemon, settings.daemon.url.clone(), settings.daemon.dataset.clone()).await?;
            let mut request = CallMethodRequest::new(method);
            request.why_build = why_build;
            request.options = MaybeScoped::Flat(HashMap::new());
            let jobid = automation.call_method(request).await?;
            println!("{jobid}");
        }
        Command::Status => {
            let status = daemon.status(None, 0, false).await?;
            println!("{}", serde_json::to_string_pretty(&serde_json::json!({
                "idle": status.idle,
                "current": status.current,
                "last_error": status.last_error,
            }))?);
        }
        Command::Methods => {
            let methods = daemon.methods().await?;
            for (name, info) in methods {
                println!("{name}: {:?}", info.dep);
            }
        }
        Command::UrdLatest { path } => {
            let mut urd = UrdClient::new(settings.urd.url.clone(), settings.urd.user.clone(), &settings.urd.password)?;
            urd.begin(path.clone(), None, None, false)?;
            match urd.peek_latest(&path).await? {
                Some(response) if !response.is_empty() => {
                    println!("{}", serde_json::to_string_pretty(&response)?);
                }
                _ => println!("no prior run recorded for {path}"),
            }
            urd.abort();
        }
    }

    Ok(())
}
