use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use llm_desktop_core::config::LauncherConfig;
use llm_desktop_core::python_env;
use llm_desktop_core::supervisor::error::SupervisorError;
use llm_desktop_core::supervisor::{self, Supervisor};

/// Local supervisor for the LLM-Desktop search backend, UI and model server
#[derive(Parser, Debug)]
#[command(name = "llm-desktop")]
#[command(version)]
#[command(about = "Start, stop and inspect the LLM-Desktop services")]
#[command(long_about = None)]
struct Cli {
    /// Project root (defaults to LLM_DESKTOP_ROOT or the nearest directory
    /// containing search/search.py or ui/app.py)
    #[arg(long, global = true, value_name = "DIR")]
    root: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Launch the services and hold the foreground until interrupted (default)
    Start,
    /// Stop processes recorded in PID files
    Stop {
        /// Also stop unrecorded processes matched by command line or port
        #[arg(long)]
        all: bool,
    },
    /// Show running services and bound ports
    Status {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Prepare the Python environment and report readiness
    Bootstrap,
}

fn setup_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_tracing(cli.verbose);

    let config = LauncherConfig::load(cli.root);
    tracing::debug!("Project root: {}", config.root.display());

    let outcome = match cli.command.unwrap_or(Command::Start) {
        Command::Start => start(config).await,
        Command::Stop { all } => {
            let mut sup = Supervisor::new(config);
            let swept = sup.stop(all).await;
            if all {
                println!("Stopped {} unrecorded process(es)", swept.len());
            }
            Ok(())
        }
        Command::Status { json } => status(config, json),
        Command::Bootstrap => bootstrap(config).await,
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report(&e);
            if e.is_fatal() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
    }
}

async fn start(config: LauncherConfig) -> Result<(), SupervisorError> {
    let mut sup = Supervisor::new(config);
    supervisor::install_signal_handlers(sup.cancellation_token())?;
    sup.run().await.map(|_| ())
}

fn status(config: LauncherConfig, json: bool) -> Result<(), SupervisorError> {
    let report = Supervisor::new(config).status();
    if json {
        let text = serde_json::to_string_pretty(&report).map_err(anyhow::Error::from)?;
        println!("{}", text);
    } else {
        print!("{}", report);
        if !report.any_running() {
            println!("No LLM-Desktop services are running.");
        }
    }
    Ok(())
}

async fn bootstrap(config: LauncherConfig) -> Result<(), SupervisorError> {
    let readiness = python_env::bootstrap(&config).await;
    let text = serde_json::to_string_pretty(&readiness).map_err(anyhow::Error::from)?;
    println!("{}", text);
    if readiness.ready {
        Ok(())
    } else {
        Err(anyhow::anyhow!(
            "environment not ready: {}",
            readiness.error.unwrap_or_default()
        )
        .into())
    }
}

fn report(err: &SupervisorError) {
    eprintln!("Error [{}]: {}", err.error_code(), err);
    if let SupervisorError::EarlyProcessExit {
        log_path, log_tail, ..
    } = err
    {
        eprintln!("--- last {} lines of {} ---", log_tail.len(), log_path.display());
        for line in log_tail {
            eprintln!("{}", line);
        }
        eprintln!("--- end of log ---");
    }
}
