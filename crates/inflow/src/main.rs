//! `inflow` service binary.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use inflow::config::Settings;
use inflow::{Service, CONFIG_FILE_NAME, STOP_GRACE};
use inflow_db::UrlConnector;
use inflow_logging::{init_logging, LogConfig};
use tracing::{error, info};

/// Actors get this long to exit once shutdown is signalled.
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "inflow", about = "Load finished files from watched directories into a database")]
struct Cli {
    /// Application directory holding inflow.toml; relative paths resolve against it
    #[arg(long, env = "INFLOW_APP_DIR", default_value = ".")]
    app_dir: PathBuf,

    /// Enable verbose logging (debug to stderr and the process log)
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Print the default settings document and exit
    #[arg(long)]
    print_default_config: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.print_default_config {
        return match Settings::default().to_toml_string() {
            Ok(text) => {
                print!("{}", text);
                ExitCode::SUCCESS
            }
            Err(err) => {
                eprintln!("{:?}", err);
                ExitCode::from(1)
            }
        };
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{:?}", err);
            eprintln!("{:?}", err);
            ExitCode::from(1)
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let app_dir = if cli.app_dir.is_absolute() {
        cli.app_dir
    } else {
        std::env::current_dir()
            .context("Failed to read current directory")?
            .join(&cli.app_dir)
    };
    let config_path = app_dir.join(CONFIG_FILE_NAME);
    let (settings, notes) = Settings::load_or_create(&config_path)
        .with_context(|| format!("Failed to load settings: {}", config_path.display()))?;

    init_logging(LogConfig {
        app_name: "inflow",
        log_dir: Some(settings.log_dir(&app_dir)),
        verbose: cli.verbose,
        allow_trace: settings.log.allow_trace,
    })?;
    info!(app_dir = %app_dir.display(), "inflow starting");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("inflow")
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(async move {
        let mut handle = Service::start(app_dir, settings, Arc::new(UrlConnector));
        for note in notes {
            handle.telemetry().debug("service", note);
        }

        tokio::select! {
            _ = handle.wait_for_stop() => {
                info!(grace_secs = STOP_GRACE.as_secs(), "stop time reached");
                tokio::select! {
                    _ = tokio::time::sleep(STOP_GRACE) => {}
                    _ = tokio::signal::ctrl_c() => info!("interrupted during stop grace"),
                }
            }
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for ctrl-c")?;
                info!("interrupt received, shutting down");
            }
        }

        handle.shutdown(JOIN_TIMEOUT).await;
        Ok::<(), anyhow::Error>(())
    })
}
