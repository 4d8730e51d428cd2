//! Command-line entry point for the acquisition coordinator.
//!
//! ```bash
//! trawl_daq --config camtrawl.toml
//! trawl_daq --config camtrawl.toml --trigger-limit 100 --output /data/test
//! trawl_daq --config camtrawl.toml --check-config
//! ```
//!
//! The process exit code reflects why the run ended; see
//! [`TerminationReason::exit_code`].

use anyhow::Context;
use clap::Parser;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use trawl_daq::app::App;
use trawl_daq::config::Settings;
use trawl_daq::error::{DaqError, TerminationReason};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const LOG_FILE: &str = "acquisition.log";

#[derive(Parser, Debug)]
#[command(author, version, about = "Multi-camera underwater acquisition coordinator")]
struct Args {
    /// Settings file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Root directory for run output, overriding the settings file
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Number of trigger cycles to run; -1 runs until stopped
    #[arg(long, allow_hyphen_values = true)]
    trigger_limit: Option<i64>,

    /// Trigger rate in Hz
    #[arg(long)]
    trigger_rate: Option<f64>,

    /// Validate the settings, print them and exit
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let code = match run(args).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{:#}", e), "Acquisition failed");
            eprintln!("error: {:#}", e);
            failure_code(&e)
        }
    };
    std::process::exit(code);
}

async fn run(args: Args) -> anyhow::Result<i32> {
    let mut settings = Settings::load(args.config.as_deref())
        .map_err(DaqError::from)
        .context("loading settings")?;
    if let Some(output) = args.output {
        settings.application.output_path = output;
    }
    if let Some(limit) = args.trigger_limit {
        settings.acquisition.trigger_limit = limit;
    }
    if let Some(rate) = args.trigger_rate {
        settings.acquisition.trigger_rate = rate;
    }
    settings
        .validate()
        .map_err(DaqError::from)
        .context("validating command-line overrides")?;

    if args.check_config {
        let rendered = toml::to_string_pretty(&settings).context("rendering settings")?;
        println!("{}", rendered);
        return Ok(0);
    }

    let app = App::create(settings.clone()).context("preparing collection run")?;
    init_logging(&settings.application.log_level, app.layout().logs_dir());
    info!(version = env!("CARGO_PKG_VERSION"), "trawl_daq starting");

    let session = app.session();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, stopping acquisition");
                session.request_stop(TerminationReason::Operator);
            }
            Err(e) => warn!(error = %e, "Could not install interrupt handler"),
        }
    });

    let reason = app.run().await.context("running acquisition")?;
    Ok(reason.map(|r| r.exit_code()).unwrap_or(0))
}

/// Console output plus a copy of every line in the run's log directory.
/// `RUST_LOG` overrides the configured level.
fn init_logging(level: &str, logs_dir: &Path) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("trawl_daq={}", level)));

    let file_layer = match File::create(logs_dir.join(LOG_FILE)) {
        Ok(file) => Some(fmt::layer().with_ansi(false).with_writer(Arc::new(file))),
        Err(e) => {
            eprintln!("warning: cannot write {}: {}", logs_dir.join(LOG_FILE).display(), e);
            None
        }
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .init();
}

/// Exit code for a run that never reached a termination reason.
fn failure_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<DaqError>() {
        Some(DaqError::Configuration(_)) => TerminationReason::ConfigurationError.exit_code(),
        Some(DaqError::OutputUnwritable(_)) => TerminationReason::OutputUnwritable.exit_code(),
        _ => 1,
    }
}
