use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::info;

use strata_server::config::InstanceConfig;
use strata_server::server::Server;
use strata_server::trace;

/// Exit codes of the server process.
const EXIT_INVALID_CONFIG: u8 = 1;
const EXIT_LOG_INIT_FAILED: u8 = 2;
const EXIT_INIT_FAILED: u8 = 3;

#[derive(Debug, Parser)]
#[command(name = "stratad", version, about = "strata database server")]
pub struct Args {
    /// Instance name; the options file is looked up as 'config/<name>.json'.
    #[clap(short, long)]
    instance: Option<String>,

    /// Explicit options file path, overrides --instance lookup.
    #[clap(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Log level override.
    #[clap(short = 'l', long)]
    log_level: Option<String>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("invalid configuration: {:#}", err);
            return ExitCode::from(EXIT_INVALID_CONFIG);
        }
    };

    let log_dir = config.log_dir();
    let log_level = args.log_level.as_deref().unwrap_or_else(|| config.log_level()).to_string();
    if std::fs::create_dir_all(&log_dir).is_err() {
        eprintln!("cannot create log directory {}", log_dir.display());
        return ExitCode::from(EXIT_LOG_INIT_FAILED);
    }
    let _log_guards = match trace::init_logging(&log_dir, &log_level) {
        Ok(guards) => guards,
        Err(err) => {
            eprintln!("cannot initialize logging: {:#}", err);
            return ExitCode::from(EXIT_LOG_INIT_FAILED);
        }
    };
    info!("stratad starting, instance '{}'", config.instance);

    let server = match Server::start(&config) {
        Ok(server) => server,
        Err(err) => {
            log::error!("initialization failed: {:#}", err);
            eprintln!("initialization failed: {:#}", err);
            return ExitCode::from(EXIT_INIT_FAILED);
        }
    };

    // One atomic flag, one interrupting signal: enough to unblock every
    // accept loop and the wait below.
    let terminate = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        if let Err(err) = signal_hook::flag::register(signal, terminate.clone()) {
            log::error!("cannot register signal handler: {}", err);
            eprintln!("cannot register signal handler: {}", err);
            return ExitCode::from(EXIT_INIT_FAILED);
        }
    }

    while !terminate.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }
    info!("termination signal received");
    server.stop();
    ExitCode::SUCCESS
}

fn load_config(args: &Args) -> anyhow::Result<InstanceConfig> {
    match (&args.config, &args.instance) {
        (Some(path), _) => InstanceConfig::load(path),
        (None, Some(instance)) => InstanceConfig::load_for_instance(instance),
        (None, None) => Err(anyhow::anyhow!("either --instance or --config is required")),
    }
}
