use std::process::ExitCode;

use tracing_subscriber::EnvFilter;
use wsrelay::config::Config;

fn main() -> ExitCode {
    let config = match Config::from_args(std::env::args()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("wsrelay: {err}");
            return ExitCode::FAILURE;
        }
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match &config.log_path {
        Some(path) => match std::fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => subscriber.with_writer(std::sync::Mutex::new(file)).init(),
            Err(err) => {
                eprintln!("wsrelay: could not open log file {path}: {err}");
                return ExitCode::FAILURE;
            }
        },
        None => subscriber.init(),
    }

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("wsrelay: failed to start runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(wsrelay::server::run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("wsrelay: {err}");
            ExitCode::FAILURE
        }
    }
}
