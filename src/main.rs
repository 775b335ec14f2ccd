//! `servisor` daemon entry point.
//!
//! Loads the YAML configuration named on the command line (or
//! `servisor.yaml` in the working directory), initialises structured
//! logging from `RUST_LOG`, and runs the supervisor until a termination
//! signal drains the fleet.

use std::path::PathBuf;
use std::process::ExitCode;

use tracing::error;

use servisor::{Config, Supervisor};

fn init_logging() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("servisor.yaml"));

    let cfg = match Config::from_file(&path) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, label = e.as_label(), path = %path.display(), "configuration rejected");
            return ExitCode::FAILURE;
        }
    };

    let supervisor = match Supervisor::builder(cfg).build() {
        Ok(sup) => sup,
        Err(e) => {
            error!(error = %e, label = e.as_label(), "construction failed");
            return ExitCode::FAILURE;
        }
    };

    match supervisor.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, label = e.as_label(), "supervisor stopped with an error");
            ExitCode::FAILURE
        }
    }
}
