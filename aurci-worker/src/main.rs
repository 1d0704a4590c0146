use anyhow::{bail, Result};
use clap::Parser;

use aurci_core::worker::{self, WorkerOptions};

/// Build worker: polls the controller for work and executes package builds
/// in containers.
#[derive(Debug, Parser)]
#[command(name = "aurci-worker", version)]
struct Args {
    /// Controller URI
    #[arg(long, env = "CONTROLLER_URI", default_value = "http://127.0.0.1:8080")]
    controller: String,

    /// Amount of packages to build at once
    #[arg(long = "work-amount", env = "WORK_AMOUNT", default_value_t = 1)]
    work_amount: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    if args.controller.is_empty() {
        bail!("missing controller URI");
    }
    let hostname = gethostname::gethostname().to_string_lossy().into_owned();

    worker::run(WorkerOptions {
        controller_uri: args.controller,
        work_amount: args.work_amount.max(1),
        hostname,
    })
    .await
}
