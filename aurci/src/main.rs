mod server;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Parser;
use log::info;

use aurci_core::aur::AurClient;
use aurci_core::db::Store;
use aurci_core::fleet::{FleetConfig, FleetManager};
use aurci_core::hetzner::HetznerClient;
use aurci_core::intake;
use aurci_core::mirror::{SourceMirror, DEFAULT_UPSTREAM};

use server::AppState;

/// Continuous-integration controller for the Arch Linux User Repository.
#[derive(Debug, Parser)]
#[command(name = "aurci", version)]
struct Args {
    /// Address to bind
    #[arg(long, env = "ADDRESS", default_value = "127.0.0.1:8080")]
    addr: String,

    /// URI under which workers reach this controller
    #[arg(long = "external-uri", env = "EXTERNAL_URI", default_value = "http://127.0.0.1:8080")]
    external_uri: String,

    /// Database driver
    #[arg(long, env = "DB_DRIVER", default_value = "sqlite")]
    driver: String,

    /// Database data source name
    #[arg(long, env = "DB_DSN", default_value = "sqlite:aurci.db")]
    dsn: String,

    /// Git storage path
    #[arg(long = "git", env = "GIT_STORAGE_PATH", default_value = "./git")]
    git: PathBuf,

    /// Hetzner API token
    #[arg(long = "hetzner", env = "HETZNER_API_TOKEN")]
    hetzner: Option<String>,

    /// Hetzner SSH key name
    #[arg(long = "hetzner-ssh-key", env = "HETZNER_SSH_KEY")]
    hetzner_ssh_key: Option<String>,

    /// Maximum number of worker VMs kept at once
    #[arg(long, env = "MAX_VM_COUNT", default_value_t = 1)]
    max_vm_count: i64,

    /// Queue length that justifies provisioning a VM
    #[arg(long, env = "BUILD_QUEUE_THRESHOLD", default_value_t = 10)]
    build_queue_threshold: usize,

    /// URL the cloud-init payload downloads the worker binary from
    #[arg(
        long,
        env = "WORKER_BINARY_URL",
        default_value = "https://example.invalid/aurci-worker"
    )]
    worker_binary_url: String,

    /// Seed a mirror for every known package base, snapshot each head, then
    /// exit
    #[arg(long = "initialize-git")]
    initialize_git: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    if args.driver != "sqlite" {
        bail!("unsupported database driver {} (only sqlite)", args.driver);
    }

    let mirror = SourceMirror::new(&args.git, DEFAULT_UPSTREAM);
    let index = AurClient::new()?;

    if args.initialize_git {
        intake::initialize_mirrors(&mirror, &index).await?;
        return Ok(());
    }

    let hetzner_token = match args.hetzner {
        Some(token) if !token.is_empty() => token,
        _ => bail!("missing hetzner API token"),
    };

    let store = Store::connect(&args.dsn).await?;

    let fleet = FleetManager::new(
        store.clone(),
        Arc::new(HetznerClient::new(hetzner_token)?),
        FleetConfig {
            max_vm_count: args.max_vm_count,
            build_queue_threshold: args.build_queue_threshold,
            ssh_key: args.hetzner_ssh_key,
            external_uri: args.external_uri,
            worker_binary_url: args.worker_binary_url,
            ..Default::default()
        },
    );
    tokio::spawn(async move {
        // The first tick fires immediately, matching a fleet pass on boot.
        let mut ticker = tokio::time::interval(Duration::from_secs(5 * 60));
        loop {
            ticker.tick().await;
            fleet.tick(Utc::now()).await;
        }
    });

    let state = Arc::new(AppState {
        store,
        mirror,
        index,
    });
    let app = server::router(state);

    let listener = tokio::net::TcpListener::bind(&args.addr)
        .await
        .with_context(|| format!("failed to bind {}", args.addr))?;
    info!("starting AUR CI controller on {}", args.addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("HTTP server failed")
}
