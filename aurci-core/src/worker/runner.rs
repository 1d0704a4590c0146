//! The worker main loop: register, heartbeat, poll for work, fan out.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{error, info, warn};
use tokio::task::JoinSet;

use super::{build, client::ControllerClient, container, rootfs};

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub controller_uri: String,
    pub work_amount: u32,
    pub hostname: String,
}

struct WorkerContext {
    docker: bollard::Docker,
    client: ControllerClient,
    rootfs: Vec<u8>,
}

/// Run the worker until the process is killed.
///
/// Fails fast only on startup problems: an unreachable container runtime
/// or a rejected initial heartbeat. Everything later is retried on the
/// next loop iteration.
pub async fn run(options: WorkerOptions) -> Result<()> {
    let client = ControllerClient::new(&options.controller_uri)?;
    let docker = container::connect().await?;
    let rootfs = rootfs::rootfs_tar()?;

    info!(
        "sending initial heartbeat / registration to controller at {}",
        options.controller_uri
    );
    client
        .heartbeat(&options.hostname)
        .await
        .context("initial heartbeat failed")?;

    // Best-effort heartbeat every minute for as long as the loop runs.
    {
        let client = client.clone();
        let hostname = options.hostname.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = client.heartbeat(&hostname).await {
                    warn!("failed to send heartbeat: {e:#}");
                }
            }
        });
    }

    info!("registration successful, requesting work in a loop");
    let ctx = Arc::new(WorkerContext {
        docker,
        client,
        rootfs,
    });

    loop {
        tokio::time::sleep(POLL_INTERVAL).await;

        let work_list = match ctx.client.request_work(options.work_amount).await {
            Ok(work_list) => work_list,
            Err(e) => {
                warn!("failed to request work: {e:#}");
                continue;
            }
        };
        if work_list.is_empty() {
            continue;
        }

        if let Err(e) = container::ensure_image(&ctx.docker).await {
            warn!("failed to pull build image: {e:#}");
        }
        container::remove_stale_containers(&ctx.docker).await;

        let mut tasks = JoinSet::new();
        for work in work_list {
            let ctx = Arc::clone(&ctx);
            tasks.spawn(async move {
                let report = build::execute(&ctx.docker, &work, &ctx.rootfs).await;
                if let Err(e) = ctx.client.report_work_result(&report).await {
                    error!(
                        "[{}] failed to report work result: {e:#}",
                        work.package_base
                    );
                }
            });
        }
        // Wait for the whole round before asking for more work.
        while tasks.join_next().await.is_some() {}
    }
}
