//! Build dispatcher: the controller side of the worker protocol.
//!
//! Workers are identified by their source address. Claims race against
//! other workers and the fleet manager; the compare-and-set in
//! [`Store::claim_build`] decides the winner, losers just receive a
//! shorter work list.

use std::net::IpAddr;

use anyhow::Context;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use log::{info, warn};
use thiserror::Error;

use crate::api::{Work, WorkResultReport};
use crate::db::Store;
use crate::mirror::SourceMirror;
use crate::model::{WorkResult, WorkResultStatus, Worker, WorkerStatus, WorkerType};

#[derive(Debug, Error)]
pub enum DispatchError {
    /// The caller's address is not a registered worker.
    #[error("worker not found")]
    UnknownWorker,
    #[error("build {0} not found")]
    UnknownBuild(i64),
    #[error("invalid work result status {0}")]
    InvalidResultStatus(i64),
    /// A result arrived for a build that already reached a terminal state.
    #[error("build {0} already finished")]
    BuildAlreadyFinished(i64),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Register or refresh the worker behind `ip`. Unknown callers are inserted
/// as self-registered `Other` workers; known ones get their lease renewed.
pub async fn heartbeat(
    store: &Store,
    ip: IpAddr,
    hostname: &str,
    now: DateTime<Utc>,
) -> Result<(), DispatchError> {
    let address = ip.to_string();
    match store.worker_by_ip(&address).await? {
        Some(worker) => {
            store.touch_worker(worker.id, now).await?;
        }
        None => {
            let (ipv4, ipv6) = match ip {
                IpAddr::V4(_) => (address, String::new()),
                IpAddr::V6(_) => (String::new(), address),
            };
            store
                .insert_worker(&Worker {
                    id: 0,
                    worker_type: WorkerType::Other,
                    status: WorkerStatus::Running,
                    provider_id: 0,
                    name: hostname.to_string(),
                    ipv4,
                    ipv6,
                    created_at: now,
                    updated_at: now,
                })
                .await?;
            info!("registered new worker {hostname} at {ip}");
        }
    }
    Ok(())
}

/// Hand out up to `amount` pending builds to the worker behind `ip`.
///
/// Builds are served oldest first from the 24-hour queue. Each one is
/// packaged with its dependency list and a base64 source tar, then claimed
/// via compare-and-set; builds lost to a concurrent claimant are dropped
/// from the response.
pub async fn request_work(
    store: &Store,
    mirror: &SourceMirror,
    ip: IpAddr,
    amount: i64,
    now: DateTime<Utc>,
) -> Result<Vec<Work>, DispatchError> {
    let worker = store
        .worker_by_ip(&ip.to_string())
        .await?
        .ok_or(DispatchError::UnknownWorker)?;
    let amount = amount.max(1);

    let mut work_list = vec![];
    for build in store.pending_package_builds(now, Some(amount)).await? {
        let dependencies = store.package_dependencies(build.package_base_id).await?;
        let hash = store
            .commit_hash(build.commit_id)
            .await?
            .with_context(|| format!("build {} references missing commit", build.id))?;
        let tar = mirror
            .snapshot_tar(&build.package_base, &hash)
            .await
            .with_context(|| format!("failed to snapshot {} at {hash}", build.package_base))?;

        if !store.claim_build(build.id, worker.id, now).await? {
            // Someone else won the row between selection and claim.
            continue;
        }
        work_list.push(Work {
            build_id: build.id,
            package_base: build.package_base,
            dependencies,
            package_base_data_base64: BASE64.encode(tar),
        });
    }

    if !work_list.is_empty() {
        info!(
            "dispatched {} build(s) to worker {} ({})",
            work_list.len(),
            worker.id,
            worker.name
        );
    }
    Ok(work_list)
}

/// Record a worker's result and move the build to its next state.
///
/// Success, failure and timeout are terminal and stamp `finished_at`; an
/// internal error sends the build back to the queue. Both writes happen in
/// one transaction, and a build that is already terminal rejects any
/// further report.
pub async fn report_work_result(
    store: &Store,
    ip: IpAddr,
    report: &WorkResultReport,
    now: DateTime<Utc>,
) -> Result<(), DispatchError> {
    store
        .worker_by_ip(&ip.to_string())
        .await?
        .ok_or(DispatchError::UnknownWorker)?;

    let status = WorkResultStatus::from_i64(report.status)
        .map_err(|_| DispatchError::InvalidResultStatus(report.status))?;
    let mut build = store
        .get_build(report.build_id)
        .await?
        .ok_or(DispatchError::UnknownBuild(report.build_id))?;

    build
        .apply_result(status, now)
        .map_err(|_| DispatchError::BuildAlreadyFinished(build.id))?;

    let result = WorkResult {
        id: 0,
        build_id: report.build_id,
        status,
        pacman_exit_code: report.pacman_exit_code,
        pacman_log_base64: report.pacman_log_base64.clone(),
        makepkg_extract_exit_code: report.makepkg_extract_exit_code,
        makepkg_extract_log_base64: report.makepkg_extract_log_base64.clone(),
        makepkg_build_exit_code: report.makepkg_build_exit_code,
        makepkg_build_log_base64: report.makepkg_build_log_base64.clone(),
        created_at: now,
    };
    store.record_work_result(&result, &build).await?;

    if status == WorkResultStatus::InternalError {
        warn!("build {} hit a worker internal error, requeued", build.id);
    } else {
        info!("build {} finished as {:?}", build.id, build.status);
    }
    Ok(())
}
