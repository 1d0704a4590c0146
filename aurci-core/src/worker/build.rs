//! Per-task build execution: one container, five phases, one wall-clock
//! deadline.
//!
//! Phase plan (strictly sequential):
//! 1. create the idle build container
//! 2. start it
//! 3. prepare: add the `ci` user, unpack the rootfs skeleton and the
//!    package sources, fix ownership
//! 4. `pacman`: install dependencies (logged phase)
//! 5. `makepkg --nobuild`: download and extract sources (logged phase)
//! 6. `makepkg --noextract`: build (logged phase)
//!
//! A deadline hit anywhere maps to TIMEOUT, any other orchestration error
//! to INTERNAL_ERROR, a non-zero phase exit to FAILED, and three clean
//! phases to SUCCESS.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bollard::Docker;
use log::{info, warn};

use crate::api::{Work, WorkResultReport};
use crate::model::WorkResultStatus;

use super::container;

/// Wall-clock budget for one task, from container creation to the last
/// phase.
pub const TASK_DEADLINE: Duration = Duration::from_secs(30 * 60);

/// Phase logs are capped to their last MiB so a runaway build cannot blow
/// up the result payload.
pub const LOG_CAP_BYTES: usize = 1024 * 1024;

/// Execute one work unit and produce the report to send back.
///
/// Never fails: every outcome, including orchestration errors, is encoded
/// in the report status. The build container is removed on the way out.
pub async fn execute(docker: &Docker, work: &Work, rootfs: &[u8]) -> WorkResultReport {
    info!("[{}] handling work request", work.package_base);

    let mut report = WorkResultReport {
        build_id: work.build_id,
        status: WorkResultStatus::InternalError.as_i64(),
        pacman_exit_code: 0,
        pacman_log_base64: String::new(),
        makepkg_extract_exit_code: 0,
        makepkg_extract_log_base64: String::new(),
        makepkg_build_exit_code: 0,
        makepkg_build_log_base64: String::new(),
    };

    let mut container_id = None;
    match tokio::time::timeout(
        TASK_DEADLINE,
        run_phases(docker, work, rootfs, &mut report, &mut container_id),
    )
    .await
    {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!("[{}] build errored: {e:#}", work.package_base);
            report.status = WorkResultStatus::InternalError.as_i64();
        }
        Err(_) => {
            warn!("[{}] build hit the {TASK_DEADLINE:?} deadline", work.package_base);
            report.status = WorkResultStatus::Timeout.as_i64();
        }
    }

    // Cleanup runs outside the deadline: an expired budget must not leak
    // the container.
    if let Some(id) = container_id {
        if let Err(e) = container::remove(docker, &id).await {
            warn!("[{}] failed to remove build container: {e:#}", work.package_base);
        }
    }
    report
}

async fn run_phases(
    docker: &Docker,
    work: &Work,
    rootfs: &[u8],
    report: &mut WorkResultReport,
    container_id: &mut Option<String>,
) -> Result<()> {
    info!("[{}] creating container", work.package_base);
    let id = container::create_build_container(docker, work.build_id, &work.package_base).await?;
    *container_id = Some(id.clone());

    info!("[{}] starting container {id}", work.package_base);
    container::start(docker, &id).await?;

    prepare(docker, work, rootfs, &id).await?;

    info!("[{}] updating system and installing dependencies", work.package_base);
    let pacman = install_dependencies(docker, work, &id).await?;
    report.pacman_exit_code = pacman.exit_code;
    report.pacman_log_base64 = encode_log(&pacman.log);
    if pacman.exit_code > 0 {
        warn!(
            "[{}] pacman failed with exit code {}",
            work.package_base, pacman.exit_code
        );
        report.status = WorkResultStatus::Failed.as_i64();
        return Ok(());
    }

    info!("[{}] downloading and extracting package sources", work.package_base);
    let extract = makepkg(docker, work, &id, "--nobuild").await?;
    report.makepkg_extract_exit_code = extract.exit_code;
    report.makepkg_extract_log_base64 = encode_log(&extract.log);
    if extract.exit_code > 0 {
        warn!(
            "[{}] makepkg --nobuild failed with exit code {}",
            work.package_base, extract.exit_code
        );
        report.status = WorkResultStatus::Failed.as_i64();
        return Ok(());
    }

    info!("[{}] building package", work.package_base);
    let build = makepkg(docker, work, &id, "--noextract").await?;
    report.makepkg_build_exit_code = build.exit_code;
    report.makepkg_build_log_base64 = encode_log(&build.log);
    if build.exit_code > 0 {
        warn!(
            "[{}] makepkg --noextract failed with exit code {}",
            work.package_base, build.exit_code
        );
        report.status = WorkResultStatus::Failed.as_i64();
        return Ok(());
    }

    report.status = WorkResultStatus::Success.as_i64();
    Ok(())
}

/// Set up the build user and deliver the rootfs skeleton and the package
/// sources into the container.
async fn prepare(docker: &Docker, work: &Work, rootfs: &[u8], container_id: &str) -> Result<()> {
    info!("[{}] preparing container and inserting data", work.package_base);

    let setup = container::exec(
        docker,
        container_id,
        &["bash", "-c", "useradd -m ci; mkdir -p /home/ci/aur"],
        None,
        None,
    )
    .await?;
    if setup.exit_code > 0 {
        bail!("user setup exited with code {}", setup.exit_code);
    }

    container::copy_to(docker, container_id, "/", rootfs.to_vec()).await?;

    let sources = BASE64
        .decode(&work.package_base_data_base64)
        .context("work unit carries invalid base64 source data")?;
    container::copy_to(docker, container_id, "/home/ci/aur", sources).await?;

    let chown = container::exec(
        docker,
        container_id,
        &["chown", "-R", "ci:ci", "/home/ci"],
        None,
        None,
    )
    .await?;
    if chown.exit_code > 0 {
        bail!("chown exited with code {}", chown.exit_code);
    }
    Ok(())
}

async fn install_dependencies(
    docker: &Docker,
    work: &Work,
    container_id: &str,
) -> Result<container::ExecOutput> {
    let mut cmd = vec![
        "pacman",
        "-Syu",
        "--noconfirm",
        "--noprogressbar",
        "--needed",
        // Everything after this is a package name, never a pacman flag.
        "--",
    ];
    cmd.extend(work.dependencies.iter().map(String::as_str));
    container::exec(docker, container_id, &cmd, None, None).await
}

async fn makepkg(
    docker: &Docker,
    work: &Work,
    container_id: &str,
    mode: &str,
) -> Result<container::ExecOutput> {
    let workdir = format!("/home/ci/aur/{}", work.package_base);
    container::exec(
        docker,
        container_id,
        &["makepkg", mode],
        Some("ci"),
        Some(&workdir),
    )
    .await
}

fn cap_log(log: &str) -> &str {
    if log.len() <= LOG_CAP_BYTES {
        return log;
    }
    let mut start = log.len() - LOG_CAP_BYTES;
    while !log.is_char_boundary(start) {
        start += 1;
    }
    &log[start..]
}

fn encode_log(log: &str) -> String {
    BASE64.encode(cap_log(log))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_logs_are_kept_verbatim() {
        assert_eq!(cap_log("hello"), "hello");
        let decoded = BASE64.decode(encode_log("hello")).unwrap();
        assert_eq!(decoded, b"hello");
    }

    #[test]
    fn long_logs_keep_the_tail() {
        let log = "a".repeat(LOG_CAP_BYTES) + "tail";
        let capped = cap_log(&log);
        assert_eq!(capped.len(), LOG_CAP_BYTES);
        assert!(capped.ends_with("tail"));
    }

    #[test]
    fn capping_respects_utf8_boundaries() {
        // 'ä' is two bytes; an odd prefix length forces the cap onto a
        // character boundary.
        let log = "ä".repeat(LOG_CAP_BYTES / 2 + 8);
        let capped = cap_log(&log);
        assert!(capped.len() <= LOG_CAP_BYTES);
        assert!(capped.chars().all(|c| c == 'ä'));
    }
}
