//! Container-runtime plumbing for the worker: image management, build
//! container lifecycle, and the exec primitive every phase runs through.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StartContainerOptions, UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::Docker;
use futures_util::StreamExt;
use log::{info, warn};

/// Base image all package builds run in.
pub const BUILD_IMAGE: &str = "archlinux/archlinux:base-devel";
/// Name prefix of build containers; stale ones are removed by prefix.
pub const CONTAINER_PREFIX: &str = "aur-ci-worker-build";

const EXEC_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// First container API version that accepts an explicit platform.
const PLATFORM_MIN_API: (u64, u64) = (1, 41);

/// Output of one exec'd command: its exit code and the newline-joined log.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub log: String,
}

pub fn container_name(build_id: i64, package_base: &str) -> String {
    format!("{CONTAINER_PREFIX}-{build_id}-{package_base}")
}

/// Connect to the local container runtime and verify the socket answers.
pub async fn connect() -> Result<Docker> {
    let docker =
        Docker::connect_with_local_defaults().context("failed to create container client")?;
    docker
        .ping()
        .await
        .context("container runtime is not reachable")?;
    Ok(docker)
}

/// Pull the build image. A no-op when it is already present locally.
pub async fn ensure_image(docker: &Docker) -> Result<()> {
    info!("pulling {BUILD_IMAGE}");
    let mut pull = docker.create_image(
        Some(CreateImageOptions {
            from_image: BUILD_IMAGE,
            ..Default::default()
        }),
        None,
        None,
    );
    while let Some(progress) = pull.next().await {
        progress.context("failed to pull build image")?;
    }
    Ok(())
}

/// Remove leftover build containers from earlier runs, matching by name
/// prefix. Failures are logged; a stuck leftover must not stall new work.
pub async fn remove_stale_containers(docker: &Docker) {
    let containers = match docker
        .list_containers(Some(ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        }))
        .await
    {
        Ok(containers) => containers,
        Err(e) => {
            warn!("failed to list containers: {e}");
            return;
        }
    };

    let prefix = format!("/{CONTAINER_PREFIX}");
    for container in containers {
        let names = container.names.unwrap_or_default();
        if !names.iter().any(|name| name.starts_with(&prefix)) {
            continue;
        }
        if let Some(id) = container.id {
            info!("removing stale container {}", names.join(", "));
            if let Err(e) = remove(docker, &id).await {
                warn!("failed to remove stale container {id}: {e}");
            }
        }
    }
}

/// Create the idle long-running container a build executes in. Platform is
/// pinned to amd64/linux where the API is new enough to say so.
pub async fn create_build_container(
    docker: &Docker,
    build_id: i64,
    package_base: &str,
) -> Result<String> {
    let client_version = docker.client_version();
    let client_version_str = format!(
        "{}.{}",
        client_version.major_version, client_version.minor_version
    );
    let platform = if api_at_least(&client_version_str, PLATFORM_MIN_API) {
        Some("linux/amd64".to_string())
    } else {
        None
    };
    let created = docker
        .create_container(
            Some(CreateContainerOptions {
                name: container_name(build_id, package_base),
                platform,
            }),
            Config {
                image: Some(BUILD_IMAGE.to_string()),
                // The container has to idle forever so each phase can exec
                // into it.
                cmd: Some(vec!["tail".into(), "-f".into(), "/dev/null".into()]),
                ..Default::default()
            },
        )
        .await
        .context("failed to create build container")?;
    Ok(created.id)
}

pub async fn start(docker: &Docker, container_id: &str) -> Result<()> {
    docker
        .start_container(container_id, None::<StartContainerOptions<String>>)
        .await
        .context("failed to start build container")
}

pub async fn remove(docker: &Docker, container_id: &str) -> Result<()> {
    docker
        .remove_container(
            container_id,
            Some(RemoveContainerOptions {
                force: true,
                v: true,
                ..Default::default()
            }),
        )
        .await
        .with_context(|| format!("failed to remove container {container_id}"))
}

/// Unpack a tar archive into the container at `path`.
pub async fn copy_to(docker: &Docker, container_id: &str, path: &str, tar: Vec<u8>) -> Result<()> {
    docker
        .upload_to_container(
            container_id,
            Some(UploadToContainerOptions {
                path,
                ..Default::default()
            }),
            tar.into(),
        )
        .await
        .with_context(|| format!("failed to copy archive to {path}"))
}

/// Run one command in the container and wait for it to finish.
///
/// exec-create / exec-attach, then poll the exec state every 100 ms until
/// it stops running; the attached stream is drained concurrently and
/// joined line by line.
pub async fn exec(
    docker: &Docker,
    container_id: &str,
    cmd: &[&str],
    user: Option<&str>,
    working_dir: Option<&str>,
) -> Result<ExecOutput> {
    let exec = docker
        .create_exec(
            container_id,
            CreateExecOptions {
                cmd: Some(cmd.iter().map(|s| s.to_string()).collect()),
                user: user.map(str::to_string),
                working_dir: working_dir.map(str::to_string),
                attach_stdout: Some(true),
                attach_stderr: Some(true),
                ..Default::default()
            },
        )
        .await
        .context("failed to create exec")?;

    let output = match docker
        .start_exec(&exec.id, None)
        .await
        .context("failed to attach exec")?
    {
        StartExecResults::Attached { output, .. } => output,
        StartExecResults::Detached => return Err(anyhow!("exec unexpectedly started detached")),
    };

    let collector = tokio::spawn(async move {
        let mut raw = Vec::new();
        let mut output = output;
        while let Some(chunk) = output.next().await {
            match chunk {
                Ok(message) => raw.extend_from_slice(&message.into_bytes()),
                Err(_) => break,
            }
        }
        raw
    });

    let exit_code = loop {
        let state = docker
            .inspect_exec(&exec.id)
            .await
            .context("failed to inspect exec")?;
        if state.running != Some(true) {
            break state.exit_code.unwrap_or(0);
        }
        tokio::time::sleep(EXEC_POLL_INTERVAL).await;
    };

    let raw = collector.await.unwrap_or_default();
    Ok(ExecOutput {
        exit_code,
        log: join_lines(&raw),
    })
}

fn join_lines(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .lines()
        .collect::<Vec<_>>()
        .join("\n")
}

fn api_at_least(version: &str, (major, minor): (u64, u64)) -> bool {
    let mut parts = version.split('.');
    let got_major: u64 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let got_minor: u64 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    (got_major, got_minor) >= (major, minor)
}
