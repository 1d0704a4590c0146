//! Worker fleet manager: the periodic control loop that expires old VMs,
//! reclaims work from silent workers, and provisions capacity when the
//! backlog warrants it.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use log::{error, info, warn};

use crate::db::Store;
use crate::hetzner::{CloudProvider, CreateServerRequest};
use crate::model::{Worker, WorkerStatus, WorkerType};

/// The provider bills by the hour; VMs are recycled before a second hour
/// starts.
pub const VM_MAX_AGE_MINUTES: i64 = 55;
/// A worker that has not heartbeated for this long loses its leases.
pub const WORKER_TIMEOUT_MINUTES: i64 = 10;
/// Scale up only when the oldest queued build has waited this long.
pub const QUEUE_STALE_HOURS: i64 = 10;

#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub max_vm_count: i64,
    pub build_queue_threshold: usize,
    pub server_type: String,
    pub image: String,
    pub location: String,
    pub ssh_key: Option<String>,
    /// URI under which workers reach this controller.
    pub external_uri: String,
    /// Where the cloud-init payload downloads the worker binary from.
    pub worker_binary_url: String,
}

impl Default for FleetConfig {
    fn default() -> Self {
        FleetConfig {
            max_vm_count: 1,
            build_queue_threshold: 10,
            server_type: "cpx11".into(),
            image: "fedora-33".into(),
            location: "nbg1".into(),
            ssh_key: None,
            external_uri: "http://127.0.0.1:8080".into(),
            worker_binary_url: "https://example.invalid/aurci-worker".into(),
        }
    }
}

pub struct FleetManager {
    store: Store,
    cloud: Arc<dyn CloudProvider>,
    config: FleetConfig,
}

impl FleetManager {
    pub fn new(store: Store, cloud: Arc<dyn CloudProvider>, config: FleetConfig) -> Self {
        FleetManager {
            store,
            cloud,
            config,
        }
    }

    /// One control-loop pass. Phase failures are logged, never fatal: the
    /// next tick retries.
    pub async fn tick(&self, now: DateTime<Utc>) {
        if let Err(e) = self.expire_old_vms(now).await {
            error!("fleet: failed to expire old VMs: {e:#}");
        }
        if let Err(e) = self.reclaim_timed_out_workers(now).await {
            error!("fleet: failed to reclaim timed-out workers: {e:#}");
        }
        if let Err(e) = self.provision_if_needed(now).await {
            error!("fleet: failed to provision workers: {e:#}");
        }
    }

    /// Destroy Hetzner VMs older than [`VM_MAX_AGE_MINUTES`] and put their
    /// in-flight builds back into the queue.
    async fn expire_old_vms(&self, now: DateTime<Utc>) -> Result<()> {
        let cutoff = now - Duration::minutes(VM_MAX_AGE_MINUTES);
        for worker in self.store.expired_hetzner_workers(cutoff).await? {
            info!("fleet: removing expired VM {}", worker.name);

            match self.cloud.get_server(worker.provider_id).await {
                Ok(Some(server)) => {
                    if let Err(e) = self.cloud.delete_server(server.id).await {
                        error!("fleet: failed to delete VM {}: {e:#}", worker.name);
                        continue;
                    }
                }
                Ok(None) => {
                    warn!(
                        "fleet: VM {} (provider id {}) is already gone",
                        worker.name, worker.provider_id
                    );
                }
                Err(e) => {
                    error!("fleet: failed to look up VM {}: {e:#}", worker.name);
                    continue;
                }
            }

            self.store.stop_worker(worker.id, now).await?;
            let requeued = self.store.requeue_builds_of_worker(worker.id).await?;
            if requeued > 0 {
                info!(
                    "fleet: requeued {requeued} build(s) of expired VM {}",
                    worker.name
                );
            }
        }
        Ok(())
    }

    /// Revoke leases of workers whose last heartbeat is older than
    /// [`WORKER_TIMEOUT_MINUTES`] and stop them, so the same worker is not
    /// reclaimed again on every tick.
    async fn reclaim_timed_out_workers(&self, now: DateTime<Utc>) -> Result<()> {
        let cutoff = now - Duration::minutes(WORKER_TIMEOUT_MINUTES);
        for worker in self.store.timed_out_workers(cutoff).await? {
            let requeued = self.store.requeue_builds_of_worker(worker.id).await?;
            self.store.stop_worker(worker.id, now).await?;
            warn!(
                "fleet: worker {} ({}) missed its heartbeats, stopped it and requeued {requeued} build(s)",
                worker.id, worker.name
            );
        }
        Ok(())
    }

    /// Create one VM when the pool is below its cap and the backlog is both
    /// long enough and stale enough to justify the spend.
    async fn provision_if_needed(&self, now: DateTime<Utc>) -> Result<()> {
        let active = self.store.active_worker_count().await?;
        if active >= self.config.max_vm_count {
            return Ok(());
        }

        let queue = self.store.pending_package_builds(now, None).await?;
        if queue.len() < self.config.build_queue_threshold {
            return Ok(());
        }
        let oldest = &queue[0];
        if oldest.created_at >= now - Duration::hours(QUEUE_STALE_HOURS) {
            return Ok(());
        }

        let request = CreateServerRequest {
            name: format!("worker-{}", now.format("%Y-%m-%d-%H-%M-%S")),
            server_type: self.config.server_type.clone(),
            image: self.config.image.clone(),
            location: self.config.location.clone(),
            ssh_key: self.config.ssh_key.clone(),
            user_data: cloud_init(&self.config.external_uri, &self.config.worker_binary_url),
        };
        let server = self.cloud.create_server(&request).await?;
        info!("fleet: created VM {} (provider id {})", server.name, server.id);

        let worker = Worker {
            id: 0,
            worker_type: WorkerType::Hetzner,
            status: WorkerStatus::Created,
            provider_id: server.id,
            name: server.name.clone(),
            ipv4: server.ipv4.clone(),
            ipv6: server.ipv6.clone(),
            created_at: now,
            updated_at: now,
        };
        if let Err(e) = self.store.insert_worker(&worker).await {
            error!(
                "fleet: failed to insert VM {} (provider id {}): {e:#}",
                server.name, server.id
            );
            // The server exists but we lost track of it; delete it again
            // rather than leak a billed machine.
            if let Err(e) = self.cloud.delete_server(server.id).await {
                error!("fleet: failed to delete untracked VM {}: {e:#}", server.name);
            }
        }
        Ok(())
    }
}

/// Cloud-init payload: install the container runtime, fetch the worker
/// binary, and run it against this controller under a hardened unit.
fn cloud_init(controller_uri: &str, worker_binary_url: &str) -> String {
    format!(
        r#"#cloud-config
write_files:
- content: |
    [Unit]
    Description=AUR CI Worker
    After=docker.service
    After=network-online.target
    Wants=network-online.target

    [Service]
    ExecStart=/usr/local/bin/aurci-worker --controller '{controller_uri}' --work-amount 1
    DynamicUser=yes
    ProtectSystem=strict
    PrivateTmp=yes
    NoNewPrivileges=yes
    ProtectControlGroups=yes
    ProtectKernelTunables=yes
    RemoveIPC=yes
    Group=docker
    Restart=always

    [Install]
    WantedBy=default.target
  path: /etc/systemd/system/aurci-worker.service
runcmd:
- dnf config-manager --add-repo https://download.docker.com/linux/fedora/docker-ce.repo
- dnf install -y docker-ce
- curl -s -o /usr/local/bin/aurci-worker '{worker_binary_url}'
- chmod +x /usr/local/bin/aurci-worker
- systemctl enable --now docker aurci-worker.service"#
    )
}
