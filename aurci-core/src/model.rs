//! Persistent entities and their state machines.
//!
//! Status discriminants are stable integers shared with the wire protocol
//! and the database; never renumber them.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};

/// An AUR package as reported by the upstream RPC endpoint.
///
/// `name` is the primary key. All packages sharing a `package_base` are
/// built from the same source repository and carry the same
/// `package_base_id`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Package {
    pub name: String,
    pub package_base_id: i64,
    pub package_base: String,
    pub version: String,
    pub description: String,
    pub url: String,
    pub num_votes: i64,
    pub popularity: f64,
    pub out_of_date: Option<DateTime<Utc>>,
    pub maintainer: String,
    pub first_submitted: Option<DateTime<Utc>>,
    pub last_modified: Option<DateTime<Utc>>,
    pub url_path: String,
    pub depends: Vec<String>,
    pub make_depends: Vec<String>,
    pub check_depends: Vec<String>,
    pub opt_depends: Vec<String>,
    pub conflicts: Vec<String>,
    pub provides: Vec<String>,
    pub replaces: Vec<String>,
    pub groups: Vec<String>,
    pub license: Vec<String>,
    pub keywords: Vec<String>,
}

/// One upstream source commit of a package base. Immutable after insert;
/// `(package_base_id, hash)` is unique.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Commit {
    pub id: i64,
    pub package_base_id: i64,
    pub hash: String,
    pub message: String,
    pub author_name: String,
    pub author_email: String,
    pub author_when: DateTime<Utc>,
    pub committer_name: String,
    pub committer_email: String,
    pub committer_when: DateTime<Utc>,
    pub parent_hashes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    Pending = 10,
    Building = 20,
    Timeout = 30,
    Failed = 40,
    Built = 50,
}

impl BuildStatus {
    pub fn as_i64(self) -> i64 {
        self as i64
    }

    pub fn from_i64(v: i64) -> Result<Self> {
        Ok(match v {
            10 => BuildStatus::Pending,
            20 => BuildStatus::Building,
            30 => BuildStatus::Timeout,
            40 => BuildStatus::Failed,
            50 => BuildStatus::Built,
            _ => bail!("unknown build status {v}"),
        })
    }

    /// Terminal statuses never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BuildStatus::Timeout | BuildStatus::Failed | BuildStatus::Built
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildType {
    Package = 10,
    Dependency = 20,
}

impl BuildType {
    pub fn as_i64(self) -> i64 {
        self as i64
    }

    pub fn from_i64(v: i64) -> Result<Self> {
        Ok(match v {
            10 => BuildType::Package,
            20 => BuildType::Dependency,
            _ => bail!("unknown build type {v}"),
        })
    }
}

/// A build task: one package base at one commit.
///
/// State machine:
/// ```text
/// Pending ──claim()──▶ Building ──apply_result()──▶ Timeout | Failed | Built
///                               ──requeue()───────▶ Pending   (worker reaped)
///                               ──apply_result(InternalError)▶ Pending
/// ```
///
/// `worker_id` is 0 while unassigned. `depends_on_build_ids` is schema-only
/// until dependency builds are scheduled recursively.
#[derive(Debug, Clone, PartialEq)]
pub struct Build {
    pub id: i64,
    pub package_base: String,
    pub package_base_id: i64,
    pub commit_id: i64,
    pub worker_id: i64,
    pub status: BuildStatus,
    pub build_type: BuildType,
    pub depends_on_build_ids: Vec<i64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Build {
    /// Transition from `Pending` to `Building`, leased to `worker_id`.
    pub fn claim(&mut self, worker_id: i64, now: DateTime<Utc>) -> Result<()> {
        if self.status != BuildStatus::Pending {
            bail!(
                "invalid transition: build {} → Building (must be Pending, got {:?})",
                self.id,
                self.status
            );
        }
        self.status = BuildStatus::Building;
        self.worker_id = worker_id;
        self.started_at = Some(now);
        Ok(())
    }

    /// Apply a reported work result.
    ///
    /// `InternalError` puts the build back into the queue for a retry;
    /// everything else is terminal and stamps `finished_at`. A build that is
    /// already terminal rejects any further result.
    pub fn apply_result(&mut self, result: WorkResultStatus, now: DateTime<Utc>) -> Result<()> {
        if self.status.is_terminal() {
            bail!(
                "invalid transition: build {} already finished as {:?}",
                self.id,
                self.status
            );
        }
        self.status = result.build_status();
        if self.status == BuildStatus::Pending {
            self.worker_id = 0;
            self.started_at = None;
        } else {
            self.finished_at = Some(now);
        }
        Ok(())
    }

    /// Revoke the worker's lease and return the build to the queue.
    pub fn requeue(&mut self) -> Result<()> {
        if self.status != BuildStatus::Building {
            bail!(
                "invalid transition: build {} → Pending (must be Building, got {:?})",
                self.id,
                self.status
            );
        }
        self.status = BuildStatus::Pending;
        self.worker_id = 0;
        self.started_at = None;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerType {
    Other = 0,
    Hetzner = 10,
}

impl WorkerType {
    pub fn as_i64(self) -> i64 {
        self as i64
    }

    pub fn from_i64(v: i64) -> Result<Self> {
        Ok(match v {
            0 => WorkerType::Other,
            10 => WorkerType::Hetzner,
            _ => bail!("unknown worker type {v}"),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Created = 10,
    Running = 20,
    Stopped = 30,
}

impl WorkerStatus {
    pub fn as_i64(self) -> i64 {
        self as i64
    }

    pub fn from_i64(v: i64) -> Result<Self> {
        Ok(match v {
            10 => WorkerStatus::Created,
            20 => WorkerStatus::Running,
            30 => WorkerStatus::Stopped,
            _ => bail!("unknown worker status {v}"),
        })
    }
}

/// A build agent. Hetzner VMs are inserted as `Created` by the fleet
/// manager and become `Running` on their first heartbeat; foreign workers
/// register themselves as `Running`. `updated_at` is refreshed on every
/// heartbeat and drives the 10-minute reap.
#[derive(Debug, Clone, PartialEq)]
pub struct Worker {
    pub id: i64,
    pub worker_type: WorkerType,
    pub status: WorkerStatus,
    /// Server id on the cloud provider's side; 0 for foreign workers.
    pub provider_id: i64,
    pub name: String,
    pub ipv4: String,
    pub ipv6: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkResultStatus {
    InternalError = 0,
    Timeout = 10,
    Failed = 20,
    Success = 30,
}

impl WorkResultStatus {
    pub fn as_i64(self) -> i64 {
        self as i64
    }

    pub fn from_i64(v: i64) -> Result<Self> {
        Ok(match v {
            0 => WorkResultStatus::InternalError,
            10 => WorkResultStatus::Timeout,
            20 => WorkResultStatus::Failed,
            30 => WorkResultStatus::Success,
            _ => bail!("unknown work result status {v}"),
        })
    }

    /// The build status a result of this kind produces. An internal error
    /// is not the package's fault, so the build goes back to the queue.
    pub fn build_status(self) -> BuildStatus {
        match self {
            WorkResultStatus::Timeout => BuildStatus::Timeout,
            WorkResultStatus::Failed => BuildStatus::Failed,
            WorkResultStatus::Success => BuildStatus::Built,
            WorkResultStatus::InternalError => BuildStatus::Pending,
        }
    }
}

/// Terminal artifact of one build: a status plus the exit code and log of
/// each container phase. Append-only.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkResult {
    pub id: i64,
    pub build_id: i64,
    pub status: WorkResultStatus,
    pub pacman_exit_code: i64,
    pub pacman_log_base64: String,
    pub makepkg_extract_exit_code: i64,
    pub makepkg_extract_log_base64: String,
    pub makepkg_build_exit_code: i64,
    pub makepkg_build_log_base64: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending_build() -> Build {
        Build {
            id: 1,
            package_base: "foo".into(),
            package_base_id: 42,
            commit_id: 7,
            worker_id: 0,
            status: BuildStatus::Pending,
            build_type: BuildType::Package,
            depends_on_build_ids: vec![],
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    #[test]
    fn claim_moves_pending_to_building() {
        let mut b = pending_build();
        let now = Utc::now();
        b.claim(3, now).unwrap();
        assert_eq!(b.status, BuildStatus::Building);
        assert_eq!(b.worker_id, 3);
        assert_eq!(b.started_at, Some(now));
    }

    #[test]
    fn claim_rejects_non_pending() {
        let mut b = pending_build();
        b.claim(3, Utc::now()).unwrap();
        assert!(b.claim(4, Utc::now()).is_err());
    }

    #[test]
    fn success_result_finishes_build() {
        let mut b = pending_build();
        b.claim(3, Utc::now()).unwrap();
        let now = Utc::now();
        b.apply_result(WorkResultStatus::Success, now).unwrap();
        assert_eq!(b.status, BuildStatus::Built);
        assert_eq!(b.finished_at, Some(now));
    }

    #[test]
    fn internal_error_requeues_without_finishing() {
        let mut b = pending_build();
        b.claim(3, Utc::now()).unwrap();
        b.apply_result(WorkResultStatus::InternalError, Utc::now())
            .unwrap();
        assert_eq!(b.status, BuildStatus::Pending);
        assert_eq!(b.worker_id, 0);
        assert_eq!(b.started_at, None);
        assert_eq!(b.finished_at, None);
    }

    #[test]
    fn terminal_build_rejects_further_results() {
        let mut b = pending_build();
        b.claim(3, Utc::now()).unwrap();
        b.apply_result(WorkResultStatus::Failed, Utc::now()).unwrap();
        assert!(b
            .apply_result(WorkResultStatus::Success, Utc::now())
            .is_err());
    }

    #[test]
    fn requeue_revokes_lease() {
        let mut b = pending_build();
        b.claim(3, Utc::now()).unwrap();
        b.requeue().unwrap();
        assert_eq!(b.status, BuildStatus::Pending);
        assert_eq!(b.worker_id, 0);
        assert!(b.requeue().is_err());
    }

    #[test]
    fn status_discriminants_are_stable() {
        assert_eq!(BuildStatus::Pending.as_i64(), 10);
        assert_eq!(BuildStatus::Built.as_i64(), 50);
        assert_eq!(WorkerStatus::Stopped.as_i64(), 30);
        assert_eq!(WorkResultStatus::InternalError.as_i64(), 0);
        assert!(BuildStatus::from_i64(15).is_err());
        assert!(WorkResultStatus::from_i64(40).is_err());
    }

    #[test]
    fn result_status_maps_to_build_status() {
        assert_eq!(
            WorkResultStatus::Success.build_status(),
            BuildStatus::Built
        );
        assert_eq!(
            WorkResultStatus::Timeout.build_status(),
            BuildStatus::Timeout
        );
        assert_eq!(WorkResultStatus::Failed.build_status(), BuildStatus::Failed);
        assert_eq!(
            WorkResultStatus::InternalError.build_status(),
            BuildStatus::Pending
        );
    }
}
