//! SQLite-backed store for the controller.
//!
//! Every query the controller issues lives here behind a typed method, so
//! handlers and control loops never touch SQL. Sequence-valued columns
//! (dependency lists, parent hashes) are stored as JSON text.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

use crate::model::{
    Build, BuildStatus, BuildType, Commit, Package, WorkResult, Worker, WorkerStatus, WorkerType,
};

/// Builds older than this never reach the dispatch queue.
pub const BUILD_QUEUE_WINDOW_HOURS: i64 = 24;

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (and create if missing) the database at `dsn`, e.g.
    /// `sqlite:aurci.db`, and bring the schema up to date.
    pub async fn connect(dsn: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(dsn)
            .with_context(|| format!("invalid database DSN {dsn}"))?
            .create_if_missing(true)
            .busy_timeout(std::time::Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("failed to open database connection")?;
        let store = Store { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        for ddl in SCHEMA {
            sqlx::query(ddl).execute(&self.pool).await?;
        }
        Ok(())
    }

    // ── packages ─────────────────────────────────────────────────────────

    /// Update the package row by name, inserting it when the update did not
    /// match anything.
    pub async fn upsert_package(&self, pkg: &Package) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE package SET package_base_id = ?, package_base = ?, version = ?, \
             description = ?, url = ?, num_votes = ?, popularity = ?, out_of_date = ?, \
             maintainer = ?, first_submitted = ?, last_modified = ?, url_path = ?, \
             depends = ?, make_depends = ?, check_depends = ?, opt_depends = ?, \
             conflicts = ?, provides = ?, replaces = ?, \"groups\" = ?, license = ?, \
             keywords = ? WHERE name = ?",
        )
        .bind(pkg.package_base_id)
        .bind(&pkg.package_base)
        .bind(&pkg.version)
        .bind(&pkg.description)
        .bind(&pkg.url)
        .bind(pkg.num_votes)
        .bind(pkg.popularity)
        .bind(pkg.out_of_date)
        .bind(&pkg.maintainer)
        .bind(pkg.first_submitted)
        .bind(pkg.last_modified)
        .bind(&pkg.url_path)
        .bind(to_json(&pkg.depends)?)
        .bind(to_json(&pkg.make_depends)?)
        .bind(to_json(&pkg.check_depends)?)
        .bind(to_json(&pkg.opt_depends)?)
        .bind(to_json(&pkg.conflicts)?)
        .bind(to_json(&pkg.provides)?)
        .bind(to_json(&pkg.replaces)?)
        .bind(to_json(&pkg.groups)?)
        .bind(to_json(&pkg.license)?)
        .bind(to_json(&pkg.keywords)?)
        .bind(&pkg.name)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            sqlx::query(
                "INSERT INTO package (name, package_base_id, package_base, version, \
                 description, url, num_votes, popularity, out_of_date, maintainer, \
                 first_submitted, last_modified, url_path, depends, make_depends, \
                 check_depends, opt_depends, conflicts, provides, replaces, \"groups\", \
                 license, keywords) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&pkg.name)
            .bind(pkg.package_base_id)
            .bind(&pkg.package_base)
            .bind(&pkg.version)
            .bind(&pkg.description)
            .bind(&pkg.url)
            .bind(pkg.num_votes)
            .bind(pkg.popularity)
            .bind(pkg.out_of_date)
            .bind(&pkg.maintainer)
            .bind(pkg.first_submitted)
            .bind(pkg.last_modified)
            .bind(&pkg.url_path)
            .bind(to_json(&pkg.depends)?)
            .bind(to_json(&pkg.make_depends)?)
            .bind(to_json(&pkg.check_depends)?)
            .bind(to_json(&pkg.opt_depends)?)
            .bind(to_json(&pkg.conflicts)?)
            .bind(to_json(&pkg.provides)?)
            .bind(to_json(&pkg.replaces)?)
            .bind(to_json(&pkg.groups)?)
            .bind(to_json(&pkg.license)?)
            .bind(to_json(&pkg.keywords)?)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to insert package {}", pkg.name))?;
        }
        Ok(())
    }

    /// The union of depends, make_depends and check_depends from one package
    /// row of the base, order-preserving and deduplicated. Empty when the
    /// base has no package row.
    pub async fn package_dependencies(&self, package_base_id: i64) -> Result<Vec<String>> {
        let row = sqlx::query(
            "SELECT depends, make_depends, check_depends FROM package \
             WHERE package_base_id = ? LIMIT 1",
        )
        .bind(package_base_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(vec![]);
        };
        let mut deps: Vec<String> = vec![];
        for col in ["depends", "make_depends", "check_depends"] {
            for dep in from_json(row.get::<String, _>(col).as_str())? {
                if !deps.contains(&dep) {
                    deps.push(dep);
                }
            }
        }
        Ok(deps)
    }

    // ── commits ──────────────────────────────────────────────────────────

    /// Hash of the newest known commit for a base, or `None` for a base we
    /// have never ingested.
    pub async fn newest_commit_hash(&self, package_base_id: i64) -> Result<Option<String>> {
        let row = sqlx::query(
            "SELECT hash FROM \"commit\" WHERE package_base_id = ? \
             ORDER BY committer_when DESC, id ASC LIMIT 1",
        )
        .bind(package_base_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("hash")))
    }

    pub async fn newest_commit_id(&self, package_base_id: i64) -> Result<Option<i64>> {
        let row = sqlx::query(
            "SELECT id FROM \"commit\" WHERE package_base_id = ? \
             ORDER BY committer_when DESC, id ASC LIMIT 1",
        )
        .bind(package_base_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("id")))
    }

    /// Insert commits in the given (newest-first) order.
    pub async fn insert_commits(&self, commits: &[Commit]) -> Result<u64> {
        for commit in commits {
            sqlx::query(
                "INSERT INTO \"commit\" (package_base_id, hash, message, author_name, \
                 author_email, author_when, committer_name, committer_email, \
                 committer_when, parent_hashes) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(commit.package_base_id)
            .bind(&commit.hash)
            .bind(&commit.message)
            .bind(&commit.author_name)
            .bind(&commit.author_email)
            .bind(commit.author_when)
            .bind(&commit.committer_name)
            .bind(&commit.committer_email)
            .bind(commit.committer_when)
            .bind(to_json(&commit.parent_hashes)?)
            .execute(&self.pool)
            .await
            .with_context(|| {
                format!(
                    "failed to insert commit {} of package base {}",
                    commit.hash, commit.package_base_id
                )
            })?;
        }
        Ok(commits.len() as u64)
    }

    pub async fn commit_hash(&self, commit_id: i64) -> Result<Option<String>> {
        let row = sqlx::query("SELECT hash FROM \"commit\" WHERE id = ?")
            .bind(commit_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("hash")))
    }

    /// All commits of a base, newest first.
    pub async fn commits_of_base(&self, package_base_id: i64) -> Result<Vec<Commit>> {
        let rows = sqlx::query(
            "SELECT * FROM \"commit\" WHERE package_base_id = ? \
             ORDER BY committer_when DESC, id ASC",
        )
        .bind(package_base_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(commit_from_row).collect()
    }

    // ── builds ───────────────────────────────────────────────────────────

    pub async fn insert_build(
        &self,
        package_base: &str,
        package_base_id: i64,
        commit_id: i64,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO build (package_base, package_base_id, commit_id, worker_id, \
             status, type, depends_on_build_ids, created_at) VALUES (?, ?, ?, 0, ?, ?, '[]', ?)",
        )
        .bind(package_base)
        .bind(package_base_id)
        .bind(commit_id)
        .bind(BuildStatus::Pending.as_i64())
        .bind(BuildType::Package.as_i64())
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get_build(&self, id: i64) -> Result<Option<Build>> {
        let row = sqlx::query("SELECT * FROM build WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(build_from_row).transpose()
    }

    /// True when the pair already has a build that is not terminal. There
    /// must never be more than one such build at a time.
    pub async fn has_open_build(&self, package_base_id: i64, commit_id: i64) -> Result<bool> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM build WHERE package_base_id = ? AND commit_id = ? \
             AND status IN (?, ?)",
        )
        .bind(package_base_id)
        .bind(commit_id)
        .bind(BuildStatus::Pending.as_i64())
        .bind(BuildStatus::Building.as_i64())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("n") > 0)
    }

    /// The dispatch queue: pending package builds from the last 24 hours,
    /// oldest first. `limit` of `None` returns the whole queue.
    pub async fn pending_package_builds(
        &self,
        now: DateTime<Utc>,
        limit: Option<i64>,
    ) -> Result<Vec<Build>> {
        let cutoff = now - Duration::hours(BUILD_QUEUE_WINDOW_HOURS);
        let rows = sqlx::query(
            "SELECT * FROM build WHERE status = ? AND type = ? AND created_at > ? \
             ORDER BY created_at ASC LIMIT ?",
        )
        .bind(BuildStatus::Pending.as_i64())
        .bind(BuildType::Package.as_i64())
        .bind(cutoff)
        .bind(limit.unwrap_or(-1))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(build_from_row).collect()
    }

    /// Claim a pending build for a worker. Compare-and-set on the status
    /// column: returns false when another caller claimed the build first.
    pub async fn claim_build(
        &self,
        build_id: i64,
        worker_id: i64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let affected = sqlx::query(
            "UPDATE build SET worker_id = ?, status = ?, started_at = ? \
             WHERE id = ? AND status = ?",
        )
        .bind(worker_id)
        .bind(BuildStatus::Building.as_i64())
        .bind(now)
        .bind(build_id)
        .bind(BuildStatus::Pending.as_i64())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected == 1)
    }

    /// Persist a work result and the build row it finishes, atomically.
    pub async fn record_work_result(&self, result: &WorkResult, build: &Build) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO work_result (build_id, status, pacman_exit_code, \
             pacman_log_base64, makepkg_extract_exit_code, makepkg_extract_log_base64, \
             makepkg_build_exit_code, makepkg_build_log_base64, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(result.build_id)
        .bind(result.status.as_i64())
        .bind(result.pacman_exit_code)
        .bind(&result.pacman_log_base64)
        .bind(result.makepkg_extract_exit_code)
        .bind(&result.makepkg_extract_log_base64)
        .bind(result.makepkg_build_exit_code)
        .bind(&result.makepkg_build_log_base64)
        .bind(result.created_at)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "UPDATE build SET status = ?, worker_id = ?, started_at = ?, finished_at = ? \
             WHERE id = ?",
        )
        .bind(build.status.as_i64())
        .bind(build.worker_id)
        .bind(build.started_at)
        .bind(build.finished_at)
        .bind(build.id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn work_results_of_build(&self, build_id: i64) -> Result<Vec<WorkResult>> {
        let rows = sqlx::query("SELECT * FROM work_result WHERE build_id = ? ORDER BY id ASC")
            .bind(build_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(work_result_from_row).collect()
    }

    /// Return a worker's in-flight builds to the queue. Used when a lease
    /// is revoked (VM expired or heartbeat timed out).
    pub async fn requeue_builds_of_worker(&self, worker_id: i64) -> Result<u64> {
        let affected = sqlx::query(
            "UPDATE build SET status = ?, worker_id = 0, started_at = NULL \
             WHERE worker_id = ? AND status = ?",
        )
        .bind(BuildStatus::Pending.as_i64())
        .bind(worker_id)
        .bind(BuildStatus::Building.as_i64())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected)
    }

    // ── workers ──────────────────────────────────────────────────────────

    pub async fn worker_by_ip(&self, ip: &str) -> Result<Option<Worker>> {
        let row = sqlx::query("SELECT * FROM worker WHERE ipv4 = ?1 OR ipv6 = ?1")
            .bind(ip)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(worker_from_row).transpose()
    }

    pub async fn get_worker(&self, id: i64) -> Result<Option<Worker>> {
        let row = sqlx::query("SELECT * FROM worker WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(worker_from_row).transpose()
    }

    pub async fn insert_worker(&self, worker: &Worker) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO worker (type, status, provider_id, name, ipv4, ipv6, \
             created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(worker.worker_type.as_i64())
        .bind(worker.status.as_i64())
        .bind(worker.provider_id)
        .bind(&worker.name)
        .bind(&worker.ipv4)
        .bind(&worker.ipv6)
        .bind(worker.created_at)
        .bind(worker.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Heartbeat: mark the worker running and refresh `updated_at`.
    pub async fn touch_worker(&self, id: i64, now: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE worker SET status = ?, updated_at = ? WHERE id = ?")
            .bind(WorkerStatus::Running.as_i64())
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn stop_worker(&self, id: i64, now: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE worker SET status = ?, updated_at = ? WHERE id = ?")
            .bind(WorkerStatus::Stopped.as_i64())
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Hetzner workers past their billing-hour budget.
    pub async fn expired_hetzner_workers(&self, cutoff: DateTime<Utc>) -> Result<Vec<Worker>> {
        let rows = sqlx::query(
            "SELECT * FROM worker WHERE type = ? AND status != ? AND created_at < ?",
        )
        .bind(WorkerType::Hetzner.as_i64())
        .bind(WorkerStatus::Stopped.as_i64())
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(worker_from_row).collect()
    }

    /// Workers whose last heartbeat is older than `cutoff`.
    pub async fn timed_out_workers(&self, cutoff: DateTime<Utc>) -> Result<Vec<Worker>> {
        let rows = sqlx::query("SELECT * FROM worker WHERE status != ? AND updated_at < ?")
            .bind(WorkerStatus::Stopped.as_i64())
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(worker_from_row).collect()
    }

    pub async fn active_worker_count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM worker WHERE status IN (?, ?)")
            .bind(WorkerStatus::Created.as_i64())
            .bind(WorkerStatus::Running.as_i64())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }
}

fn to_json(values: &[String]) -> Result<String> {
    Ok(serde_json::to_string(values)?)
}

fn from_json(text: &str) -> Result<Vec<String>> {
    if text.is_empty() {
        return Ok(vec![]);
    }
    Ok(serde_json::from_str(text)?)
}

fn build_from_row(row: &SqliteRow) -> Result<Build> {
    let ids: Vec<i64> = {
        let text: String = row.get("depends_on_build_ids");
        if text.is_empty() {
            vec![]
        } else {
            serde_json::from_str(&text)?
        }
    };
    Ok(Build {
        id: row.get("id"),
        package_base: row.get("package_base"),
        package_base_id: row.get("package_base_id"),
        commit_id: row.get("commit_id"),
        worker_id: row.get("worker_id"),
        status: BuildStatus::from_i64(row.get("status"))?,
        build_type: BuildType::from_i64(row.get("type"))?,
        depends_on_build_ids: ids,
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
    })
}

fn worker_from_row(row: &SqliteRow) -> Result<Worker> {
    Ok(Worker {
        id: row.get("id"),
        worker_type: WorkerType::from_i64(row.get("type"))?,
        status: WorkerStatus::from_i64(row.get("status"))?,
        provider_id: row.get("provider_id"),
        name: row.get("name"),
        ipv4: row.get("ipv4"),
        ipv6: row.get("ipv6"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn commit_from_row(row: &SqliteRow) -> Result<Commit> {
    Ok(Commit {
        id: row.get("id"),
        package_base_id: row.get("package_base_id"),
        hash: row.get("hash"),
        message: row.get("message"),
        author_name: row.get("author_name"),
        author_email: row.get("author_email"),
        author_when: row.get("author_when"),
        committer_name: row.get("committer_name"),
        committer_email: row.get("committer_email"),
        committer_when: row.get("committer_when"),
        parent_hashes: from_json(row.get::<String, _>("parent_hashes").as_str())?,
    })
}

fn work_result_from_row(row: &SqliteRow) -> Result<WorkResult> {
    Ok(WorkResult {
        id: row.get("id"),
        build_id: row.get("build_id"),
        status: crate::model::WorkResultStatus::from_i64(row.get("status"))?,
        pacman_exit_code: row.get("pacman_exit_code"),
        pacman_log_base64: row.get("pacman_log_base64"),
        makepkg_extract_exit_code: row.get("makepkg_extract_exit_code"),
        makepkg_extract_log_base64: row.get("makepkg_extract_log_base64"),
        makepkg_build_exit_code: row.get("makepkg_build_exit_code"),
        makepkg_build_log_base64: row.get("makepkg_build_log_base64"),
        created_at: row.get("created_at"),
    })
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS package (
        name TEXT PRIMARY KEY,
        package_base_id INTEGER NOT NULL,
        package_base TEXT NOT NULL,
        version TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        url TEXT NOT NULL DEFAULT '',
        num_votes INTEGER NOT NULL DEFAULT 0,
        popularity REAL NOT NULL DEFAULT 0,
        out_of_date TEXT,
        maintainer TEXT NOT NULL DEFAULT '',
        first_submitted TEXT,
        last_modified TEXT,
        url_path TEXT NOT NULL DEFAULT '',
        depends TEXT NOT NULL DEFAULT '[]',
        make_depends TEXT NOT NULL DEFAULT '[]',
        check_depends TEXT NOT NULL DEFAULT '[]',
        opt_depends TEXT NOT NULL DEFAULT '[]',
        conflicts TEXT NOT NULL DEFAULT '[]',
        provides TEXT NOT NULL DEFAULT '[]',
        replaces TEXT NOT NULL DEFAULT '[]',
        \"groups\" TEXT NOT NULL DEFAULT '[]',
        license TEXT NOT NULL DEFAULT '[]',
        keywords TEXT NOT NULL DEFAULT '[]'
    )",
    "CREATE INDEX IF NOT EXISTS idx_package_base_id ON package (package_base_id)",
    "CREATE TABLE IF NOT EXISTS \"commit\" (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        package_base_id INTEGER NOT NULL,
        hash TEXT NOT NULL,
        message TEXT NOT NULL DEFAULT '',
        author_name TEXT NOT NULL DEFAULT '',
        author_email TEXT NOT NULL DEFAULT '',
        author_when TEXT NOT NULL,
        committer_name TEXT NOT NULL DEFAULT '',
        committer_email TEXT NOT NULL DEFAULT '',
        committer_when TEXT NOT NULL,
        parent_hashes TEXT NOT NULL DEFAULT '[]',
        UNIQUE (package_base_id, hash)
    )",
    "CREATE TABLE IF NOT EXISTS build (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        package_base TEXT NOT NULL,
        package_base_id INTEGER NOT NULL,
        commit_id INTEGER NOT NULL,
        worker_id INTEGER NOT NULL DEFAULT 0,
        status INTEGER NOT NULL,
        type INTEGER NOT NULL,
        depends_on_build_ids TEXT NOT NULL DEFAULT '[]',
        created_at TEXT NOT NULL,
        started_at TEXT,
        finished_at TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_build_status ON build (status, type, created_at)",
    "CREATE TABLE IF NOT EXISTS worker (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        type INTEGER NOT NULL,
        status INTEGER NOT NULL,
        provider_id INTEGER NOT NULL DEFAULT 0,
        name TEXT NOT NULL DEFAULT '',
        ipv4 TEXT NOT NULL DEFAULT '',
        ipv6 TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS work_result (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        build_id INTEGER NOT NULL,
        status INTEGER NOT NULL,
        pacman_exit_code INTEGER NOT NULL DEFAULT 0,
        pacman_log_base64 TEXT NOT NULL DEFAULT '',
        makepkg_extract_exit_code INTEGER NOT NULL DEFAULT 0,
        makepkg_extract_log_base64 TEXT NOT NULL DEFAULT '',
        makepkg_build_exit_code INTEGER NOT NULL DEFAULT 0,
        makepkg_build_log_base64 TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL
    )",
];
