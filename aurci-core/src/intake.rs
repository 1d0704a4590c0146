//! Modification intake: turns upstream change notifications into commits
//! and pending builds.

use anyhow::{Context, Result};
use chrono::Utc;
use log::{info, warn};

use crate::aur::PackageIndex;
use crate::db::Store;
use crate::mirror::{MirrorError, SourceMirror};

/// What one intake run changed. Re-running with unchanged upstream state
/// yields all-zero counts after the first run.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct IntakeSummary {
    pub packages: usize,
    pub new_commits: u64,
    pub new_builds: u64,
}

/// Handle a package-modification notification.
///
/// Refreshes metadata for every named package, fetches new upstream commits
/// per affected base, and enqueues a pending build for the newest commit of
/// each base that changed. Bases whose upstream has no `master` branch are
/// skipped with a warning. Work done for earlier bases stays persisted even
/// when a later base fails.
pub async fn report_package_modification(
    store: &Store,
    mirror: &SourceMirror,
    index: &dyn PackageIndex,
    names: &[String],
) -> Result<IntakeSummary> {
    let packages = index
        .infos(names)
        .await
        .with_context(|| format!("failed to receive package infos for {} packages", names.len()))?;

    let mut summary = IntakeSummary {
        packages: packages.len(),
        ..Default::default()
    };

    let mut bases: Vec<(String, i64)> = vec![];
    for pkg in &packages {
        store
            .upsert_package(pkg)
            .await
            .with_context(|| format!("failed to store package {}", pkg.name))?;
        let key = (pkg.package_base.clone(), pkg.package_base_id);
        if !bases.contains(&key) {
            bases.push(key);
        }
    }

    for (base, base_id) in bases {
        match mirror.ensure(&base).await {
            Ok(()) => {}
            Err(MirrorError::NoBranch(_)) => {
                warn!("skipping package base {base}: upstream has no branch");
                continue;
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to clone or fetch {base}"));
            }
        }

        let last_hash = store.newest_commit_hash(base_id).await?.unwrap_or_default();
        let new_commits = mirror
            .commits_until(&base, base_id, &last_hash)
            .await
            .with_context(|| format!("failed to read commits of {base}"))?;
        if new_commits.is_empty() {
            continue;
        }

        summary.new_commits += store
            .insert_commits(&new_commits)
            .await
            .with_context(|| format!("failed to insert commits of {base}"))?;

        let newest_id = store
            .newest_commit_id(base_id)
            .await?
            .with_context(|| format!("no commit row for {base} after insert"))?;
        // One open build per (base, commit) pair; a retry of the same
        // notification must not enqueue twice.
        if !store.has_open_build(base_id, newest_id).await? {
            store
                .insert_build(&base, base_id, newest_id, Utc::now())
                .await
                .with_context(|| format!("failed to enqueue build for {base}"))?;
            summary.new_builds += 1;
        }
    }

    Ok(summary)
}

/// One-shot mirror seeding: clone or refresh every known package base and
/// take a snapshot of its current head, then return. Individual failures
/// are logged and skipped so a single broken base cannot stall the seed.
pub async fn initialize_mirrors(mirror: &SourceMirror, index: &dyn PackageIndex) -> Result<u64> {
    let bases = index.list_bases().await.context("failed to list package bases")?;
    info!("seeding {} package base mirrors", bases.len());

    let mut seeded = 0u64;
    for base in &bases {
        match seed_one(mirror, base).await {
            Ok(()) => seeded += 1,
            Err(MirrorError::NoBranch(_)) => {
                warn!("skipping package base {base}: upstream has no branch");
            }
            Err(e) => warn!("failed to seed package base {base}: {e:#}"),
        }
    }
    info!("seeded {seeded}/{} package base mirrors", bases.len());
    Ok(seeded)
}

async fn seed_one(mirror: &SourceMirror, base: &str) -> Result<(), MirrorError> {
    mirror.ensure(base).await?;
    let head = mirror.head_hash(base).await?;
    mirror.snapshot_tar(base, &head).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::test_store;
    use crate::mirror::tests::{commit_files, init_upstream};
    use crate::model::{BuildStatus, Package};
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct FakeIndex {
        packages: Vec<Package>,
    }

    #[async_trait]
    impl PackageIndex for FakeIndex {
        async fn list_bases(&self) -> Result<Vec<String>> {
            Ok(self
                .packages
                .iter()
                .map(|p| p.package_base.clone())
                .collect())
        }

        async fn infos(&self, _names: &[String]) -> Result<Vec<Package>> {
            Ok(self.packages.clone())
        }
    }

    fn package(name: &str, base: &str, base_id: i64) -> Package {
        Package {
            name: name.into(),
            package_base: base.into(),
            package_base_id: base_id,
            version: "1.0-1".into(),
            depends: vec!["glibc".into()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn cold_ingest_creates_commits_and_one_build() {
        let upstream = TempDir::new().unwrap();
        let mirrors = TempDir::new().unwrap();
        let repo = init_upstream(upstream.path(), "foo");
        commit_files(&repo, &[("PKGBUILD", "v1", 0o100644)], "c0", 100);
        let c1 = commit_files(&repo, &[("PKGBUILD", "v2", 0o100644)], "c1", 200);

        let (_dir, store) = test_store().await;
        let mirror = SourceMirror::new(mirrors.path(), upstream.path().display().to_string());
        let index = FakeIndex {
            packages: vec![package("foo", "foo", 42)],
        };

        let summary = report_package_modification(&store, &mirror, &index, &["foo".into()])
            .await
            .unwrap();
        assert_eq!(
            summary,
            IntakeSummary {
                packages: 1,
                new_commits: 2,
                new_builds: 1
            }
        );

        let commits = store.commits_of_base(42).await.unwrap();
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].hash, c1, "newest commit must sort first");

        let builds = store
            .pending_package_builds(Utc::now(), None)
            .await
            .unwrap();
        assert_eq!(builds.len(), 1);
        assert_eq!(builds[0].status, BuildStatus::Pending);
        assert_eq!(builds[0].commit_id, commits[0].id);
        assert_eq!(builds[0].package_base, "foo");
    }

    #[tokio::test]
    async fn repeated_ingest_is_idempotent() {
        let upstream = TempDir::new().unwrap();
        let mirrors = TempDir::new().unwrap();
        let repo = init_upstream(upstream.path(), "foo");
        commit_files(&repo, &[("PKGBUILD", "v1", 0o100644)], "c0", 100);

        let (_dir, store) = test_store().await;
        let mirror = SourceMirror::new(mirrors.path(), upstream.path().display().to_string());
        let index = FakeIndex {
            packages: vec![package("foo", "foo", 42)],
        };

        let names = vec!["foo".to_string()];
        report_package_modification(&store, &mirror, &index, &names)
            .await
            .unwrap();
        let second = report_package_modification(&store, &mirror, &index, &names)
            .await
            .unwrap();

        assert_eq!(second.new_commits, 0);
        assert_eq!(second.new_builds, 0);
        assert_eq!(store.commits_of_base(42).await.unwrap().len(), 1);
        assert_eq!(
            store
                .pending_package_builds(Utc::now(), None)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn new_upstream_commit_enqueues_another_build() {
        let upstream = TempDir::new().unwrap();
        let mirrors = TempDir::new().unwrap();
        let repo = init_upstream(upstream.path(), "foo");
        commit_files(&repo, &[("PKGBUILD", "v1", 0o100644)], "c0", 100);

        let (_dir, store) = test_store().await;
        let mirror = SourceMirror::new(mirrors.path(), upstream.path().display().to_string());
        let index = FakeIndex {
            packages: vec![package("foo", "foo", 42)],
        };
        let names = vec!["foo".to_string()];
        report_package_modification(&store, &mirror, &index, &names)
            .await
            .unwrap();

        commit_files(&repo, &[("PKGBUILD", "v2", 0o100644)], "c1", 200);
        let summary = report_package_modification(&store, &mirror, &index, &names)
            .await
            .unwrap();

        assert_eq!(summary.new_commits, 1);
        assert_eq!(summary.new_builds, 1);
        assert_eq!(
            store
                .pending_package_builds(Utc::now(), None)
                .await
                .unwrap()
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn branchless_base_is_skipped_not_fatal() {
        let upstream = TempDir::new().unwrap();
        let mirrors = TempDir::new().unwrap();
        let repo = init_upstream(upstream.path(), "good");
        commit_files(&repo, &[("PKGBUILD", "v1", 0o100644)], "c0", 100);
        init_upstream(upstream.path(), "headless");

        let (_dir, store) = test_store().await;
        let mirror = SourceMirror::new(mirrors.path(), upstream.path().display().to_string());
        let index = FakeIndex {
            packages: vec![package("good", "good", 1), package("headless", "headless", 2)],
        };

        let summary = report_package_modification(
            &store,
            &mirror,
            &index,
            &["good".into(), "headless".into()],
        )
        .await
        .unwrap();

        assert_eq!(summary.new_builds, 1);
        assert!(store.commits_of_base(2).await.unwrap().is_empty());
    }
}
