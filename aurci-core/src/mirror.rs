//! Local bare git mirrors of the upstream package-base repositories.
//!
//! One mirror per package base at `<root>/<base>.git`, tracking the single
//! upstream branch `master`. Fetches for the same base are serialized;
//! snapshot and history reads work on the object store only and may run
//! concurrently with anything.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::anyhow;
use chrono::{DateTime, TimeZone, Utc};
use git2::build::RepoBuilder;
use git2::{BranchType, ErrorCode, ObjectType, Oid, Repository};
use log::warn;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::model::Commit;

/// Upstream git host the mirrors track.
pub const DEFAULT_UPSTREAM: &str = "https://aur.archlinux.org";

const FETCH_REFSPEC: &str = "+refs/heads/master:refs/heads/master";
const ENSURE_TRIES: u32 = 3;

#[derive(Debug, Error)]
pub enum MirrorError {
    /// The upstream repository has a detached HEAD and no `master` branch.
    /// Known for a handful of bases; callers skip these.
    #[error("package base {0} has no master branch")]
    NoBranch(String),
    #[error(transparent)]
    Git(#[from] git2::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub struct SourceMirror {
    root: PathBuf,
    upstream: String,
    fetch_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SourceMirror {
    pub fn new(root: impl Into<PathBuf>, upstream: impl Into<String>) -> Self {
        SourceMirror {
            root: root.into(),
            upstream: upstream.into(),
            fetch_locks: Mutex::new(HashMap::new()),
        }
    }

    fn repository_path(&self, base: &str) -> PathBuf {
        self.root.join(format!("{base}.git"))
    }

    fn clone_url(&self, base: &str) -> String {
        format!("{}/{}.git", self.upstream, base)
    }

    async fn fetch_lock(&self, base: &str) -> Arc<Mutex<()>> {
        let mut locks = self.fetch_locks.lock().await;
        locks
            .entry(base.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Clone the mirror for `base` if it does not exist yet, fetch `master`
    /// otherwise. Retries the transient reference-lock race up to three
    /// times; at most one fetch per base runs at a time.
    pub async fn ensure(&self, base: &str) -> Result<(), MirrorError> {
        let lock = self.fetch_lock(base).await;
        let _guard = lock.lock().await;

        let path = self.repository_path(base);
        let url = self.clone_url(base);
        let base = base.to_string();
        run_blocking(move || {
            for attempt in 1..=ENSURE_TRIES {
                match clone_or_fetch(&path, &url, &base) {
                    Err(MirrorError::Git(e)) if is_transient_ref_error(&e) => {
                        if attempt == ENSURE_TRIES {
                            return Err(e.into());
                        }
                        warn!("reference lock race on {base}, retrying ({attempt}/{ENSURE_TRIES})");
                    }
                    other => return other,
                }
            }
            unreachable!("retry loop always returns")
        })
        .await
    }

    /// Commits of `base` from the `master` tip backwards, newest first,
    /// stopping before the commit whose hash equals `until_hash`. An empty
    /// `until_hash` replays the whole history.
    pub async fn commits_until(
        &self,
        base: &str,
        package_base_id: i64,
        until_hash: &str,
    ) -> Result<Vec<Commit>, MirrorError> {
        let path = self.repository_path(base);
        let base = base.to_string();
        let until_hash = until_hash.to_string();
        run_blocking(move || {
            let repo = Repository::open(&path)?;
            let tip = master_tip(&repo, &base)?;
            let mut walk = repo.revwalk()?;
            walk.push(tip)?;

            let mut commits = vec![];
            for oid in walk {
                let oid = oid?;
                if oid.to_string() == until_hash {
                    break;
                }
                commits.push(commit_from_git(&repo.find_commit(oid)?, package_base_id));
            }
            Ok(commits)
        })
        .await
    }

    /// Hash of the `master` tip.
    pub async fn head_hash(&self, base: &str) -> Result<String, MirrorError> {
        let path = self.repository_path(base);
        let base = base.to_string();
        run_blocking(move || {
            let repo = Repository::open(&path)?;
            Ok(master_tip(&repo, &base)?.to_string())
        })
        .await
    }

    /// A tar archive of the top-level files and symlinks of the tree at
    /// `commit_hash`, each entry prefixed with `<base>/`. Subdirectories are
    /// skipped: package build files live at the repository root. Works
    /// entirely from the object store, so it never disturbs a concurrent
    /// fetch.
    pub async fn snapshot_tar(&self, base: &str, commit_hash: &str) -> Result<Vec<u8>, MirrorError> {
        let path = self.repository_path(base);
        let base = base.to_string();
        let commit_hash = commit_hash.to_string();
        run_blocking(move || {
            let repo = Repository::open(&path)?;
            let commit = repo.find_commit(Oid::from_str(&commit_hash)?)?;
            let tree = commit.tree()?;
            let mtime = commit.time().seconds().max(0) as u64;

            let mut builder = tar::Builder::new(Vec::new());
            for entry in tree.iter() {
                let Some(name) = entry.name() else { continue };
                if entry.kind() != Some(ObjectType::Blob) {
                    continue;
                }
                let blob = repo.find_blob(entry.id())?;
                let entry_path = format!("{base}/{name}");
                let mode = entry.filemode() as u32;

                let mut header = tar::Header::new_ustar();
                header.set_mtime(mtime);
                if mode == 0o120000 {
                    let target = String::from_utf8_lossy(blob.content()).into_owned();
                    header.set_entry_type(tar::EntryType::Symlink);
                    header.set_mode(0o777);
                    header.set_size(0);
                    header
                        .set_link_name(target.as_str())
                        .map_err(|e| anyhow!("symlink target of {entry_path}: {e}"))?;
                    builder
                        .append_data(&mut header, &entry_path, std::io::empty())
                        .map_err(|e| anyhow!("tar entry {entry_path}: {e}"))?;
                } else {
                    header.set_entry_type(tar::EntryType::Regular);
                    header.set_mode(mode & 0o777);
                    header.set_size(blob.content().len() as u64);
                    builder
                        .append_data(&mut header, &entry_path, blob.content())
                        .map_err(|e| anyhow!("tar entry {entry_path}: {e}"))?;
                }
            }
            builder
                .into_inner()
                .map_err(|e| MirrorError::Other(anyhow!("failed to finish tar: {e}")))
        })
        .await
    }
}

async fn run_blocking<T: Send + 'static>(
    f: impl FnOnce() -> Result<T, MirrorError> + Send + 'static,
) -> Result<T, MirrorError> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| MirrorError::Other(anyhow!("mirror task panicked: {e}")))?
}

fn clone_or_fetch(path: &Path, url: &str, base: &str) -> Result<(), MirrorError> {
    if path.exists() {
        let repo = Repository::open(path)?;
        let mut remote = repo.find_remote("origin")?;
        match remote.fetch(&[FETCH_REFSPEC], None, None) {
            // A fetch that finds nothing new is a success, not an error.
            Ok(()) => {}
            Err(e) if e.code() == ErrorCode::NotFound => {
                return Err(MirrorError::NoBranch(base.to_string()));
            }
            Err(e) => return Err(e.into()),
        }
        master_tip(&repo, base)?;
        Ok(())
    } else {
        let repo = match RepoBuilder::new().bare(true).clone(url, path) {
            Ok(repo) => repo,
            Err(e) if e.code() == ErrorCode::NotFound => {
                return Err(MirrorError::NoBranch(base.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        master_tip(&repo, base)?;
        Ok(())
    }
}

fn master_tip(repo: &Repository, base: &str) -> Result<Oid, MirrorError> {
    match repo.find_branch("master", BranchType::Local) {
        Ok(branch) => Ok(branch.get().peel_to_commit()?.id()),
        Err(e) if e.code() == ErrorCode::NotFound || e.code() == ErrorCode::UnbornBranch => {
            Err(MirrorError::NoBranch(base.to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

/// The reference-lock race seen on some filesystems when a fetch and a
/// concurrent ref update collide. Worth a retry, unlike real failures.
fn is_transient_ref_error(e: &git2::Error) -> bool {
    e.code() == ErrorCode::Locked
        || e.message().contains("failed to lock")
        || e.message().contains("reference has changed")
}

fn commit_from_git(commit: &git2::Commit<'_>, package_base_id: i64) -> Commit {
    Commit {
        id: 0,
        package_base_id,
        hash: commit.id().to_string(),
        message: commit.message().unwrap_or("").to_string(),
        author_name: commit.author().name().unwrap_or("").to_string(),
        author_email: commit.author().email().unwrap_or("").to_string(),
        author_when: timestamp(commit.author().when().seconds()),
        committer_name: commit.committer().name().unwrap_or("").to_string(),
        committer_email: commit.committer().email().unwrap_or("").to_string(),
        committer_when: timestamp(commit.committer().when().seconds()),
        parent_hashes: commit.parent_ids().map(|id| id.to_string()).collect(),
    }
}

fn timestamp(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(seconds, 0).single().unwrap_or_default()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use git2::{RepositoryInitOptions, Signature, Time};
    use tempfile::TempDir;

    /// Initialize a bare upstream repository at `<root>/<base>.git` with
    /// `master` as initial head and no commits.
    pub(crate) fn init_upstream(root: &Path, base: &str) -> Repository {
        let mut opts = RepositoryInitOptions::new();
        opts.bare(true).initial_head("master");
        Repository::init_opts(root.join(format!("{base}.git")), &opts).unwrap()
    }

    /// Commit `files` (`(name, content, filemode)`) onto `master`, with a
    /// committer timestamp of `when` seconds. Returns the commit hash.
    pub(crate) fn commit_files(
        repo: &Repository,
        files: &[(&str, &str, i32)],
        message: &str,
        when: i64,
    ) -> String {
        let sig = Signature::new("tester", "tester@localhost", &Time::new(when, 0)).unwrap();
        let parent = match repo.find_branch("master", BranchType::Local) {
            Ok(branch) => Some(branch.get().peel_to_commit().unwrap()),
            Err(_) => None,
        };
        let mut tb = match &parent {
            Some(p) => repo.treebuilder(Some(&p.tree().unwrap())).unwrap(),
            None => repo.treebuilder(None).unwrap(),
        };
        for (name, content, mode) in files {
            let blob = repo.blob(content.as_bytes()).unwrap();
            tb.insert(*name, blob, *mode).unwrap();
        }
        let tree = repo.find_tree(tb.write().unwrap()).unwrap();
        let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
        repo.commit(Some("refs/heads/master"), &sig, &sig, message, &tree, &parents)
            .unwrap()
            .to_string()
    }

    /// Commit a subdirectory entry onto `master`.
    fn commit_subdir(repo: &Repository, dir: &str, when: i64) -> String {
        let sig = Signature::new("tester", "tester@localhost", &Time::new(when, 0)).unwrap();
        let parent = repo
            .find_branch("master", BranchType::Local)
            .unwrap()
            .get()
            .peel_to_commit()
            .unwrap();
        let blob = repo.blob(b"nested").unwrap();
        let mut sub = repo.treebuilder(None).unwrap();
        sub.insert("nested.txt", blob, 0o100644).unwrap();
        let sub_tree = sub.write().unwrap();
        let mut tb = repo.treebuilder(Some(&parent.tree().unwrap())).unwrap();
        tb.insert(dir, sub_tree, 0o040000).unwrap();
        let tree = repo.find_tree(tb.write().unwrap()).unwrap();
        repo.commit(Some("refs/heads/master"), &sig, &sig, "subdir", &tree, &[&parent])
            .unwrap()
            .to_string()
    }

    fn test_mirror(upstream_root: &Path, mirror_root: &Path) -> SourceMirror {
        SourceMirror::new(mirror_root, upstream_root.display().to_string())
    }

    #[tokio::test]
    async fn ensure_clones_and_then_fetches() {
        let upstream = TempDir::new().unwrap();
        let mirrors = TempDir::new().unwrap();
        let repo = init_upstream(upstream.path(), "foo");
        let c0 = commit_files(&repo, &[("PKGBUILD", "pkgname=foo", 0o100644)], "init", 100);

        let mirror = test_mirror(upstream.path(), mirrors.path());
        mirror.ensure("foo").await.unwrap();
        assert_eq!(mirror.head_hash("foo").await.unwrap(), c0);

        let c1 = commit_files(&repo, &[("PKGBUILD", "pkgname=foo v2", 0o100644)], "bump", 200);
        mirror.ensure("foo").await.unwrap();
        assert_eq!(mirror.head_hash("foo").await.unwrap(), c1);
    }

    #[tokio::test]
    async fn ensure_reports_branchless_upstream() {
        let upstream = TempDir::new().unwrap();
        let mirrors = TempDir::new().unwrap();
        init_upstream(upstream.path(), "headless");

        let mirror = test_mirror(upstream.path(), mirrors.path());
        match mirror.ensure("headless").await {
            Err(MirrorError::NoBranch(base)) => assert_eq!(base, "headless"),
            other => panic!("expected NoBranch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn commits_until_replays_newest_first_and_stops() {
        let upstream = TempDir::new().unwrap();
        let mirrors = TempDir::new().unwrap();
        let repo = init_upstream(upstream.path(), "foo");
        let c0 = commit_files(&repo, &[("PKGBUILD", "v1", 0o100644)], "one", 100);
        let c1 = commit_files(&repo, &[("PKGBUILD", "v2", 0o100644)], "two", 200);

        let mirror = test_mirror(upstream.path(), mirrors.path());
        mirror.ensure("foo").await.unwrap();

        let all = mirror.commits_until("foo", 7, "").await.unwrap();
        assert_eq!(
            all.iter().map(|c| c.hash.as_str()).collect::<Vec<_>>(),
            vec![c1.as_str(), c0.as_str()]
        );
        assert!(all.iter().all(|c| c.package_base_id == 7));
        assert_eq!(all[0].parent_hashes, vec![c0.clone()]);
        assert!(all[0].committer_when > all[1].committer_when);

        let newer = mirror.commits_until("foo", 7, &c0).await.unwrap();
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].hash, c1);

        let none = mirror.commits_until("foo", 7, &c1).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn snapshot_preserves_files_and_symlinks_skips_dirs() {
        let upstream = TempDir::new().unwrap();
        let mirrors = TempDir::new().unwrap();
        let repo = init_upstream(upstream.path(), "foo");
        commit_files(
            &repo,
            &[
                ("PKGBUILD", "pkgname=foo", 0o100644),
                ("build.sh", "#!/bin/sh", 0o100755),
                ("link.patch", "PKGBUILD", 0o120000),
            ],
            "files",
            100,
        );
        let head = commit_subdir(&repo, "keys", 200);

        let mirror = test_mirror(upstream.path(), mirrors.path());
        mirror.ensure("foo").await.unwrap();
        let tar_bytes = mirror.snapshot_tar("foo", &head).await.unwrap();

        let mut archive = tar::Archive::new(&tar_bytes[..]);
        let mut seen = std::collections::BTreeMap::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().display().to_string();
            let kind = entry.header().entry_type();
            let mode = entry.header().mode().unwrap();
            let link = entry
                .link_name()
                .unwrap()
                .map(|l| l.display().to_string());
            let mut content = String::new();
            use std::io::Read;
            entry.read_to_string(&mut content).unwrap();
            seen.insert(path, (kind, mode, link, content));
        }

        assert_eq!(seen.len(), 3, "subdirectory must not be archived");
        let (kind, mode, _, content) = &seen["foo/PKGBUILD"];
        assert_eq!(*kind, tar::EntryType::Regular);
        assert_eq!(*mode, 0o644);
        assert_eq!(content, "pkgname=foo");
        let (_, mode, _, _) = &seen["foo/build.sh"];
        assert_eq!(*mode, 0o755);
        let (kind, _, link, _) = &seen["foo/link.patch"];
        assert_eq!(*kind, tar::EntryType::Symlink);
        assert_eq!(link.as_deref(), Some("PKGBUILD"));
    }

    #[tokio::test]
    async fn snapshot_of_dir_only_tree_is_empty() {
        let upstream = TempDir::new().unwrap();
        let mirrors = TempDir::new().unwrap();
        let repo = init_upstream(upstream.path(), "foo");
        commit_files(&repo, &[("PKGBUILD", "x", 0o100644)], "init", 100);
        let head = commit_subdir(&repo, "only", 200);

        let mirror = test_mirror(upstream.path(), mirrors.path());
        mirror.ensure("foo").await.unwrap();

        // Snapshot a tree that holds a single subdirectory next to nothing:
        // build one by replacing the whole tree.
        let sig = Signature::new("tester", "tester@localhost", &Time::new(300, 0)).unwrap();
        let blob = repo.blob(b"nested").unwrap();
        let mut sub = repo.treebuilder(None).unwrap();
        sub.insert("nested.txt", blob, 0o100644).unwrap();
        let sub_tree = sub.write().unwrap();
        let mut tb = repo.treebuilder(None).unwrap();
        tb.insert("only", sub_tree, 0o040000).unwrap();
        let tree = repo.find_tree(tb.write().unwrap()).unwrap();
        let parent = repo.find_commit(Oid::from_str(&head).unwrap()).unwrap();
        let dir_only = repo
            .commit(Some("refs/heads/master"), &sig, &sig, "dirs", &tree, &[&parent])
            .unwrap()
            .to_string();
        mirror.ensure("foo").await.unwrap();

        let tar_bytes = mirror.snapshot_tar("foo", &dir_only).await.unwrap();
        let mut archive = tar::Archive::new(&tar_bytes[..]);
        assert_eq!(archive.entries().unwrap().count(), 0);
    }
}
