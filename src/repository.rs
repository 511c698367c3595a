//! Working copies of `(repository, branch)` pairs under `<base_dir>/repos`.
//!
//! A working copy is cloned once and afterwards updated by fetching the branch
//! and hard-resetting to it, never by merging. With `single_pull` each pair is
//! fetched at most once per instance until [`RepositoryCache::pull_again`].

use crate::error::{ArcaError, Result};
use crate::git::{CloneOptions, Depth, GitCli, Vcs};
use crate::hasher::repo_id;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Clone tuning for the first checkout of a branch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// History depth, one commit when neither this nor `shallow_since` is set
    pub depth: Option<Depth>,
    pub shallow_since: Option<NaiveDate>,
    pub reference: Option<PathBuf>,
}

impl RunOptions {
    pub fn depth(mut self, depth: Depth) -> Self {
        self.depth = Some(depth);
        self
    }

    pub fn shallow_since(mut self, date: NaiveDate) -> Self {
        self.shallow_since = Some(date);
        self
    }

    pub fn reference(mut self, path: impl Into<PathBuf>) -> Self {
        self.reference = Some(path.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.depth.is_some() && self.shallow_since.is_some() {
            return Err(ArcaError::misconfigured(
                "Only one of depth and shallow_since can be set",
            ));
        }
        Ok(())
    }

    fn clone_options(&self, reference: Option<PathBuf>) -> CloneOptions {
        let depth = match (self.depth, self.shallow_since) {
            (Some(depth), _) => Some(depth),
            (None, Some(_)) => None,
            (None, None) => Some(Depth::default()),
        };
        CloneOptions {
            depth,
            shallow_since: self.shallow_since,
            reference,
        }
    }
}

/// Parses a `YYYY-MM-DD` date for `shallow_since`.
pub fn parse_shallow_since(value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").map_err(|_| {
        ArcaError::misconfigured(format!(
            "Shallow since '{}' is not a date in the YYYY-MM-DD format",
            value
        ))
    })
}

/// A checked-out branch and the commit it is at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkingCopy {
    pub repo: String,
    pub branch: String,
    pub repo_id: String,
    pub path: PathBuf,
    pub commit: String,
    /// Unambiguous abbreviation of `commit`, as git shortens it
    pub short_commit: String,
}

pub struct RepositoryCache {
    repos_dir: PathBuf,
    single_pull: bool,
    vcs: Box<dyn Vcs>,
    /// repo_id -> branch -> commit, filled only in single-pull mode
    current_hashes: HashMap<String, HashMap<String, String>>,
}

impl RepositoryCache {
    pub fn new(base_dir: &Path, single_pull: bool) -> Self {
        Self::with_vcs(base_dir, single_pull, Box::new(GitCli))
    }

    pub fn with_vcs(base_dir: &Path, single_pull: bool, vcs: Box<dyn Vcs>) -> Self {
        Self {
            repos_dir: base_dir.join("repos"),
            single_pull,
            vcs,
            current_hashes: HashMap::new(),
        }
    }

    pub fn single_pull(&self) -> bool {
        self.single_pull
    }

    pub fn vcs(&self) -> &dyn Vcs {
        self.vcs.as_ref()
    }

    /// Directory holding every branch of `repo`
    pub fn path_to_repo(&self, repo: &str) -> PathBuf {
        self.repos_dir.join(repo_id(repo))
    }

    pub fn path_to_repo_and_branch(&self, repo: &str, branch: &str) -> PathBuf {
        let path = self.path_to_repo(repo).join(branch);
        std::path::absolute(&path).unwrap_or(path)
    }

    /// Clones or updates the branch and returns its working copy.
    pub fn get_files(&mut self, repo: &str, branch: &str, options: &RunOptions) -> Result<WorkingCopy> {
        options.validate()?;

        let id = repo_id(repo);
        let path = self.path_to_repo_and_branch(repo, branch);
        info!(repo_id = %id, branch, path = %path.display(), "resolving working copy");

        if path.join(".git").is_dir() {
            if self.pulled_hash(&id, branch).is_none() {
                debug!(repo_id = %id, branch, "pulling");
                self.vcs.fetch(&path, branch)?;
                self.vcs.reset_hard(&path, "FETCH_HEAD")?;
            } else {
                debug!(repo_id = %id, branch, "single pull enabled and already pulled");
            }
        } else {
            if path.exists() {
                warn!(path = %path.display(), "removing incomplete working copy");
                fs::remove_dir_all(&path)?;
            }
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }

            let reference = self.get_reference_repository(repo, branch, options.reference.as_deref());
            info!(repo_id = %id, branch, reference = ?reference, "initial clone");

            let clone_options = options.clone_options(reference);
            if let Err(e) = self.vcs.clone_branch(repo, branch, &path, &clone_options) {
                if path.exists() {
                    fs::remove_dir_all(&path)?;
                }
                return Err(e);
            }
        }

        let commit = match self.pulled_hash(&id, branch) {
            Some(hash) => hash.to_string(),
            None => self.vcs.rev_parse(&path, "HEAD")?,
        };

        let short_commit = self.vcs.short_hash(&path, &commit)?;

        if self.single_pull {
            self.current_hashes
                .entry(id.clone())
                .or_default()
                .insert(branch.to_string(), commit.clone());
        }

        Ok(WorkingCopy {
            repo: repo.to_string(),
            branch: branch.to_string(),
            repo_id: id,
            path,
            commit,
            short_commit,
        })
    }

    fn pulled_hash(&self, id: &str, branch: &str) -> Option<&str> {
        if !self.single_pull {
            return None;
        }
        self.current_hashes
            .get(id)
            .and_then(|branches| branches.get(branch))
            .map(String::as_str)
    }

    /// Explicit reference if given, else a sibling full clone of the same repo.
    ///
    /// `master` is preferred. Shallow siblings are skipped: git refuses to
    /// borrow objects from a shallow repository.
    pub fn get_reference_repository(&self, repo: &str, branch: &str, explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(reference) = explicit {
            return Some(reference.to_path_buf());
        }

        let entries = fs::read_dir(self.path_to_repo(repo)).ok()?;
        let mut candidates: Vec<(String, PathBuf)> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| (entry.file_name().to_string_lossy().into_owned(), entry.path()))
            .filter(|(name, path)| {
                name != branch && path.join(".git").is_dir() && !path.join(".git/shallow").exists()
            })
            .collect();

        candidates.sort_by(|(a, _), (b, _)| (a != "master", a).cmp(&(b != "master", b)));
        candidates.into_iter().next().map(|(_, path)| path)
    }

    /// Forgets single-pull hashes: everything, one repo, or one branch.
    pub fn pull_again(&mut self, repo: Option<&str>, branch: Option<&str>) -> Result<()> {
        match (repo, branch) {
            (None, None) => self.current_hashes.clear(),
            (None, Some(_)) => {
                return Err(ArcaError::misconfigured(
                    "You can't define just the branch to pull again.",
                ))
            }
            (Some(repo), None) => {
                self.current_hashes.remove(&repo_id(repo));
            }
            (Some(repo), Some(branch)) => {
                if let Some(branches) = self.current_hashes.get_mut(&repo_id(repo)) {
                    branches.remove(branch);
                }
            }
        }
        Ok(())
    }

    /// Commit of the working copy: the single-pull memo if present, else HEAD.
    pub fn current_git_hash(&self, copy: &WorkingCopy, short: bool) -> Result<String> {
        let hash = match self.pulled_hash(&copy.repo_id, &copy.branch) {
            Some(hash) => hash.to_string(),
            None => self.vcs.rev_parse(&copy.path, "HEAD")?,
        };

        if short {
            self.vcs.short_hash(&copy.path, &hash)
        } else {
            Ok(hash)
        }
    }
}
