//! The orchestrator: working copy, cache key, environment, execution.

use crate::backend::{create_backend, Backend};
use crate::cache::CacheStore;
use crate::error::{ArcaError, Result};
use crate::git::{GitCli, Vcs};
use crate::hasher::cache_key;
use crate::repository::{RepositoryCache, RunOptions, WorkingCopy};
use crate::result::ExecutionResult;
use crate::settings::{ArcaConfig, Settings};
use crate::task::Task;
use regex::Regex;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, info};

static REPO_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(https?|file)://[\w._\-/~]*(\.git)?/?$").expect("valid regex")
});

type ShouldCache = Box<dyn Fn(&ExecutionResult) -> bool>;

/// Only `http(s)://` and `file://` repositories are supported.
pub fn validate_repo_url(repo: &str) -> Result<()> {
    if REPO_URL.is_match(repo) {
        Ok(())
    } else {
        Err(ArcaError::misconfigured(format!(
            "{} is not a valid http[s] or file:// git repository.",
            repo
        )))
    }
}

pub struct Arca {
    config: ArcaConfig,
    repositories: RepositoryCache,
    backend: Box<dyn Backend>,
    cache: Box<dyn CacheStore>,
    should_cache: ShouldCache,
}

impl Arca {
    /// Resolves the configuration, backend and cache from `settings`.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let config = ArcaConfig::from_settings(settings)?;
        let backend = create_backend(config.backend, settings, &config.base_dir)?;
        let cache = config.cache.open(config.ignore_cache_errors)?;
        Ok(Self::with_parts(config, backend, cache, Box::new(GitCli)))
    }

    pub fn with_parts(
        config: ArcaConfig,
        backend: Box<dyn Backend>,
        cache: Box<dyn CacheStore>,
        vcs: Box<dyn Vcs>,
    ) -> Self {
        info!(
            base_dir = %config.base_dir.display(),
            backend = %backend.kind(),
            single_pull = config.single_pull,
            "arca configured"
        );
        let repositories = RepositoryCache::with_vcs(&config.base_dir, config.single_pull, vcs);
        Self {
            config,
            repositories,
            backend,
            cache,
            should_cache: Box::new(|_| true),
        }
    }

    /// Decides which results are stored; by default all of them are.
    pub fn should_cache(mut self, predicate: impl Fn(&ExecutionResult) -> bool + 'static) -> Self {
        self.should_cache = Box::new(predicate);
        self
    }

    pub fn cache_successful_only(self) -> Self {
        self.should_cache(ExecutionResult::is_success)
    }

    pub fn config(&self) -> &ArcaConfig {
        &self.config
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub fn backend_mut(&mut self) -> &mut dyn Backend {
        self.backend.as_mut()
    }

    pub fn cache(&self) -> &dyn CacheStore {
        self.cache.as_ref()
    }

    pub fn repositories(&self) -> &RepositoryCache {
        &self.repositories
    }

    /// Clones or updates `repo` at `branch`.
    pub fn get_files(&mut self, repo: &str, branch: &str, options: &RunOptions) -> Result<WorkingCopy> {
        validate_repo_url(repo)?;
        self.repositories.get_files(repo, branch, options)
    }

    /// Working copy path and the commit it is at.
    pub fn get_repo(&mut self, repo: &str, branch: &str, options: &RunOptions) -> Result<(PathBuf, String)> {
        let copy = self.get_files(repo, branch, options)?;
        Ok((copy.path, copy.commit))
    }

    pub fn current_git_hash(&self, copy: &WorkingCopy, short: bool) -> Result<String> {
        self.repositories.current_git_hash(copy, short)
    }

    pub fn pull_again(&mut self, repo: Option<&str>, branch: Option<&str>) -> Result<()> {
        self.repositories.pull_again(repo, branch)
    }

    pub fn cache_key(&self, copy: &WorkingCopy, task: &Task) -> String {
        cache_key(&copy.repo, &copy.branch, &copy.commit, task.hash())
    }

    /// Runs `task` in the configured backend, or returns the cached result
    /// for the same repository, branch, commit and task.
    pub fn run(&mut self, repo: &str, branch: &str, task: &Task, options: &RunOptions) -> Result<ExecutionResult> {
        info!(task = %task, repo, branch, "running task");
        let copy = self.get_files(repo, branch, options)?;

        let key = self.cache_key(&copy, task);
        debug!(key = %key, "cache key");

        let backend = &mut self.backend;
        let should_cache = &self.should_cache;

        let mut compute = || -> Result<Vec<u8>> {
            debug!("value not in cache, creating");
            let environment = backend.get_or_create_environment(&copy)?;
            backend.run(&copy, task, &environment)?.to_bytes()
        };
        let cacheable = |bytes: &[u8]| {
            ExecutionResult::from_bytes(bytes)
                .map(|result| should_cache(&result))
                .unwrap_or(false)
        };

        let bytes = self.cache.get_or_create(&key, &mut compute, &cacheable)?;
        ExecutionResult::from_bytes(&bytes)
    }

    /// Absolute path of a file inside the working copy of `repo` at `branch`.
    pub fn static_filename(
        &mut self,
        repo: &str,
        branch: &str,
        relative_path: impl AsRef<Path>,
        options: &RunOptions,
    ) -> Result<PathBuf> {
        let relative_path = relative_path.as_ref();
        let copy = self.get_files(repo, branch, options)?;
        let root = std::path::absolute(&copy.path)?;

        let out_of_range = || ArcaError::FileOutOfRange(relative_path.to_path_buf());

        let candidate = normalize(&root.join(relative_path)).ok_or_else(out_of_range)?;
        if candidate == root || !candidate.starts_with(&root) {
            return Err(out_of_range());
        }
        if !candidate.exists() {
            return Err(ArcaError::FileNotFound(relative_path.to_path_buf()));
        }

        // symlinks may still point outside of the repository
        let resolved = candidate.canonicalize()?;
        if !resolved.starts_with(root.canonicalize()?) {
            return Err(out_of_range());
        }

        info!(path = %relative_path.display(), resolved = %resolved.display(), "static file");
        Ok(resolved)
    }
}

/// Resolves `.` and `..` lexically; `None` when `..` climbs above the root.
fn normalize(path: &Path) -> Option<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                if !normalized.pop() {
                    return None;
                }
            }
            Component::CurDir => {}
            other => normalized.push(other),
        }
    }
    Some(normalized)
}
