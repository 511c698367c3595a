//! Execution environments.
//!
//! Every backend resolves an environment for a working copy, then runs a task
//! inside it through the runner program. Backends are picked from a closed
//! registry by [`BackendKind`].

pub mod current_env;
pub mod docker;
pub mod manifest;
pub mod vagrant;
pub mod venv;

pub use current_env::{CurrentEnvironmentBackend, CurrentEnvironmentConfig, RequirementsStrategy};
pub use docker::{DockerBackend, DockerConfig};
pub use manifest::{Manifest, ManifestKind};
pub use vagrant::{VagrantBackend, VagrantConfig};
pub use venv::{VenvBackend, VenvConfig};

use crate::docker::ImageRef;
use crate::error::{ArcaError, Result};
use crate::hasher::hash_bytes;
use crate::process::{self, Completion};
use crate::repository::WorkingCopy;
use crate::result::ExecutionResult;
use crate::settings::{BackendSettings, Settings};
use crate::task::protocol::{parse_runner_output, RUNNER_FILENAME, RUNNER_SOURCE};
use crate::task::Task;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// Bound on each dependency installation step and image build, in seconds
pub const DEFAULT_INSTALL_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Venv,
    Docker,
    Vagrant,
    CurrentEnvironment,
}

impl BackendKind {
    pub const ALL: [BackendKind; 4] = [
        BackendKind::Venv,
        BackendKind::Docker,
        BackendKind::Vagrant,
        BackendKind::CurrentEnvironment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Venv => "venv",
            BackendKind::Docker => "docker",
            BackendKind::Vagrant => "vagrant",
            BackendKind::CurrentEnvironment => "current_environment",
        }
    }

    /// Prefix of this backend's own settings, e.g. `docker_backend`
    pub fn settings_name(&self) -> &'static str {
        match self {
            BackendKind::Venv => "venv_backend",
            BackendKind::Docker => "docker_backend",
            BackendKind::Vagrant => "vagrant_backend",
            BackendKind::CurrentEnvironment => "current_environment_backend",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = ArcaError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        let name = normalized
            .strip_suffix("_backend")
            .unwrap_or(&normalized);
        BackendKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == name)
            .ok_or_else(|| {
                ArcaError::misconfigured(format!(
                    "Unknown backend '{}', expected one of venv, docker, vagrant, current_environment",
                    s
                ))
            })
    }
}

/// What a backend resolved for one working copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvironmentHandle {
    /// The live interpreter
    Current { python: String },
    Venv { path: PathBuf },
    Container { image: ImageRef, container: String },
    VirtualMachine {
        vagrantfile: PathBuf,
        image: ImageRef,
        container: String,
    },
}

pub trait Backend {
    fn kind(&self) -> BackendKind;

    /// Finds or builds the environment the working copy's tasks run in.
    fn get_or_create_environment(&mut self, copy: &WorkingCopy) -> Result<EnvironmentHandle>;

    /// Executes `task` in `environment`, bounded by the task's timeout.
    fn run(
        &mut self,
        copy: &WorkingCopy,
        task: &Task,
        environment: &EnvironmentHandle,
    ) -> Result<ExecutionResult>;
}

/// Settings every backend shares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    /// Requirements file, relative to the repository root
    pub requirements_location: PathBuf,
    /// Directory holding `Pipfile` and `Pipfile.lock`, relative to the root
    pub pipfile_location: PathBuf,
    /// Where tasks run, relative to the repository root
    pub cwd: PathBuf,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            requirements_location: PathBuf::from("requirements.txt"),
            pipfile_location: PathBuf::new(),
            cwd: PathBuf::new(),
        }
    }
}

impl BackendConfig {
    pub fn from_settings(settings: &BackendSettings<'_>) -> Result<Self> {
        let config = Self {
            requirements_location: PathBuf::from(
                settings.string_or("requirements_location", "requirements.txt"),
            ),
            pipfile_location: settings
                .string("pipfile_location")
                .map(PathBuf::from)
                .unwrap_or_default(),
            cwd: settings.string("cwd").map(PathBuf::from).unwrap_or_default(),
        };

        for (key, path) in [
            ("requirements_location", &config.requirements_location),
            ("pipfile_location", &config.pipfile_location),
            ("cwd", &config.cwd),
        ] {
            if path.is_absolute() {
                return Err(ArcaError::misconfigured(format!(
                    "{} must be relative to the repository root",
                    key
                )));
            }
        }
        Ok(config)
    }

    pub fn working_dir(&self, copy: &WorkingCopy) -> PathBuf {
        copy.path.join(&self.cwd)
    }
}

/// Files under the base directory the backends share.
#[derive(Debug, Clone)]
pub struct Workspace {
    base_dir: PathBuf,
}

impl Workspace {
    pub fn new(base_dir: &Path) -> Self {
        Self {
            base_dir: base_dir.to_path_buf(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn dir(&self, name: &str) -> PathBuf {
        self.base_dir.join(name)
    }

    /// Writes the runner to `scripts/runner.py`, only when its content changed
    pub fn write_runner(&self) -> Result<PathBuf> {
        let path = self.dir("scripts").join(RUNNER_FILENAME);
        write_if_changed(&path, RUNNER_SOURCE.as_bytes())?;
        absolute(path)
    }

    /// Writes the task definition to `tasks/<hash>.json`
    pub fn write_task(&self, task: &Task) -> Result<PathBuf> {
        let path = self.dir("tasks").join(format!("{}.json", task.hash()));
        write_if_changed(&path, task.json().as_bytes())?;
        absolute(path)
    }
}

pub(crate) fn write_if_changed(path: &Path, contents: &[u8]) -> Result<()> {
    if path.is_file() && crate::hasher::hash_file(path)? == hash_bytes(contents) {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents)?;
    fs::rename(tmp, path)?;
    Ok(())
}

fn absolute(path: PathBuf) -> Result<PathBuf> {
    Ok(std::path::absolute(path)?)
}

/// Runs the runner with `python` as a local subprocess in `cwd`.
///
/// Shared by the venv and current environment backends.
pub fn run_in_subprocess(
    workspace: &Workspace,
    python: &Path,
    cwd: &Path,
    task: &Task,
) -> Result<ExecutionResult> {
    let runner = workspace.write_runner()?;
    let definition = workspace.write_task(task)?;

    info!(task = %task, cwd = %cwd.display(), python = %python.display(), "running task");

    let mut cmd = Command::new(python);
    cmd.arg(&runner).arg(&definition).current_dir(cwd);

    match process::run_with_timeout(cmd, Some(task.timeout()))? {
        Completion::TimedOut => Err(timed_out(task)),
        Completion::Finished(output) => {
            debug!(status = ?output.status.code(), "runner finished");
            parse_runner_output(&output.stdout, &output.stderr, output.status.code())
        }
    }
}

/// Runs one dependency installation command, bounded by `timeout`.
pub(crate) fn install_step(cmd: Command, timeout: Duration, failure: &str) -> Result<()> {
    match process::run_with_timeout(cmd, Some(timeout))? {
        Completion::TimedOut => Err(ArcaError::timeout(
            failure,
            timeout.as_secs(),
            Default::default(),
        )),
        Completion::Finished(output) if !output.success() => {
            Err(ArcaError::build(failure, output.context()))
        }
        Completion::Finished(_) => Ok(()),
    }
}

pub(crate) fn timed_out(task: &Task) -> ArcaError {
    ArcaError::timeout(
        format!("{} timed out", task),
        task.timeout().as_secs(),
        Default::default(),
    )
}

/// Builds the backend `kind` from settings.
pub fn create_backend(kind: BackendKind, settings: &Settings, base_dir: &Path) -> Result<Box<dyn Backend>> {
    let backend: Box<dyn Backend> = match kind {
        BackendKind::Venv => Box::new(VenvBackend::new(
            VenvConfig::from_settings(settings)?,
            base_dir,
        )),
        BackendKind::CurrentEnvironment => Box::new(CurrentEnvironmentBackend::new(
            CurrentEnvironmentConfig::from_settings(settings)?,
            base_dir,
        )?),
        BackendKind::Docker => Box::new(DockerBackend::new(
            DockerConfig::from_settings(settings, BackendKind::Docker)?,
            base_dir,
        )?),
        BackendKind::Vagrant => Box::new(VagrantBackend::new(
            VagrantConfig::from_settings(settings)?,
            base_dir,
        )?),
    };
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!("venv".parse::<BackendKind>().unwrap(), BackendKind::Venv);
        assert_eq!(
            "docker_backend".parse::<BackendKind>().unwrap(),
            BackendKind::Docker
        );
        assert_eq!(
            "Current-Environment".parse::<BackendKind>().unwrap(),
            BackendKind::CurrentEnvironment
        );
        assert!(matches!(
            "kubernetes".parse::<BackendKind>(),
            Err(ArcaError::Misconfigured(_))
        ));
    }

    #[test]
    fn test_backend_config_rejects_absolute_paths() {
        let settings = Settings::from_pairs([("backend_cwd", "/etc")]);
        assert!(BackendConfig::from_settings(&settings.backend("venv_backend")).is_err());

        let settings = Settings::from_pairs([("venv_backend_cwd", "src")]);
        let config = BackendConfig::from_settings(&settings.backend("venv_backend")).unwrap();
        assert_eq!(config.cwd, PathBuf::from("src"));
        assert_eq!(config.requirements_location, PathBuf::from("requirements.txt"));
    }

    #[cfg(unix)]
    #[test]
    fn test_install_step_is_bounded() {
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let err = install_step(cmd, Duration::from_millis(200), "Unable to install").unwrap_err();
        assert!(err.is_timeout());

        let err = install_step(Command::new("false"), Duration::from_secs(10), "Unable to install").unwrap_err();
        assert!(err.is_build_error() && !err.is_timeout());
    }

    #[test]
    fn test_workspace_writes_files_once() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::new(dir.path());

        let runner = workspace.write_runner().unwrap();
        assert!(runner.ends_with("scripts/runner.py"));
        assert_eq!(fs::read_to_string(&runner).unwrap(), RUNNER_SOURCE);

        let task = Task::new("library.mod:func").unwrap();
        let definition = workspace.write_task(&task).unwrap();
        assert_eq!(
            definition.file_name().unwrap().to_string_lossy(),
            format!("{}.json", task.hash())
        );
        assert_eq!(fs::read_to_string(definition).unwrap(), task.json());
    }
}
