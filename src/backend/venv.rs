use super::manifest::{environment_fingerprint, Manifest, ManifestKind};
use super::{
    install_step, run_in_subprocess, Backend, BackendConfig, BackendKind, EnvironmentHandle, Workspace,
    DEFAULT_INSTALL_TIMEOUT_SECS,
};
use crate::error::{ArcaError, Result};
use crate::repository::WorkingCopy;
use crate::result::ExecutionResult;
use crate::settings::Settings;
use crate::task::Task;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tracing::{info, warn};

/// Written last; a venv directory without it is an interrupted build.
const COMPLETE_MARKER: &str = ".arca-complete";

#[derive(Debug, Clone)]
pub struct VenvConfig {
    pub backend: BackendConfig,
    /// Bound on creating the venv and on each install step
    pub install_timeout: Duration,
    /// Interpreter the venvs are created with
    pub python: String,
}

impl VenvConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let backend = settings.backend(BackendKind::Venv.settings_name());
        Ok(Self {
            backend: BackendConfig::from_settings(&backend)?,
            install_timeout: backend.secs("install_timeout", DEFAULT_INSTALL_TIMEOUT_SECS)?,
            python: backend.string_or("python", "python3"),
        })
    }
}

/// Runs tasks in virtualenvs shared by every working copy with the same
/// dependency fingerprint.
pub struct VenvBackend {
    config: VenvConfig,
    workspace: Workspace,
}

impl VenvBackend {
    pub fn new(config: VenvConfig, base_dir: &Path) -> Self {
        Self {
            config,
            workspace: Workspace::new(base_dir),
        }
    }

    pub fn venv_path(&self, fingerprint: &str) -> PathBuf {
        self.workspace.dir("venvs").join(fingerprint)
    }

    fn build(&self, path: &Path, manifest: Option<&Manifest>) -> Result<()> {
        let absolute = std::path::absolute(path)?;

        let mut create = Command::new(&self.config.python);
        create.args(["-m", "venv"]).arg(&absolute);
        self.install_step(create, "Unable to create the virtual environment")?;

        let python = absolute.join("bin").join("python");
        let Some(manifest) = manifest else {
            info!(path = %path.display(), "no manifest in repository, empty venv it is");
            return Ok(());
        };

        match manifest.kind {
            ManifestKind::Requirements => {
                info!(requirements = %manifest.path.display(), "installing requirements");
                let mut install = Command::new(&python);
                install
                    .args(["-m", "pip", "install", "--disable-pip-version-check", "-r"])
                    .arg(&manifest.path);
                self.install_step(install, "Unable to install requirements.txt")?;
            }
            ManifestKind::Pipfile => {
                info!(lockfile = %manifest.path.display(), "installing from Pipfile.lock");
                let mut pipenv = Command::new(&python);
                pipenv.args(["-m", "pip", "install", "--disable-pip-version-check", "pipenv"]);
                self.install_step(pipenv, "Unable to install pipenv")?;

                let mut install = Command::new(&python);
                install
                    .args(["-m", "pipenv", "install", "--deploy", "--ignore-pipfile"])
                    .env("VIRTUAL_ENV", &absolute)
                    .env("PIPENV_VERBOSITY", "-1");
                if let Some(dir) = manifest.path.parent() {
                    install.current_dir(dir);
                }
                self.install_step(install, "Unable to install dependencies from Pipfile.lock")?;
            }
        }
        Ok(())
    }

    fn install_step(&self, cmd: Command, failure: &str) -> Result<()> {
        install_step(cmd, self.config.install_timeout, failure)
    }
}

impl Backend for VenvBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Venv
    }

    fn get_or_create_environment(&mut self, copy: &WorkingCopy) -> Result<EnvironmentHandle> {
        let manifest = Manifest::locate(&copy.path, &self.config.backend)?;
        let fingerprint = environment_fingerprint(manifest.as_ref());
        let path = self.venv_path(&fingerprint);

        if path.join(COMPLETE_MARKER).is_file() {
            info!(path = %path.display(), "venv already exists");
            return Ok(EnvironmentHandle::Venv { path });
        }

        if path.exists() {
            warn!(path = %path.display(), "removing incomplete venv");
            fs::remove_dir_all(&path)?;
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        info!(path = %path.display(), "creating venv");
        if let Err(e) = self.build(&path, manifest.as_ref()) {
            if path.exists() {
                fs::remove_dir_all(&path)?;
            }
            return Err(e);
        }

        fs::write(path.join(COMPLETE_MARKER), &fingerprint)?;
        Ok(EnvironmentHandle::Venv { path })
    }

    fn run(
        &mut self,
        copy: &WorkingCopy,
        task: &Task,
        environment: &EnvironmentHandle,
    ) -> Result<ExecutionResult> {
        let EnvironmentHandle::Venv { path } = environment else {
            return Err(ArcaError::misconfigured(
                "The venv backend can only run tasks in a venv",
            ));
        };
        let python = std::path::absolute(path.join("bin").join("python"))?;
        run_in_subprocess(
            &self.workspace,
            &python,
            &self.config.backend.working_dir(copy),
            task,
        )
    }
}
