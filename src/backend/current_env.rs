use super::manifest::{requirement_lines, Manifest};
use super::{
    install_step, run_in_subprocess, Backend, BackendConfig, BackendKind, EnvironmentHandle, Workspace,
    DEFAULT_INSTALL_TIMEOUT_SECS,
};
use crate::error::{ArcaError, Result};
use crate::repository::WorkingCopy;
use crate::result::ExecutionResult;
use crate::settings::Settings;
use crate::task::Task;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// What to do when the repository requires packages the baseline lacks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequirementsStrategy {
    Ignore,
    #[default]
    Raise,
    InstallExtra,
}

impl FromStr for RequirementsStrategy {
    type Err = ArcaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "ignore" => Ok(RequirementsStrategy::Ignore),
            "raise" => Ok(RequirementsStrategy::Raise),
            "install_extra" => Ok(RequirementsStrategy::InstallExtra),
            other => Err(ArcaError::misconfigured(format!(
                "Unknown requirements strategy '{}', expected ignore, raise or install_extra",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CurrentEnvironmentConfig {
    pub backend: BackendConfig,
    /// Requirements the live interpreter already satisfies
    pub current_environment_requirements: Option<PathBuf>,
    pub requirements_strategy: RequirementsStrategy,
    pub python: String,
    /// Bound on installing extra requirements
    pub install_timeout: Duration,
}

impl CurrentEnvironmentConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let backend = settings.backend(BackendKind::CurrentEnvironment.settings_name());
        let requirements_strategy = match backend.string("requirements_strategy") {
            Some(value) => value.parse()?,
            None => RequirementsStrategy::default(),
        };
        Ok(Self {
            backend: BackendConfig::from_settings(&backend)?,
            current_environment_requirements: backend
                .string("current_environment_requirements")
                .map(PathBuf::from),
            requirements_strategy,
            python: backend.string_or("python", "python3"),
            install_timeout: backend.secs("install_timeout", DEFAULT_INSTALL_TIMEOUT_SECS)?,
        })
    }
}

/// Runs tasks with the interpreter Arca itself is configured with.
pub struct CurrentEnvironmentBackend {
    config: CurrentEnvironmentConfig,
    workspace: Workspace,
}

impl CurrentEnvironmentBackend {
    pub fn new(config: CurrentEnvironmentConfig, base_dir: &Path) -> Result<Self> {
        if config.requirements_strategy != RequirementsStrategy::Ignore {
            if let Some(baseline) = &config.current_environment_requirements {
                if !baseline.is_file() {
                    return Err(ArcaError::misconfigured(format!(
                        "Can't locate current environment requirements at {}",
                        baseline.display()
                    )));
                }
            }
        }
        Ok(Self {
            config,
            workspace: Workspace::new(base_dir),
        })
    }

    fn baseline(&self) -> Result<BTreeSet<String>> {
        match &self.config.current_environment_requirements {
            Some(path) => Ok(requirement_lines(&fs::read_to_string(path)?)),
            None => Ok(BTreeSet::new()),
        }
    }

    fn install(&self, requirements: &BTreeSet<String>) -> Result<()> {
        info!(count = requirements.len(), "installing extra requirements into the current environment");
        let mut cmd = Command::new(&self.config.python);
        cmd.args(["-m", "pip", "install", "--disable-pip-version-check"])
            .args(requirements);
        install_step(
            cmd,
            self.config.install_timeout,
            "Unable to install requirements from the target repository",
        )
    }
}

/// Repository requirements missing from `baseline`.
pub fn extra_requirements(repository: &BTreeSet<String>, baseline: &BTreeSet<String>) -> BTreeSet<String> {
    repository.difference(baseline).cloned().collect()
}

impl Backend for CurrentEnvironmentBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::CurrentEnvironment
    }

    fn get_or_create_environment(&mut self, copy: &WorkingCopy) -> Result<EnvironmentHandle> {
        let handle = EnvironmentHandle::Current {
            python: self.config.python.clone(),
        };

        if self.config.requirements_strategy == RequirementsStrategy::Ignore {
            info!("requirements strategy is ignore");
            return Ok(handle);
        }

        let Some(manifest) = Manifest::locate(&copy.path, &self.config.backend)? else {
            return Ok(handle);
        };

        let extra = extra_requirements(&manifest.requirement_set()?, &self.baseline()?);
        if extra.is_empty() {
            return Ok(handle);
        }

        match self.config.requirements_strategy {
            RequirementsStrategy::Raise => Err(ArcaError::RequirementsMismatch {
                message: format!(
                    "There are extra requirements in repository {}, branch {}.",
                    copy.repo, copy.branch
                ),
                diff: extra.into_iter().collect::<Vec<_>>().join("\n"),
            }),
            RequirementsStrategy::InstallExtra => {
                self.install(&extra)?;
                Ok(handle)
            }
            RequirementsStrategy::Ignore => Ok(handle),
        }
    }

    fn run(
        &mut self,
        copy: &WorkingCopy,
        task: &Task,
        _environment: &EnvironmentHandle,
    ) -> Result<ExecutionResult> {
        run_in_subprocess(
            &self.workspace,
            Path::new(&self.config.python),
            &self.config.backend.working_dir(copy),
            task,
        )
    }
}
