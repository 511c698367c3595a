/// Arca error types and handling utilities
use std::fmt;
use std::path::PathBuf;

/// Captured output of a failed install, build or task execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildContext {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    /// Traceback reported by the runner when the callable itself failed
    pub traceback: Option<String>,
}

impl BuildContext {
    pub fn from_output(stdout: &[u8], stderr: &[u8], exit_code: Option<i32>) -> Self {
        Self {
            stdout: String::from_utf8_lossy(stdout).into_owned(),
            stderr: String::from_utf8_lossy(stderr).into_owned(),
            exit_code,
            traceback: None,
        }
    }

    pub fn with_traceback(traceback: impl Into<String>) -> Self {
        Self {
            traceback: Some(traceback.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.stdout.is_empty()
            && self.stderr.is_empty()
            && self.exit_code.is_none()
            && self.traceback.is_none()
    }
}

impl fmt::Display for BuildContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(traceback) = &self.traceback {
            return write!(f, "{}", traceback);
        }
        if let Some(code) = self.exit_code {
            writeln!(f, "exit code: {}", code)?;
        }
        if !self.stdout.is_empty() {
            writeln!(f, "stdout:\n{}", self.stdout)?;
        }
        if !self.stderr.is_empty() {
            writeln!(f, "stderr:\n{}", self.stderr)?;
        }
        Ok(())
    }
}

/// Main error type for Arca operations
#[derive(Debug, thiserror::Error)]
pub enum ArcaError {
    /// Invalid configuration, detected eagerly
    #[error("Arca is misconfigured: {0}")]
    Misconfigured(String),
    /// The task definition is invalid
    #[error("Task is misconfigured: {0}")]
    TaskMisconfigured(String),
    /// Cloning or fetching the target repository failed
    #[error("{message}\n\n{stderr}")]
    Pull { message: String, stderr: String },
    /// Building an environment or running a task failed
    #[error("{message}\n\n{context}")]
    Build {
        message: String,
        context: BuildContext,
    },
    /// The install or task did not finish in time
    #[error("{message} (timed out after {timeout_secs}s)\n\n{context}")]
    BuildTimeout {
        message: String,
        timeout_secs: u64,
        context: BuildContext,
    },
    /// Pushing an image to the configured registry failed
    #[error("{message}\n\n{full_output}")]
    PushToRegistry {
        message: String,
        full_output: String,
    },
    /// The repository requires packages the current environment lacks
    #[error("{message}\nDiff:\n{diff}")]
    RequirementsMismatch { message: String, diff: String },
    /// A relative path resolved outside of the repository
    #[error("{0} is not inside the repository")]
    FileOutOfRange(PathBuf),
    #[error("{0} does not exist in the repository")]
    FileNotFound(PathBuf),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ArcaError>;

impl ArcaError {
    pub fn misconfigured(message: impl Into<String>) -> Self {
        ArcaError::Misconfigured(message.into())
    }

    pub fn task(message: impl Into<String>) -> Self {
        ArcaError::TaskMisconfigured(message.into())
    }

    pub fn pull(message: impl Into<String>, stderr: impl Into<String>) -> Self {
        ArcaError::Pull {
            message: message.into(),
            stderr: stderr.into(),
        }
    }

    pub fn build(message: impl Into<String>, context: BuildContext) -> Self {
        ArcaError::Build {
            message: message.into(),
            context,
        }
    }

    pub fn timeout(message: impl Into<String>, timeout_secs: u64, context: BuildContext) -> Self {
        ArcaError::BuildTimeout {
            message: message.into(),
            timeout_secs,
            context,
        }
    }

    /// True for `Build` and its `BuildTimeout` refinement
    pub fn is_build_error(&self) -> bool {
        matches!(self, ArcaError::Build { .. } | ArcaError::BuildTimeout { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ArcaError::BuildTimeout { .. })
    }

    /// The captured output attached to a build failure, if any
    pub fn build_context(&self) -> Option<&BuildContext> {
        match self {
            ArcaError::Build { context, .. } | ArcaError::BuildTimeout { context, .. } => {
                Some(context)
            }
            _ => None,
        }
    }
}

/// Configuration errors surface immediately and re-running never fixes them.
pub fn is_configuration_error(err: &ArcaError) -> bool {
    match err {
        ArcaError::Misconfigured(_) => true,
        ArcaError::TaskMisconfigured(_) => true,
        ArcaError::Pull { .. } => false,
        ArcaError::Build { .. } => false,
        ArcaError::BuildTimeout { .. } => false,
        ArcaError::PushToRegistry { .. } => false,
        ArcaError::RequirementsMismatch { .. } => false,
        ArcaError::FileOutOfRange(_) => true,
        ArcaError::FileNotFound(_) => false,
        ArcaError::Io(_) => false,
        ArcaError::Json(_) => false,
    }
}
