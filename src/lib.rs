pub mod arca;
pub mod backend;
pub mod cache;
pub mod docker;
pub mod error;
pub mod git;
pub mod hasher;
pub mod process;
pub mod repository;
pub mod result;
pub mod settings;
pub mod task;

pub use crate::arca::{validate_repo_url, Arca};
pub use crate::backend::{Backend, BackendKind, EnvironmentHandle};
pub use crate::error::{ArcaError, BuildContext, Result};
pub use crate::repository::{RunOptions, WorkingCopy};
pub use crate::result::{ExecutionResult, FailureReason};
pub use crate::settings::{ArcaConfig, Settings};
pub use crate::task::{EntryPoint, Task};
