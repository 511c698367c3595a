use crate::error::{ArcaError, Result};
use crate::process::{self, CommandOutput};
use chrono::NaiveDate;
use std::path::{Path, PathBuf};
use std::process::Command;

/// How much history an initial clone fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Depth {
    Limited(u32),
    Unlimited,
}

impl Default for Depth {
    fn default() -> Self {
        Depth::Limited(1)
    }
}

impl Depth {
    /// `-1` means unlimited; otherwise the value must be positive.
    pub fn from_value(value: i64) -> Result<Self> {
        match value {
            -1 => Ok(Depth::Unlimited),
            v if v >= 1 && v <= u32::MAX as i64 => Ok(Depth::Limited(v as u32)),
            v => Err(ArcaError::misconfigured(format!(
                "Depth '{}' isn't a positive number",
                v
            ))),
        }
    }
}

impl std::str::FromStr for Depth {
    type Err = ArcaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "unlimited" | "none" => Ok(Depth::Unlimited),
            other => {
                let value = other.parse::<i64>().map_err(|_| {
                    ArcaError::misconfigured(format!("Depth '{}' can't be converted to int.", other))
                })?;
                Depth::from_value(value)
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloneOptions {
    pub depth: Option<Depth>,
    pub shallow_since: Option<NaiveDate>,
    /// Borrow objects from this clone, then dissociate from it
    pub reference: Option<PathBuf>,
}

/// The version-control operations the repository cache needs.
pub trait Vcs {
    fn clone_branch(&self, url: &str, branch: &str, dest: &Path, options: &CloneOptions) -> Result<()>;
    fn fetch(&self, repo_path: &Path, branch: &str) -> Result<()>;
    /// Hard-resets the working tree to `rev`, discarding local changes
    fn reset_hard(&self, repo_path: &Path, rev: &str) -> Result<()>;
    fn rev_parse(&self, repo_path: &Path, rev: &str) -> Result<String>;
    /// Shortest unambiguous prefix of `commit`, at least 7 characters
    fn short_hash(&self, repo_path: &Path, commit: &str) -> Result<String>;
    fn commit_count(&self, repo_path: &Path) -> Result<usize>;
}

/// [`Vcs`] backed by the `git` executable.
#[derive(Debug, Clone, Default)]
pub struct GitCli;

impl GitCli {
    fn git(&self, repo_path: &Path) -> Command {
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(repo_path);
        cmd
    }

    fn checked(&self, cmd: Command, failure: &str) -> Result<CommandOutput> {
        let described = process::describe(&cmd);
        let output = process::run(cmd)
            .map_err(|e| ArcaError::pull(format!("Failed to start `{}`", described), e.to_string()))?;
        if !output.success() {
            return Err(ArcaError::pull(failure, output.stderr_str()));
        }
        Ok(output)
    }
}

impl Vcs for GitCli {
    fn clone_branch(&self, url: &str, branch: &str, dest: &Path, options: &CloneOptions) -> Result<()> {
        let mut cmd = Command::new("git");
        cmd.args(["clone", "--branch", branch]);

        if let Some(Depth::Limited(depth)) = options.depth {
            cmd.arg("--depth").arg(depth.to_string());
        }
        if let Some(since) = options.shallow_since {
            cmd.arg(format!("--shallow-since={}", since.format("%Y-%m-%d")));
        }
        if let Some(reference) = &options.reference {
            let reference = std::path::absolute(reference).unwrap_or_else(|_| reference.clone());
            cmd.arg("--reference-if-able").arg(reference).arg("--dissociate");
        }

        cmd.arg(url).arg(dest);
        self.checked(cmd, "There was an error cloning the target repository.")?;
        Ok(())
    }

    fn fetch(&self, repo_path: &Path, branch: &str) -> Result<()> {
        let mut cmd = self.git(repo_path);
        cmd.args(["fetch", "origin", branch]);
        self.checked(cmd, "There was an error pulling the target repository.")?;
        Ok(())
    }

    fn reset_hard(&self, repo_path: &Path, rev: &str) -> Result<()> {
        let mut cmd = self.git(repo_path);
        cmd.args(["reset", "--hard", rev]);
        self.checked(cmd, "There was an error pulling the target repository.")?;
        Ok(())
    }

    fn rev_parse(&self, repo_path: &Path, rev: &str) -> Result<String> {
        let mut cmd = self.git(repo_path);
        cmd.args(["rev-parse", "--verify", rev]);
        Ok(self.checked(cmd, "Could not resolve revision")?.stdout_str())
    }

    fn short_hash(&self, repo_path: &Path, commit: &str) -> Result<String> {
        let mut cmd = self.git(repo_path);
        cmd.args(["rev-parse", "--short=7", commit]);
        Ok(self.checked(cmd, "Could not shorten commit hash")?.stdout_str())
    }

    fn commit_count(&self, repo_path: &Path) -> Result<usize> {
        let mut cmd = self.git(repo_path);
        cmd.args(["rev-list", "--count", "HEAD"]);
        let count = self.checked(cmd, "Could not count commits")?.stdout_str();
        count
            .parse()
            .map_err(|_| ArcaError::pull("Unexpected rev-list output", count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depth_values() {
        assert_eq!(Depth::from_value(5).unwrap(), Depth::Limited(5));
        assert_eq!(Depth::from_value(-1).unwrap(), Depth::Unlimited);
        assert!(Depth::from_value(0).is_err());
        assert!(Depth::from_value(-2).is_err());
        assert_eq!("5".parse::<Depth>().unwrap(), Depth::Limited(5));
        assert_eq!("unlimited".parse::<Depth>().unwrap(), Depth::Unlimited);
        assert!("asddf".parse::<Depth>().is_err());
    }

    #[test]
    fn test_default_depth_is_one() {
        assert_eq!(Depth::default(), Depth::Limited(1));
    }
}
