use super::BackendConfig;
use crate::error::{ArcaError, BuildContext, Result};
use crate::hasher::dependency_fingerprint;
use crate::task::protocol::PROTOCOL_VERSION;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

pub const PIPFILE: &str = "Pipfile";
pub const PIPFILE_LOCK: &str = "Pipfile.lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestKind {
    Requirements,
    /// `Pipfile` with its `Pipfile.lock`
    Pipfile,
}

impl ManifestKind {
    /// Mixed into the dependency fingerprint
    pub fn marker(&self) -> &'static str {
        match self {
            ManifestKind::Requirements => "requirements",
            ManifestKind::Pipfile => "pipfile",
        }
    }
}

/// The dependency declaration found in a working copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub kind: ManifestKind,
    /// `requirements.txt`, or the `Pipfile.lock` of a pipfile manifest
    pub path: PathBuf,
    /// Hashed content: the requirements file or the lockfile
    pub text: String,
}

impl Manifest {
    /// Locates the manifest of the working copy at `repo_path`.
    ///
    /// A complete Pipfile pair wins over a requirements file. Only one half
    /// of the pair is an error.
    pub fn locate(repo_path: &Path, config: &BackendConfig) -> Result<Option<Self>> {
        let pipfile_dir = repo_path.join(&config.pipfile_location);
        let pipfile = pipfile_dir.join(PIPFILE);
        let lock = pipfile_dir.join(PIPFILE_LOCK);

        match (pipfile.is_file(), lock.is_file()) {
            (true, true) => {
                return Ok(Some(Self {
                    kind: ManifestKind::Pipfile,
                    text: fs::read_to_string(&lock)?,
                    path: lock,
                }))
            }
            (true, false) => {
                return Err(ArcaError::build(
                    "Pipfile is present in the repository but Pipfile.lock is missing",
                    BuildContext::default(),
                ))
            }
            (false, true) => {
                return Err(ArcaError::build(
                    "Pipfile.lock is present in the repository but Pipfile is missing",
                    BuildContext::default(),
                ))
            }
            (false, false) => {}
        }

        let requirements = repo_path.join(&config.requirements_location);
        if !requirements.is_file() {
            return Ok(None);
        }
        Ok(Some(Self {
            kind: ManifestKind::Requirements,
            text: fs::read_to_string(&requirements)?,
            path: requirements,
        }))
    }

    pub fn fingerprint(&self) -> String {
        dependency_fingerprint(&self.text, self.kind.marker(), PROTOCOL_VERSION)
    }

    /// The `Pipfile` next to the lockfile
    pub fn pipfile(&self) -> Option<PathBuf> {
        match self.kind {
            ManifestKind::Pipfile => self.path.parent().map(|dir| dir.join(PIPFILE)),
            ManifestKind::Requirements => None,
        }
    }

    /// Declared packages, one `name==version` style entry each.
    ///
    /// Lockfiles contribute their `default` section.
    pub fn requirement_set(&self) -> Result<BTreeSet<String>> {
        match self.kind {
            ManifestKind::Requirements => Ok(requirement_lines(&self.text)),
            ManifestKind::Pipfile => {
                let lock: serde_json::Value = serde_json::from_str(&self.text)?;
                let default = lock
                    .get("default")
                    .and_then(|d| d.as_object())
                    .ok_or_else(|| {
                        ArcaError::build(
                            "Pipfile.lock has no default section",
                            BuildContext::default(),
                        )
                    })?;
                Ok(default
                    .iter()
                    .map(|(name, entry)| {
                        let version = entry.get("version").and_then(|v| v.as_str()).unwrap_or("");
                        format!("{}{}", name, version)
                    })
                    .collect())
            }
        }
    }
}

/// Non-empty, non-comment lines of a requirements file.
pub fn requirement_lines(text: &str) -> BTreeSet<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Fingerprint of an optional manifest; working copies without one share
/// a single environment.
pub fn environment_fingerprint(manifest: Option<&Manifest>) -> String {
    match manifest {
        Some(manifest) => manifest.fingerprint(),
        None => dependency_fingerprint("", "none", PROTOCOL_VERSION),
    }
}
