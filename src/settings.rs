//! Prefixed settings lookup and the resolved orchestrator configuration.
//!
//! Every key lives under the `ARCA_` prefix. Values come from an explicit map
//! first and are then overridden by `ARCA_*` process environment variables.
//! Configuration structs are resolved from [`Settings`] once, at construction,
//! and never re-read afterwards.

use crate::backend::BackendKind;
use crate::cache::CacheConfig;
use crate::error::{ArcaError, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const PREFIX: &str = "ARCA";

#[derive(Debug, Clone, Default)]
pub struct Settings {
    data: BTreeMap<String, String>,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Settings from explicit pairs; keys may be given with or without the prefix
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let data = pairs
            .into_iter()
            .map(|(k, v)| (normalize_key(k.as_ref()), v.into()))
            .collect();
        Self { data }
    }

    /// Explicit settings overlaid with the process environment
    pub fn from_env() -> Self {
        Self::new().with_env()
    }

    pub fn with_env(self) -> Self {
        self.with_env_vars(std::env::vars())
    }

    /// Overlays `ARCA_*` variables from `vars`, which take precedence.
    pub fn with_env_vars<I>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let prefix = format!("{}_", PREFIX);
        for (key, value) in vars {
            if key.starts_with(&prefix) {
                self.data.insert(key, value);
            }
        }
        self
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.data.insert(normalize_key(key), value.into());
        self
    }

    /// First present key among `options` wins.
    pub fn get(&self, options: &[&str]) -> Option<&str> {
        options
            .iter()
            .find_map(|option| self.data.get(&normalize_key(option)))
            .map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(&normalize_key(key))
    }

    /// Two-tier lookup: `<backend>_<key>` then `backend_<key>`.
    pub fn backend(&self, backend: &'static str) -> BackendSettings<'_> {
        BackendSettings {
            settings: self,
            backend,
        }
    }

    pub fn string(&self, key: &str) -> Option<String> {
        self.get(&[key]).map(str::to_string)
    }

    pub fn bool(&self, key: &str, default: bool) -> Result<bool> {
        self.get(&[key])
            .map(|v| parse_bool(key, v))
            .unwrap_or(Ok(default))
    }
}

fn normalize_key(key: &str) -> String {
    let upper = key.to_uppercase();
    let prefix = format!("{}_", PREFIX);
    if upper.starts_with(&prefix) {
        upper
    } else {
        format!("{}{}", prefix, upper)
    }
}

/// Settings view of a single backend.
#[derive(Debug, Clone, Copy)]
pub struct BackendSettings<'a> {
    settings: &'a Settings,
    backend: &'static str,
}

impl<'a> BackendSettings<'a> {
    pub fn keys(&self, key: &str) -> [String; 2] {
        [
            format!("{}_{}", self.backend, key),
            format!("backend_{}", key),
        ]
    }

    pub fn get(&self, key: &str) -> Option<&'a str> {
        let [specific, generic] = self.keys(key);
        self.settings.get(&[specific.as_str(), generic.as_str()])
    }

    pub fn string(&self, key: &str) -> Option<String> {
        self.get(key)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    }

    pub fn string_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or(default).to_string()
    }

    pub fn bool(&self, key: &str, default: bool) -> Result<bool> {
        self.get(key)
            .map(|v| parse_bool(key, v))
            .unwrap_or(Ok(default))
    }

    pub fn secs(&self, key: &str, default: u64) -> Result<Duration> {
        let secs = match self.get(key) {
            Some(v) => parse_number::<u64>(key, v)?,
            None => default,
        };
        if secs == 0 {
            return Err(ArcaError::misconfigured(format!(
                "{} must be a positive number of seconds",
                key
            )));
        }
        Ok(Duration::from_secs(secs))
    }

    /// Comma-separated list; `None` when unset or empty
    pub fn list(&self, key: &str) -> Option<Vec<String>> {
        let items: Vec<String> = self
            .get(key)?
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if items.is_empty() {
            None
        } else {
            Some(items)
        }
    }
}

pub fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(ArcaError::misconfigured(format!(
            "{} must be a boolean, got '{}'",
            key, other
        ))),
    }
}

pub fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse::<T>().map_err(|_| {
        ArcaError::misconfigured(format!("{} must be a number, got '{}'", key, value))
    })
}

/// Orchestrator configuration, resolved and validated once.
#[derive(Debug, Clone)]
pub struct ArcaConfig {
    pub base_dir: PathBuf,
    pub single_pull: bool,
    pub ignore_cache_errors: bool,
    pub backend: BackendKind,
    pub cache: CacheConfig,
}

impl Default for ArcaConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from(".arca"),
            single_pull: false,
            ignore_cache_errors: false,
            backend: BackendKind::CurrentEnvironment,
            cache: CacheConfig::default(),
        }
    }
}

impl ArcaConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let base_dir = settings
            .string("base_dir")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(".arca"));

        let backend = match settings.get(&["backend"]) {
            Some(name) => name.parse::<BackendKind>()?,
            None => BackendKind::CurrentEnvironment,
        };

        Ok(Self {
            base_dir,
            single_pull: settings.bool("single_pull", false)?,
            ignore_cache_errors: settings.bool("ignore_cache_errors", false)?,
            backend,
            cache: CacheConfig::from_settings(settings)?,
        })
    }
}
