//! Key/value stores for task results.
//!
//! The orchestrator only relies on [`CacheStore`]; which store backs it, and
//! when entries expire, is a matter of configuration.

use crate::error::{ArcaError, Result};
use crate::hasher::{hash_bytes, hash_file};
use crate::settings::{parse_number, Settings};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

pub trait CacheStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn set(&self, key: &str, value: &[u8]) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;

    /// Returns the cached value, or computes it and stores it when
    /// `should_cache` accepts it.
    fn get_or_create(
        &self,
        key: &str,
        compute: &mut dyn FnMut() -> Result<Vec<u8>>,
        should_cache: &dyn Fn(&[u8]) -> bool,
    ) -> Result<Vec<u8>> {
        if let Some(value) = self.get(key)? {
            debug!(key, "cache hit");
            return Ok(value);
        }

        debug!(key, "cache miss, creating value");
        let value = compute()?;
        if should_cache(&value) {
            self.set(key, &value)?;
        }
        Ok(value)
    }
}

/// Stores nothing; every lookup is a miss.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCache;

impl CacheStore for NullCache {
    fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    fn set(&self, _key: &str, _value: &[u8]) -> Result<()> {
        Ok(())
    }

    fn delete(&self, _key: &str) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryCache {
    store: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.store.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.lock().is_empty()
    }
}

impl CacheStore for MemoryCache {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.store.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.store.lock().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.store.lock().remove(key);
        Ok(())
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CacheEntry {
    pub cache_key: String,
    pub created_at: i64,
    pub artifact_path: PathBuf,
    pub size: u64,
    pub checksum: String,
}

/// One file per entry plus a JSON index, optionally expiring entries.
pub struct FileCache {
    cache_dir: PathBuf,
    index_path: PathBuf,
    expiration: Option<Duration>,
    store: Mutex<HashMap<String, CacheEntry>>,
}

impl FileCache {
    pub fn open(cache_dir: &Path, expiration: Option<Duration>) -> Result<Self> {
        fs::create_dir_all(cache_dir)?;

        let index_path = cache_dir.join("index.json");
        let store = Self::load_index(&index_path)?;

        Ok(Self {
            cache_dir: cache_dir.to_path_buf(),
            index_path,
            expiration,
            store: Mutex::new(store),
        })
    }

    fn load_index(path: &Path) -> Result<HashMap<String, CacheEntry>> {
        if !path.exists() {
            return Ok(HashMap::new());
        }

        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "cache index unreadable, starting empty");
            HashMap::new()
        }))
    }

    fn save_index(&self, store: &HashMap<String, CacheEntry>) -> Result<()> {
        let content = serde_json::to_string_pretty(store)?;
        let tmp = self.index_path.with_extension("json.tmp");
        fs::write(&tmp, content)?;
        fs::rename(tmp, &self.index_path)?;
        Ok(())
    }

    fn is_expired(&self, entry: &CacheEntry) -> bool {
        match self.expiration {
            Some(expiration) => {
                let age = chrono::Utc::now().timestamp() - entry.created_at;
                age >= expiration.as_secs() as i64
            }
            None => false,
        }
    }
}

impl CacheStore for FileCache {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let store = self.store.lock();
        let Some(entry) = store.get(key) else {
            return Ok(None);
        };
        if self.is_expired(entry) {
            debug!(key, "cache entry expired");
            return Ok(None);
        }

        let path = self.cache_dir.join(&entry.artifact_path);
        if !path.exists() {
            return Ok(None);
        }
        if hash_file(&path)? != entry.checksum {
            warn!(key, path = %path.display(), "cache entry corrupted, ignoring");
            return Ok(None);
        }
        Ok(Some(fs::read(path)?))
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let artifact_path = PathBuf::from(format!("{}.bin", hash_bytes(key.as_bytes())));
        fs::write(self.cache_dir.join(&artifact_path), value)?;

        let entry = CacheEntry {
            cache_key: key.to_string(),
            created_at: chrono::Utc::now().timestamp(),
            artifact_path,
            size: value.len() as u64,
            checksum: hash_bytes(value),
        };

        let mut store = self.store.lock();
        store.insert(key.to_string(), entry);
        self.save_index(&store)
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut store = self.store.lock();
        if let Some(entry) = store.remove(key) {
            let path = self.cache_dir.join(entry.artifact_path);
            if path.exists() {
                fs::remove_file(path)?;
            }
            self.save_index(&store)?;
        }
        Ok(())
    }
}

/// Which store to open, as read from settings.
#[derive(Debug, Clone, Default)]
pub struct CacheConfig {
    pub backend: Option<String>,
    /// JSON object; `{"directory": ...}` for the file store
    pub arguments: Option<String>,
    pub expiration_time: Option<Duration>,
}

impl CacheConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let expiration_time = match settings.get(&["cache_expiration_time"]) {
            Some(v) => Some(Duration::from_secs(parse_number::<u64>(
                "cache_expiration_time",
                v,
            )?)),
            None => None,
        };

        Ok(Self {
            backend: settings.string("cache_backend"),
            arguments: settings.string("cache_backend_arguments"),
            expiration_time,
        })
    }

    /// Opens the configured store and checks that it accepts writes.
    ///
    /// With `ignore_errors` any failure falls back to [`NullCache`].
    pub fn open(&self, ignore_errors: bool) -> Result<Box<dyn CacheStore>> {
        match self.try_open() {
            Ok(store) => Ok(store),
            Err(e) if ignore_errors => {
                warn!(error = %e, "cache unusable, results will not be cached");
                Ok(Box::new(NullCache))
            }
            Err(e) => Err(e),
        }
    }

    fn try_open(&self) -> Result<Box<dyn CacheStore>> {
        let arguments = match self.arguments.as_deref().filter(|a| !a.trim().is_empty()) {
            Some(raw) => Some(
                serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(raw).map_err(
                    |_| {
                        ArcaError::misconfigured(
                            "Cache backend arguments couldn't be converted to a dictionary.",
                        )
                    },
                )?,
            ),
            None => None,
        };

        let store: Box<dyn CacheStore> = match self.backend.as_deref().unwrap_or("null") {
            "null" => Box::new(NullCache),
            "memory" => Box::new(MemoryCache::new()),
            "file" => {
                let directory = arguments
                    .as_ref()
                    .and_then(|args| args.get("directory"))
                    .and_then(|d| d.as_str())
                    .ok_or_else(|| {
                        ArcaError::misconfigured("The file cache requires a 'directory' argument")
                    })?;
                Box::new(FileCache::open(Path::new(directory), self.expiration_time)?)
            }
            other => {
                return Err(ArcaError::misconfigured(format!(
                    "Unknown cache backend '{}'",
                    other
                )))
            }
        };

        store
            .set("last_arca_run", chrono::Utc::now().to_rfc3339().as_bytes())
            .map_err(|e| {
                ArcaError::misconfigured(format!(
                    "The provided cache is not working - most likely misconfigured: {}",
                    e
                ))
            })?;

        Ok(store)
    }
}
