pub mod file_hasher;
pub mod fingerprint;

pub use file_hasher::{hash_bytes, hash_file};
pub use fingerprint::{
    cache_key, canonical_json, dependency_fingerprint, dependency_list_fingerprint, repo_id,
    CACHE_KEY_SEPARATOR,
};
