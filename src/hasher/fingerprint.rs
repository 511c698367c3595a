//! Stable identifiers for repositories, dependency manifests and cache entries.
//!
//! Everything here is a pure function of its inputs. The task fingerprint
//! lives on [`crate::task::Task`] and is built from [`canonical_json`].

use super::file_hasher::hash_bytes;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::LazyLock;

/// Joins the parts of a cache key. It is outside the `repo_id` alphabet and
/// git refuses it in ref names, so the parts can always be told apart.
pub const CACHE_KEY_SEPARATOR: char = ':';

static HTTP_SCHEME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^https?://(.www)?").expect("valid regex"));
static GIT_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\.git/?$").expect("valid regex"));
static NON_SLUG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-zA-Z0-9._]+").expect("valid regex"));

/// Filesystem-safe identifier of a repository URL.
///
/// The readable slug keeps host and path (runs of other characters collapse to
/// a single `_`), and the SHA-256 of the raw URL makes the id unique.
pub fn repo_id(url: &str) -> String {
    let location = if url.starts_with("http") {
        HTTP_SCHEME.replace(url, "").into_owned()
    } else {
        let path = url.strip_prefix("file://").unwrap_or(url);
        expand_home(path)
    };
    let location = GIT_SUFFIX.replace(&location, "");
    let slug = NON_SLUG.replace_all(&location, "_");

    format!("{}{}", slug, hash_bytes(url.as_bytes()))
}

fn expand_home(path: &str) -> String {
    match (path.strip_prefix('~'), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}{}", home, rest),
        _ => path.to_string(),
    }
}

/// SHA-256 over the manifest text, the manifest kind and the protocol version.
///
/// The text is hashed verbatim: whitespace-only edits produce a new
/// fingerprint and therefore a new environment.
pub fn dependency_fingerprint(manifest_text: &str, kind_marker: &str, protocol_version: &str) -> String {
    let mut data = String::with_capacity(
        manifest_text.len() + kind_marker.len() + protocol_version.len(),
    );
    data.push_str(manifest_text);
    data.push_str(kind_marker);
    data.push_str(protocol_version);
    hash_bytes(data.as_bytes())
}

/// Order-independent SHA-256 of a list of OS-level packages.
pub fn dependency_list_fingerprint(dependencies: &[String]) -> String {
    let mut sorted: Vec<&str> = dependencies.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.dedup();
    hash_bytes(sorted.join(",").as_bytes())
}

/// Key of a task result: `repo_id:branch:commit:task_fingerprint`.
pub fn cache_key(repo_url: &str, branch: &str, commit: &str, task_fingerprint: &str) -> String {
    let sep = CACHE_KEY_SEPARATOR.to_string();
    [repo_id(repo_url).as_str(), branch, commit, task_fingerprint].join(&sep)
}

/// Compact JSON with object keys sorted at every depth.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => value.to_string(),
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        Value::Object(map) => {
            let sorted: BTreeMap<&String, String> =
                map.iter().map(|(k, v)| (k, canonical_json(v))).collect();
            let items: Vec<String> = sorted
                .into_iter()
                .map(|(k, v)| format!("{}:{}", Value::String(k.clone()), v))
                .collect();
            format!("{{{}}}", items.join(","))
        }
    }
}
