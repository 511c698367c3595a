//! Task definitions: which callable to run, with what arguments, for how long.

pub mod protocol;

use crate::error::{ArcaError, Result};
use crate::hasher::{canonical_json, hash_bytes};
use protocol::{EntryPointDefinition, TaskDefinition, PROTOCOL_VERSION};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;

pub const DEFAULT_TIMEOUT_SECS: u64 = 5;

static ENTRY_POINT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<module>[\w.]+)\s*(:\s*(?P<object>[\w.]+))?\s*$").expect("valid regex")
});

/// `module.path:object.attr`, resolved by the runner inside the environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntryPoint {
    pub module_name: String,
    pub object_name: String,
}

impl EntryPoint {
    pub fn parse(value: &str) -> Result<Self> {
        let caps = ENTRY_POINT
            .captures(value)
            .ok_or_else(|| ArcaError::task("Incorrectly defined entry point."))?;

        let object = caps.name("object").ok_or_else(|| {
            ArcaError::task("Task entry point must be an object, not a module.")
        })?;

        Ok(Self {
            module_name: caps["module"].to_string(),
            object_name: object.as_str().to_string(),
        })
    }
}

impl fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.module_name, self.object_name)
    }
}

/// An immutable, validated task. Its JSON definition and fingerprint are
/// computed once, at construction.
#[derive(Debug, Clone)]
pub struct Task {
    entry_point: EntryPoint,
    args: Vec<Value>,
    kwargs: BTreeMap<String, Value>,
    timeout: Duration,
    json: String,
    hash: String,
}

impl Task {
    /// A task without arguments and with the default timeout
    pub fn new(entry_point: &str) -> Result<Self> {
        Self::builder(entry_point).build()
    }

    pub fn builder(entry_point: &str) -> TaskBuilder {
        TaskBuilder {
            entry_point: entry_point.to_string(),
            args: Vec::new(),
            kwargs: BTreeMap::new(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            error: None,
        }
    }

    pub fn entry_point(&self) -> &EntryPoint {
        &self.entry_point
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn kwargs(&self) -> &BTreeMap<String, Value> {
        &self.kwargs
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// The definition handed to the runner
    pub fn json(&self) -> &str {
        &self.json
    }

    /// SHA-256 of the canonical `{entry_point, args, kwargs}` encoding
    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn definition(&self) -> TaskDefinition {
        TaskDefinition {
            version: PROTOCOL_VERSION.to_string(),
            entry_point: EntryPointDefinition {
                module_name: self.entry_point.module_name.clone(),
                object_name: self.entry_point.object_name.clone(),
            },
            args: self.args.clone(),
            kwargs: self.kwargs.clone(),
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Task({})", self.entry_point)
    }
}

/// Collects arguments; the first serialization failure is reported by `build`.
#[derive(Debug)]
pub struct TaskBuilder {
    entry_point: String,
    args: Vec<Value>,
    kwargs: BTreeMap<String, Value>,
    timeout_secs: u64,
    error: Option<ArcaError>,
}

impl TaskBuilder {
    pub fn arg<T: Serialize>(mut self, value: T) -> Self {
        match to_wire(&value) {
            Ok(value) => self.args.push(value),
            Err(e) => self.fail(e),
        }
        self
    }

    pub fn args<I, T>(self, values: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Serialize,
    {
        values.into_iter().fold(self, |builder, v| builder.arg(v))
    }

    pub fn kwarg<T: Serialize>(mut self, key: impl Into<String>, value: T) -> Self {
        match to_wire(&value) {
            Ok(value) => {
                self.kwargs.insert(key.into(), value);
            }
            Err(e) => self.fail(e),
        }
        self
    }

    pub fn timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn build(self) -> Result<Task> {
        if let Some(err) = self.error {
            return Err(err);
        }

        let entry_point = EntryPoint::parse(&self.entry_point)?;

        if self.timeout_secs < 1 {
            return Err(ArcaError::task("Timeout must be at least one second."));
        }

        let mut task = Task {
            entry_point,
            args: self.args,
            kwargs: self.kwargs,
            timeout: Duration::from_secs(self.timeout_secs),
            json: String::new(),
            hash: String::new(),
        };

        let definition = task.definition();
        task.json = serde_json::to_string(&definition).map_err(|_| {
            ArcaError::task("Provided arguments are not JSON-serializable")
        })?;

        let identity = serde_json::json!({
            "entry_point": {
                "module_name": definition.entry_point.module_name,
                "object_name": definition.entry_point.object_name,
            },
            "args": definition.args,
            "kwargs": definition.kwargs,
        });
        task.hash = hash_bytes(canonical_json(&identity).as_bytes());

        Ok(task)
    }

    fn fail(&mut self, err: ArcaError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }
}

fn to_wire<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value)
        .map_err(|e| ArcaError::task(format!("Provided arguments are not JSON-serializable: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn test_entry_point_parsing() {
        let ep = EntryPoint::parse("library.module:ret_argument").unwrap();
        assert_eq!(ep.module_name, "library.module");
        assert_eq!(ep.object_name, "ret_argument");

        let nested = EntryPoint::parse("mod : Class.method").unwrap();
        assert_eq!(nested.object_name, "Class.method");
    }

    #[test]
    fn test_module_only_entry_point_is_rejected() {
        assert!(matches!(
            Task::new("library.module"),
            Err(ArcaError::TaskMisconfigured(_))
        ));
        assert!(matches!(
            Task::new("library module:x"),
            Err(ArcaError::TaskMisconfigured(_))
        ));
    }

    #[test]
    fn test_invalid_timeout() {
        assert!(Task::builder("m:f").timeout(0).build().is_err());
        assert_eq!(
            Task::builder("m:f").timeout(3).build().unwrap().timeout(),
            Duration::from_secs(3)
        );
    }

    #[test]
    fn test_unserializable_arguments_fail_at_construction() {
        let mut bad: HashMap<Vec<u8>, i32> = HashMap::new();
        bad.insert(vec![1, 2], 3);

        let err = Task::builder("m:f").arg(&bad).build().unwrap_err();
        assert!(matches!(err, ArcaError::TaskMisconfigured(_)));

        let err = Task::builder("m:f").kwarg("value", &bad).build().unwrap_err();
        assert!(matches!(err, ArcaError::TaskMisconfigured(_)));
    }

    #[test]
    fn test_hash_is_independent_of_kwarg_order() {
        let a = Task::builder("m:f")
            .kwarg("a", 1)
            .kwarg("b", json!({"y": 1, "x": 2}))
            .build()
            .unwrap();
        let b = Task::builder("m:f")
            .kwarg("b", json!({"x": 2, "y": 1}))
            .kwarg("a", 1)
            .build()
            .unwrap();
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn test_hash_changes_with_arguments() {
        let a = Task::builder("m:f").arg("x").build().unwrap();
        let b = Task::builder("m:f").arg("y").build().unwrap();
        let c = Task::builder("m:g").arg("x").build().unwrap();
        assert_ne!(a.hash(), b.hash());
        assert_ne!(a.hash(), c.hash());
    }

    #[test]
    fn test_hash_ignores_timeout() {
        let a = Task::builder("m:f").timeout(1).build().unwrap();
        let b = Task::builder("m:f").timeout(10).build().unwrap();
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn test_wire_definition() {
        let task = Task::builder("pkg.mod:func")
            .args(["a", "b"])
            .kwarg("flag", true)
            .build()
            .unwrap();
        let parsed: Value = serde_json::from_str(task.json()).unwrap();
        assert_eq!(parsed["version"], json!(PROTOCOL_VERSION));
        assert_eq!(
            parsed["entry_point"],
            json!({"module_name": "pkg.mod", "object_name": "func"})
        );
        assert_eq!(parsed["args"], json!(["a", "b"]));
        assert_eq!(parsed["kwargs"], json!({"flag": true}));
        assert_eq!(task.to_string(), "Task(pkg.mod:func)");
    }
}
