//! Change detection strategies.
//!
//! A [`ChangeDetector`] turns two raw snapshots of the same resource into an
//! ordered list of [`ChangedValue`] records. Detectors that cannot produce a
//! structured diff for their content type return an empty list; the watcher
//! still reports the change because it compares raw content first.

use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;

use crate::error::Result;

/// One changed location: `old` is `None` when the path was added, `new` is
/// `None` when it was removed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangedValue {
    pub path: String,
    pub old: Option<Value>,
    pub new: Option<Value>,
}

impl fmt::Display for ChangedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |v: &Option<Value>| {
            v.as_ref()
                .map_or_else(|| "<absent>".to_string(), Value::to_string)
        };
        write!(f, "{}: {} -> {}", self.path, show(&self.old), show(&self.new))
    }
}

pub trait ChangeDetector: Send + Sync {
    fn changed_values(&self, old: &str, new: &str) -> Result<Vec<ChangedValue>>;
}

/// For content where only presence of change matters (RSS, HTML, ...).
#[derive(Debug, Default, Clone, Copy)]
pub struct RawDetector;

impl ChangeDetector for RawDetector {
    fn changed_values(&self, _old: &str, _new: &str) -> Result<Vec<ChangedValue>> {
        Ok(Vec::new())
    }
}

/// Structural diff of two JSON documents.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonDetector;

impl ChangeDetector for JsonDetector {
    fn changed_values(&self, old: &str, new: &str) -> Result<Vec<ChangedValue>> {
        let old: Value = serde_json::from_str(old)?;
        let new: Value = serde_json::from_str(new)?;
        Ok(diff_values(&old, &new))
    }
}

/// Diffs two JSON trees.
///
/// Object keys are walked in sorted order and arrays in index order. Paths
/// join object keys with `.` and array indices with `[i]`, starting from the
/// empty root path.
#[must_use]
pub fn diff_values(old: &Value, new: &Value) -> Vec<ChangedValue> {
    let mut changes = Vec::new();
    diff_into(String::new(), Some(old), Some(new), &mut changes);
    changes
}

fn diff_into(
    path: String,
    old: Option<&Value>,
    new: Option<&Value>,
    out: &mut Vec<ChangedValue>,
) {
    match (old, new) {
        (Some(Value::Object(a)), Some(Value::Object(b))) => {
            let keys: BTreeSet<&String> = a.keys().chain(b.keys()).collect();
            for key in keys {
                diff_into(key_path(&path, key), a.get(key), b.get(key), out);
            }
        }
        (Some(Value::Array(a)), Some(Value::Array(b))) => {
            for i in 0..a.len().max(b.len()) {
                diff_into(format!("{path}[{i}]"), a.get(i), b.get(i), out);
            }
        }
        (a, b) if a != b => out.push(ChangedValue {
            path,
            old: a.cloned(),
            new: b.cloned(),
        }),
        _ => {}
    }
}

fn key_path(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{parent}.{key}")
    }
}
