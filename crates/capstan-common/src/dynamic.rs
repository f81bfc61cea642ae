//! Typed lookups into loosely-typed resource bodies
//!
//! Lifecycle CRDs (Cluster, control planes, MachineDeployments, Provider
//! records) are handled as `DynamicObject`s whose `data` is schema-less JSON.
//! These helpers walk a path of keys and return a typed optional, keeping
//! "the field is absent" (`Ok(None)` / [`Error::FieldNotFound`]) apart from
//! "the field has the wrong type" ([`Error::FieldType`]).

use serde_json::Value;

use crate::{Error, Result};

fn lookup<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter()
        .try_fold(value, |current, key| current.get(key))
        .filter(|v| !v.is_null())
}

/// Look up a string field
pub fn nested_str<'a>(value: &'a Value, path: &[&str]) -> Result<Option<&'a str>> {
    match lookup(value, path) {
        None => Ok(None),
        Some(v) => v
            .as_str()
            .map(Some)
            .ok_or_else(|| Error::field_type(path, "string")),
    }
}

/// Look up a boolean field
pub fn nested_bool(value: &Value, path: &[&str]) -> Result<Option<bool>> {
    match lookup(value, path) {
        None => Ok(None),
        Some(v) => v
            .as_bool()
            .map(Some)
            .ok_or_else(|| Error::field_type(path, "boolean")),
    }
}

/// Look up an integer field
pub fn nested_i64(value: &Value, path: &[&str]) -> Result<Option<i64>> {
    match lookup(value, path) {
        None => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| Error::field_type(path, "integer")),
    }
}

/// Look up a list field
pub fn nested_slice<'a>(value: &'a Value, path: &[&str]) -> Result<Option<&'a [Value]>> {
    match lookup(value, path) {
        None => Ok(None),
        Some(v) => v
            .as_array()
            .map(|a| Some(a.as_slice()))
            .ok_or_else(|| Error::field_type(path, "list")),
    }
}

/// Look up a string field that must be present
pub fn required_str<'a>(value: &'a Value, path: &[&str]) -> Result<&'a str> {
    nested_str(value, path)?.ok_or_else(|| Error::field_not_found(path))
}

/// Find the status string of a condition in `status.conditions`
///
/// Returns `Ok(None)` when there are no conditions or none of the given type.
pub fn condition_status<'a>(value: &'a Value, condition_type: &str) -> Result<Option<&'a str>> {
    let Some(conditions) = nested_slice(value, &["status", "conditions"])? else {
        return Ok(None);
    };
    for condition in conditions {
        if nested_str(condition, &["type"])? == Some(condition_type) {
            return nested_str(condition, &["status"]);
        }
    }
    Ok(None)
}

/// Reference from one lifecycle object to another (e.g. `spec.controlPlaneRef`)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectRef {
    /// apiVersion of the referenced object
    pub api_version: String,
    /// Kind of the referenced object
    pub kind: String,
    /// Name of the referenced object
    pub name: String,
    /// Namespace of the referenced object
    pub namespace: String,
}

impl ObjectRef {
    /// Read a reference at `path`
    ///
    /// `apiVersion`, `kind` and `name` are required. A missing namespace means
    /// the referencing object's namespace.
    pub fn from_field(value: &Value, path: &[&str], default_namespace: &str) -> Result<Self> {
        let field = |key: &'static str| {
            let mut full = path.to_vec();
            full.push(key);
            full
        };
        if lookup(value, path).is_none() {
            return Err(Error::field_not_found(path));
        }
        Ok(Self {
            api_version: required_str(value, &field("apiVersion"))?.to_string(),
            kind: required_str(value, &field("kind"))?.to_string(),
            name: required_str(value, &field("name"))?.to_string(),
            namespace: nested_str(value, &field("namespace"))?
                .unwrap_or(default_namespace)
                .to_string(),
        })
    }
}
