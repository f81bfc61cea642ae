//! Configuration reader for provider installation and template rendering
//!
//! Values resolve through three layers, highest priority first:
//! 1. Programmatic overrides (`set` / `inject`), used to pass computed
//!    variables such as credentials or node counts
//! 2. Environment variables, with the key upper-cased and `-` replaced by `_`
//! 3. The clusterctl config file (`~/.cluster-api/clusterctl.yaml` by default)
//!
//! The reader is an explicit value threaded through install and deploy calls;
//! nothing here touches process-global state except reading the environment.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::{Error, Result};

/// Key/value variables passed between providers, the pipeline and the reader
pub type Variables = BTreeMap<String, String>;

/// Directory under the home directory holding the clusterctl config
const CONFIG_DIR_NAME: &str = ".cluster-api";
/// Base name of the clusterctl config file
const CONFIG_FILE_STEM: &str = "clusterctl";
/// Extensions tried for the default config file
const CONFIG_EXTENSIONS: &[&str] = &["yaml", "yml"];

/// Variable naming the directory with provider component manifests
pub const PROVIDERS_DIR_VAR: &str = "PROVIDERS_DIR";
/// Providers directory used when `PROVIDERS_DIR` is unset
pub const DEFAULT_PROVIDERS_DIR: &str = "/providers";

type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Layered key/value configuration store
#[derive(Clone)]
pub struct ConfigReader {
    overrides: BTreeMap<String, String>,
    file: BTreeMap<String, String>,
    env: EnvLookup,
}

impl fmt::Debug for ConfigReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigReader")
            .field("overrides", &self.overrides.keys().collect::<Vec<_>>())
            .field("file", &self.file.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for ConfigReader {
    fn default() -> Self {
        Self::with_env(|key| std::env::var(key).ok())
    }
}

/// Normalize a key the way it is looked up in the environment
pub fn env_key(key: &str) -> String {
    key.to_uppercase().replace('-', "_")
}

impl ConfigReader {
    /// Create a reader with no overrides and no config file
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a reader with a custom environment lookup
    pub fn with_env(env: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        Self {
            overrides: BTreeMap::new(),
            file: BTreeMap::new(),
            env: Arc::new(env),
        }
    }

    /// Load the clusterctl config file
    ///
    /// With an explicit path the file must exist. Without one the default
    /// `~/.cluster-api/clusterctl.{yaml,yml}` is read if present.
    pub fn load(mut self, path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => {
                if !p.exists() {
                    return Err(Error::validation(format!(
                        "clusterctl config file {} does not exist",
                        p.display()
                    )));
                }
                p.to_path_buf()
            }
            None => match default_config_path() {
                Some(p) => p,
                None => return Ok(self),
            },
        };

        let content =
            std::fs::read_to_string(&path).map_err(|e| Error::io(path.display().to_string(), e))?;
        self.file = parse_config_file(&content)?;
        debug!(path = %path.display(), keys = self.file.len(), "loaded clusterctl config");
        Ok(self)
    }

    /// Set an override, replacing any previous value
    pub fn set(&mut self, key: impl AsRef<str>, value: impl Into<String>) {
        self.overrides.insert(env_key(key.as_ref()), value.into());
    }

    /// Inject variables, skipping empty values
    ///
    /// A non-empty value always replaces what was there before. An empty
    /// value never does, so ambient defaults from the environment or the
    /// config file survive.
    pub fn inject(&mut self, vars: &Variables) {
        for (key, value) in vars {
            if value.is_empty() {
                continue;
            }
            self.set(key, value.clone());
        }
    }

    /// Look up a value, or `None` when no layer has it
    ///
    /// An environment variable that is set but empty counts as set.
    pub fn get_opt(&self, key: &str) -> Option<String> {
        let key = env_key(key);
        self.overrides
            .get(&key)
            .cloned()
            .or_else(|| (self.env)(&key))
            .or_else(|| self.file.get(&key).cloned())
    }

    /// Look up a value that must be present
    pub fn get(&self, key: &str) -> Result<String> {
        self.get_opt(key).ok_or_else(|| Error::MissingVariable {
            key: key.to_string(),
        })
    }

    /// Directory holding provider component manifests
    pub fn providers_dir(&self) -> PathBuf {
        self.get_opt(PROVIDERS_DIR_VAR)
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| DEFAULT_PROVIDERS_DIR.to_string())
            .into()
    }
}

fn default_config_path() -> Option<PathBuf> {
    let dir = dirs::home_dir()?.join(CONFIG_DIR_NAME);
    CONFIG_EXTENSIONS
        .iter()
        .map(|ext| dir.join(format!("{}.{}", CONFIG_FILE_STEM, ext)))
        .find(|p| p.is_file())
}

/// Flatten a clusterctl YAML file into top-level string values
///
/// Scalars are rendered as strings; nested maps and lists are kept as YAML
/// text.
fn parse_config_file(content: &str) -> Result<BTreeMap<String, String>> {
    let value: serde_yaml::Value = serde_yaml::from_str(content)
        .map_err(|e| Error::serialization(format!("invalid clusterctl config: {}", e)))?;

    let mapping = match value {
        serde_yaml::Value::Null => return Ok(BTreeMap::new()),
        serde_yaml::Value::Mapping(m) => m,
        _ => {
            return Err(Error::serialization(
                "clusterctl config must be a mapping of variables",
            ))
        }
    };

    let mut out = BTreeMap::new();
    for (key, value) in mapping {
        let Some(key) = key.as_str() else { continue };
        let rendered = match value {
            serde_yaml::Value::Null => continue,
            serde_yaml::Value::String(s) => s,
            serde_yaml::Value::Bool(b) => b.to_string(),
            serde_yaml::Value::Number(n) => n.to_string(),
            other => serde_yaml::to_string(&other)
                .map_err(|e| Error::serialization(e.to_string()))?,
        };
        out.insert(env_key(key), rendered);
    }
    Ok(out)
}
