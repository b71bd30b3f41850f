use anyhow::Context;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::PluginSettings;

/// Read-only view of the persisted plugin configuration.
///
/// The file holds `plugins: [...]` and `settings: {id: {key: value}}`, as
/// YAML for `.yaml`/`.yml` paths and JSON otherwise. A missing file is an
/// empty configuration.
#[derive(Debug, Clone)]
pub struct PluginStore {
    path: PathBuf,
}

/// One snapshot of the store, taken per load cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreSnapshot {
    pub plugins: Vec<String>,
    pub settings: BTreeMap<String, PluginSettings>,
}

impl StoreSnapshot {
    /// Settings for `name`, empty if none were persisted.
    pub fn settings_for(&self, name: &str) -> PluginSettings {
        self.settings.get(name).cloned().unwrap_or_default()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawStore {
    Full {
        #[serde(default)]
        plugins: Option<Vec<String>>,
        #[serde(default)]
        settings: Option<BTreeMap<String, serde_yaml::Value>>,
    },
    List(Vec<String>),
}

impl PluginStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `~/.cache/hookline/plugins.yaml`, or `plugins.yaml` in the working
    /// directory when no home directory is known.
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .map(|home| home.join(".cache").join("hookline").join("plugins.yaml"))
            .unwrap_or_else(|| PathBuf::from("plugins.yaml"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> anyhow::Result<StoreSnapshot> {
        if !self.path.exists() {
            return Ok(StoreSnapshot::default());
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {:?}", self.path))?;
        if content.trim().is_empty() {
            return Ok(StoreSnapshot::default());
        }

        let raw: RawStore = if is_yaml(&self.path) {
            serde_yaml::from_str(&content)
                .with_context(|| format!("failed to parse YAML {:?}", self.path))?
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("failed to parse JSON {:?}", self.path))?
        };

        match raw {
            RawStore::List(plugins) => Ok(StoreSnapshot {
                plugins,
                settings: BTreeMap::new(),
            }),
            RawStore::Full { plugins, settings } => {
                let mut parsed = BTreeMap::new();
                for (name, value) in settings.unwrap_or_default() {
                    // Non-mapping entries are ignored, like a missing entry.
                    if let serde_yaml::Value::Mapping(map) = value {
                        parsed.insert(name.clone(), flatten_settings(&name, map)?);
                    }
                }
                Ok(StoreSnapshot {
                    plugins: plugins.unwrap_or_default(),
                    settings: parsed,
                })
            }
        }
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

fn flatten_settings(name: &str, map: serde_yaml::Mapping) -> anyhow::Result<PluginSettings> {
    let mut out = PluginSettings::new();
    for (key, value) in map {
        let key = scalar_to_string(&key)
            .with_context(|| format!("plugin '{}' has a non-scalar setting key", name))?;
        let value = scalar_to_string(&value).with_context(|| {
            format!("setting '{}' of plugin '{}' is not a scalar", key, name)
        })?;
        out.insert(key, value);
    }
    Ok(out)
}

fn scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        serde_yaml::Value::Null => Some(String::new()),
        _ => None,
    }
}
