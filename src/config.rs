use std::path::PathBuf;

use crate::plugins::{ModuleCatalog, PluginStore};

pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";
pub const DEFAULT_LLAMA_BIN: &str = "llama-cli";

/// Construction-time settings. Read once when the engine is built; changing
/// the model means building a new engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Hosted model name, or a path to local weights.
    pub model: String,
    pub api_key: Option<String>,
    pub api_base: Option<String>,
    /// Pool workers for local models; 0 loads the model in-process.
    pub workers: usize,
    /// llama.cpp CLI used for native weight files.
    pub llama_bin: String,
    /// Command for other local models: prompt on stdin, text on stdout.
    pub runner: Option<String>,
    /// Capacity of the completion cache; 0 disables it.
    pub cache_size: usize,
    /// Executable started for each pool worker. Defaults to this binary.
    pub worker_program: Option<PathBuf>,
    pub plugin_file: Option<PathBuf>,
    pub plugin_dirs: Vec<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            api_key: None,
            api_base: None,
            workers: 0,
            llama_bin: DEFAULT_LLAMA_BIN.to_string(),
            runner: None,
            cache_size: 0,
            worker_program: None,
            plugin_file: None,
            plugin_dirs: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn plugin_store(&self) -> PluginStore {
        PluginStore::new(
            self.plugin_file
                .clone()
                .unwrap_or_else(PluginStore::default_path),
        )
    }

    /// Catalog searching every configured plugin directory for manifests.
    pub fn catalog(&self) -> ModuleCatalog {
        self.plugin_dirs
            .iter()
            .fold(ModuleCatalog::new(), |catalog, dir| catalog.with_manifest_dir(dir))
    }
}
