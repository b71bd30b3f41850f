use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

use super::command::{load_manifest, module_from_manifest};
use super::PluginModule;
use crate::error::EngineError;

/// Builds a plugin module. Calling it is the module's "import".
pub type ModuleFactory = Arc<dyn Fn() -> anyhow::Result<PluginModule> + Send + Sync>;

/// Resolves plugin identifiers to modules and caches what it imported.
///
/// Identifiers are looked up first among registered factories, then as
/// `<identifier>.yaml` / `<identifier>.yml` manifests in the search
/// directories, in the order the directories were added.
#[derive(Default)]
pub struct ModuleCatalog {
    factories: HashMap<String, ModuleFactory>,
    manifest_dirs: Vec<PathBuf>,
    cache: Mutex<HashMap<String, PluginModule>>,
}

impl ModuleCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a built-in module under `identifier`.
    pub fn register<F>(&mut self, identifier: impl Into<String>, factory: F)
    where
        F: Fn() -> anyhow::Result<PluginModule> + Send + Sync + 'static,
    {
        self.factories.insert(identifier.into(), Arc::new(factory));
    }

    /// Builder form of [`ModuleCatalog::register`].
    pub fn with_module<F>(mut self, identifier: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> anyhow::Result<PluginModule> + Send + Sync + 'static,
    {
        self.register(identifier, factory);
        self
    }

    pub fn with_manifest_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.manifest_dirs.push(dir.into());
        self
    }

    /// Import `identifier`, reusing the cached module if it was imported
    /// before.
    pub fn import(&self, identifier: &str) -> Result<PluginModule, EngineError> {
        if let Some(module) = self.cached(identifier) {
            return Ok(module);
        }
        let module = self.execute(identifier)?;
        self.store(identifier, module.clone());
        Ok(module)
    }

    /// Drop any cached copy and import `identifier` afresh.
    pub fn reimport(&self, identifier: &str) -> Result<PluginModule, EngineError> {
        self.forget(identifier);
        self.import(identifier)
    }

    /// Forget every cached import.
    pub fn invalidate(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
    }

    pub fn is_imported(&self, identifier: &str) -> bool {
        self.cached(identifier).is_some()
    }

    fn execute(&self, identifier: &str) -> Result<PluginModule, EngineError> {
        if let Some(factory) = self.factories.get(identifier) {
            debug!(plugin = identifier, "importing built-in module");
            return factory().map_err(|e| EngineError::import(identifier, e));
        }
        if let Some(path) = self.find_manifest(identifier) {
            debug!(plugin = identifier, path = ?path, "importing manifest module");
            let manifest = load_manifest(&path).map_err(|e| EngineError::import(identifier, e))?;
            return Ok(module_from_manifest(manifest));
        }
        Err(EngineError::import(
            identifier,
            format!("no module named '{}'", identifier),
        ))
    }

    fn find_manifest(&self, identifier: &str) -> Option<PathBuf> {
        // Identifiers are module names, not paths.
        if identifier.is_empty() || identifier.contains(['/', '\\']) || identifier.starts_with('.')
        {
            return None;
        }
        self.manifest_dirs.iter().find_map(|dir| manifest_in(dir, identifier))
    }

    fn cached(&self, identifier: &str) -> Option<PluginModule> {
        self.cache
            .lock()
            .ok()
            .and_then(|cache| cache.get(identifier).cloned())
    }

    fn store(&self, identifier: &str, module: PluginModule) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(identifier.to_string(), module);
        }
    }

    fn forget(&self, identifier: &str) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.remove(identifier);
        }
    }
}

fn manifest_in(dir: &Path, identifier: &str) -> Option<PathBuf> {
    ["yaml", "yml"]
        .iter()
        .map(|ext| dir.join(format!("{}.{}", identifier, ext)))
        .find(|p| p.is_file())
}
