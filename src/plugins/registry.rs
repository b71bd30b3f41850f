use std::sync::Arc;
use tracing::{debug, info};

use super::store::{PluginStore, StoreSnapshot};
use super::{ModuleCatalog, Plugin};
use crate::error::EngineError;

/// Turns plugin identifiers into ordered, configured plugins.
///
/// When no explicit list is given, identifiers come from the store. Settings
/// always come from the store, one snapshot per load cycle.
#[derive(Clone)]
pub struct PluginRegistry {
    catalog: Arc<ModuleCatalog>,
    store: Option<PluginStore>,
}

impl PluginRegistry {
    pub fn new(catalog: ModuleCatalog) -> Self {
        Self {
            catalog: Arc::new(catalog),
            store: None,
        }
    }

    pub fn with_store(mut self, store: PluginStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn catalog(&self) -> &ModuleCatalog {
        &self.catalog
    }

    /// Import, configure and order the plugins. Any failure aborts the whole
    /// load; nothing partial is returned.
    pub async fn load(&self, names: Option<&[String]>) -> Result<Vec<Plugin>, EngineError> {
        self.build(names, false).await
    }

    /// Like [`PluginRegistry::load`], but every module is imported afresh so
    /// edits to its source take effect.
    pub async fn reload(&self, names: Option<&[String]>) -> Result<Vec<Plugin>, EngineError> {
        self.catalog.invalidate();
        self.build(names, true).await
    }

    async fn build(
        &self,
        names: Option<&[String]>,
        fresh: bool,
    ) -> Result<Vec<Plugin>, EngineError> {
        let snapshot = self.snapshot()?;
        let names: Vec<String> = match names {
            Some(names) => names.to_vec(),
            None => snapshot.plugins.clone(),
        };

        let mut plugins = Vec::with_capacity(names.len());
        for name in &names {
            let module = if fresh {
                self.catalog.reimport(name)?
            } else {
                self.catalog.import(name)?
            };
            let plugin = Plugin::new(name.clone(), module);

            if plugin.has_setup() {
                let settings = snapshot.settings_for(name);
                debug!(plugin = %name, keys = settings.len(), "running setup");
                plugin
                    .run_setup(&settings)
                    .await
                    .map_err(|e| EngineError::setup(name, e))?;
            }
            plugins.push(plugin);
        }

        // Stable: equal orders keep their input order.
        plugins.sort_by_key(Plugin::order);

        info!(
            plugins = ?plugins.iter().map(Plugin::identifier).collect::<Vec<_>>(),
            "plugins loaded"
        );
        Ok(plugins)
    }

    fn snapshot(&self) -> Result<StoreSnapshot, EngineError> {
        match &self.store {
            Some(store) => store.snapshot().map_err(|e| EngineError::PluginStore {
                source: e.into(),
            }),
            None => Ok(StoreSnapshot::default()),
        }
    }
}
