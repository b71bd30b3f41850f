//! Plugins: optional text hooks that run before and after generation.
//!
//! A plugin module is an explicit set of optional hooks, each available in a
//! sync and an async flavour. Where a module provides both, the async arm is
//! the one that runs; the sync arm is never tried as a fallback.

pub mod catalog;
pub mod command;
pub mod registry;
pub mod store;

use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

pub use catalog::ModuleCatalog;
pub use registry::PluginRegistry;
pub use store::PluginStore;

/// Flat key -> value settings handed to a plugin's setup hook.
pub type PluginSettings = BTreeMap<String, String>;

pub type TextHook = Arc<dyn Fn(&str) -> anyhow::Result<String> + Send + Sync>;
pub type AsyncTextHook =
    Arc<dyn Fn(String) -> BoxFuture<'static, anyhow::Result<String>> + Send + Sync>;
pub type SetupHook = Arc<dyn Fn(&PluginSettings) -> anyhow::Result<()> + Send + Sync>;
pub type AsyncSetupHook =
    Arc<dyn Fn(PluginSettings) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
pub type TeardownHook = Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync>;
pub type AsyncTeardownHook = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// The capability set exported by one plugin module.
///
/// Absent hooks are `None`; a module with no hooks at all is valid and
/// leaves text untouched.
#[derive(Clone, Default)]
pub struct PluginModule {
    pub order: i32,
    pub preprocess: Option<TextHook>,
    pub preprocess_async: Option<AsyncTextHook>,
    pub postprocess: Option<TextHook>,
    pub postprocess_async: Option<AsyncTextHook>,
    pub setup: Option<SetupHook>,
    pub setup_async: Option<AsyncSetupHook>,
    pub teardown: Option<TeardownHook>,
    pub teardown_async: Option<AsyncTeardownHook>,
}

impl PluginModule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    pub fn with_preprocess<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) -> anyhow::Result<String> + Send + Sync + 'static,
    {
        self.preprocess = Some(Arc::new(f));
        self
    }

    pub fn with_preprocess_async<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
    {
        self.preprocess_async = Some(Arc::new(move |text| Box::pin(f(text))));
        self
    }

    pub fn with_postprocess<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) -> anyhow::Result<String> + Send + Sync + 'static,
    {
        self.postprocess = Some(Arc::new(f));
        self
    }

    pub fn with_postprocess_async<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
    {
        self.postprocess_async = Some(Arc::new(move |text| Box::pin(f(text))));
        self
    }

    pub fn with_setup<F>(mut self, f: F) -> Self
    where
        F: Fn(&PluginSettings) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.setup = Some(Arc::new(f));
        self
    }

    pub fn with_setup_async<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(PluginSettings) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.setup_async = Some(Arc::new(move |settings| Box::pin(f(settings))));
        self
    }

    pub fn with_teardown<F>(mut self, f: F) -> Self
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.teardown = Some(Arc::new(f));
        self
    }

    pub fn with_teardown_async<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.teardown_async = Some(Arc::new(move || Box::pin(f())));
        self
    }

    /// Names of the hooks this module exports, for logging.
    pub fn exported_hooks(&self) -> Vec<&'static str> {
        let mut hooks = Vec::new();
        let mut add = |present: bool, name: &'static str| {
            if present {
                hooks.push(name);
            }
        };
        add(self.preprocess.is_some(), "preprocess");
        add(self.preprocess_async.is_some(), "preprocess_async");
        add(self.postprocess.is_some(), "postprocess");
        add(self.postprocess_async.is_some(), "postprocess_async");
        add(self.setup.is_some(), "setup");
        add(self.setup_async.is_some(), "setup_async");
        add(self.teardown.is_some(), "teardown");
        add(self.teardown_async.is_some(), "teardown_async");
        hooks
    }
}

impl fmt::Debug for PluginModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginModule")
            .field("order", &self.order)
            .field("hooks", &self.exported_hooks())
            .finish()
    }
}

/// A loaded plugin: its identifier plus the module it was imported from.
#[derive(Clone, Debug)]
pub struct Plugin {
    identifier: String,
    module: PluginModule,
}

impl Plugin {
    pub fn new(identifier: impl Into<String>, module: PluginModule) -> Self {
        Self {
            identifier: identifier.into(),
            module,
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn order(&self) -> i32 {
        self.module.order
    }

    pub fn module(&self) -> &PluginModule {
        &self.module
    }

    pub async fn run_preprocess(&self, text: String) -> anyhow::Result<String> {
        dispatch_text(&self.module.preprocess, &self.module.preprocess_async, text).await
    }

    pub async fn run_postprocess(&self, text: String) -> anyhow::Result<String> {
        dispatch_text(&self.module.postprocess, &self.module.postprocess_async, text).await
    }

    pub async fn run_setup(&self, settings: &PluginSettings) -> anyhow::Result<()> {
        if let Some(hook) = &self.module.setup_async {
            hook(settings.clone()).await
        } else if let Some(hook) = &self.module.setup {
            hook(settings)
        } else {
            Ok(())
        }
    }

    pub async fn run_teardown(&self) -> anyhow::Result<()> {
        if let Some(hook) = &self.module.teardown_async {
            hook().await
        } else if let Some(hook) = &self.module.teardown {
            hook()
        } else {
            Ok(())
        }
    }

    pub fn has_setup(&self) -> bool {
        self.module.setup.is_some() || self.module.setup_async.is_some()
    }
}

async fn dispatch_text(
    sync: &Option<TextHook>,
    async_: &Option<AsyncTextHook>,
    text: String,
) -> anyhow::Result<String> {
    if let Some(hook) = async_ {
        hook(text).await
    } else if let Some(hook) = sync {
        hook(&text)
    } else {
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn missing_hooks_pass_text_through() {
        let plugin = Plugin::new("noop", PluginModule::new());
        assert_eq!(plugin.run_preprocess("x".into()).await.unwrap(), "x");
        assert_eq!(plugin.run_postprocess("y".into()).await.unwrap(), "y");
        plugin.run_teardown().await.unwrap();
        plugin.run_setup(&PluginSettings::new()).await.unwrap();
    }

    #[tokio::test]
    async fn async_arm_wins_over_sync_arm() {
        let sync_calls = Arc::new(AtomicUsize::new(0));
        let counter = sync_calls.clone();
        let module = PluginModule::new()
            .with_preprocess(move |t| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(format!("sync:{t}"))
            })
            .with_preprocess_async(|t| async move { Ok(format!("async:{t}")) });
        let plugin = Plugin::new("both", module);

        assert_eq!(plugin.run_preprocess("x".into()).await.unwrap(), "async:x");
        assert_eq!(sync_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn postprocess_only_leaves_preprocess_alone() {
        let module = PluginModule::new().with_postprocess(|t| Ok(format!("{t}!")));
        let plugin = Plugin::new("post_only", module);
        assert_eq!(plugin.run_preprocess("hi".into()).await.unwrap(), "hi");
        assert_eq!(plugin.run_postprocess("hi".into()).await.unwrap(), "hi!");
    }

    #[tokio::test]
    async fn hook_errors_propagate_unchanged() {
        let module = PluginModule::new().with_postprocess(|_| anyhow::bail!("broken hook"));
        let plugin = Plugin::new("broken", module);
        let err = plugin.run_postprocess("x".into()).await.unwrap_err();
        assert_eq!(err.to_string(), "broken hook");
    }

    #[tokio::test]
    async fn teardown_async_only_module_tears_down() {
        let called = Arc::new(AtomicUsize::new(0));
        let counter = called.clone();
        let module = PluginModule::new().with_teardown_async(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        let plugin = Plugin::new("teardown_only", module);
        plugin.run_teardown().await.unwrap();
        assert_eq!(called.load(Ordering::SeqCst), 1);
        assert!(!plugin.has_setup());
    }

    #[test]
    fn debug_lists_exported_hooks() {
        let module = PluginModule::new()
            .with_order(3)
            .with_postprocess(|t| Ok(t.to_string()));
        let dbg = format!("{:?}", module);
        assert!(dbg.contains("order: 3"));
        assert!(dbg.contains("postprocess"));
    }
}
