use anyhow::Context;
use serde::Deserialize;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::debug;

use super::{PluginModule, PluginSettings};
use crate::process::pipe_through;

/// Manifest for a plugin whose hooks are shell commands.
///
/// Each text hook receives the text on stdin and replaces it with its
/// stdout. Settings from setup are exported as `HOOKLINE_SETTING_<KEY>`.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct CommandManifest {
    #[serde(default)]
    pub order: i32,
    #[serde(default)]
    pub preprocess: Option<String>,
    #[serde(default)]
    pub postprocess: Option<String>,
    #[serde(default)]
    pub teardown: Option<String>,
    #[serde(default)]
    pub timeout: Option<u64>, // seconds
}

/// Read and parse a manifest file.
pub fn load_manifest(path: &Path) -> anyhow::Result<CommandManifest> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("failed to read {:?}", path))?;
    let manifest: CommandManifest = serde_yaml::from_str(&content)
        .with_context(|| format!("failed to parse YAML {:?}", path))?;
    Ok(manifest)
}

/// Turn a manifest into a module. Every command hook uses the async arm.
pub fn module_from_manifest(manifest: CommandManifest) -> PluginModule {
    let env: Arc<RwLock<Vec<(String, String)>>> = Arc::default();
    let timeout = manifest.timeout;

    let mut module = PluginModule::new().with_order(manifest.order);

    let setup_env = env.clone();
    module = module.with_setup_async(move |settings: PluginSettings| {
        let setup_env = setup_env.clone();
        async move {
            let vars = settings_env(&settings);
            debug!(count = vars.len(), "command plugin configured");
            *setup_env
                .write()
                .map_err(|_| anyhow::anyhow!("settings lock poisoned"))? = vars;
            Ok(())
        }
    });

    if let Some(cmd) = manifest.preprocess {
        module = module.with_preprocess_async(text_hook(cmd, env.clone(), timeout));
    }
    if let Some(cmd) = manifest.postprocess {
        module = module.with_postprocess_async(text_hook(cmd, env.clone(), timeout));
    }
    if let Some(cmd) = manifest.teardown {
        let env = env.clone();
        let cmd = Arc::new(cmd);
        module = module.with_teardown_async(move || {
            let cmd = cmd.clone();
            let vars = snapshot(&env);
            async move {
                pipe_through(&cmd, "", &vars?, timeout).await?;
                Ok(())
            }
        });
    }

    module
}

fn text_hook(
    cmd: String,
    env: Arc<RwLock<Vec<(String, String)>>>,
    timeout: Option<u64>,
) -> impl Fn(String) -> futures::future::BoxFuture<'static, anyhow::Result<String>> + Send + Sync
{
    let cmd = Arc::new(cmd);
    move |text: String| -> futures::future::BoxFuture<'static, anyhow::Result<String>> {
        let cmd = cmd.clone();
        let vars = snapshot(&env);
        Box::pin(async move { pipe_through(&cmd, &text, &vars?, timeout).await })
    }
}

fn snapshot(env: &RwLock<Vec<(String, String)>>) -> anyhow::Result<Vec<(String, String)>> {
    env.read()
        .map(|vars| vars.clone())
        .map_err(|_| anyhow::anyhow!("settings lock poisoned"))
}

/// `{"max-len": "3"}` -> `HOOKLINE_SETTING_MAX_LEN=3`
pub fn settings_env(settings: &PluginSettings) -> Vec<(String, String)> {
    settings
        .iter()
        .map(|(k, v)| {
            let key: String = k
                .chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() {
                        c.to_ascii_uppercase()
                    } else {
                        '_'
                    }
                })
                .collect();
            (format!("HOOKLINE_SETTING_{}", key), v.clone())
        })
        .collect()
}
