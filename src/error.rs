use std::fmt;

use thiserror::Error;

/// Boxed cause carried by engine errors. Hook and model failures arrive as
/// `anyhow::Error` and are converted into this at the engine boundary.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Which hook chain a failing plugin belonged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Pre,
    Post,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Pre => f.write_str("pre"),
            Stage::Post => f.write_str("post"),
        }
    }
}

/// Errors surfaced by the plugin registry, the pipeline and the backends.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Module not found, or it failed while being imported.
    #[error("failed to import plugin '{name}': {source}")]
    PluginImport {
        name: String,
        #[source]
        source: BoxError,
    },

    /// A plugin's setup hook failed.
    #[error("setup of plugin '{name}' failed: {source}")]
    PluginSetup {
        name: String,
        #[source]
        source: BoxError,
    },

    /// A plugin's teardown hook failed.
    #[error("teardown of plugin '{name}' failed: {source}")]
    PluginTeardown {
        name: String,
        #[source]
        source: BoxError,
    },

    /// The persisted plugin configuration could not be read.
    #[error("failed to load plugin configuration: {source}")]
    PluginStore {
        #[source]
        source: BoxError,
    },

    /// A pre- or post-process hook failed during a run.
    #[error("{stage}-process hook of plugin '{plugin}' failed: {source}")]
    PipelineStage {
        stage: Stage,
        plugin: String,
        #[source]
        source: BoxError,
    },

    /// The backend call itself failed.
    #[error("generation failed: {source}")]
    Generation {
        #[source]
        source: BoxError,
    },

    /// No usable backend is configured, or it has been closed.
    #[error("no backend available: {reason}")]
    BackendUnavailable { reason: String },
}

impl EngineError {
    pub fn import(name: &str, err: impl Into<BoxError>) -> Self {
        EngineError::PluginImport {
            name: name.to_string(),
            source: err.into(),
        }
    }

    pub fn setup(name: &str, err: impl Into<BoxError>) -> Self {
        EngineError::PluginSetup {
            name: name.to_string(),
            source: err.into(),
        }
    }

    pub fn teardown(name: &str, err: impl Into<BoxError>) -> Self {
        EngineError::PluginTeardown {
            name: name.to_string(),
            source: err.into(),
        }
    }

    pub fn stage(stage: Stage, plugin: &str, err: impl Into<BoxError>) -> Self {
        EngineError::PipelineStage {
            stage,
            plugin: plugin.to_string(),
            source: err.into(),
        }
    }

    pub fn generation(err: impl Into<BoxError>) -> Self {
        EngineError::Generation { source: err.into() }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        EngineError::BackendUnavailable {
            reason: reason.into(),
        }
    }

    /// Whether this failure came from a plugin rather than from generation.
    pub fn is_plugin_failure(&self) -> bool {
        matches!(
            self,
            EngineError::PluginImport { .. }
                | EngineError::PluginSetup { .. }
                | EngineError::PluginTeardown { .. }
                | EngineError::PipelineStage { .. }
        )
    }
}
