//! Text-generation backends.
//!
//! Exactly one [`BackendStrategy`] is picked when the engine is built, from
//! the shape of the model reference. Whatever the strategy, callers get the
//! same four entry points: `complete`, `acomplete`, `stream`, `astream`.

pub mod cache;
pub mod local;
pub mod pool;
pub mod remote;
pub mod sse;

use anyhow::Context;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;
use cache::ResponseCache;
use local::{CommandModel, LlamaCppModel, LocalAsyncModel, LocalModelSpec, LocalSyncModel};
use pool::PooledModel;
use remote::RemoteApi;

pub const DEFAULT_MAX_TOKENS: u32 = 16;
pub const DEFAULT_TEMPERATURE: f32 = 1.0;
pub const DEFAULT_TOP_P: f32 = 1.0;

/// Fragments from a model, before they cross the engine boundary.
pub type FragmentIter = Box<dyn Iterator<Item = anyhow::Result<String>> + Send>;
/// Blocking fragment sequence. Finite, not restartable.
pub type TokenIter = Box<dyn Iterator<Item = Result<String, EngineError>> + Send>;
/// Async fragment sequence. Finite, not restartable.
pub type TokenStream = BoxStream<'static, Result<String, EngineError>>;

/// Sampling knobs. Absent values fall back to the engine defaults when the
/// backend is called; the struct itself is passed along unchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
}

impl GenerationParams {
    pub fn max_tokens(&self) -> u32 {
        self.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)
    }

    pub fn temperature(&self) -> f32 {
        self.temperature.unwrap_or(DEFAULT_TEMPERATURE)
    }

    pub fn top_p(&self) -> f32 {
        self.top_p.unwrap_or(DEFAULT_TOP_P)
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = Some(top_p);
        self
    }
}

/// The generation mechanism behind an engine.
pub enum BackendStrategy {
    RemoteApi(RemoteApi),
    LocalSync(LocalSyncModel),
    LocalAsync(LocalAsyncModel),
    Pooled(PooledModel),
    /// Nothing usable could be built; every call fails with the reason.
    Unavailable(String),
}

/// A reference to local weights rather than a hosted model name.
pub fn is_local_reference(model: &str) -> bool {
    Path::new(model).exists() || model.contains('/') || model.contains(std::path::MAIN_SEPARATOR)
}

impl BackendStrategy {
    /// Pick and build the strategy for `config.model`. Never fails; a
    /// backend that cannot be built becomes [`BackendStrategy::Unavailable`].
    pub fn from_config(config: &EngineConfig) -> Self {
        match Self::build(config) {
            Ok(strategy) => {
                info!(backend = %strategy.describe(), "backend selected");
                strategy
            }
            Err(e) => {
                warn!(model = %config.model, error = %format!("{:#}", e), "backend unavailable");
                BackendStrategy::Unavailable(format!("{:#}", e))
            }
        }
    }

    fn build(config: &EngineConfig) -> anyhow::Result<Self> {
        let model = config.model.trim();
        if model.is_empty() {
            anyhow::bail!("no model configured");
        }

        if !is_local_reference(model) {
            if config.workers > 0 {
                debug!(workers = config.workers, "worker pool ignored for hosted model");
            }
            let api = RemoteApi::new(model, config.api_key.clone(), config.api_base.clone())?;
            return Ok(BackendStrategy::RemoteApi(api));
        }

        let spec = LocalModelSpec::for_model(model, &config.llama_bin, config.runner.as_deref())?;
        spec.validate()?;

        if config.workers > 0 {
            let program = match &config.worker_program {
                Some(program) => program.clone(),
                None => std::env::current_exe().context("cannot locate worker executable")?,
            };
            return Ok(BackendStrategy::Pooled(PooledModel::with_processes(
                config.workers,
                program,
                spec,
            )));
        }

        Ok(match spec {
            LocalModelSpec::Native { model, binary } => {
                let model = LlamaCppModel::new(model, binary);
                BackendStrategy::LocalAsync(LocalAsyncModel::new(Arc::new(model)))
            }
            LocalModelSpec::Pipeline { model, runner } => {
                let model = CommandModel::new(model, runner);
                BackendStrategy::LocalSync(LocalSyncModel::new(Arc::new(model)))
            }
        })
    }

    pub fn describe(&self) -> String {
        match self {
            BackendStrategy::RemoteApi(api) => {
                format!("remote {} at {}", api.model(), api.base_url())
            }
            BackendStrategy::LocalSync(m) => format!("local {}", m.describe()),
            BackendStrategy::LocalAsync(m) => format!("local async {}", m.describe()),
            BackendStrategy::Pooled(p) => p.describe(),
            BackendStrategy::Unavailable(reason) => format!("unavailable ({})", reason),
        }
    }

    pub fn complete(&self, prompt: &str, params: &GenerationParams) -> Result<String, EngineError> {
        match self {
            BackendStrategy::RemoteApi(api) => api
                .complete(prompt, params)
                .map_err(EngineError::generation),
            BackendStrategy::LocalSync(m) => m.complete(prompt, params),
            BackendStrategy::LocalAsync(m) => m.complete(prompt, params),
            BackendStrategy::Pooled(p) => p.complete(prompt, params),
            BackendStrategy::Unavailable(reason) => Err(EngineError::unavailable(reason.clone())),
        }
    }

    pub async fn acomplete(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<String, EngineError> {
        match self {
            BackendStrategy::RemoteApi(api) => api
                .acomplete(prompt, params)
                .await
                .map_err(EngineError::generation),
            BackendStrategy::LocalSync(m) => m.acomplete(prompt, params).await,
            BackendStrategy::LocalAsync(m) => m.acomplete(prompt, params).await,
            BackendStrategy::Pooled(p) => p.acomplete(prompt, params).await,
            BackendStrategy::Unavailable(reason) => Err(EngineError::unavailable(reason.clone())),
        }
    }

    pub fn stream(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<TokenIter, EngineError> {
        match self {
            BackendStrategy::RemoteApi(api) => {
                let iter = api.stream(prompt, params).map_err(EngineError::generation)?;
                Ok(Box::new(iter.map(|r| r.map_err(EngineError::generation))))
            }
            BackendStrategy::LocalSync(m) => m.stream(prompt, params),
            BackendStrategy::LocalAsync(m) => m.stream(prompt, params),
            BackendStrategy::Pooled(p) => p.stream(prompt, params),
            BackendStrategy::Unavailable(reason) => Err(EngineError::unavailable(reason.clone())),
        }
    }

    pub async fn astream(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<TokenStream, EngineError> {
        use futures::StreamExt;
        match self {
            BackendStrategy::RemoteApi(api) => {
                let s = api
                    .astream(prompt, params)
                    .await
                    .map_err(EngineError::generation)?;
                Ok(s.map(|r| r.map_err(EngineError::generation)).boxed())
            }
            BackendStrategy::LocalSync(m) => m.astream(prompt, params).await,
            BackendStrategy::LocalAsync(m) => m.astream(prompt, params).await,
            BackendStrategy::Pooled(p) => p.astream(prompt, params).await,
            BackendStrategy::Unavailable(reason) => Err(EngineError::unavailable(reason.clone())),
        }
    }

    fn close(&self) {
        if let BackendStrategy::Pooled(p) = self {
            p.close();
        }
    }
}

/// The backend an executor talks to: the selected strategy plus the
/// optional completion cache. Shared by all requests for the engine's
/// lifetime.
pub struct Backend {
    strategy: BackendStrategy,
    cache: Option<ResponseCache>,
    closed: AtomicBool,
}

impl Backend {
    pub fn new(strategy: BackendStrategy) -> Self {
        Self {
            strategy,
            cache: None,
            closed: AtomicBool::new(false),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(BackendStrategy::from_config(config)).with_cache(config.cache_size)
    }

    /// Memoise whole completions; 0 turns caching off.
    pub fn with_cache(mut self, capacity: usize) -> Self {
        self.cache = ResponseCache::new(capacity);
        self
    }

    pub fn strategy(&self) -> &BackendStrategy {
        &self.strategy
    }

    pub fn describe(&self) -> String {
        self.strategy.describe()
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::unavailable("backend has been closed"));
        }
        Ok(())
    }

    pub fn complete(&self, prompt: &str, params: &GenerationParams) -> Result<String, EngineError> {
        self.ensure_open()?;
        if let Some(hit) = self.cache.as_ref().and_then(|c| c.get(prompt, params)) {
            debug!("completion cache hit");
            return Ok(hit);
        }
        let text = self.strategy.complete(prompt, params)?;
        if let Some(cache) = &self.cache {
            cache.put(prompt, params, &text);
        }
        Ok(text)
    }

    pub async fn acomplete(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<String, EngineError> {
        self.ensure_open()?;
        if let Some(hit) = self.cache.as_ref().and_then(|c| c.get(prompt, params)) {
            debug!("completion cache hit");
            return Ok(hit);
        }
        let text = self.strategy.acomplete(prompt, params).await?;
        if let Some(cache) = &self.cache {
            cache.put(prompt, params, &text);
        }
        Ok(text)
    }

    pub fn stream(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<TokenIter, EngineError> {
        self.ensure_open()?;
        self.strategy.stream(prompt, params)
    }

    pub async fn astream(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<TokenStream, EngineError> {
        self.ensure_open()?;
        self.strategy.astream(prompt, params).await
    }

    /// Release the backend. Pool workers are stopped; later calls fail with
    /// [`EngineError::BackendUnavailable`].
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!(backend = %self.describe(), "closing backend");
            self.strategy.close();
        }
    }
}
