use std::sync::{Arc, RwLock};

use tokio::sync::Mutex;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::state::{PipelineState, RunState};
use crate::backends::{Backend, GenerationParams, TokenStream};
use crate::error::{EngineError, Stage};
use crate::plugins::{Plugin, PluginRegistry};

/// Runs requests through the plugin chain and the backend.
///
/// The active plugin list is an immutable snapshot behind a lock. A request
/// takes the snapshot once and runs against it to the end; reload publishes
/// a whole new snapshot.
pub struct Executor {
    backend: Arc<Backend>,
    registry: PluginRegistry,
    plugins: RwLock<Arc<[Plugin]>>,
    // serialises reload and shutdown
    lifecycle: Mutex<()>,
}

impl Executor {
    /// Load plugins and return a ready executor. Any load failure is fatal.
    pub async fn start(
        backend: Backend,
        registry: PluginRegistry,
        names: Option<&[String]>,
    ) -> Result<Self, EngineError> {
        let plugins = registry.load(names).await?;
        info!(backend = %backend.describe(), plugins = plugins.len(), "executor started");
        Ok(Self {
            backend: Arc::new(backend),
            registry,
            plugins: RwLock::new(plugins.into()),
            lifecycle: Mutex::new(()),
        })
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// The currently published plugin list.
    pub fn plugins(&self) -> Arc<[Plugin]> {
        match self.plugins.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn publish(&self, plugins: Arc<[Plugin]>) {
        match self.plugins.write() {
            Ok(mut guard) => *guard = plugins,
            Err(poisoned) => *poisoned.into_inner() = plugins,
        }
    }

    /// Pre-process, generate, post-process.
    pub async fn run(&self, text: &str, params: &GenerationParams) -> Result<String, EngineError> {
        let span = info_span!("run", request_id = %Uuid::new_v4());
        let plugins = self.plugins();
        let mut state = RunState::new();

        let result = async {
            state.advance(PipelineState::PreProcessing);
            let prompt = apply_chain(Stage::Pre, &plugins, text.to_string()).await?;

            state.advance(PipelineState::Generating);
            let generated = self.backend.acomplete(&prompt, params).await?;

            state.advance(PipelineState::PostProcessing);
            let output = apply_chain(Stage::Post, &plugins, generated).await?;

            state.advance(PipelineState::Done);
            Ok::<_, EngineError>(output)
        }
        .instrument(span.clone())
        .await;

        if let Err(e) = &result {
            span.in_scope(|| report(&mut state, e));
        }
        result
    }

    /// Pre-process, then hand back the backend's fragment stream. Streamed
    /// output does not pass through post-process hooks.
    pub async fn run_streaming(
        &self,
        text: &str,
        params: &GenerationParams,
    ) -> Result<TokenStream, EngineError> {
        let span = info_span!("run_streaming", request_id = %Uuid::new_v4());
        let plugins = self.plugins();
        let mut state = RunState::new();

        let result = async {
            state.advance(PipelineState::PreProcessing);
            let prompt = apply_chain(Stage::Pre, &plugins, text.to_string()).await?;

            state.advance(PipelineState::Generating);
            let stream = self.backend.astream(&prompt, params).await?;

            state.advance(PipelineState::Done);
            Ok::<_, EngineError>(stream)
        }
        .instrument(span.clone())
        .await;

        if let Err(e) = &result {
            span.in_scope(|| report(&mut state, e));
        }
        result
    }

    /// Rebuild the plugin list from freshly imported modules. On failure the
    /// current list stays active. On success the old plugins are torn down
    /// before the new list is published; teardown errors are only logged.
    pub async fn reload(&self, names: Option<&[String]>) -> Result<Arc<[Plugin]>, EngineError> {
        let _guard = self.lifecycle.lock().await;

        let fresh: Arc<[Plugin]> = match self.registry.reload(names).await {
            Ok(plugins) => plugins.into(),
            Err(e) => {
                error!(error = %e, "reload failed, keeping current plugins");
                return Err(e);
            }
        };

        let old = self.plugins();
        for e in teardown_all(&old).await {
            warn!(error = %e, "teardown during reload failed");
        }

        self.publish(fresh.clone());
        info!(plugins = fresh.len(), "plugins reloaded");
        Ok(fresh)
    }

    /// Tear down every plugin, then close the backend. Every plugin gets its
    /// teardown even if an earlier one fails; the first failure is returned.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        let _guard = self.lifecycle.lock().await;

        let old = self.plugins();
        self.publish(Arc::from(Vec::new()));

        let mut errors = teardown_all(&old).await.into_iter();
        let first = errors.next();
        for e in errors {
            warn!(error = %e, "teardown failed");
        }

        // Stopping pool workers waits on child processes.
        let backend = self.backend.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || backend.close()).await {
            warn!(error = %e, "closing backend failed");
        }
        info!("executor shut down");
        match first {
            Some(e) => {
                error!(error = %e, "teardown failed");
                Err(e)
            }
            None => Ok(()),
        }
    }
}

async fn apply_chain(
    stage: Stage,
    plugins: &[Plugin],
    mut text: String,
) -> Result<String, EngineError> {
    for plugin in plugins {
        let result = match stage {
            Stage::Pre => plugin.run_preprocess(text).await,
            Stage::Post => plugin.run_postprocess(text).await,
        };
        text = result.map_err(|e| EngineError::stage(stage, plugin.identifier(), e))?;
    }
    Ok(text)
}

async fn teardown_all(plugins: &[Plugin]) -> Vec<EngineError> {
    let mut errors = Vec::new();
    for plugin in plugins {
        if let Err(e) = plugin.run_teardown().await {
            errors.push(EngineError::teardown(plugin.identifier(), e));
        }
    }
    errors
}

fn report(state: &mut RunState, err: &EngineError) {
    let at = state.current();
    state.fail();
    match err {
        EngineError::PipelineStage { stage, plugin, .. } => {
            error!(%stage, %plugin, error = %err, "pipeline failed");
        }
        _ => error!(state = %at, error = %err, "pipeline failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::local::{BlockingModel, LocalSyncModel};
    use crate::backends::pool::{PooledModel, Worker, WorkerFactory, WorkerPool};
    use crate::backends::BackendStrategy;
    use crate::plugins::{ModuleCatalog, PluginModule};
    use futures::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    struct Echo;

    impl BlockingModel for Echo {
        fn describe(&self) -> String {
            "echo".into()
        }

        fn generate(&self, prompt: &str, _params: &GenerationParams) -> anyhow::Result<String> {
            Ok(prompt.to_string())
        }
    }

    fn echo_backend() -> Backend {
        Backend::new(BackendStrategy::LocalSync(LocalSyncModel::new(Arc::new(Echo))))
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn failing_pre_hook_aborts_the_chain() {
        let later = Arc::new(AtomicUsize::new(0));
        let counter = later.clone();
        let catalog = ModuleCatalog::new()
            .with_module("broken", || {
                Ok(PluginModule::new().with_preprocess(|_: &str| Err(anyhow::anyhow!("nope"))))
            })
            .with_module("after", move || {
                let counter = counter.clone();
                Ok(PluginModule::new().with_order(1).with_preprocess(move |t: &str| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(t.to_string())
                }))
            });
        let executor = Executor::start(
            echo_backend(),
            PluginRegistry::new(catalog),
            Some(&names(&["broken", "after"])),
        )
        .await
        .unwrap();

        let err = executor.run("x", &GenerationParams::default()).await.unwrap_err();
        match err {
            EngineError::PipelineStage { stage, plugin, .. } => {
                assert_eq!(stage, Stage::Pre);
                assert_eq!(plugin, "broken");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(later.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failing_post_hook_names_post_stage() {
        let catalog = ModuleCatalog::new().with_module("sour", || {
            Ok(PluginModule::new().with_postprocess_async(|_: String| async {
                Err(anyhow::anyhow!("bad output"))
            }))
        });
        let executor = Executor::start(
            echo_backend(),
            PluginRegistry::new(catalog),
            Some(&names(&["sour"])),
        )
        .await
        .unwrap();
        let err = executor.run("x", &GenerationParams::default()).await.unwrap_err();
        assert!(matches!(err, EngineError::PipelineStage { stage: Stage::Post, .. }));
    }

    #[tokio::test]
    async fn streaming_skips_post_hooks() {
        let catalog = ModuleCatalog::new().with_module("wrap", || {
            Ok(PluginModule::new()
                .with_preprocess(|t: &str| Ok(format!("[{t}]")))
                .with_postprocess(|t: &str| Ok(format!("{t}!"))))
        });
        let executor = Executor::start(
            echo_backend(),
            PluginRegistry::new(catalog),
            Some(&names(&["wrap"])),
        )
        .await
        .unwrap();

        let fragments: Vec<String> = executor
            .run_streaming("a", &GenerationParams::default())
            .await
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(fragments.concat(), "[a]");
        assert_eq!(executor.run("a", &GenerationParams::default()).await.unwrap(), "[a]!");
    }

    #[tokio::test]
    async fn failed_reload_keeps_current_plugins() {
        let catalog = ModuleCatalog::new().with_module("upper", || {
            Ok(PluginModule::new().with_preprocess(|t: &str| Ok(t.to_uppercase())))
        });
        let executor = Executor::start(
            echo_backend(),
            PluginRegistry::new(catalog),
            Some(&names(&["upper"])),
        )
        .await
        .unwrap();

        let err = executor.reload(Some(&names(&["upper", "missing"]))).await.unwrap_err();
        assert!(matches!(err, EngineError::PluginImport { .. }));
        assert_eq!(executor.plugins().len(), 1);
        assert_eq!(executor.run("ok", &GenerationParams::default()).await.unwrap(), "OK");
    }

    #[tokio::test]
    async fn in_flight_snapshot_survives_reload() {
        let catalog = ModuleCatalog::new().with_module("a", || Ok(PluginModule::new()));
        let executor = Executor::start(
            echo_backend(),
            PluginRegistry::new(catalog),
            Some(&names(&["a"])),
        )
        .await
        .unwrap();
        let before = executor.plugins();
        executor.reload(Some(&[])).await.unwrap();
        assert_eq!(before.len(), 1);
        assert!(executor.plugins().is_empty());
    }

    #[tokio::test]
    async fn shutdown_tears_down_everyone_and_reports_first_failure() {
        let torn = Arc::new(AtomicUsize::new(0));
        let (t1, t2) = (torn.clone(), torn.clone());
        let catalog = ModuleCatalog::new()
            .with_module("bad", move || {
                let t = t1.clone();
                Ok(PluginModule::new().with_teardown(move || {
                    t.fetch_add(1, Ordering::SeqCst);
                    Err(anyhow::anyhow!("stuck"))
                }))
            })
            .with_module("good", move || {
                let t = t2.clone();
                Ok(PluginModule::new().with_order(1).with_teardown(move || {
                    t.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }))
            });
        let executor = Executor::start(
            echo_backend(),
            PluginRegistry::new(catalog),
            Some(&names(&["good", "bad"])),
        )
        .await
        .unwrap();

        let err = executor.shutdown().await.unwrap_err();
        assert!(matches!(err, EngineError::PluginTeardown { ref name, .. } if name == "bad"));
        assert_eq!(torn.load(Ordering::SeqCst), 2);
        assert!(matches!(
            executor.run("x", &GenerationParams::default()).await,
            Err(EngineError::BackendUnavailable { .. })
        ));
    }

    struct SlowToStop;

    impl Worker for SlowToStop {
        fn generate(&mut self, prompt: &str, _params: &GenerationParams) -> anyhow::Result<String> {
            Ok(prompt.to_string())
        }

        fn shutdown(&mut self) {
            std::thread::sleep(Duration::from_millis(400));
        }
    }

    #[tokio::test]
    async fn closing_a_pool_keeps_the_runtime_responsive() {
        let factory: WorkerFactory = Arc::new(|_| Ok(Box::new(SlowToStop) as Box<dyn Worker>));
        let pooled = PooledModel::new(WorkerPool::new(1, factory), "slow");
        let backend = Backend::new(BackendStrategy::Pooled(pooled));
        let executor = Executor::start(
            backend,
            PluginRegistry::new(ModuleCatalog::new()),
            Some(&[]),
        )
        .await
        .unwrap();
        executor.run("warm", &GenerationParams::default()).await.unwrap();

        let started = Instant::now();
        let ticker = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            started.elapsed()
        });
        executor.shutdown().await.unwrap();
        let ticked_after = ticker.await.unwrap();
        assert!(ticked_after < Duration::from_millis(300), "{ticked_after:?}");
    }
}
