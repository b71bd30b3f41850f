mod cli;

use std::io::Write;

use anyhow::Context;
use futures::StreamExt;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use hookline::backends::local::LocalModelSpec;
use hookline::backends::pool::serve_worker;
use hookline::{Backend, Executor, PluginRegistry};

use cli::{Command, EngineOpts};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = cli::get_opts();

    // stdout carries results and the worker protocol, so logs go to stderr
    let filter = EnvFilter::try_new(&opts.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();

    match opts.command {
        Command::Complete {
            prompt,
            stream,
            max_tokens,
            temperature,
            top_p,
            engine,
        } => {
            let params = cli::generation_params(max_tokens, temperature, top_p);
            let executor = start(&engine).await?;

            let outcome = tokio::select! {
                res = complete(&executor, &prompt, &params, stream) => res,
                _ = tokio::signal::ctrl_c() => {
                    warn!("Received Ctrl+C, shutting down");
                    Ok(())
                }
            };

            let closed = executor.shutdown().await;
            outcome?;
            closed.context("plugin teardown failed")?;
        }
        Command::Plugins { engine } => {
            let executor = start(&engine).await?;
            for plugin in executor.plugins().iter() {
                println!(
                    "{:>4}  {}  [{}]",
                    plugin.order(),
                    plugin.identifier(),
                    plugin.module().exported_hooks().join(", ")
                );
            }
            executor.shutdown().await.context("plugin teardown failed")?;
        }
        Command::Worker { spec } => {
            let spec: LocalModelSpec = serde_json::from_str(&spec).context("invalid worker spec")?;
            tokio::task::spawn_blocking(move || {
                let stdin = std::io::stdin();
                let stdout = std::io::stdout();
                serve_worker(&spec, stdin.lock(), stdout.lock())
            })
            .await
            .context("worker task panicked")??;
        }
    }

    Ok(())
}

async fn start(engine: &EngineOpts) -> anyhow::Result<Executor> {
    let config = engine.to_config();
    let backend = Backend::from_config(&config);
    let registry = PluginRegistry::new(config.catalog()).with_store(config.plugin_store());
    info!(model = %config.model, "starting engine");
    Executor::start(backend, registry, engine.plugin_names())
        .await
        .context("failed to load plugins")
}

async fn complete(
    executor: &Executor,
    prompt: &str,
    params: &hookline::GenerationParams,
    stream: bool,
) -> anyhow::Result<()> {
    if !stream {
        let text = executor.run(prompt, params).await?;
        println!("{}", text);
        return Ok(());
    }

    let mut fragments = executor.run_streaming(prompt, params).await?;
    let mut stdout = std::io::stdout();
    while let Some(fragment) = fragments.next().await {
        stdout.write_all(fragment?.as_bytes())?;
        stdout.flush()?;
    }
    writeln!(stdout)?;
    Ok(())
}
