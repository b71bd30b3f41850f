//! Fixed-size pool of long-lived model workers.
//!
//! Each slot owns at most one worker, started the first time the slot is
//! used. A worker loads the model once and then serves requests one at a
//! time. The default worker is a child process speaking JSON lines over
//! stdin/stdout; the parent never shares model memory with it.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::local::LocalModelSpec;
use super::{GenerationParams, TokenIter, TokenStream};
use crate::error::EngineError;

/// One pool worker. Calls on a worker are never concurrent.
pub trait Worker: Send {
    fn generate(&mut self, prompt: &str, params: &GenerationParams) -> anyhow::Result<String>;

    fn shutdown(&mut self) {}
}

/// Starts the worker for a slot; receives the slot index.
pub type WorkerFactory = Arc<dyn Fn(usize) -> anyhow::Result<Box<dyn Worker>> + Send + Sync>;

/// The worker's channel broke; it is discarded and respawned on next use.
#[derive(Debug, thiserror::Error)]
#[error("pool worker {index} lost: {reason}")]
pub struct WorkerLost {
    pub index: usize,
    pub reason: String,
}

struct Slot {
    index: usize,
    worker: Option<Box<dyn Worker>>,
}

struct PoolState {
    idle: Vec<Slot>,
    closed: bool,
}

pub struct WorkerPool {
    size: usize,
    factory: WorkerFactory,
    state: Mutex<PoolState>,
    ready: Condvar,
}

impl WorkerPool {
    pub fn new(size: usize, factory: WorkerFactory) -> Self {
        let size = size.max(1);
        // Reversed so slot 0 is handed out first.
        let idle = (0..size).rev().map(|index| Slot { index, worker: None }).collect();
        Self {
            size,
            factory,
            state: Mutex::new(PoolState {
                idle,
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().map(|s| s.closed).unwrap_or(true)
    }

    /// Run one request on a free worker, blocking until one is available.
    pub fn complete(&self, prompt: &str, params: &GenerationParams) -> anyhow::Result<String> {
        let mut slot = self.checkout()?;
        let result = self.run_on(&mut slot, prompt, params);
        self.checkin(slot);
        result
    }

    fn checkout(&self) -> anyhow::Result<Slot> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow::anyhow!("worker pool lock poisoned"))?;
        loop {
            if state.closed {
                anyhow::bail!("worker pool is closed");
            }
            if let Some(slot) = state.idle.pop() {
                return Ok(slot);
            }
            state = self
                .ready
                .wait(state)
                .map_err(|_| anyhow::anyhow!("worker pool lock poisoned"))?;
        }
    }

    fn run_on(
        &self,
        slot: &mut Slot,
        prompt: &str,
        params: &GenerationParams,
    ) -> anyhow::Result<String> {
        let worker = match &mut slot.worker {
            Some(worker) => worker,
            empty => {
                info!(worker = slot.index, "starting pool worker");
                empty.insert(
                    (self.factory)(slot.index)
                        .with_context(|| format!("failed to start pool worker {}", slot.index))?,
                )
            }
        };

        let result = worker.generate(prompt, params);
        if let Err(e) = &result {
            if e.downcast_ref::<WorkerLost>().is_some() {
                warn!(worker = slot.index, error = %e, "discarding pool worker");
                if let Some(mut lost) = slot.worker.take() {
                    lost.shutdown();
                }
            }
        }
        result
    }

    fn checkin(&self, mut slot: Slot) {
        if let Ok(mut state) = self.state.lock() {
            if !state.closed {
                state.idle.push(slot);
                drop(state);
                self.ready.notify_one();
                return;
            }
        }
        if let Some(mut worker) = slot.worker.take() {
            worker.shutdown();
        }
    }

    /// Stop idle workers now; busy ones are stopped when they are returned.
    pub fn close(&self) {
        let idle = match self.state.lock() {
            Ok(mut state) => {
                state.closed = true;
                std::mem::take(&mut state.idle)
            }
            Err(_) => Vec::new(),
        };
        self.ready.notify_all();
        for mut slot in idle {
            if let Some(mut worker) = slot.worker.take() {
                debug!(worker = slot.index, "stopping pool worker");
                worker.shutdown();
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.close();
    }
}

/// Pool-backed model. Every call is blocking on the pool, so async entry
/// points go through `spawn_blocking`. There is no native streaming; streams
/// yield the full text as one fragment.
#[derive(Clone)]
pub struct PooledModel {
    pool: Arc<WorkerPool>,
    label: String,
}

impl PooledModel {
    pub fn new(pool: WorkerPool, label: impl Into<String>) -> Self {
        Self {
            pool: Arc::new(pool),
            label: label.into(),
        }
    }

    /// Pool of child processes running `program worker --spec <json>`.
    pub fn with_processes(size: usize, program: PathBuf, spec: LocalModelSpec) -> Self {
        let label = format!("{} x{}", describe_spec(&spec), size.max(1));
        let factory: WorkerFactory = Arc::new(move |index| {
            let worker = ProcessWorker::spawn(&program, &spec, index)?;
            Ok(Box::new(worker) as Box<dyn Worker>)
        });
        Self::new(WorkerPool::new(size, factory), label)
    }

    pub fn describe(&self) -> String {
        format!("pool of {}", self.label)
    }

    pub fn size(&self) -> usize {
        self.pool.size()
    }

    pub fn complete(&self, prompt: &str, params: &GenerationParams) -> Result<String, EngineError> {
        if self.pool.is_closed() {
            return Err(EngineError::unavailable("worker pool is closed"));
        }
        self.pool
            .complete(prompt, params)
            .map_err(EngineError::generation)
    }

    pub async fn acomplete(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<String, EngineError> {
        let this = self.clone();
        let prompt = prompt.to_string();
        let params = *params;
        tokio::task::spawn_blocking(move || this.complete(&prompt, &params))
            .await
            .map_err(EngineError::generation)?
    }

    pub fn stream(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<TokenIter, EngineError> {
        let text = self.complete(prompt, params)?;
        Ok(Box::new(std::iter::once(Ok(text))))
    }

    pub async fn astream(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<TokenStream, EngineError> {
        use futures::stream::{self, StreamExt};
        let text = self.acomplete(prompt, params).await?;
        Ok(stream::once(async move { Ok::<_, EngineError>(text) }).boxed())
    }

    pub fn close(&self) {
        self.pool.close();
    }
}

fn describe_spec(spec: &LocalModelSpec) -> String {
    match spec {
        LocalModelSpec::Native { model, .. } => format!("{:?}", model),
        LocalModelSpec::Pipeline { model, .. } => model.clone(),
    }
}

/// Request line sent to a worker process.
#[derive(Debug, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub prompt: String,
    #[serde(default)]
    pub params: GenerationParams,
}

/// Reply line from a worker process. `Ready` is sent once the model is
/// loaded.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerResponse {
    Ready,
    Text(String),
    Error(String),
}

/// Worker living in a child process.
pub struct ProcessWorker {
    index: usize,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
}

impl ProcessWorker {
    /// Spawn the worker and wait until it reports the model loaded.
    pub fn spawn(program: &Path, spec: &LocalModelSpec, index: usize) -> anyhow::Result<Self> {
        let spec_json = serde_json::to_string(spec)?;
        let mut child = Command::new(program)
            .arg("worker")
            .arg("--spec")
            .arg(&spec_json)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("failed to spawn worker {:?}", program))?;

        let stdin = child.stdin.take().context("worker stdin not captured")?;
        let stdout = child.stdout.take().context("worker stdout not captured")?;
        let mut worker = Self {
            index,
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout),
        };

        match worker.read_response()? {
            WorkerResponse::Ready => {
                debug!(worker = index, pid = worker.child.id(), "pool worker ready");
                Ok(worker)
            }
            WorkerResponse::Error(e) => {
                worker.shutdown();
                anyhow::bail!("worker {} failed to load model: {}", index, e)
            }
            WorkerResponse::Text(_) => {
                worker.shutdown();
                anyhow::bail!("worker {} sent output before ready", index)
            }
        }
    }

    fn lost(&self, reason: impl std::fmt::Display) -> anyhow::Error {
        WorkerLost {
            index: self.index,
            reason: reason.to_string(),
        }
        .into()
    }

    fn read_response(&mut self) -> anyhow::Result<WorkerResponse> {
        let mut line = String::new();
        let n = self
            .stdout
            .read_line(&mut line)
            .map_err(|e| self.lost(e))?;
        if n == 0 {
            return Err(self.lost("worker closed its output"));
        }
        serde_json::from_str(line.trim_end())
            .map_err(|e| self.lost(format!("invalid reply: {}", e)))
    }
}

impl Worker for ProcessWorker {
    fn generate(&mut self, prompt: &str, params: &GenerationParams) -> anyhow::Result<String> {
        let request = WorkerRequest {
            prompt: prompt.to_string(),
            params: *params,
        };
        let mut line = serde_json::to_string(&request)?;
        line.push('\n');

        let write = match self.stdin.as_mut() {
            Some(stdin) => stdin.write_all(line.as_bytes()).and_then(|_| stdin.flush()),
            None => return Err(self.lost("worker already shut down")),
        };
        write.map_err(|e| self.lost(e))?;

        match self.read_response()? {
            WorkerResponse::Text(text) => Ok(text),
            WorkerResponse::Error(e) => Err(anyhow::anyhow!(e)),
            WorkerResponse::Ready => Err(self.lost("unexpected ready message")),
        }
    }

    fn shutdown(&mut self) {
        // Closing stdin ends the worker loop.
        if self.stdin.take().is_none() {
            return;
        }
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match self.child.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(20))
                }
                _ => break,
            }
        }
        warn!(worker = self.index, "pool worker did not exit, killing it");
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for ProcessWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Worker process main loop: load the model once, then answer one request
/// per input line until the input closes.
pub fn serve_worker<R: BufRead, W: Write>(
    spec: &LocalModelSpec,
    input: R,
    mut output: W,
) -> anyhow::Result<()> {
    let model = match spec.load_blocking() {
        Ok(model) => model,
        Err(e) => {
            reply(&mut output, &WorkerResponse::Error(format!("{:#}", e)))?;
            return Err(e);
        }
    };
    reply(&mut output, &WorkerResponse::Ready)?;
    info!(model = %model.describe(), "worker ready");

    for line in input.lines() {
        let line = line.context("failed to read request")?;
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<WorkerRequest>(&line) {
            Ok(req) => match model.generate(&req.prompt, &req.params) {
                Ok(text) => WorkerResponse::Text(text),
                Err(e) => WorkerResponse::Error(format!("{:#}", e)),
            },
            Err(e) => WorkerResponse::Error(format!("invalid request: {}", e)),
        };
        reply(&mut output, &response)?;
    }
    Ok(())
}

fn reply<W: Write>(output: &mut W, response: &WorkerResponse) -> anyhow::Result<()> {
    let mut line = serde_json::to_string(response)?;
    line.push('\n');
    output.write_all(line.as_bytes())?;
    output.flush()?;
    Ok(())
}
