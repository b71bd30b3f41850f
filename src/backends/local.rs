use anyhow::Context;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tracing::debug;

use super::{FragmentIter, GenerationParams, TokenIter, TokenStream};
use crate::error::EngineError;
use crate::process::{blocking_shell, pipe_through_blocking, trim_newline};

/// A model that can only be driven with blocking calls.
pub trait BlockingModel: Send + Sync {
    fn describe(&self) -> String;

    fn generate(&self, prompt: &str, params: &GenerationParams) -> anyhow::Result<String>;

    /// Fragments as they become available. Models without native streaming
    /// yield the whole text once.
    fn generate_stream(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> anyhow::Result<FragmentIter> {
        let text = self.generate(prompt, params)?;
        Ok(Box::new(std::iter::once(Ok(text))))
    }
}

/// A model with a native async arm. Its blocking arm comes from
/// [`BlockingModel`].
#[async_trait]
pub trait AsyncModel: BlockingModel {
    async fn agenerate(&self, prompt: &str, params: &GenerationParams) -> anyhow::Result<String>;

    async fn agenerate_stream(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> anyhow::Result<BoxStream<'static, anyhow::Result<String>>> {
        let text = self.agenerate(prompt, params).await?;
        Ok(stream::once(async move { Ok::<_, anyhow::Error>(text) }).boxed())
    }
}

/// In-process blocking model. Async entry points run on tokio's blocking
/// pool so the caller's runtime thread is never held.
#[derive(Clone)]
pub struct LocalSyncModel {
    model: Arc<dyn BlockingModel>,
}

impl LocalSyncModel {
    pub fn new(model: Arc<dyn BlockingModel>) -> Self {
        Self { model }
    }

    pub fn describe(&self) -> String {
        self.model.describe()
    }

    pub fn complete(&self, prompt: &str, params: &GenerationParams) -> Result<String, EngineError> {
        self.model
            .generate(prompt, params)
            .map_err(EngineError::generation)
    }

    pub async fn acomplete(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<String, EngineError> {
        let model = self.model.clone();
        let prompt = prompt.to_string();
        let params = *params;
        tokio::task::spawn_blocking(move || model.generate(&prompt, &params))
            .await
            .map_err(EngineError::generation)?
            .map_err(EngineError::generation)
    }

    pub fn stream(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<TokenIter, EngineError> {
        let iter = self
            .model
            .generate_stream(prompt, params)
            .map_err(EngineError::generation)?;
        Ok(Box::new(iter.map(|r| r.map_err(EngineError::generation))))
    }

    /// Drives the blocking iterator on the blocking pool and forwards each
    /// fragment as it is produced.
    pub async fn astream(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<TokenStream, EngineError> {
        let model = self.model.clone();
        let prompt = prompt.to_string();
        let params = *params;
        let (tx, rx) = tokio::sync::mpsc::channel::<Result<String, EngineError>>(16);

        tokio::task::spawn_blocking(move || match model.generate_stream(&prompt, &params) {
            Ok(iter) => {
                for item in iter {
                    // Receiver gone: the caller stopped listening.
                    if tx.blocking_send(item.map_err(EngineError::generation)).is_err() {
                        break;
                    }
                }
            }
            Err(e) => {
                let _ = tx.blocking_send(Err(EngineError::generation(e)));
            }
        });

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }
}

/// In-process model with a native async arm; async entry points never touch
/// the blocking pool.
#[derive(Clone)]
pub struct LocalAsyncModel {
    model: Arc<dyn AsyncModel>,
}

impl LocalAsyncModel {
    pub fn new(model: Arc<dyn AsyncModel>) -> Self {
        Self { model }
    }

    pub fn describe(&self) -> String {
        self.model.describe()
    }

    pub fn complete(&self, prompt: &str, params: &GenerationParams) -> Result<String, EngineError> {
        self.model
            .generate(prompt, params)
            .map_err(EngineError::generation)
    }

    pub async fn acomplete(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<String, EngineError> {
        self.model
            .agenerate(prompt, params)
            .await
            .map_err(EngineError::generation)
    }

    pub fn stream(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<TokenIter, EngineError> {
        let iter = self
            .model
            .generate_stream(prompt, params)
            .map_err(EngineError::generation)?;
        Ok(Box::new(iter.map(|r| r.map_err(EngineError::generation))))
    }

    pub async fn astream(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<TokenStream, EngineError> {
        let s = self
            .model
            .agenerate_stream(prompt, params)
            .await
            .map_err(EngineError::generation)?;
        Ok(s.map(|r| r.map_err(EngineError::generation)).boxed())
    }
}

/// Weight-file extensions handled by the native runtime.
pub const NATIVE_EXTENSIONS: &[&str] = &["gguf", "ggml", "ggjt"];

pub fn is_native_weights(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| NATIVE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// How to bring up a local model. Serializable so pool workers can build
/// the same model in their own process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LocalModelSpec {
    /// Native weight file run through a llama.cpp-style CLI.
    Native { model: PathBuf, binary: String },
    /// Anything else, run through a configurable runner command.
    Pipeline { model: String, runner: String },
}

impl LocalModelSpec {
    /// Pick the local runtime for `model` from its extension.
    pub fn for_model(model: &str, llama_bin: &str, runner: Option<&str>) -> anyhow::Result<Self> {
        if is_native_weights(Path::new(model)) {
            return Ok(LocalModelSpec::Native {
                model: PathBuf::from(model),
                binary: llama_bin.to_string(),
            });
        }
        let runner = runner
            .filter(|r| !r.trim().is_empty())
            .with_context(|| format!("no runner command configured for local model '{}'", model))?;
        Ok(LocalModelSpec::Pipeline {
            model: model.to_string(),
            runner: runner.to_string(),
        })
    }

    /// Cheap checks done in the main process before anything is loaded.
    pub fn validate(&self) -> anyhow::Result<()> {
        match self {
            LocalModelSpec::Native { model, .. } => {
                if !model.is_file() {
                    anyhow::bail!("model file {:?} does not exist", model);
                }
                Ok(())
            }
            LocalModelSpec::Pipeline { .. } => Ok(()),
        }
    }

    pub fn is_native(&self) -> bool {
        matches!(self, LocalModelSpec::Native { .. })
    }

    /// Load the model for blocking use (pool workers).
    pub fn load_blocking(&self) -> anyhow::Result<Arc<dyn BlockingModel>> {
        self.validate()?;
        Ok(match self.clone() {
            LocalModelSpec::Native { model, binary } => Arc::new(LlamaCppModel::new(model, binary)),
            LocalModelSpec::Pipeline { model, runner } => {
                Arc::new(CommandModel::new(model, runner))
            }
        })
    }
}

/// Generic local model: the prompt goes to `runner` on stdin, the
/// completion comes back on stdout. Parameters are passed as environment
/// variables.
pub struct CommandModel {
    model: String,
    runner: String,
}

impl CommandModel {
    pub fn new(model: impl Into<String>, runner: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            runner: runner.into(),
        }
    }

    fn envs(&self, params: &GenerationParams) -> Vec<(&'static str, String)> {
        vec![
            ("HOOKLINE_MODEL", self.model.clone()),
            ("HOOKLINE_MAX_TOKENS", params.max_tokens().to_string()),
            ("HOOKLINE_TEMPERATURE", params.temperature().to_string()),
            ("HOOKLINE_TOP_P", params.top_p().to_string()),
        ]
    }
}

impl BlockingModel for CommandModel {
    fn describe(&self) -> String {
        format!("runner `{}` for {}", self.runner, self.model)
    }

    fn generate(&self, prompt: &str, params: &GenerationParams) -> anyhow::Result<String> {
        let mut c = blocking_shell(&self.runner);
        c.envs(self.envs(params));
        debug!(runner = %self.runner, "running local model");
        pipe_through_blocking(c, &self.runner, prompt)
    }
}

/// Native weight files through a llama.cpp CLI (`llama-cli` by default).
pub struct LlamaCppModel {
    model: PathBuf,
    binary: String,
}

impl LlamaCppModel {
    pub fn new(model: impl Into<PathBuf>, binary: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            binary: binary.into(),
        }
    }

    fn args(&self, prompt: &str, params: &GenerationParams) -> Vec<String> {
        vec![
            "-m".into(),
            self.model.to_string_lossy().to_string(),
            "-p".into(),
            prompt.to_string(),
            "-n".into(),
            params.max_tokens().to_string(),
            "--temp".into(),
            params.temperature().to_string(),
            "--top-p".into(),
            params.top_p().to_string(),
            "--no-display-prompt".into(),
            "-no-cnv".into(),
        ]
    }

    fn command(&self, prompt: &str, params: &GenerationParams) -> tokio::process::Command {
        let mut c = tokio::process::Command::new(&self.binary);
        c.args(self.args(prompt, params))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        c
    }
}

impl BlockingModel for LlamaCppModel {
    fn describe(&self) -> String {
        format!("{} {:?}", self.binary, self.model)
    }

    fn generate(&self, prompt: &str, params: &GenerationParams) -> anyhow::Result<String> {
        let output = std::process::Command::new(&self.binary)
            .args(self.args(prompt, params))
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("failed to run {}", self.binary))?;
        check_output(&self.binary, output)
    }
}

#[async_trait]
impl AsyncModel for LlamaCppModel {
    async fn agenerate(&self, prompt: &str, params: &GenerationParams) -> anyhow::Result<String> {
        let output = self
            .command(prompt, params)
            .output()
            .await
            .with_context(|| format!("failed to run {}", self.binary))?;
        check_output(&self.binary, output)
    }

    async fn agenerate_stream(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> anyhow::Result<BoxStream<'static, anyhow::Result<String>>> {
        let mut child = self
            .command(prompt, params)
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.binary))?;
        let stdout = child.stdout.take().context("child stdout not captured")?;
        let stderr = child.stderr.take().map(drain_stderr);
        Ok(read_fragments(self.binary.clone(), child, stdout, stderr))
    }
}

fn check_output(label: &str, output: std::process::Output) -> anyhow::Result<String> {
    if !output.status.success() {
        anyhow::bail!(
            "{} exited with {:?}: {}",
            label,
            output.status.code(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(trim_newline(String::from_utf8_lossy(&output.stdout).to_string()))
}

/// Bytes of a child's stderr kept for error messages.
const STDERR_TAIL: usize = 4096;

/// Read a child's stderr to the end on its own task, so a chatty child never
/// blocks on a full pipe. Resolves to the last `STDERR_TAIL` bytes.
fn drain_stderr<E>(mut stderr: E) -> JoinHandle<String>
where
    E: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut tail = Vec::new();
        let mut buf = [0u8; 4096];
        while let Ok(n) = stderr.read(&mut buf).await {
            if n == 0 {
                break;
            }
            tail.extend_from_slice(&buf[..n]);
            if tail.len() > STDERR_TAIL {
                let excess = tail.len() - STDERR_TAIL;
                tail.drain(..excess);
            }
        }
        String::from_utf8_lossy(&tail).trim().to_string()
    })
}

struct ReadState<R> {
    label: String,
    child: tokio::process::Child,
    stdout: R,
    stderr: Option<JoinHandle<String>>,
    pending: Vec<u8>,
    finished: bool,
}

/// Turn a child's stdout into text fragments as bytes arrive. The exit
/// status is checked once the pipe closes; a failure carries the tail of
/// the child's stderr when it is being drained.
fn read_fragments<R>(
    label: String,
    child: tokio::process::Child,
    stdout: R,
    stderr: Option<JoinHandle<String>>,
) -> BoxStream<'static, anyhow::Result<String>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let state = ReadState {
        label,
        child,
        stdout,
        stderr,
        pending: Vec::new(),
        finished: false,
    };
    stream::unfold(state, |mut st| async move {
        if st.finished {
            return None;
        }
        let mut buf = [0u8; 1024];
        loop {
            match st.stdout.read(&mut buf).await {
                Ok(0) => {
                    st.finished = true;
                    let tail = String::from_utf8_lossy(&st.pending).to_string();
                    st.pending.clear();
                    return match st.child.wait().await {
                        Ok(status) if status.success() => {
                            if tail.is_empty() {
                                None
                            } else {
                                Some((Ok(tail), st))
                            }
                        }
                        Ok(status) => {
                            let detail = match st.stderr.take() {
                                Some(handle) => handle.await.unwrap_or_default(),
                                None => String::new(),
                            };
                            let err = if detail.is_empty() {
                                anyhow::anyhow!("{} exited with {:?}", st.label, status.code())
                            } else {
                                anyhow::anyhow!(
                                    "{} exited with {:?}: {}",
                                    st.label,
                                    status.code(),
                                    detail
                                )
                            };
                            Some((Err(err), st))
                        }
                        Err(e) => Some((Err(anyhow::Error::from(e)), st)),
                    };
                }
                Ok(n) => {
                    st.pending.extend_from_slice(&buf[..n]);
                    let text = take_utf8(&mut st.pending);
                    if !text.is_empty() {
                        return Some((Ok(text), st));
                    }
                }
                Err(e) => {
                    st.finished = true;
                    return Some((Err(anyhow::Error::from(e)), st));
                }
            }
        }
    })
    .boxed()
}

/// Remove and return the longest valid UTF-8 prefix of `pending`, leaving an
/// incomplete trailing sequence for the next read.
fn take_utf8(pending: &mut Vec<u8>) -> String {
    match std::str::from_utf8(pending) {
        Ok(s) => {
            let out = s.to_string();
            pending.clear();
            out
        }
        Err(e) if e.error_len().is_none() => {
            let rest = pending.split_off(e.valid_up_to());
            let out = String::from_utf8_lossy(pending).to_string();
            *pending = rest;
            out
        }
        Err(_) => {
            let out = String::from_utf8_lossy(pending).to_string();
            pending.clear();
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Chunky;

    impl BlockingModel for Chunky {
        fn describe(&self) -> String {
            "chunky".into()
        }

        fn generate(&self, prompt: &str, _params: &GenerationParams) -> anyhow::Result<String> {
            Ok(prompt.chars().rev().collect())
        }

        fn generate_stream(
            &self,
            prompt: &str,
            params: &GenerationParams,
        ) -> anyhow::Result<FragmentIter> {
            let text = self.generate(prompt, params)?;
            let parts: Vec<anyhow::Result<String>> = text
                .chars()
                .collect::<Vec<_>>()
                .chunks(2)
                .map(|c| Ok(c.iter().collect()))
                .collect();
            Ok(Box::new(parts.into_iter()))
        }
    }

    struct Failing;

    impl BlockingModel for Failing {
        fn describe(&self) -> String {
            "failing".into()
        }

        fn generate(&self, _prompt: &str, _params: &GenerationParams) -> anyhow::Result<String> {
            anyhow::bail!("runtime exploded")
        }
    }

    #[tokio::test]
    async fn sync_and_async_complete_agree() {
        let backend = LocalSyncModel::new(Arc::new(Chunky));
        let params = GenerationParams::default();
        let sync = backend.complete("hello", &params).unwrap();
        let async_ = backend.acomplete("hello", &params).await.unwrap();
        assert_eq!(sync, "olleh");
        assert_eq!(sync, async_);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn astream_forwards_each_fragment() {
        let backend = LocalSyncModel::new(Arc::new(Chunky));
        let parts: Vec<String> = backend
            .astream("abcde", &GenerationParams::default())
            .await
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(parts, vec!["ed", "cb", "a"]);
    }

    #[tokio::test]
    async fn model_failure_is_generation_error() {
        let backend = LocalSyncModel::new(Arc::new(Failing));
        let err = backend
            .acomplete("x", &GenerationParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Generation { .. }));

        let mut s = backend.astream("x", &GenerationParams::default()).await.unwrap();
        assert!(matches!(s.next().await, Some(Err(EngineError::Generation { .. }))));
        assert!(s.next().await.is_none());
    }

    #[test]
    fn default_stream_degrades_to_one_fragment() {
        let backend = LocalSyncModel::new(Arc::new(Echo));
        let parts: Vec<String> = backend
            .stream("abc", &GenerationParams::default())
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(parts, vec!["abc"]);
    }

    struct Echo;

    impl BlockingModel for Echo {
        fn describe(&self) -> String {
            "echo".into()
        }

        fn generate(&self, prompt: &str, _params: &GenerationParams) -> anyhow::Result<String> {
            Ok(prompt.to_string())
        }
    }

    #[test]
    fn model_selection_by_extension() {
        let native = LocalModelSpec::for_model("models/llama.GGUF", "llama-cli", None).unwrap();
        assert!(native.is_native());

        let pipeline =
            LocalModelSpec::for_model("models/gpt2", "llama-cli", Some("python run.py")).unwrap();
        assert_eq!(
            pipeline,
            LocalModelSpec::Pipeline {
                model: "models/gpt2".into(),
                runner: "python run.py".into()
            }
        );

        assert!(LocalModelSpec::for_model("models/gpt2", "llama-cli", None).is_err());
        assert!(LocalModelSpec::for_model("models/gpt2", "llama-cli", Some("  ")).is_err());
    }

    #[test]
    fn native_model_requires_existing_file() {
        let spec = LocalModelSpec::Native {
            model: PathBuf::from("/definitely/not/here.gguf"),
            binary: "llama-cli".into(),
        };
        assert!(spec.validate().is_err());
        assert!(spec.load_blocking().is_err());
    }

    #[test]
    fn take_utf8_keeps_split_sequences() {
        let mut pending = "hé".as_bytes().to_vec();
        let last = pending.pop().unwrap();
        assert_eq!(take_utf8(&mut pending), "h");
        assert_eq!(pending.len(), 1);
        pending.push(last);
        assert_eq!(take_utf8(&mut pending), "é");
        assert!(pending.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn command_model_passes_prompt_and_params() {
        let model = CommandModel::new(
            "tiny",
            "printf '%s|%s|%s' \"$(cat)\" \"$HOOKLINE_MODEL\" \"$HOOKLINE_MAX_TOKENS\"",
        );
        let params = GenerationParams::default().with_max_tokens(8);
        assert_eq!(model.generate("hi", &params).unwrap(), "hi|tiny|8");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn reads_child_output_as_fragments() {
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg("printf 'one '; sleep 0.1; printf 'two'")
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        let stdout = child.stdout.take().unwrap();
        let text: Vec<String> = read_fragments("sh".into(), child, stdout, None)
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(text.concat(), "one two");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_child_ends_stream_with_error() {
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg("exit 2")
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        let stdout = child.stdout.take().unwrap();
        let items: Vec<anyhow::Result<String>> =
            read_fragments("sh".into(), child, stdout, None).collect().await;
        assert_eq!(items.len(), 1);
        assert!(items[0].is_err());
    }

    #[cfg(unix)]
    fn fake_llama(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("llama");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn chatty_stderr_does_not_stall_stream() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_llama(
            dir.path(),
            "yes 'load_tensors: blk.0.attn_q.weight' | head -n 10000 >&2\nprintf hello",
        );
        let model = LlamaCppModel::new(dir.path().join("m.gguf"), bin.to_string_lossy());

        let fragments = model
            .agenerate_stream("hi", &GenerationParams::default())
            .await
            .unwrap();
        let text: Vec<String> = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            fragments.map(|r| r.unwrap()).collect::<Vec<_>>(),
        )
        .await
        .expect("stream stalled");
        assert_eq!(text.concat(), "hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stream_failure_carries_child_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_llama(dir.path(), "echo 'failed to load model' >&2\nexit 3");
        let model = LlamaCppModel::new(dir.path().join("m.gguf"), bin.to_string_lossy());

        let items: Vec<anyhow::Result<String>> = model
            .agenerate_stream("hi", &GenerationParams::default())
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(items.len(), 1);
        let err = items[0].as_ref().unwrap_err().to_string();
        assert!(err.contains("failed to load model"), "{err}");
    }
}
