use anyhow::Context;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::sse::SseDecoder;
use super::{FragmentIter, GenerationParams};

pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    content: Option<String>,
}

/// Hosted model behind an OpenAI-compatible chat-completions endpoint.
#[derive(Clone)]
pub struct RemoteApi {
    client: reqwest::Client,
    model: String,
    api_key: Option<String>,
    base_url: String,
}

impl std::fmt::Debug for RemoteApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteApi")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl RemoteApi {
    /// Needs an API key, or an explicit base URL for keyless servers.
    pub fn new(
        model: impl Into<String>,
        api_key: Option<String>,
        base_url: Option<String>,
    ) -> anyhow::Result<Self> {
        let api_key = api_key.filter(|k| !k.trim().is_empty());
        let base_url = base_url.filter(|u| !u.trim().is_empty());
        if api_key.is_none() && base_url.is_none() {
            anyhow::bail!("no API key configured for the remote API (set OPENAI_API_KEY)");
        }
        let base_url = base_url
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string())
            .trim_end_matches('/')
            .to_string();
        Ok(Self {
            client: build_client()?,
            model: model.into(),
            api_key,
            base_url,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn request(
        &self,
        prompt: &str,
        params: &GenerationParams,
        stream: bool,
    ) -> reqwest::RequestBuilder {
        let body = ChatRequest {
            model: &self.model,
            messages: [ChatMessage {
                role: "user",
                content: prompt,
            }],
            max_tokens: params.max_tokens(),
            temperature: params.temperature(),
            top_p: params.top_p(),
            stream,
        };
        let mut req = self.client.post(self.endpoint()).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        req
    }

    async fn send(
        &self,
        prompt: &str,
        params: &GenerationParams,
        stream: bool,
    ) -> anyhow::Result<reqwest::Response> {
        debug!(model = %self.model, stream, "calling remote API");
        let resp = self
            .request(prompt, params, stream)
            .send()
            .await
            .with_context(|| format!("request to {} failed", self.endpoint()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("remote API returned {}: {}", status, body.trim());
        }
        Ok(resp)
    }

    pub async fn acomplete(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> anyhow::Result<String> {
        let resp: ChatResponse = self
            .send(prompt, params, false)
            .await?
            .json()
            .await
            .context("invalid chat completion response")?;
        resp.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .context("chat completion response had no content")
    }

    pub async fn astream(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> anyhow::Result<BoxStream<'static, anyhow::Result<String>>> {
        let resp = self.send(prompt, params, true).await?;
        let mut decoder = SseDecoder::default();
        let fragments = resp
            .bytes_stream()
            .map(move |chunk| match chunk {
                Ok(bytes) => decoder.push(&bytes),
                Err(e) => vec![Err(anyhow::Error::new(e).context("stream interrupted"))],
            })
            .flat_map(stream::iter);
        Ok(fragments.boxed())
    }

    /// Blocking completion. The request runs on a dedicated thread with its
    /// own runtime and client, so this is safe to call from any context.
    pub fn complete(&self, prompt: &str, params: &GenerationParams) -> anyhow::Result<String> {
        let this = self.detached()?;
        let prompt = prompt.to_string();
        let params = *params;
        std::thread::spawn(move || {
            current_thread_runtime()?.block_on(this.acomplete(&prompt, &params))
        })
        .join()
        .map_err(|_| anyhow::anyhow!("remote API thread panicked"))?
    }

    /// Blocking stream, fed by a dedicated thread as fragments arrive.
    pub fn stream(&self, prompt: &str, params: &GenerationParams) -> anyhow::Result<FragmentIter> {
        let this = self.detached()?;
        let prompt = prompt.to_string();
        let params = *params;
        let (tx, rx) = std::sync::mpsc::sync_channel::<anyhow::Result<String>>(16);

        std::thread::spawn(move || {
            let rt = match current_thread_runtime() {
                Ok(rt) => rt,
                Err(e) => {
                    let _ = tx.send(Err(e));
                    return;
                }
            };
            rt.block_on(async {
                match this.astream(&prompt, &params).await {
                    Ok(mut fragments) => {
                        while let Some(item) = fragments.next().await {
                            if tx.send(item).is_err() {
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e));
                    }
                }
            });
        });

        Ok(Box::new(rx.into_iter()))
    }

    /// Same configuration with a fresh connection pool, for use on another
    /// runtime.
    fn detached(&self) -> anyhow::Result<Self> {
        Ok(Self {
            client: build_client()?,
            ..self.clone()
        })
    }
}

fn build_client() -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .context("failed to build HTTP client")
}

fn current_thread_runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start runtime for blocking call")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve exactly one canned HTTP response and hand back the raw request.
    async fn one_shot_server(
        body: &'static str,
        content_type: &'static str,
    ) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut req = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = sock.read(&mut buf).await.unwrap();
                req.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&req);
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let len = text[..head_end]
                        .lines()
                        .find_map(|l| {
                            l.to_ascii_lowercase()
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    if req.len() >= head_end + 4 + len {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let resp = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: {}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                content_type,
                body.len(),
                body
            );
            sock.write_all(resp.as_bytes()).await.unwrap();
            sock.shutdown().await.ok();
            String::from_utf8_lossy(&req).to_string()
        });
        (format!("http://{}", addr), handle)
    }

    #[test]
    fn needs_key_or_base_url() {
        assert!(RemoteApi::new("gpt-3.5-turbo", None, None).is_err());
        assert!(RemoteApi::new("gpt-3.5-turbo", Some(" ".into()), None).is_err());

        let keyed = RemoteApi::new("gpt-3.5-turbo", Some("sk-test".into()), None).unwrap();
        assert_eq!(keyed.base_url(), DEFAULT_API_BASE);

        let local =
            RemoteApi::new("llama3", None, Some("http://localhost:8080/v1/".into())).unwrap();
        assert_eq!(local.base_url(), "http://localhost:8080/v1");
    }

    #[test]
    fn debug_redacts_key() {
        let api = RemoteApi::new("m", Some("sk-secret".into()), None).unwrap();
        assert!(!format!("{:?}", api).contains("sk-secret"));
    }

    #[tokio::test]
    async fn acomplete_posts_chat_request() {
        let (base, server) = one_shot_server(
            r#"{"choices":[{"message":{"role":"assistant","content":"olleh"}}]}"#,
            "application/json",
        )
        .await;
        let api = RemoteApi::new("test-model", Some("sk-test".into()), Some(base)).unwrap();
        let params = GenerationParams::default().with_max_tokens(5);

        assert_eq!(api.acomplete("hello", &params).await.unwrap(), "olleh");

        let raw = server.await.unwrap();
        assert!(raw.starts_with("POST /chat/completions"));
        assert!(raw.to_ascii_lowercase().contains("authorization: bearer sk-test"));
        assert!(raw.contains(r#""max_tokens":5"#));
        assert!(raw.contains(r#""content":"hello""#));
        assert!(!raw.contains(r#""stream""#));
    }

    #[tokio::test]
    async fn astream_yields_deltas() {
        let (base, _server) = one_shot_server(
            "data: {\"choices\":[{\"delta\":{\"content\":\"ol\"}}]}\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"leh\"}}]}\n\ndata: [DONE]\n\n",
            "text/event-stream",
        )
        .await;
        let api = RemoteApi::new("test-model", None, Some(base)).unwrap();
        let parts: Vec<String> = api
            .astream("hello", &GenerationParams::default())
            .await
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(parts, vec!["ol", "leh"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn blocking_complete_works_inside_a_runtime() {
        let (base, _server) = one_shot_server(
            r#"{"choices":[{"message":{"content":"done"}}]}"#,
            "application/json",
        )
        .await;
        let api = RemoteApi::new("test-model", None, Some(base)).unwrap();
        let text =
            tokio::task::spawn_blocking(move || api.complete("x", &GenerationParams::default()))
                .await
                .unwrap()
                .unwrap();
        assert_eq!(text, "done");
    }

    #[tokio::test]
    async fn http_errors_are_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = sock.read(&mut buf).await;
            let body = "{\"error\":\"bad key\"}";
            let resp = format!(
                "HTTP/1.1 401 Unauthorized\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = sock.write_all(resp.as_bytes()).await;
        });
        let api =
            RemoteApi::new("m", Some("nope".into()), Some(format!("http://{}", addr))).unwrap();
        let err = api.acomplete("x", &GenerationParams::default()).await.unwrap_err();
        assert!(err.to_string().contains("401"), "{err}");
    }
}
