use serde::Deserialize;

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Deserialize, Default)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

/// Incremental decoder for chat-completion server-sent events.
///
/// Bytes may arrive split anywhere, including inside a line or a UTF-8
/// sequence. Only `data:` lines are considered; `[DONE]` ends the stream and
/// anything after it is ignored.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    done: bool,
}

impl SseDecoder {
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed a chunk, returning the text fragments it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<anyhow::Result<String>> {
        let mut out = Vec::new();
        if self.done {
            return out;
        }
        self.buf.extend_from_slice(chunk);

        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);

            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data == "[DONE]" {
                self.done = true;
                self.buf.clear();
                break;
            }
            if data.is_empty() {
                continue;
            }
            match serde_json::from_str::<StreamChunk>(data) {
                Ok(chunk) => {
                    let text: String = chunk
                        .choices
                        .into_iter()
                        .filter_map(|c| c.delta.content)
                        .collect();
                    if !text.is_empty() {
                        out.push(Ok(text));
                    }
                }
                Err(e) => out.push(Err(anyhow::anyhow!("malformed stream event: {}", e))),
            }
        }
        out
    }
}
