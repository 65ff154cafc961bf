//! OpenAI-compatible streaming chat client (`/chat/completions`, `stream: true`).

use super::ChatProvider;
use crate::config::LlmConfig;
use crate::conversation::ChatMessage;
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

const SSE_DONE: &str = "[DONE]";

pub struct OpenAiChatClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
}

#[derive(Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Deserialize, Default)]
struct ChunkDelta {
    content: Option<String>,
}

impl OpenAiChatClient {
    pub fn from_config(config: &LlmConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build LLM HTTP client: {e}"))?;

        Ok(Self {
            http,
            api_key: config.api_key.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
        })
    }
}

/// Incremental parser for an SSE body. Bytes may split events and lines
/// arbitrarily; only complete lines are interpreted.
#[derive(Default)]
struct SseDecoder {
    buffer: Vec<u8>,
    done: bool,
}

impl SseDecoder {
    /// Feed raw bytes and return the content pieces they completed.
    fn push(&mut self, bytes: &[u8]) -> anyhow::Result<Vec<String>> {
        self.buffer.extend_from_slice(bytes);

        let mut pieces = Vec::new();
        while let Some(line_end) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=line_end).collect();
            let line = String::from_utf8_lossy(&raw);
            if let Some(piece) = self.parse_line(line.trim_end_matches(['\r', '\n']))? {
                pieces.push(piece);
            }
        }
        Ok(pieces)
    }

    /// Interpret a trailing line that arrived without a newline.
    fn finish(&mut self) -> anyhow::Result<Option<String>> {
        let rest = std::mem::take(&mut self.buffer);
        self.parse_line(String::from_utf8_lossy(&rest).trim())
    }

    fn parse_line(&mut self, line: &str) -> anyhow::Result<Option<String>> {
        if self.done {
            return Ok(None);
        }
        let Some(data) = line.strip_prefix("data:") else {
            return Ok(None);
        };
        let data = data.trim_start();

        if data == SSE_DONE {
            self.done = true;
            return Ok(None);
        }

        let chunk: CompletionChunk = serde_json::from_str(data)
            .map_err(|e| anyhow::anyhow!("Malformed completion chunk: {e}\nData: {data}"))?;

        Ok(chunk
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.delta.content)
            .filter(|c| !c.is_empty()))
    }
}

#[async_trait]
impl ChatProvider for OpenAiChatClient {
    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        deltas: UnboundedSender<String>,
    ) -> anyhow::Result<String> {
        anyhow::ensure!(!self.api_key.is_empty(), "OPENAI_API_KEY is not set");

        let request = CompletionRequest {
            model: &self.model,
            messages: messages
                .iter()
                .map(|m| WireMessage {
                    role: m.role.as_str(),
                    content: &m.content,
                })
                .collect(),
            stream: true,
        };

        tracing::debug!(model = %self.model, messages = messages.len(), "Requesting chat completion");

        let resp = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Chat completion request failed: {e}"))?;

        let status = resp.status();
        if !status.is_success() {
            let body_text = resp
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable>".to_string());
            anyhow::bail!("Chat completion API returned {status}: {body_text}");
        }

        let mut decoder = SseDecoder::default();
        let mut reply = String::new();
        let mut stream = resp.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|e| anyhow::anyhow!("Chat stream interrupted: {e}"))?;
            for piece in decoder.push(&bytes)? {
                reply.push_str(&piece);
                let _ = deltas.send(piece);
            }
        }
        if let Some(piece) = decoder.finish()? {
            reply.push_str(&piece);
            let _ = deltas.send(piece);
        }

        Ok(reply)
    }
}
