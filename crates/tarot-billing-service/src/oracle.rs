//! Reading oracle: the AI text generator that writes the reading.
//!
//! [`OpenAiOracle`] talks to any OpenAI-compatible `chat/completions`
//! endpoint with `stream: true` and yields the content deltas.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use tarot_billing_core::MessageRole;

/// Timeout for establishing the completion stream.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Oracle errors.
#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    /// The request could not be sent or the stream broke.
    #[error("transport error: {0}")]
    Transport(String),

    /// The provider answered with a non-success status.
    #[error("provider returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },
}

/// One turn of the conversation sent to the oracle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    /// Author.
    pub role: MessageRole,
    /// Text.
    pub content: String,
}

/// Everything the oracle needs to write a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadingPrompt {
    /// System instructions describing the spread and the cards.
    pub system: String,
    /// Conversation so far, oldest first.
    pub turns: Vec<ChatTurn>,
}

/// Stream of reply text deltas.
pub type ReplyStream = BoxStream<'static, Result<String, OracleError>>;

/// Generates reading replies.
#[async_trait]
pub trait ReadingOracle: Send + Sync {
    /// Start streaming a reply to `prompt`.
    ///
    /// # Errors
    ///
    /// Returns an error if the reply stream cannot be opened.
    async fn stream_reply(&self, prompt: ReadingPrompt) -> Result<ReplyStream, OracleError>;
}

/// OpenAI-compatible chat completions client.
#[derive(Debug, Clone)]
pub struct OpenAiOracle {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiOracle {
    /// Create a client.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base_url: &str, api_key: &str, model: &str) -> Result<Self, OracleError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| OracleError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl ReadingOracle for OpenAiOracle {
    async fn stream_reply(&self, prompt: ReadingPrompt) -> Result<ReplyStream, OracleError> {
        let mut messages = vec![WireMessage {
            role: "system",
            content: &prompt.system,
        }];
        messages.extend(prompt.turns.iter().map(|turn| WireMessage {
            role: turn.role.as_str(),
            content: &turn.content,
        }));

        let request = CompletionRequest {
            model: &self.model,
            messages,
            stream: true,
        };

        let url = format!("{}/chat/completions", self.base_url);
        tracing::debug!(url = %url, model = %self.model, turns = prompt.turns.len(), "Requesting reading");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| OracleError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Reading oracle request failed");
            return Err(OracleError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let mut decoder = SseDecoder::default();
        let deltas = response
            .bytes_stream()
            .map(move |chunk| match chunk {
                Ok(bytes) => decoder.push(&bytes).into_iter().map(Ok).collect::<Vec<_>>(),
                Err(e) => vec![Err(OracleError::Transport(e.to_string()))],
            })
            .flat_map(stream::iter);

        Ok(deltas.boxed())
    }
}

/// Incremental decoder for the completion event stream.
///
/// Buffers partial lines across chunks and returns the non-empty content
/// deltas of every complete `data:` line.
#[derive(Debug, Default)]
struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut deltas = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let Some(data) = line.trim().strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data.is_empty() || data == "[DONE]" {
                continue;
            }
            match serde_json::from_str::<CompletionChunk>(data) {
                Ok(chunk) => deltas.extend(
                    chunk
                        .choices
                        .into_iter()
                        .filter_map(|c| c.delta.content)
                        .filter(|c| !c.is_empty()),
                ),
                Err(e) => tracing::debug!(error = %e, "Skipping undecodable stream line"),
            }
        }
        deltas
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_joins_lines_split_across_chunks() {
        let mut decoder = SseDecoder::default();
        let first = decoder.push(b"data: {\"choices\":[{\"delta\":{\"content\":\"the \"}}]}\n\ndata: {\"choi");
        assert_eq!(first, vec!["the ".to_string()]);

        let second = decoder.push(b"ces\":[{\"delta\":{\"content\":\"moon\"}}]}\n\ndata: [DONE]\n\n");
        assert_eq!(second, vec!["moon".to_string()]);
    }

    #[test]
    fn decoder_skips_role_only_and_comment_lines() {
        let mut decoder = SseDecoder::default();
        let deltas = decoder.push(
            b": keep-alive\n\ndata: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
        );
        assert!(deltas.is_empty());
    }

    #[test]
    fn decoder_handles_multibyte_split() {
        let mut decoder = SseDecoder::default();
        let line = "data: {\"choices\":[{\"delta\":{\"content\":\"月\"}}]}\n".as_bytes();
        let split = line.iter().position(|b| *b >= 0x80).unwrap() + 1;
        assert!(decoder.push(&line[..split]).is_empty());
        assert_eq!(decoder.push(&line[split..]), vec!["月".to_string()]);
    }
}
