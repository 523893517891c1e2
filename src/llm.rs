use axum::body::Bytes;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{AnyDelimiterCodec, FramedRead};
use tokio_util::io::StreamReader;

use crate::error::AppError;

/// Longest NDJSON line accepted from the model backend.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Content fragments of one streamed chat completion, in arrival order.
pub type FragmentStream = BoxStream<'static, Result<String, AppError>>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> ChatMessage {
        ChatMessage {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> ChatMessage {
        ChatMessage {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Serialize, Debug)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

#[derive(Deserialize, Debug)]
struct ChatChunk {
    #[serde(default)]
    message: Option<ChunkMessage>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ChunkMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Client for a local streaming chat-completion endpoint.
#[derive(Debug, Clone)]
pub struct ModelClient {
    client: reqwest::Client,
    url: String,
    model: String,
}

impl ModelClient {
    pub fn new(client: reqwest::Client, url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            model: model.into(),
        }
    }

    /// Sends the chat request and returns its body as a fragment stream once
    /// the backend has answered with a success status.
    pub async fn open_chat(&self, messages: &[ChatMessage]) -> Result<FragmentStream, AppError> {
        let request = ChatRequest {
            model: &self.model,
            messages,
            stream: true,
        };
        let res = self.client.post(&self.url).json(&request).send().await?;

        let status = res.status();
        if !status.is_success() {
            return Err(AppError::UpstreamTransport(format!(
                "model backend returned {status}"
            )));
        }

        let body = res.bytes_stream().map_err(std::io::Error::other);
        Ok(fragment_stream(body))
    }
}

/// Splits a raw NDJSON body into content fragments.
///
/// Lines are reassembled across chunk boundaries and decoded lossily, so
/// invalid UTF-8 only spoils its own line. A line that fails to decode is
/// logged and dropped; a transport error is yielded and ends the useful part
/// of the stream.
pub fn fragment_stream<S>(body: S) -> FragmentStream
where
    S: Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static,
{
    let codec = AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), Vec::new(), MAX_LINE_BYTES);
    FramedRead::new(StreamReader::new(body), codec)
        .filter_map(|line| async move {
            match line {
                Ok(line) => match decode_line(&String::from_utf8_lossy(&line)) {
                    Ok(fragment) => fragment.map(Ok),
                    Err(e) => {
                        log::warn!("skipping stream line: {:#}", e);
                        None
                    }
                },
                Err(e) => Some(Err(AppError::UpstreamTransport(e.to_string()))),
            }
        })
        .boxed()
}

/// Decodes one `{"message":{"content":..}}` line. Blank lines and chunks
/// without content yield `None`.
pub fn decode_line(line: &str) -> Result<Option<String>, AppError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let chunk: ChatChunk = serde_json::from_str(line)?;
    if let Some(err) = chunk.error {
        return Err(AppError::UpstreamFormat(format!(
            "model backend reported: {err}"
        )));
    }
    Ok(chunk
        .message
        .and_then(|m| m.content)
        .filter(|c| !c.is_empty()))
}
