//! Generative-AI client: one streamed generation call per request.
//!
//! The remote endpoint streams its answer as server-sent events. Fragments are
//! concatenated in delivery order and only the complete text is handed back;
//! callers never observe partial output.

use std::collections::VecDeque;
use std::fmt::Display;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::Bytes;
use futures_util::{Stream, StreamExt, stream};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::GenerativeConfig;
use crate::error::{FlowError, Result};
use crate::prompt::GenerationRequest;

/// Anything that can turn a [`GenerationRequest`] into the model's raw text.
#[async_trait]
pub trait GenerativeClient: Send + Sync {
    async fn generate(&self, request: &GenerationRequest, model: &str) -> Result<String>;
}

/// Concatenate text fragments in delivery order.
///
/// `None` and empty fragments contribute nothing. The first error aborts the
/// accumulation and is returned as-is.
pub async fn accumulate_fragments<S>(mut fragments: S) -> Result<String>
where
    S: Stream<Item = Result<Option<String>>> + Unpin,
{
    let mut buffer = String::new();
    let mut count = 0usize;
    while let Some(fragment) = fragments.next().await {
        if let Some(text) = fragment? {
            if !text.is_empty() {
                buffer.push_str(&text);
                count += 1;
            }
        }
    }
    debug!(fragments = count, chars = buffer.len(), "Stream accumulated");
    Ok(buffer)
}

/// Client for Gemini's `streamGenerateContent` endpoint.
pub struct GeminiClient {
    http: reqwest::Client,
    config: GenerativeConfig,
}

impl GeminiClient {
    pub fn new(config: GenerativeConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    fn endpoint(&self, model: &str) -> String {
        format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
            self.config.base_url.trim_end_matches('/'),
            model
        )
    }
}

#[async_trait]
impl GenerativeClient for GeminiClient {
    async fn generate(&self, request: &GenerationRequest, model: &str) -> Result<String> {
        // Checked on every call so a missing key never reaches the network.
        let api_key = self.config.api_key.as_deref().ok_or_else(|| {
            FlowError::Configuration("GEMINI_API_KEY environment variable is not set".to_string())
        })?;

        let body = GenerateContentRequest::new(request, self.config.json_output);
        info!(
            task = %request.kind(),
            model = %model,
            prompt_chars = request.prompt().len(),
            attachment_bytes = request.attachment().map(|a| a.len()).unwrap_or(0),
            "Calling generative model"
        );

        let response = self
            .http
            .post(self.endpoint(model))
            .header("x-goog-api-key", api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| FlowError::Upstream(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, body = %body, "Generative API returned an error status");
            return Err(FlowError::Upstream(format!("API returned {status}")));
        }

        let fragments = std::pin::pin!(text_fragments(Box::pin(response.bytes_stream())));
        let text = accumulate_fragments(fragments).await?;

        info!(task = %request.kind(), chars = text.len(), "Generation completed");
        Ok(text)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest<'a> {
    contents: Vec<RequestContent<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Serialize)]
struct RequestContent<'a> {
    role: &'static str,
    parts: Vec<RequestPart<'a>>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum RequestPart<'a> {
    Text {
        text: &'a str,
    },
    #[serde(rename_all = "camelCase")]
    InlineData {
        inline_data: InlineData<'a>,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineData<'a> {
    mime_type: &'a str,
    data: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_mime_type: &'static str,
}

impl<'a> GenerateContentRequest<'a> {
    fn new(request: &'a GenerationRequest, json_output: bool) -> Self {
        let mut parts = vec![RequestPart::Text {
            text: request.prompt(),
        }];
        if let Some(attachment) = request.attachment() {
            // base64 is only the JSON transport framing; the bytes themselves are untouched.
            parts.push(RequestPart::InlineData {
                inline_data: InlineData {
                    mime_type: &attachment.mime_type,
                    data: STANDARD.encode(&attachment.data),
                },
            });
        }

        Self {
            contents: vec![RequestContent {
                role: "user",
                parts,
            }],
            generation_config: json_output.then_some(GenerationConfig {
                response_mime_type: "application/json",
            }),
        }
    }
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    candidates: Vec<Candidate>,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    code: Option<i64>,
    #[serde(default)]
    message: String,
}

impl StreamChunk {
    fn text(self) -> Option<String> {
        let parts = self.candidates.into_iter().next()?.content?.parts;
        let text: String = parts.into_iter().filter_map(|p| p.text).collect();
        (!text.is_empty()).then_some(text)
    }
}

fn parse_event(event: &str) -> Result<Option<String>> {
    let mut chunk: StreamChunk = serde_json::from_str(event)
        .map_err(|e| FlowError::Upstream(format!("malformed stream event: {e}")))?;
    if let Some(error) = chunk.error.take() {
        return Err(FlowError::Upstream(format!(
            "stream reported error {}: {}",
            error.code.unwrap_or_default(),
            error.message
        )));
    }
    Ok(chunk.text())
}

/// Incremental decoder for `text/event-stream` bodies.
///
/// Network chunks may split lines (and UTF-8 sequences) anywhere, so bytes are
/// buffered until a full line is available. Only `data:` fields are kept.
#[derive(Default)]
pub(crate) struct SseDecoder {
    pending: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    /// Feed bytes, returning the payload of every event completed by them.
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            self.handle_line(line.trim_end_matches(['\n', '\r']), &mut events);
        }
        events
    }

    /// Flush whatever is left once the body has ended.
    pub(crate) fn finish(&mut self) -> Option<String> {
        let mut events = Vec::new();
        if !self.pending.is_empty() {
            let raw = std::mem::take(&mut self.pending);
            let line = String::from_utf8_lossy(&raw).into_owned();
            self.handle_line(line.trim_end_matches('\r'), &mut events);
        }
        self.handle_line("", &mut events);
        events.pop()
    }

    fn handle_line(&mut self, line: &str, events: &mut Vec<String>) {
        if line.is_empty() {
            if !self.data.is_empty() {
                events.push(self.data.join("\n"));
                self.data.clear();
            }
            return;
        }
        if let Some(value) = line.strip_prefix("data:") {
            self.data
                .push(value.strip_prefix(' ').unwrap_or(value).to_string());
        }
    }
}

struct FragmentState<S> {
    bytes: S,
    decoder: SseDecoder,
    ready: VecDeque<String>,
    done: bool,
}

/// Turn an SSE byte stream into a stream of text fragments.
fn text_fragments<S, E>(bytes: S) -> impl Stream<Item = Result<Option<String>>>
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
    E: Display,
{
    let state = FragmentState {
        bytes,
        decoder: SseDecoder::default(),
        ready: VecDeque::new(),
        done: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.ready.pop_front() {
                let fragment = parse_event(&event);
                if fragment.is_err() {
                    state.done = true;
                    state.ready.clear();
                }
                return Some((fragment, state));
            }
            if state.done {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    let events = state.decoder.push(&chunk);
                    state.ready.extend(events);
                }
                Some(Err(e)) => {
                    state.done = true;
                    return Some((
                        Err(FlowError::Upstream(format!(
                            "stream terminated abnormally: {e}"
                        ))),
                        state,
                    ));
                }
                None => {
                    state.done = true;
                    let tail = state.decoder.finish();
                    state.ready.extend(tail);
                }
            }
        }
    })
}
