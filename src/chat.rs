use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::StatusCode;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::AppError;

pub const MAX_SUGGESTIONS: usize = 5;
pub const STREAM_CHUNK_CHARS: usize = 120;

/// Upper bound on the number of chunks one streamed reply is split into.
pub const MAX_STREAM_CHUNKS: usize = 32;

pub const DEFAULT_SUGGESTIONS: [&str; MAX_SUGGESTIONS] = [
    "Can you summarize this document?",
    "What are the key points in this document?",
    "Extract the main ideas from this document",
    "What insights can you find in this content?",
    "How would you explain this document in simple terms?",
];

const CHART_FENCE: &str = "```chart";
const PREVIEW_PROMPT_CHARS: usize = 2_000;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("chat is not configured on this server")]
    Disabled,
    #[error("language model request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("language model returned an unexpected response: {0}")]
    InvalidResponse(String),
}

impl From<ChatError> for AppError {
    fn from(value: ChatError) -> Self {
        match value {
            ChatError::Disabled => AppError::service_unavailable(value.to_string()),
            other => AppError::new(StatusCode::BAD_GATEWAY, other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentRef {
    pub id: Uuid,
    pub file_name: String,
    pub file_type: String,
    pub preview: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub message: String,
    pub history: Vec<ChatTurn>,
    pub documents: Vec<DocumentRef>,
    pub plan: String,
    pub use_agent: bool,
}

#[derive(Debug, Clone)]
pub struct ChatReply {
    pub content: String,
    pub chart_data: Option<Value>,
    pub model: String,
    pub tokens_used: i64,
}

#[async_trait]
pub trait ChatEngine: Send + Sync + 'static {
    async fn reply(&self, request: ChatRequest) -> Result<ChatReply, ChatError>;
}

/// Picks the OpenAI-backed engine when an API key is configured.
pub fn engine_from_config(config: &AppConfig) -> Arc<dyn ChatEngine> {
    match config.openai_api_key.as_deref() {
        Some(key) => Arc::new(OpenAiChatEngine::new(
            key,
            &config.openai_base_url,
            &config.default_model,
            &config.free_model,
        )),
        None => {
            warn!("OPENAI_API_KEY not set; chat endpoints will answer 503");
            Arc::new(DisabledChatEngine)
        }
    }
}

pub struct DisabledChatEngine;

#[async_trait]
impl ChatEngine for DisabledChatEngine {
    async fn reply(&self, _request: ChatRequest) -> Result<ChatReply, ChatError> {
        Err(ChatError::Disabled)
    }
}

pub struct OpenAiChatEngine {
    client: Client,
    api_key: String,
    base_url: String,
    default_model: String,
    free_model: String,
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<CompletionMessage>,
    temperature: f32,
}

#[derive(Debug, Serialize, Deserialize)]
struct CompletionMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
    usage: Option<CompletionUsage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionUsage {
    total_tokens: i64,
}

impl OpenAiChatEngine {
    pub fn new(api_key: &str, base_url: &str, default_model: &str, free_model: &str) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            api_key: api_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            default_model: default_model.to_string(),
            free_model: free_model.to_string(),
        }
    }

    pub fn model_for(&self, plan: &str) -> &str {
        if plan == "free" {
            &self.free_model
        } else {
            &self.default_model
        }
    }
}

#[async_trait]
impl ChatEngine for OpenAiChatEngine {
    async fn reply(&self, request: ChatRequest) -> Result<ChatReply, ChatError> {
        let model = self.model_for(&request.plan).to_string();

        let mut messages = vec![CompletionMessage {
            role: "system".to_string(),
            content: system_prompt(&request.documents, request.use_agent),
        }];
        messages.extend(request.history.iter().map(|turn| CompletionMessage {
            role: turn.role.clone(),
            content: turn.content.clone(),
        }));
        messages.push(CompletionMessage {
            role: "user".to_string(),
            content: request.message.clone(),
        });

        debug!(%model, turns = messages.len(), "sending chat completion");
        let response: CompletionResponse = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&CompletionRequest {
                model: &model,
                messages,
                temperature: 0.2,
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let raw = response
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| ChatError::InvalidResponse("no choices returned".to_string()))?;

        let (content, chart_data) = if request.use_agent {
            extract_chart_block(&raw)
        } else {
            (raw, None)
        };

        Ok(ChatReply {
            content,
            chart_data,
            model,
            tokens_used: response.usage.map(|u| u.total_tokens).unwrap_or(0),
        })
    }
}

pub fn system_prompt(documents: &[DocumentRef], use_agent: bool) -> String {
    let mut prompt = String::from(
        "You are a helpful assistant that answers questions about the user's documents. \
         Answer from the provided material and say so when it does not contain the answer.",
    );

    if documents.is_empty() {
        prompt.push_str("\n\nNo documents are attached to this conversation.");
    } else {
        prompt.push_str("\n\nAttached documents:");
        for doc in documents {
            prompt.push_str(&format!("\n- {} ({})", doc.file_name, doc.file_type));
            if let Some(preview) = doc.preview.as_deref().filter(|p| !p.is_empty()) {
                let excerpt: String = preview.chars().take(PREVIEW_PROMPT_CHARS).collect();
                prompt.push_str(&format!("\n  Excerpt:\n{excerpt}"));
            }
        }
    }

    if use_agent {
        prompt.push_str(
            "\n\nWhen a chart would help, append exactly one fenced block starting with \
             ```chart containing JSON with keys \"type\", \"title\", \"labels\" and \"datasets\".",
        );
    }

    prompt
}

/// Splits a ```chart fenced JSON block out of a reply.
///
/// Returns the reply unchanged when no well-formed block is present.
pub fn extract_chart_block(text: &str) -> (String, Option<Value>) {
    let Some(start) = text.find(CHART_FENCE) else {
        return (text.to_string(), None);
    };
    let body_start = start + CHART_FENCE.len();
    let Some(body_len) = text[body_start..].find("```") else {
        return (text.to_string(), None);
    };
    let body = &text[body_start..body_start + body_len];

    match serde_json::from_str::<Value>(body.trim()) {
        Ok(chart) => {
            let end = body_start + body_len + 3;
            let stripped = format!("{}{}", &text[..start], &text[end..]);
            (stripped.trim().to_string(), Some(chart))
        }
        Err(err) => {
            warn!(error = %err, "ignoring malformed chart block");
            (text.to_string(), None)
        }
    }
}

/// Splits `text` on whitespace boundaries into pieces of about `max_chars`.
///
/// Concatenating the pieces yields the input. Always returns at least one piece.
pub fn split_into_chunks(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();

    for piece in text.split_inclusive(char::is_whitespace) {
        if !current.is_empty() && current.chars().count() + piece.chars().count() > max_chars {
            chunks.push(std::mem::take(&mut current));
        }
        current.push_str(piece);
    }

    if !current.is_empty() || chunks.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Splits a reply for streaming, widening chunks past [`STREAM_CHUNK_CHARS`]
/// so the reply never needs more than [`MAX_STREAM_CHUNKS`] events.
pub fn stream_chunks(text: &str) -> Vec<String> {
    // Greedy packing makes any two neighbouring chunks longer than the chunk
    // size, so budgeting for half the chunks bounds the total.
    let per_chunk = text.chars().count().div_ceil(MAX_STREAM_CHUNKS / 2);
    split_into_chunks(text, STREAM_CHUNK_CHARS.max(per_chunk))
}

pub fn suggestions_for(documents: &[DocumentRef]) -> Vec<String> {
    if documents.is_empty() {
        return DEFAULT_SUGGESTIONS.iter().map(|s| s.to_string()).collect();
    }

    let mut suggestions = Vec::new();
    if let [first, second, ..] = documents {
        suggestions.push(format!(
            "Compare {} and {}",
            first.file_name, second.file_name
        ));
    }
    for doc in documents {
        suggestions.push(format!("Can you summarize {}?", doc.file_name));
        if matches!(doc.file_type.as_str(), "csv" | "xlsx" | "xls") {
            suggestions.push(format!("Create a chart from the data in {}", doc.file_name));
        }
        suggestions.push(format!("What are the key points in {}?", doc.file_name));
    }
    suggestions.extend(DEFAULT_SUGGESTIONS.iter().skip(2).map(|s| s.to_string()));

    let mut seen = std::collections::HashSet::new();
    suggestions.retain(|s| seen.insert(s.clone()));
    suggestions.truncate(MAX_SUGGESTIONS);
    suggestions
}
