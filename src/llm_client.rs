use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::ServerConfig;
use crate::database::User;
use crate::tools::ToolDef;

pub const OPENAI_COMPATIBLE_BINDING: &str = "openai_compatible";

/// A message in the conversation (OpenAI chat format)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<LlmToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageUrl {
    pub url: String,
}

impl ChatMessage {
    pub fn text(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: Some(MessageContent::Text(content.into())),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::text("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::text("assistant", content)
    }

    /// Text plus base64 images sent as `data:` URLs.
    pub fn with_images(role: &str, text: impl Into<String>, images: &[String]) -> Self {
        if images.is_empty() {
            return Self::text(role, text);
        }
        let mut parts = vec![ContentPart::Text { text: text.into() }];
        parts.extend(images.iter().map(|image| ContentPart::ImageUrl {
            image_url: ImageUrl {
                url: format!("data:{};base64,{}", sniff_mime(image), image),
            },
        }));
        Self {
            role: role.to_string(),
            content: Some(MessageContent::Parts(parts)),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn tool_result(tool_call_id: &str, content: impl Into<String>) -> Self {
        Self {
            role: "tool".to_string(),
            content: Some(MessageContent::Text(content.into())),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.to_string()),
        }
    }

    /// Concatenated text parts, ignoring images.
    pub fn text_content(&self) -> String {
        match &self.content {
            Some(MessageContent::Text(text)) => text.clone(),
            Some(MessageContent::Parts(parts)) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
            None => String::new(),
        }
    }
}

fn sniff_mime(base64_image: &str) -> &'static str {
    // Base64 of the PNG signature starts with "iVBOR"; JPEG with "/9j/".
    if base64_image.starts_with("iVBOR") {
        "image/png"
    } else if base64_image.starts_with("R0lGOD") {
        "image/gif"
    } else if base64_image.starts_with("UklGR") {
        "image/webp"
    } else {
        "image/jpeg"
    }
}

/// Tool call as returned by the LLM (OpenAI format)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: LlmFunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmFunctionCall {
    pub name: String,
    pub arguments: String, // JSON string
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationOptions {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub repeat_penalty: Option<f32>,
    pub max_tokens: Option<u32>,
    pub ctx_size: Option<u32>,
}

impl GenerationOptions {
    pub fn from_user(user: &User) -> Self {
        let prefs = &user.preferences;
        Self {
            temperature: prefs.temperature,
            top_p: prefs.top_p,
            top_k: prefs.top_k,
            repeat_penalty: prefs.repeat_penalty,
            max_tokens: None,
            ctx_size: prefs.ctx_size,
        }
    }

    pub fn deterministic(max_tokens: u32) -> Self {
        Self {
            temperature: Some(0.0),
            max_tokens: Some(max_tokens),
            ..Self::default()
        }
    }
}

/// Final state of one model call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub content: String,
    pub tool_calls: Vec<LlmToolCall>,
    /// Number of streamed content deltas; one per token for most providers.
    pub tokens: usize,
    /// The text callback asked to stop before the provider finished.
    pub stopped: bool,
}

/// Seam between the turn pipeline and a concrete model provider.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn binding_name(&self) -> &str;

    fn model_name(&self) -> &str;

    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDef],
        options: &GenerationOptions,
    ) -> Result<Completion>;

    /// Streams text deltas into `on_text`; returning `false` stops the stream.
    async fn stream(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDef],
        options: &GenerationOptions,
        on_text: &mut (dyn for<'a> FnMut(&'a str) -> bool + Send),
    ) -> Result<Completion>;
}

/// Builds (or reuses) the model a user's turns run against.
pub trait ModelProvider: Send + Sync {
    fn model_for(&self, user: &User) -> Result<Arc<dyn LanguageModel>>;
}

pub async fn generate_text(
    model: &dyn LanguageModel,
    system: &str,
    user: &str,
    options: &GenerationOptions,
) -> Result<String> {
    let messages = vec![ChatMessage::system(system), ChatMessage::user(user)];
    let completion = model.complete(&messages, &[], options).await?;
    Ok(completion.content)
}

/// Generate a JSON response using the LLM
pub async fn generate_json<T>(
    model: &dyn LanguageModel,
    system: &str,
    user: &str,
    options: &GenerationOptions,
) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    let response = generate_text(model, system, user, options).await?;
    parse_json(&response)
}

/// Parses model output as JSON, tolerating `<think>` preambles, code fences and
/// surrounding prose.
pub fn parse_json<T>(response: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    if let Ok(parsed) = serde_json::from_str::<T>(response) {
        return Ok(parsed);
    }

    let cleaned = match response.rfind("</think>") {
        Some(think_end) => &response[think_end + "</think>".len()..],
        None => response,
    };

    if let Ok(parsed) = serde_json::from_str::<T>(cleaned.trim()) {
        return Ok(parsed);
    }

    let json_content = if let Some(start) = cleaned.find("```json") {
        let after_start = &cleaned[start + 7..];
        match after_start.find("```") {
            Some(end) => after_start[..end].trim(),
            None => cleaned,
        }
    } else if let (Some(start), Some(end)) = (cleaned.find('{'), cleaned.rfind('}')) {
        if start < end {
            &cleaned[start..=end]
        } else {
            cleaned
        }
    } else {
        cleaned
    };

    serde_json::from_str::<T>(json_content.trim()).with_context(|| {
        format!(
            "Failed to parse JSON. Extracted: {} | Original: {}",
            json_content,
            response.chars().take(500).collect::<String>()
        )
    })
}

/// Splits `<think>`/`<thinking>` blocks out of a reply.
pub fn split_visible_and_thinking(input: &str) -> (String, Vec<String>) {
    fn extract_tag(text: String, open_tag: &str, close_tag: &str) -> (String, Vec<String>) {
        let mut rest = text;
        let mut thoughts = Vec::new();

        while let Some(start) = rest.find(open_tag) {
            let content_start = start + open_tag.len();
            let (thought_end, remove_end) = match rest[content_start..].find(close_tag) {
                Some(rel_end) => {
                    let end = content_start + rel_end;
                    (end, end + close_tag.len())
                }
                None => (rest.len(), rest.len()),
            };
            let thought = rest[content_start..thought_end].trim();
            if !thought.is_empty() {
                thoughts.push(thought.to_string());
            }
            rest.replace_range(start..remove_end, "");
        }

        (rest, thoughts)
    }

    let (without_thinking_tag, mut thoughts) =
        extract_tag(input.to_string(), "<thinking>", "</thinking>");
    let (visible, mut more) = extract_tag(without_thinking_tag, "<think>", "</think>");
    thoughts.append(&mut more);

    (visible.trim().to_string(), thoughts)
}

/// OpenAI-compatible `/chat/completions` client (Ollama, LM Studio, vLLM, OpenAI, ...).
#[derive(Clone)]
pub struct LlmClient {
    api_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl LlmClient {
    pub fn new(api_url: String, api_key: String, model: String, client: reqwest::Client) -> Self {
        Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            client,
        }
    }

    fn request_body(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDef],
        options: &GenerationOptions,
        stream: bool,
    ) -> Result<serde_json::Value> {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "stream": stream,
        });
        if let Some(temperature) = options.temperature {
            body["temperature"] = temperature.into();
        }
        if let Some(top_p) = options.top_p {
            body["top_p"] = top_p.into();
        }
        if let Some(top_k) = options.top_k {
            body["top_k"] = top_k.into();
        }
        if let Some(repeat_penalty) = options.repeat_penalty {
            body["repeat_penalty"] = repeat_penalty.into();
        }
        if let Some(max_tokens) = options.max_tokens {
            body["max_tokens"] = max_tokens.into();
        }
        if let Some(ctx_size) = options.ctx_size {
            body["num_ctx"] = ctx_size.into();
        }
        if !tools.is_empty() {
            body["tools"] = serde_json::to_value(tools)?;
        }
        Ok(body)
    }

    async fn send(&self, body: &serde_json::Value) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.api_url);
        let mut req = self.client.post(&url).json(body);

        // Add API key header if provided (not needed for local models)
        if !self.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let response = req.send().await.context("Failed to send LLM request")?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("LLM API returned error {}: {}", status, body);
        }
        Ok(response)
    }
}

#[derive(Debug, Clone, Default)]
struct ToolCallAccumulator {
    id: String,
    call_type: String,
    name: String,
    arguments: String,
}

fn finish_tool_calls(tool_calls: Vec<ToolCallAccumulator>) -> Vec<LlmToolCall> {
    tool_calls
        .into_iter()
        .enumerate()
        .filter_map(|(idx, tc)| {
            let name = tc.name.trim().to_string();
            if name.is_empty() {
                return None;
            }
            Some(LlmToolCall {
                id: if tc.id.trim().is_empty() {
                    format!("stream_tool_call_{}", idx)
                } else {
                    tc.id
                },
                call_type: if tc.call_type.trim().is_empty() {
                    "function".to_string()
                } else {
                    tc.call_type
                },
                function: LlmFunctionCall {
                    name,
                    arguments: if tc.arguments.trim().is_empty() {
                        "{}".to_string()
                    } else {
                        tc.arguments
                    },
                },
            })
        })
        .collect()
}

fn accumulate_tool_deltas(tool_calls: &mut Vec<ToolCallAccumulator>, deltas: &[serde_json::Value]) {
    for tc_delta in deltas {
        let idx = tc_delta
            .get("index")
            .and_then(|v| v.as_u64())
            .unwrap_or(tool_calls.len() as u64) as usize;

        while tool_calls.len() <= idx {
            tool_calls.push(ToolCallAccumulator::default());
        }
        let acc = &mut tool_calls[idx];

        if let Some(id) = tc_delta.get("id").and_then(|v| v.as_str()) {
            acc.id = id.to_string();
        }
        if let Some(call_type) = tc_delta.get("type").and_then(|v| v.as_str()) {
            acc.call_type = call_type.to_string();
        }
        let function = tc_delta.get("function");
        if let Some(name_part) = function.and_then(|f| f.get("name")).and_then(|v| v.as_str()) {
            acc.name.push_str(name_part);
        }
        if let Some(args_part) = function
            .and_then(|f| f.get("arguments"))
            .and_then(|v| v.as_str())
        {
            acc.arguments.push_str(args_part);
        }
    }
}

#[async_trait]
impl LanguageModel for LlmClient {
    fn binding_name(&self) -> &str {
        OPENAI_COMPATIBLE_BINDING
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDef],
        options: &GenerationOptions,
    ) -> Result<Completion> {
        let body = self.request_body(messages, tools, options, false)?;
        let response = self.send(&body).await?;
        let response_json: serde_json::Value = response
            .json()
            .await
            .context("Failed to parse LLM response")?;

        let message = response_json["choices"]
            .as_array()
            .and_then(|arr| arr.first())
            .map(|choice| &choice["message"])
            .context("Empty choices in LLM response")?;

        let tool_calls: Vec<LlmToolCall> = message
            .get("tool_calls")
            .and_then(|tc| serde_json::from_value(tc.clone()).ok())
            .unwrap_or_default();
        let tokens = response_json["usage"]["completion_tokens"]
            .as_u64()
            .unwrap_or(0) as usize;

        Ok(Completion {
            content: message["content"].as_str().unwrap_or_default().to_string(),
            tool_calls,
            tokens,
            stopped: false,
        })
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDef],
        options: &GenerationOptions,
        on_text: &mut (dyn for<'a> FnMut(&'a str) -> bool + Send),
    ) -> Result<Completion> {
        let body = self.request_body(messages, tools, options, true)?;
        let mut response = self.send(&body).await?;

        let mut content = String::new();
        let mut tool_calls: Vec<ToolCallAccumulator> = Vec::new();
        let mut line_buffer = String::new();
        let mut tokens = 0usize;
        let mut finished = false;
        let mut stopped = false;

        while let Some(chunk) = response
            .chunk()
            .await
            .context("Failed reading streaming chunk")?
        {
            line_buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(newline_idx) = line_buffer.find('\n') {
                let line = line_buffer[..newline_idx].trim().to_string();
                line_buffer.drain(..=newline_idx);

                let Some(payload) = line.strip_prefix("data:").map(str::trim) else {
                    continue;
                };
                if payload == "[DONE]" {
                    finished = true;
                    break;
                }

                let chunk_json: serde_json::Value = serde_json::from_str(payload)
                    .with_context(|| format!("Failed to parse stream payload: {}", payload))?;
                let Some(choice) = chunk_json["choices"].as_array().and_then(|arr| arr.first())
                else {
                    continue;
                };

                if let Some(delta) = choice["delta"]["content"].as_str() {
                    if !delta.is_empty() {
                        content.push_str(delta);
                        tokens += 1;
                        if !on_text(delta) {
                            stopped = true;
                            finished = true;
                            break;
                        }
                    }
                }

                if let Some(deltas) = choice["delta"]["tool_calls"].as_array() {
                    accumulate_tool_deltas(&mut tool_calls, deltas);
                }
            }

            if finished {
                break;
            }
        }

        Ok(Completion {
            content,
            tool_calls: finish_tool_calls(tool_calls),
            tokens,
            stopped,
        })
    }
}

/// Builds an [`LlmClient`] per user from the server endpoint and the user's model choice.
pub struct OpenAiCompatibleProvider {
    api_url: String,
    api_key: String,
    default_model: String,
    client: reqwest::Client,
}

impl OpenAiCompatibleProvider {
    pub fn new(config: &ServerConfig, client: reqwest::Client) -> Self {
        Self {
            api_url: config.llm_api_url.clone(),
            api_key: config.llm_api_key.clone().unwrap_or_default(),
            default_model: config.llm_model.clone(),
            client,
        }
    }
}

impl ModelProvider for OpenAiCompatibleProvider {
    fn model_for(&self, user: &User) -> Result<Arc<dyn LanguageModel>> {
        let model = user
            .preferences
            .model_name()
            .unwrap_or(&self.default_model)
            .to_string();
        Ok(Arc::new(LlmClient::new(
            self.api_url.clone(),
            self.api_key.clone(),
            model,
            self.client.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Decision {
        search: bool,
        query: String,
    }

    #[test]
    fn parse_json_handles_fences_and_think_blocks() {
        let fenced = "Sure!\n```json\n{\"search\": true, \"query\": \"rust\"}\n```";
        assert_eq!(
            parse_json::<Decision>(fenced).unwrap(),
            Decision {
                search: true,
                query: "rust".into()
            }
        );
        let thinking = "<think>{\"nope\": 1}</think> {\"search\": false, \"query\": \"\"}";
        assert!(!parse_json::<Decision>(thinking).unwrap().search);
        let prose = "I think {\"search\": true, \"query\": \"x\"} is right";
        assert!(parse_json::<Decision>(prose).unwrap().search);
        assert!(parse_json::<Decision>("no json here").is_err());
    }

    #[test]
    fn thinking_blocks_are_split_out() {
        let (visible, thoughts) =
            split_visible_and_thinking("<think>plan</think>Answer<thinking>more</thinking>!");
        assert_eq!(visible, "Answer!");
        assert_eq!(thoughts, vec!["more".to_string(), "plan".to_string()]);

        let (visible, thoughts) = split_visible_and_thinking("Hi <think>unterminated");
        assert_eq!(visible, "Hi");
        assert_eq!(thoughts, vec!["unterminated".to_string()]);
    }

    #[test]
    fn image_messages_serialize_as_parts() {
        let message = ChatMessage::with_images("user", "what is this?", &["iVBORw0KGgo".into()]);
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["content"][0]["type"], "text");
        assert_eq!(value["content"][1]["type"], "image_url");
        assert_eq!(
            value["content"][1]["image_url"]["url"],
            "data:image/png;base64,iVBORw0KGgo"
        );
        assert_eq!(message.text_content(), "what is this?");
    }

    #[test]
    fn request_body_only_sets_provided_options() {
        let client = LlmClient::new(
            "http://localhost:11434/v1/".into(),
            String::new(),
            "llama3.2".into(),
            reqwest::Client::new(),
        );
        let body = client
            .request_body(
                &[ChatMessage::user("hi")],
                &[],
                &GenerationOptions::deterministic(100),
                false,
            )
            .unwrap();
        assert_eq!(body["temperature"], 0.0);
        assert_eq!(body["max_tokens"], 100);
        assert!(body.get("top_p").is_none());
        assert!(body.get("tools").is_none());
        assert_eq!(client.api_url, "http://localhost:11434/v1");
    }

    #[test]
    fn streamed_tool_call_deltas_merge_by_index() {
        let mut calls = Vec::new();
        accumulate_tool_deltas(
            &mut calls,
            &[serde_json::json!({"index": 0, "id": "c1", "function": {"name": "search_", "arguments": "{\"q\""}})],
        );
        accumulate_tool_deltas(
            &mut calls,
            &[serde_json::json!({"index": 0, "function": {"name": "notes", "arguments": ":\"x\"}"}})],
        );
        let calls = finish_tool_calls(calls);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function.name, "search_notes");
        assert_eq!(calls[0].function.arguments, "{\"q\":\"x\"}");
        assert_eq!(calls[0].call_type, "function");
    }
}
