//! NDJSON frames and the streaming driver that produces them.
//!
//! The driver runs on the turn worker thread. Frames go out through a flume channel
//! whose receiver backs the HTTP response body, so their order on the wire is the order
//! in which they were emitted.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::discussion::Message;
use crate::llm_client::{
    split_visible_and_thinking, ChatMessage, GenerationOptions, LanguageModel, LlmToolCall,
};
use crate::rag::RetrievedDocument;
use crate::tools::safety::{validate_input, SafetyVerdict};
use crate::tools::{ToolCall, ToolContext, ToolOutput, ToolSet};

/// Observations echoed to the client are cut to this many characters.
const OBSERVATION_PREVIEW_CHARS: usize = 2_000;

/// A citation shown next to the answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub title: String,
    pub source: String,
    pub content: String,
    pub score: f64,
}

impl Source {
    pub fn from_document(doc: &RetrievedDocument, fallback_source: &str) -> Self {
        let source = ["source", "path", "url"]
            .iter()
            .find_map(|key| doc.metadata.get(*key).and_then(Value::as_str))
            .unwrap_or(fallback_source)
            .to_string();
        Self {
            title: doc.title.clone(),
            source,
            content: doc.content.clone(),
            score: doc.score,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FinalizeData {
    pub user_message: Message,
    pub ai_message: Message,
}

/// One line of the turn's NDJSON response.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Chunk { content: String },
    StepStart { content: String, id: String },
    StepEnd { content: String, id: String, status: StepStatus },
    Info { content: String },
    Observation { content: String },
    Thought { content: String },
    Reasoning { content: String },
    ToolCall { content: Value },
    Scratchpad { content: String },
    Exception { content: String },
    Error { content: String },
    Sources { content: Vec<Source> },
    Ttft { content: f64 },
    NewTitleStart { content: String },
    NewTitleEnd { content: String },
    Finalize {
        data: Box<FinalizeData>,
        #[serde(skip_serializing_if = "Option::is_none")]
        new_title: Option<String>,
    },
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Chunk { .. } => "chunk",
            Frame::StepStart { .. } => "step_start",
            Frame::StepEnd { .. } => "step_end",
            Frame::Info { .. } => "info",
            Frame::Observation { .. } => "observation",
            Frame::Thought { .. } => "thought",
            Frame::Reasoning { .. } => "reasoning",
            Frame::ToolCall { .. } => "tool_call",
            Frame::Scratchpad { .. } => "scratchpad",
            Frame::Exception { .. } => "exception",
            Frame::Error { .. } => "error",
            Frame::Sources { .. } => "sources",
            Frame::Ttft { .. } => "ttft",
            Frame::NewTitleStart { .. } => "new_title_start",
            Frame::NewTitleEnd { .. } => "new_title_end",
            Frame::Finalize { .. } => "finalize",
        }
    }

    /// Serialized frame terminated by `\n`.
    pub fn to_ndjson_line(&self) -> String {
        match serde_json::to_string(self) {
            Ok(mut line) => {
                line.push('\n');
                line
            }
            Err(e) => {
                tracing::error!("Failed to serialize {} frame: {}", self.kind(), e);
                format!(
                    "{}\n",
                    json!({"type": "error", "content": format!("Failed to serialize {} frame", self.kind())})
                )
            }
        }
    }

    /// Frames worth keeping in the assistant message's `events` metadata.
    fn is_recorded_event(&self) -> bool {
        matches!(
            self,
            Frame::StepStart { .. }
                | Frame::StepEnd { .. }
                | Frame::Info { .. }
                | Frame::ToolCall { .. }
                | Frame::Observation { .. }
                | Frame::Exception { .. }
        )
    }
}

/// Per-turn stop flag set by `stop_generation`.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `true` when both handles point at the same flag.
    pub fn ptr_eq(&self, other: &CancelFlag) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// `(tokens - 1) / seconds`, or 0 when nothing meaningful can be computed.
pub fn tokens_per_second(tokens: usize, streaming_seconds: f64) -> f64 {
    if tokens < 2 || streaming_seconds <= f64::EPSILON {
        return 0.0;
    }
    (tokens - 1) as f64 / streaming_seconds
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StreamMetrics {
    pub ttft_ms: Option<f64>,
    pub tps: f64,
    pub tokens: usize,
}

/// Sending half of one turn's NDJSON stream, plus its timing bookkeeping.
pub struct TurnStream {
    tx: flume::Sender<Frame>,
    cancel: CancelFlag,
    started: Instant,
    first_chunk: Option<Instant>,
    last_chunk: Option<Instant>,
    ttft_ms: Option<f64>,
    chunks: usize,
    next_step: usize,
    events: Vec<Value>,
    client_gone: bool,
}

impl TurnStream {
    pub fn new(tx: flume::Sender<Frame>, cancel: CancelFlag) -> Self {
        Self {
            tx,
            cancel,
            started: Instant::now(),
            first_chunk: None,
            last_chunk: None,
            ttft_ms: None,
            chunks: 0,
            next_step: 0,
            events: Vec::new(),
            client_gone: false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn emit(&mut self, frame: Frame) {
        if frame.is_recorded_event() {
            if let Ok(value) = serde_json::to_value(&frame) {
                self.events.push(value);
            }
        }
        if self.client_gone {
            return;
        }
        if self.tx.send(frame).is_err() {
            // The turn still runs to completion so its results are persisted.
            tracing::debug!("Turn stream receiver dropped; continuing without client");
            self.client_gone = true;
        }
    }

    /// Streaming callback: forwards a text delta, returning `false` once cancelled.
    pub fn on_chunk(&mut self, text: &str) -> bool {
        if self.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        self.last_chunk = Some(now);
        if self.first_chunk.is_none() {
            let ttft = now.duration_since(self.started).as_secs_f64() * 1000.0;
            self.first_chunk = Some(now);
            self.ttft_ms = Some(ttft);
            self.emit(Frame::Ttft { content: ttft });
        }
        self.chunks += 1;
        self.emit(Frame::Chunk {
            content: text.to_string(),
        });
        true
    }

    pub fn step_start(&mut self, content: impl Into<String>) -> String {
        self.next_step += 1;
        let id = format!("s{}", self.next_step);
        self.emit(Frame::StepStart {
            content: content.into(),
            id: id.clone(),
        });
        id
    }

    pub fn step_end(&mut self, id: &str, content: impl Into<String>, status: StepStatus) {
        self.emit(Frame::StepEnd {
            content: content.into(),
            id: id.to_string(),
            status,
        });
    }

    pub fn info(&mut self, content: impl Into<String>) {
        self.emit(Frame::Info {
            content: content.into(),
        });
    }

    pub fn error(&mut self, content: impl Into<String>) {
        self.emit(Frame::Error {
            content: content.into(),
        });
    }

    pub fn sources(&mut self, sources: Vec<Source>) {
        if !sources.is_empty() {
            self.emit(Frame::Sources { content: sources });
        }
    }

    pub fn take_events(&mut self) -> Vec<Value> {
        std::mem::take(&mut self.events)
    }

    /// Timing between the first and the last chunk. `tokens` is the completion's
    /// count; 0 falls back to the number of chunks seen.
    pub fn metrics(&self, tokens: usize) -> StreamMetrics {
        let seconds = match (self.first_chunk, self.last_chunk) {
            (Some(first), Some(last)) => last.duration_since(first).as_secs_f64(),
            _ => 0.0,
        };
        let tokens = if tokens == 0 { self.chunks } else { tokens };
        StreamMetrics {
            ttft_ms: self.ttft_ms,
            tps: tokens_per_second(tokens, seconds),
            tokens,
        }
    }
}

/// What the model produced for one turn.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DriveOutcome {
    /// Full final reply, reasoning blocks included.
    pub raw_content: String,
    /// Reply with reasoning blocks removed.
    pub visible_content: String,
    pub reasoning: Vec<String>,
    pub sources: Vec<Source>,
    pub tokens: usize,
    pub cancelled: bool,
}

/// Streams a reply, running tool calls for at most `max_steps` rounds.
pub async fn drive(
    model: &dyn LanguageModel,
    mut messages: Vec<ChatMessage>,
    tools: &ToolSet,
    tool_ctx: &ToolContext,
    options: &GenerationOptions,
    max_steps: usize,
    stream: &mut TurnStream,
) -> Result<DriveOutcome> {
    let definitions = tools.definitions(tool_ctx);
    let max_steps = max_steps.max(1);
    let mut outcome = DriveOutcome::default();
    let mut steps = 0usize;

    loop {
        let offer_tools = !definitions.is_empty() && steps < max_steps;
        let offered = if offer_tools { definitions.as_slice() } else { &[] };
        let completion = model
            .stream(&messages, offered, options, &mut |text: &str| stream.on_chunk(text))
            .await?;
        outcome.tokens += completion.tokens;

        if completion.stopped || stream.is_cancelled() {
            outcome.cancelled = true;
            return Ok(outcome);
        }
        if completion.tool_calls.is_empty() || !offer_tools {
            outcome.raw_content = completion.content;
            break;
        }

        steps += 1;
        messages.push(ChatMessage {
            role: "assistant".to_string(),
            content: (!completion.content.is_empty())
                .then(|| crate::llm_client::MessageContent::Text(completion.content.clone())),
            tool_calls: Some(completion.tool_calls.clone()),
            tool_call_id: None,
        });
        for call in &completion.tool_calls {
            let observation = run_tool_call(call, tools, tool_ctx, stream, &mut outcome).await;
            messages.push(ChatMessage::tool_result(&call.id, observation));
        }
    }

    let (visible, reasoning) = split_visible_and_thinking(&outcome.raw_content);
    for block in &reasoning {
        stream.emit(Frame::Reasoning {
            content: block.clone(),
        });
    }
    outcome.visible_content = visible;
    outcome.reasoning = reasoning;
    Ok(outcome)
}

async fn run_tool_call(
    call: &LlmToolCall,
    tools: &ToolSet,
    tool_ctx: &ToolContext,
    stream: &mut TurnStream,
    outcome: &mut DriveOutcome,
) -> String {
    let arguments: Value = if call.function.arguments.trim().is_empty() {
        json!({})
    } else {
        serde_json::from_str(&call.function.arguments).unwrap_or_else(|e| {
            tracing::warn!("Tool {} sent malformed arguments: {}", call.function.name, e);
            json!({})
        })
    };
    stream.emit(Frame::ToolCall {
        content: json!({ "name": call.function.name, "arguments": arguments }),
    });

    let output = match validate_input(&arguments) {
        SafetyVerdict::Block(reason) => ToolOutput::Error(reason),
        _ => {
            tools
                .execute_call(
                    &ToolCall {
                        name: call.function.name.clone(),
                        arguments,
                    },
                    tool_ctx,
                )
                .await
                .output
        }
    };

    if let ToolOutput::Documents(docs) = &output {
        let found: Vec<Source> = docs
            .iter()
            .map(|doc| Source::from_document(doc, &call.function.name))
            .collect();
        outcome.sources.extend(found.iter().cloned());
        stream.sources(found);
    }

    let text = output.to_llm_string();
    let preview: String = text.chars().take(OBSERVATION_PREVIEW_CHARS).collect();
    stream.emit(Frame::Observation { content: preview });
    text
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::llm_client::{Completion, LlmFunctionCall};
    use crate::tools::ToolDef;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// One scripted model response.
    #[derive(Clone, Default)]
    pub(crate) struct Scripted {
        pub chunks: Vec<String>,
        pub tool_calls: Vec<LlmToolCall>,
    }

    impl Scripted {
        pub(crate) fn text(text: &str) -> Self {
            Self {
                chunks: text
                    .split_inclusive(' ')
                    .map(str::to_string)
                    .collect(),
                tool_calls: Vec::new(),
            }
        }
    }

    /// Replays scripted responses and records what it was sent.
    #[derive(Default)]
    pub(crate) struct ScriptedModel {
        pub streams: Mutex<VecDeque<Scripted>>,
        pub completions: Mutex<VecDeque<String>>,
        pub seen: Mutex<Vec<Vec<ChatMessage>>>,
        pub offered_tools: Mutex<Vec<usize>>,
        /// Cancel this flag after the first streamed chunk.
        pub cancel_after_first_chunk: Option<CancelFlag>,
    }

    impl ScriptedModel {
        pub(crate) fn new(streams: Vec<Scripted>, completions: Vec<&str>) -> Self {
            Self {
                streams: Mutex::new(streams.into()),
                completions: Mutex::new(completions.into_iter().map(str::to_string).collect()),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        fn binding_name(&self) -> &str {
            "scripted"
        }

        fn model_name(&self) -> &str {
            "scripted-model"
        }

        async fn complete(
            &self,
            messages: &[ChatMessage],
            _tools: &[ToolDef],
            _options: &GenerationOptions,
        ) -> Result<Completion> {
            self.seen.lock().unwrap().push(messages.to_vec());
            let content = self
                .completions
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| anyhow::anyhow!("no scripted completion left"))?;
            Ok(Completion {
                content,
                ..Default::default()
            })
        }

        async fn stream(
            &self,
            messages: &[ChatMessage],
            tools: &[ToolDef],
            _options: &GenerationOptions,
            on_text: &mut (dyn for<'a> FnMut(&'a str) -> bool + Send),
        ) -> Result<Completion> {
            self.seen.lock().unwrap().push(messages.to_vec());
            self.offered_tools.lock().unwrap().push(tools.len());
            let scripted = self
                .streams
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| anyhow::anyhow!("no scripted stream left"))?;
            let mut completion = Completion {
                tool_calls: scripted.tool_calls.clone(),
                ..Default::default()
            };
            for chunk in &scripted.chunks {
                completion.content.push_str(chunk);
                completion.tokens += 1;
                if !on_text(chunk) {
                    completion.stopped = true;
                    break;
                }
                if let Some(flag) = &self.cancel_after_first_chunk {
                    flag.cancel();
                }
            }
            Ok(completion)
        }
    }

    pub(crate) fn tool_call(id: &str, name: &str, arguments: Value) -> LlmToolCall {
        LlmToolCall {
            id: id.to_string(),
            call_type: "function".to_string(),
            function: LlmFunctionCall {
                name: name.to_string(),
                arguments: arguments.to_string(),
            },
        }
    }

    fn tool_ctx() -> ToolContext {
        ToolContext {
            user_id: 1,
            username: "alice".to_string(),
            discussion_id: "d".to_string(),
            allowed_tools: None,
        }
    }

    struct LookupTool;

    #[async_trait]
    impl crate::tools::Tool for LookupTool {
        fn name(&self) -> &str {
            "search_docs"
        }

        fn description(&self) -> &str {
            "docs"
        }

        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }

        async fn execute(&self, _params: Value, _ctx: &ToolContext) -> Result<ToolOutput> {
            Ok(ToolOutput::Documents(vec![RetrievedDocument {
                title: "Guide".to_string(),
                content: "Use metric".to_string(),
                score: 91.0,
                metadata: json!({"source": "guide.md"}),
            }]))
        }
    }

    fn drain(rx: &flume::Receiver<Frame>) -> Vec<Frame> {
        rx.try_iter().collect()
    }

    #[test]
    fn frames_serialize_with_type_tags() {
        let line = Frame::StepStart {
            content: "Generating image".to_string(),
            id: "s1".to_string(),
        }
        .to_ndjson_line();
        assert_eq!(
            line,
            "{\"type\":\"step_start\",\"content\":\"Generating image\",\"id\":\"s1\"}\n"
        );
        let ttft: Value = serde_json::from_str(&Frame::Ttft { content: 342.17 }.to_ndjson_line()).unwrap();
        assert_eq!(ttft, json!({"type": "ttft", "content": 342.17}));
        let title: Value = serde_json::from_str(
            &Frame::NewTitleEnd {
                content: "Trip".to_string(),
            }
            .to_ndjson_line(),
        )
        .unwrap();
        assert_eq!(title["type"], "new_title_end");
    }

    #[test]
    fn tps_guards_degenerate_inputs() {
        assert_eq!(tokens_per_second(0, 1.0), 0.0);
        assert_eq!(tokens_per_second(1, 1.0), 0.0);
        assert_eq!(tokens_per_second(11, 0.0), 0.0);
        assert!((tokens_per_second(11, 2.0) - 5.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn ttft_is_emitted_once_before_the_first_chunk() {
        let (tx, rx) = flume::unbounded();
        let mut stream = TurnStream::new(tx, CancelFlag::new());
        let model = ScriptedModel::new(vec![Scripted::text("Hello there friend")], vec![]);

        let outcome = drive(
            &model,
            vec![ChatMessage::user("hi")],
            &ToolSet::default(),
            &tool_ctx(),
            &GenerationOptions::default(),
            1,
            &mut stream,
        )
        .await
        .unwrap();
        assert_eq!(outcome.visible_content, "Hello there friend");
        assert!(!outcome.cancelled);

        let frames = drain(&rx);
        let kinds: Vec<&str> = frames.iter().map(Frame::kind).collect();
        assert_eq!(kinds, vec!["ttft", "chunk", "chunk", "chunk"]);
        let metrics = stream.metrics(outcome.tokens);
        assert!(metrics.ttft_ms.is_some());
        assert_eq!(metrics.tokens, 3);
        assert_eq!(stream.metrics(0).tokens, 3);
    }

    #[tokio::test]
    async fn metrics_stop_at_the_last_chunk() {
        let (tx, _rx) = flume::unbounded();
        let mut stream = TurnStream::new(tx, CancelFlag::new());
        assert_eq!(stream.metrics(0), StreamMetrics::default());

        stream.on_chunk("one ");
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        stream.on_chunk("two ");
        stream.on_chunk("three");
        let at_end = stream.metrics(3);
        assert!(at_end.tps > 0.0);

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(stream.metrics(3), at_end);
        assert_eq!(stream.metrics(7).tokens, 7);
    }

    #[tokio::test]
    async fn cancellation_stops_at_the_next_chunk() {
        let (tx, rx) = flume::unbounded();
        let cancel = CancelFlag::new();
        let mut stream = TurnStream::new(tx, cancel.clone());
        let mut model = ScriptedModel::new(vec![Scripted::text("a b c d e")], vec![]);
        model.cancel_after_first_chunk = Some(cancel);

        let outcome = drive(
            &model,
            vec![ChatMessage::user("hi")],
            &ToolSet::default(),
            &tool_ctx(),
            &GenerationOptions::default(),
            1,
            &mut stream,
        )
        .await
        .unwrap();
        assert!(outcome.cancelled);
        let chunks = drain(&rx)
            .into_iter()
            .filter(|f| matches!(f, Frame::Chunk { .. }))
            .count();
        assert_eq!(chunks, 1);
    }

    #[tokio::test]
    async fn tool_loop_feeds_observations_back_and_surfaces_sources() {
        let (tx, rx) = flume::unbounded();
        let mut stream = TurnStream::new(tx, CancelFlag::new());
        let model = ScriptedModel::new(
            vec![
                Scripted {
                    chunks: Vec::new(),
                    tool_calls: vec![tool_call("c1", "search_docs", json!({"query": "units"}))],
                },
                Scripted::text("<think>check docs</think>Use metric."),
            ],
            vec![],
        );
        let mut tools = ToolSet::default();
        tools.insert(Arc::new(LookupTool));

        let outcome = drive(
            &model,
            vec![ChatMessage::user("units?")],
            &tools,
            &tool_ctx(),
            &GenerationOptions::default(),
            1,
            &mut stream,
        )
        .await
        .unwrap();

        assert_eq!(outcome.visible_content, "Use metric.");
        assert_eq!(outcome.reasoning, vec!["check docs".to_string()]);
        assert_eq!(outcome.sources.len(), 1);
        assert_eq!(outcome.sources[0].source, "guide.md");

        let seen = model.seen.lock().unwrap();
        let second_call = &seen[1];
        assert_eq!(second_call.last().unwrap().role, "tool");
        assert!(second_call.last().unwrap().text_content().contains("Use metric"));
        // The step budget is spent, so the follow-up call gets no tools.
        assert_eq!(*model.offered_tools.lock().unwrap(), vec![1, 0]);

        let kinds: Vec<&str> = drain(&rx).iter().map(Frame::kind).collect();
        let pos = |k: &str| kinds.iter().position(|x| *x == k).unwrap();
        assert!(pos("tool_call") < pos("sources"));
        assert!(pos("sources") < pos("observation"));
        assert!(pos("observation") < pos("chunk"));
        assert_eq!(kinds.last(), Some(&"reasoning"));
        assert_eq!(stream.take_events().len(), 2);
    }
}
