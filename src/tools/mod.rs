//! Function tools the model may call during a turn.
//!
//! Each tool declares a JSON Schema for its parameters, enabling LLM function-calling.
//! Tools live in a thread-safe [`ToolRegistry`]; a turn narrows the registry down to the
//! names its personality and discussion activate ([`ToolSet`]) and may add per-turn tools
//! such as the RAG datastore callbacks.

pub mod fetch;
pub mod safety;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::rag::RetrievedDocument;

/// Category of tool, used for logging and for deciding which results carry sources.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ToolCategory {
    /// Reaches out over the network
    Network,
    /// Datastore retrieval
    Retrieval,
    /// Anything else
    General,
}

/// What a tool hands back to the tool loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ToolOutput {
    /// Plain text
    Text(String),
    /// Structured JSON
    Json(serde_json::Value),
    /// Retrieved documents, rendered for the model and surfaced as sources
    Documents(Vec<RetrievedDocument>),
    /// The call failed; the message is shown to the model
    Error(String),
}

impl ToolOutput {
    /// Text sent back to the model as the tool message content.
    pub fn to_llm_string(&self) -> String {
        match self {
            ToolOutput::Text(s) => s.clone(),
            ToolOutput::Json(v) => {
                serde_json::to_string_pretty(v).unwrap_or_else(|_| v.to_string())
            }
            ToolOutput::Documents(docs) if docs.is_empty() => {
                "No matching documents found.".to_string()
            }
            ToolOutput::Documents(docs) => docs
                .iter()
                .enumerate()
                .map(|(i, doc)| {
                    format!(
                        "[{}] {} (score {:.1})\n{}",
                        i + 1,
                        doc.title,
                        doc.score,
                        doc.content
                    )
                })
                .collect::<Vec<_>>()
                .join("\n\n"),
            ToolOutput::Error(e) => format!("[ERROR] {}", e),
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, ToolOutput::Error(_))
    }
}

/// Per-call context: who is asking and which tools the turn allows.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub user_id: i64,
    pub username: String,
    pub discussion_id: String,
    /// Case-insensitive allow list; `None` allows every registered tool.
    pub allowed_tools: Option<Vec<String>>,
}

impl ToolContext {
    pub fn allows_tool(&self, tool_name: &str) -> bool {
        match &self.allowed_tools {
            Some(allowed) => allowed
                .iter()
                .any(|name| name.eq_ignore_ascii_case(tool_name)),
            None => true,
        }
    }
}

/// A capability the model can invoke while answering.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Function name the model calls, e.g. `fetch_url`.
    fn name(&self) -> &str;

    /// Shown to the model in the function definition.
    fn description(&self) -> &str;

    /// JSON Schema for the arguments.
    ///
    /// Sent as-is as the function's `parameters`.
    fn parameters_schema(&self) -> serde_json::Value;

    async fn execute(&self, params: serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput>;

    fn category(&self) -> ToolCategory {
        ToolCategory::General
    }
}

/// Function entry in a chat-completions `tools` array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// `{"type": "function", "function": ...}` wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDef,
}

impl ToolDef {
    fn for_tool(tool: &dyn Tool) -> Self {
        ToolDef {
            tool_type: "function".to_string(),
            function: FunctionDef {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters_schema(),
            },
        }
    }
}

/// One function call requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Output of one call, keyed by tool name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub name: String,
    pub output: ToolOutput,
}

/// Thread-safe registry of the server-wide tools.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
        }
    }

    /// Registry holding the built-in tools.
    pub async fn with_builtins(client: reqwest::Client) -> Self {
        let registry = Self::new();
        registry
            .register(Arc::new(fetch::FetchUrlTool::new(client)))
            .await;
        registry
    }

    /// Register a tool. Overwrites any existing tool with the same name.
    pub async fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        tracing::info!(
            "Registered tool: {} (category: {:?})",
            name,
            tool.category()
        );
        self.tools.write().await.insert(name, tool);
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().await.get(name).cloned()
    }

    pub async fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Narrows the registry to the requested names. Unknown names are logged and skipped.
    pub async fn select<'a, I>(&self, names: I) -> ToolSet
    where
        I: IntoIterator<Item = &'a String>,
    {
        let tools = self.tools.read().await;
        let mut set = ToolSet::default();
        for name in names {
            match tools.get(name) {
                Some(tool) => set.insert(tool.clone()),
                None => tracing::debug!("Requested tool '{}' is not registered", name),
            }
        }
        set
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The tools bound to one turn, in a stable order.
#[derive(Clone, Default)]
pub struct ToolSet {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolSet {
    /// Adds a tool, replacing any existing one with the same name.
    pub fn insert(&mut self, tool: Arc<dyn Tool>) {
        self.tools.retain(|existing| existing.name() != tool.name());
        self.tools.push(tool);
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name().to_string()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name)
    }

    /// OpenAI-format definitions filtered by the context policy.
    pub fn definitions(&self, ctx: &ToolContext) -> Vec<ToolDef> {
        self.tools
            .iter()
            .filter(|tool| ctx.allows_tool(tool.name()))
            .map(|tool| ToolDef::for_tool(tool.as_ref()))
            .collect()
    }

    pub async fn execute_call(&self, call: &ToolCall, ctx: &ToolContext) -> ToolCallResult {
        if !ctx.allows_tool(&call.name) {
            return ToolCallResult {
                name: call.name.clone(),
                output: ToolOutput::Error(format!(
                    "Tool '{}' is disabled for this context",
                    call.name
                )),
            };
        }

        let Some(tool) = self.get(&call.name) else {
            return ToolCallResult {
                name: call.name.clone(),
                output: ToolOutput::Error(format!("Unknown tool: {}", call.name)),
            };
        };

        let output = match tool.execute(call.arguments.clone(), ctx).await {
            Ok(output) => output,
            Err(e) => ToolOutput::Error(format!("Tool execution failed: {}", e)),
        };
        ToolCallResult {
            name: call.name.clone(),
            output,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echoes back the input message"
        }

        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({
                "type": "object",
                "properties": {
                    "message": {
                        "type": "string",
                        "description": "The message to echo"
                    }
                },
                "required": ["message"]
            })
        }

        async fn execute(
            &self,
            params: serde_json::Value,
            _ctx: &ToolContext,
        ) -> Result<ToolOutput> {
            let message = params["message"].as_str().unwrap_or("(no message)");
            Ok(ToolOutput::Text(message.to_string()))
        }
    }

    struct FailingTool;

    #[async_trait]
    impl Tool for FailingTool {
        fn name(&self) -> &str {
            "broken"
        }

        fn description(&self) -> &str {
            "Always fails"
        }

        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object", "properties": {}})
        }

        async fn execute(
            &self,
            _params: serde_json::Value,
            _ctx: &ToolContext,
        ) -> Result<ToolOutput> {
            anyhow::bail!("backend offline")
        }
    }

    fn test_ctx() -> ToolContext {
        ToolContext {
            user_id: 1,
            username: "test".to_string(),
            discussion_id: "d1".to_string(),
            allowed_tools: None,
        }
    }

    #[tokio::test]
    async fn select_keeps_only_registered_names() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).await;

        let names = vec!["echo".to_string(), "missing".to_string()];
        let set = registry.select(&names).await;
        assert_eq!(set.names(), vec!["echo".to_string()]);
    }

    #[tokio::test]
    async fn definitions_use_openai_function_format() {
        let mut set = ToolSet::default();
        set.insert(Arc::new(EchoTool));

        let defs = set.definitions(&test_ctx());
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].tool_type, "function");
        assert_eq!(defs[0].function.name, "echo");
        let json = serde_json::to_value(&defs[0]).unwrap();
        assert_eq!(json["type"], "function");
    }

    #[tokio::test]
    async fn execute_echo_tool() {
        let mut set = ToolSet::default();
        set.insert(Arc::new(EchoTool));

        let call = ToolCall {
            name: "echo".to_string(),
            arguments: serde_json::json!({"message": "hello"}),
        };
        let result = set.execute_call(&call, &test_ctx()).await;
        assert!(result.output.is_success());
        assert_eq!(result.output.to_llm_string(), "hello");
    }

    #[tokio::test]
    async fn unknown_and_failing_tools_become_error_outputs() {
        let mut set = ToolSet::default();
        set.insert(Arc::new(FailingTool));

        let unknown = ToolCall {
            name: "nope".to_string(),
            arguments: serde_json::json!({}),
        };
        let result = set.execute_call(&unknown, &test_ctx()).await;
        assert!(result.output.to_llm_string().contains("Unknown tool"));

        let broken = ToolCall {
            name: "broken".to_string(),
            arguments: serde_json::json!({}),
        };
        let result = set.execute_call(&broken, &test_ctx()).await;
        assert!(!result.output.is_success());
        assert!(result.output.to_llm_string().contains("backend offline"));
    }

    #[tokio::test]
    async fn allowlist_hides_and_blocks_other_tools() {
        let mut set = ToolSet::default();
        set.insert(Arc::new(EchoTool));
        set.insert(Arc::new(FailingTool));

        let mut ctx = test_ctx();
        ctx.allowed_tools = Some(vec!["ECHO".to_string()]);

        let defs = set.definitions(&ctx);
        assert_eq!(defs.len(), 1);
        let call = ToolCall {
            name: "broken".to_string(),
            arguments: serde_json::json!({}),
        };
        let result = set.execute_call(&call, &ctx).await;
        assert!(result.output.to_llm_string().contains("disabled"));
    }

    #[test]
    fn documents_render_numbered_for_the_model() {
        let output = ToolOutput::Documents(vec![RetrievedDocument {
            title: "Handbook".to_string(),
            content: "Vacation is 25 days.".to_string(),
            score: 87.5,
            metadata: serde_json::json!({}),
        }]);
        let text = output.to_llm_string();
        assert!(text.starts_with("[1] Handbook (score 87.5)"));
        assert!(text.contains("Vacation is 25 days."));
        assert_eq!(
            ToolOutput::Documents(Vec::new()).to_llm_string(),
            "No matching documents found."
        );
    }
}
