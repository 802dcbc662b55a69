//! Tool registry for the local agent.
//!
//! Tools declare typed argument structs; the registry owns them behind `dyn Tool`, exposes
//! OpenAI-style function definitions and dispatches calls by name.

use crate::collaborators::LocalMedia;
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCategory {
    Information,
    Productivity,
    Media,
    System,
}

impl ToolCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ToolCategory::Information => "information",
            ToolCategory::Productivity => "productivity",
            ToolCategory::Media => "media",
            ToolCategory::System => "system",
        }
    }
}

/// Object-safe tool interface used by the registry.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn category(&self) -> ToolCategory;
    /// JSON schema of the arguments.
    fn parameters_schema(&self) -> Value;
    async fn call(&self, args: Value) -> VoiceResult<String>;
}

/// Tool with a typed argument struct. Every `TypedTool` is a [`Tool`].
#[async_trait]
pub trait TypedTool: Send + Sync {
    type Args: DeserializeOwned + Send;

    const NAME: &'static str;
    const DESCRIPTION: &'static str;
    const CATEGORY: ToolCategory;

    fn parameters_schema(&self) -> Value;
    async fn invoke(&self, args: Self::Args) -> VoiceResult<String>;
}

#[async_trait]
impl<T: TypedTool> Tool for T {
    fn name(&self) -> &str {
        T::NAME
    }

    fn description(&self) -> &str {
        T::DESCRIPTION
    }

    fn category(&self) -> ToolCategory {
        T::CATEGORY
    }

    fn parameters_schema(&self) -> Value {
        TypedTool::parameters_schema(self)
    }

    async fn call(&self, args: Value) -> VoiceResult<String> {
        // Models send `null` or nothing for tools without parameters.
        let args = if args.is_null() { json!({}) } else { args };
        let typed: T::Args = serde_json::from_value(args)
            .map_err(|e| VoiceError::Tool(format!("{}: invalid arguments: {}", T::NAME, e)))?;
        self.invoke(typed).await
    }
}

/// Name → tool map.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in tools.
    pub fn with_builtins(media: Arc<dyn LocalMedia>) -> Self {
        let mut registry = Self::new();
        registry.register(ClockTool);
        registry.register(StopMediaTool::new(media));
        registry
    }

    /// Add a tool, replacing any tool with the same name.
    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.name().to_string();
        info!("🔧 Registered tool '{}' ({})", name, tool.category().as_str());
        self.tools.insert(name, Box::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// `tools` array for an OpenAI-compatible chat completion request.
    pub fn definitions(&self) -> Vec<Value> {
        self.tools
            .values()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name(),
                        "description": tool.description(),
                        "parameters": tool.parameters_schema(),
                    }
                })
            })
            .collect()
    }

    /// Run a tool with raw JSON arguments as the model produced them.
    pub async fn dispatch(&self, name: &str, raw_args: &str) -> VoiceResult<String> {
        let tool = self
            .get(name)
            .ok_or_else(|| VoiceError::Tool(format!("unknown tool '{}'", name)))?;
        let args = if raw_args.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(raw_args)
                .map_err(|e| VoiceError::Tool(format!("{}: arguments are not JSON: {}", name, e)))?
        };
        debug!(tool = name, "Dispatching tool call");
        tool.call(args).await
    }
}

#[derive(Debug, Deserialize)]
pub struct ClockArgs {
    /// Offset from UTC in minutes; local time when absent.
    #[serde(default)]
    pub utc_offset_minutes: Option<i32>,
}

/// Current date and time.
pub struct ClockTool;

#[async_trait]
impl TypedTool for ClockTool {
    type Args = ClockArgs;

    const NAME: &'static str = "get_current_time";
    const DESCRIPTION: &'static str = "Get the current date and time.";
    const CATEGORY: ToolCategory = ToolCategory::Information;

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "utc_offset_minutes": {
                    "type": "integer",
                    "description": "Offset from UTC in minutes. Omit for the device's local time."
                }
            },
            "required": []
        })
    }

    async fn invoke(&self, args: ClockArgs) -> VoiceResult<String> {
        let formatted = match args.utc_offset_minutes {
            Some(minutes) => {
                let offset = chrono::FixedOffset::east_opt(minutes.saturating_mul(60))
                    .ok_or_else(|| VoiceError::Tool(format!("offset {} out of range", minutes)))?;
                chrono::Utc::now()
                    .with_timezone(&offset)
                    .format("%A %Y-%m-%d %H:%M")
                    .to_string()
            }
            None => chrono::Local::now().format("%A %Y-%m-%d %H:%M").to_string(),
        };
        Ok(formatted)
    }
}

#[derive(Debug, Deserialize)]
pub struct StopMediaArgs {}

/// Stops whatever the host is playing.
pub struct StopMediaTool {
    media: Arc<dyn LocalMedia>,
}

impl StopMediaTool {
    pub fn new(media: Arc<dyn LocalMedia>) -> Self {
        Self { media }
    }
}

#[async_trait]
impl TypedTool for StopMediaTool {
    type Args = StopMediaArgs;

    const NAME: &'static str = "stop_media";
    const DESCRIPTION: &'static str = "Stop music or other media currently playing on this device.";
    const CATEGORY: ToolCategory = ToolCategory::Media;

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {}, "required": [] })
    }

    async fn invoke(&self, _args: StopMediaArgs) -> VoiceResult<String> {
        self.media.stop();
        Ok("Media stopped.".to_string())
    }
}
