//! Tool-calling agent over an OpenAI-compatible chat completion API.

use crate::settings::AgentConfig;
use async_trait::async_trait;
use duplex_voice::{AgentRuntime, TokenCallback, ToolRegistry, VoiceError, VoiceResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: AssistantMessage,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ToolCall {
    id: String,
    #[serde(rename = "type", default = "function_kind")]
    kind: String,
    function: FunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

fn function_kind() -> String {
    "function".to_string()
}

/// Agent that lets the model call registry tools until it produces a spoken answer.
pub struct OpenAiAgent {
    base_url: String,
    api_key: String,
    model: String,
    system_prompt: String,
    max_tool_rounds: usize,
    tools: Arc<ToolRegistry>,
    client: reqwest::Client,
}

impl OpenAiAgent {
    pub fn new(config: &AgentConfig, tools: Arc<ToolRegistry>) -> VoiceResult<Self> {
        if config.api_key.is_empty() {
            return Err(VoiceError::Config(
                "agent requires agent.api_key or OPENAI_API_KEY".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| VoiceError::Agent(e.to_string()))?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            system_prompt: config.system_prompt.clone(),
            max_tool_rounds: config.max_tool_rounds.max(1),
            tools,
            client,
        })
    }

    fn request_body(&self, messages: &[Value]) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": messages,
        });
        if !self.tools.is_empty() {
            body["tools"] = Value::Array(self.tools.definitions());
        }
        body
    }

    async fn complete(&self, messages: &[Value]) -> VoiceResult<AssistantMessage> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(messages))
            .send()
            .await
            .map_err(|e| VoiceError::Agent(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(VoiceError::Agent(format!("chat API {}: {}", status, detail)));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| VoiceError::Agent(format!("invalid chat response: {}", e)))?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| VoiceError::Agent("chat response has no choices".to_string()))
    }

    /// Run each call and append the results as `tool` messages. Tool failures go back
    /// to the model as text.
    async fn run_tools(&self, calls: &[ToolCall], messages: &mut Vec<Value>) {
        for call in calls {
            let output = match self.tools.dispatch(&call.function.name, &call.function.arguments).await {
                Ok(output) => output,
                Err(e) => {
                    warn!(tool = %call.function.name, error = %e, "Tool call failed");
                    format!("error: {}", e)
                }
            };
            messages.push(json!({
                "role": "tool",
                "tool_call_id": call.id,
                "content": output,
            }));
        }
    }
}

#[async_trait]
impl AgentRuntime for OpenAiAgent {
    async fn run(&self, text: &str, on_token: TokenCallback<'_>) -> VoiceResult<String> {
        let mut messages = vec![
            json!({ "role": "system", "content": self.system_prompt }),
            json!({ "role": "user", "content": text }),
        ];

        for round in 0..self.max_tool_rounds {
            let message = self.complete(&messages).await?;
            if message.tool_calls.is_empty() {
                let reply = message.content.unwrap_or_default().trim().to_string();
                info!(round, chars = reply.len(), "Agent answered");
                on_token(&reply);
                return Ok(reply);
            }

            debug!(round, calls = message.tool_calls.len(), "Agent requested tools");
            messages.push(json!({
                "role": "assistant",
                "content": message.content,
                "tool_calls": message.tool_calls,
            }));
            self.run_tools(&message.tool_calls, &mut messages).await;
        }

        Err(VoiceError::Agent(format!(
            "no answer after {} tool rounds",
            self.max_tool_rounds
        )))
    }
}
