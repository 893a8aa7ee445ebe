use crate::domain::model::GeneratedScript;
use crate::domain::ports::CodeGenerator;
use crate::utils::error::{AgentError, Result};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You automate repetitive work in Google Sheets by writing Google Apps Script.
Reply with a single JSON object and nothing else:
{"explanation": "<one or two sentences describing what the script does>", "code": "<the complete Apps Script source>"}
The code must define a function named main() that performs the task on the active spreadsheet."#;

/// Prompt generator backed by an OpenAI-compatible chat completions endpoint.
pub struct ChatCompletionGenerator {
    client: Client,
    endpoint: String,
    model: String,
    api_key: String,
    system_prompt: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

impl ChatCompletionGenerator {
    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
            model: model.into(),
            api_key: api_key.into(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }
}

fn generation_error(message: impl Into<String>) -> AgentError {
    AgentError::GenerationError {
        message: message.into(),
    }
}

/// Parse assistant output into a script, tolerating a markdown code fence.
pub fn parse_generated(content: &str) -> Result<GeneratedScript> {
    let trimmed = content.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.trim_end().strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();

    let script: GeneratedScript = serde_json::from_str(unfenced)
        .map_err(|e| generation_error(format!("model output is not the expected JSON: {}", e)))?;
    if script.code.trim().is_empty() {
        return Err(generation_error("model output contains no code"));
    }
    Ok(script)
}

#[async_trait::async_trait]
impl CodeGenerator for ChatCompletionGenerator {
    async fn generate(&self, instruction: &str) -> Result<GeneratedScript> {
        tracing::debug!("Requesting script for instruction from {}", self.endpoint);
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "messages": [
                    {"role": "system", "content": self.system_prompt},
                    {"role": "user", "content": format!("Create a Google Apps Script that does the following: {}", instruction)},
                ],
            }))
            .send()
            .await
            .map_err(|e| generation_error(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(generation_error(format!(
                "language model returned {}: {}",
                status, body
            )));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| generation_error(e.to_string()))?;
        let content = chat
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| generation_error("language model returned no choices"))?;

        parse_generated(&content)
    }
}
