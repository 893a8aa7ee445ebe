use crate::domain::model::{
    Credential, Deployment, ExecutionResult, ProjectHandle, ScriptFailure, SourceUnit, StackFrame,
    Version, MANIFEST_NAME,
};
use crate::domain::ports::ScriptPlatform;
use crate::utils::error::{AgentError, Result};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;

pub const DEFAULT_API_BASE: &str = "https://script.googleapis.com/v1";

type ErrorKind = fn(Option<u16>, String) -> AgentError;

/// REST client for the script-hosting platform's project endpoints.
pub struct ProjectManager {
    client: Client,
    api_base: String,
    script_title: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectResponse {
    script_id: String,
    #[serde(default)]
    parent_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VersionResponse {
    version_number: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeploymentResponse {
    deployment_id: String,
    #[serde(default)]
    deployment_config: Option<DeploymentConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeploymentConfig {
    #[serde(default)]
    version_number: Option<u64>,
    #[serde(default)]
    manifest_file_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Operation {
    #[serde(default)]
    response: Option<OperationResponse>,
    #[serde(default)]
    error: Option<OperationStatus>,
}

#[derive(Debug, Deserialize)]
struct OperationResponse {
    #[serde(default)]
    result: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct OperationStatus {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    details: Vec<ExecutionErrorDetail>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecutionErrorDetail {
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    error_type: Option<String>,
    #[serde(default)]
    script_stack_trace_elements: Vec<StackTraceElement>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StackTraceElement {
    #[serde(default)]
    function: Option<String>,
    #[serde(default)]
    line_number: Option<u64>,
}

impl ProjectManager {
    pub fn new(api_base: impl Into<String>, script_title: impl Into<String>) -> Self {
        Self::with_client(Client::new(), api_base, script_title)
    }

    pub fn with_client(
        client: Client,
        api_base: impl Into<String>,
        script_title: impl Into<String>,
    ) -> Self {
        Self {
            client,
            api_base: api_base.into(),
            script_title: script_title.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.api_base.trim_end_matches('/'), path)
    }

    /// Send, then hand back the body of a 2xx response as JSON. Transport
    /// failures carry no status; platform failures carry the body verbatim.
    async fn send_checked(request: RequestBuilder, kind: ErrorKind) -> Result<serde_json::Value> {
        let response = request.send().await.map_err(|e| kind(None, e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| kind(Some(status.as_u16()), e.to_string()))?;

        if !status.is_success() {
            tracing::debug!("Platform returned {}: {}", status, body);
            return Err(kind(Some(status.as_u16()), body));
        }

        if body.trim().is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_str(&body).map_err(|e| {
            kind(
                Some(status.as_u16()),
                format!("unexpected response body ({}): {}", e, body),
            )
        })
    }

    fn decode<T: DeserializeOwned>(value: serde_json::Value, kind: ErrorKind) -> Result<T> {
        let raw = value.to_string();
        serde_json::from_value(value)
            .map_err(|e| kind(None, format!("unexpected response shape ({}): {}", e, raw)))
    }
}

fn project_create_error(status: Option<u16>, payload: String) -> AgentError {
    AgentError::ProjectCreateError { status, payload }
}

fn push_error(status: Option<u16>, payload: String) -> AgentError {
    AgentError::PushError { status, payload }
}

fn deployment_error(status: Option<u16>, payload: String) -> AgentError {
    AgentError::DeploymentError { status, payload }
}

fn execution_error(status: Option<u16>, payload: String) -> AgentError {
    AgentError::ExecutionError { status, payload }
}

#[async_trait::async_trait]
impl ScriptPlatform for ProjectManager {
    async fn create_project(
        &self,
        credential: &Credential,
        container_id: &str,
    ) -> Result<ProjectHandle> {
        tracing::debug!("Creating project bound to container {}", container_id);
        let request = self
            .client
            .post(self.url("projects"))
            .bearer_auth(&credential.access_token)
            .json(&json!({
                "title": self.script_title,
                "parentId": container_id,
            }));

        let body = Self::send_checked(request, project_create_error).await?;
        let project: ProjectResponse = Self::decode(body, project_create_error)?;

        tracing::info!("Created project {}", project.script_id);
        Ok(ProjectHandle {
            project_id: project.script_id,
            container_id: project.parent_id.or_else(|| Some(container_id.to_string())),
        })
    }

    async fn push_content(
        &self,
        credential: &Credential,
        handle: &ProjectHandle,
        units: &[SourceUnit],
    ) -> Result<Version> {
        tracing::debug!(
            "Pushing {} units to project {}",
            units.len(),
            handle.project_id
        );
        let content = self
            .client
            .put(self.url(&format!("projects/{}/content", handle.project_id)))
            .bearer_auth(&credential.access_token)
            .json(&json!({ "files": units }));
        Self::send_checked(content, push_error).await?;

        let version = self
            .client
            .post(self.url(&format!("projects/{}/versions", handle.project_id)))
            .bearer_auth(&credential.access_token)
            .json(&json!({ "description": "Automated push" }));
        let body = Self::send_checked(version, push_error).await?;
        let version: VersionResponse = Self::decode(body, push_error)?;

        tracing::info!(
            "Project {} now at version {}",
            handle.project_id,
            version.version_number
        );
        Ok(Version {
            project_id: handle.project_id.clone(),
            number: version.version_number,
        })
    }

    async fn create_deployment(
        &self,
        credential: &Credential,
        handle: &ProjectHandle,
        version: &Version,
    ) -> Result<Deployment> {
        let request = self
            .client
            .post(self.url(&format!("projects/{}/deployments", handle.project_id)))
            .bearer_auth(&credential.access_token)
            .json(&json!({
                "versionNumber": version.number,
                "manifestFileName": MANIFEST_NAME,
                "description": "Automated deployment",
            }));

        let body = Self::send_checked(request, deployment_error).await?;
        let deployment: DeploymentResponse = Self::decode(body, deployment_error)?;
        let config = deployment.deployment_config;

        tracing::info!(
            "Created deployment {} for version {}",
            deployment.deployment_id,
            version.number
        );
        Ok(Deployment {
            deployment_id: deployment.deployment_id,
            version_number: config
                .as_ref()
                .and_then(|c| c.version_number)
                .unwrap_or(version.number),
            manifest_file: config
                .and_then(|c| c.manifest_file_name)
                .unwrap_or_else(|| MANIFEST_NAME.to_string()),
        })
    }

    async fn execute(
        &self,
        credential: &Credential,
        deployment: &Deployment,
        entry_point: &str,
        arguments: &[serde_json::Value],
    ) -> Result<ExecutionResult> {
        tracing::debug!(
            "Running {} on deployment {}",
            entry_point,
            deployment.deployment_id
        );
        let request = self
            .client
            .post(self.url(&format!("scripts/{}:run", deployment.deployment_id)))
            .bearer_auth(&credential.access_token)
            .json(&json!({
                "function": entry_point,
                "parameters": arguments,
                "devMode": false,
            }));

        let body = Self::send_checked(request, execution_error).await?;
        let operation: Operation = Self::decode(body, execution_error)?;

        if let Some(status) = operation.error {
            let detail = status.details.into_iter().next();
            let failure = match detail {
                Some(detail) => ScriptFailure {
                    message: detail
                        .error_message
                        .or(status.message)
                        .unwrap_or_else(|| "script error".to_string()),
                    error_type: detail.error_type,
                    stack: detail
                        .script_stack_trace_elements
                        .into_iter()
                        .map(|frame| StackFrame {
                            function: frame.function,
                            line_number: frame.line_number,
                        })
                        .collect(),
                },
                None => ScriptFailure {
                    message: status.message.unwrap_or_else(|| "script error".to_string()),
                    error_type: None,
                    stack: Vec::new(),
                },
            };
            tracing::warn!("Script {} failed: {}", entry_point, failure.message);
            return Ok(ExecutionResult::ScriptFailed { failure });
        }

        let value = operation
            .response
            .and_then(|r| r.result)
            .unwrap_or(serde_json::Value::Null);
        Ok(ExecutionResult::Returned { value })
    }
}
