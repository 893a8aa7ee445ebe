use crate::core::credential_store::CredentialSource;
use crate::core::pipeline::DeploymentPipeline;
use crate::domain::model::Target;
use crate::domain::ports::{CodeGenerator, ScriptPlatform, Storage};
use crate::utils::error::ClassifiedError;
use serde_json::{json, Value};

/// What the front end writes back: always a JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    fn error(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "error": message.into() }),
        }
    }

    fn classified(error: &ClassifiedError) -> Self {
        tracing::warn!(
            "Request failed at {}: {}",
            error.stage,
            error.source.recovery_suggestion()
        );
        Self {
            status: error.http_status(),
            body: json!({
                "error": error.message,
                "stage": error.stage.to_string(),
            }),
        }
    }
}

/// Token from an `Authorization: Bearer <token>` header. An empty token is
/// returned as-is so the credential check can reject it.
pub fn bearer_token(header: Option<&str>) -> Option<&str> {
    header?.strip_prefix("Bearer ").map(str::trim)
}

fn string_field<'a>(body: &'a Value, key: &str) -> Option<&'a str> {
    body.get(key).and_then(Value::as_str)
}

/// `POST /prompt`: `{instruction, scriptId}` (or `spreadsheet_id` for a first
/// run without a known project).
pub async fn handle_prompt<P: ScriptPlatform, S: Storage>(
    pipeline: &DeploymentPipeline<P, S>,
    generator: &dyn CodeGenerator,
    authorization: Option<&str>,
    body: &Value,
) -> ApiResponse {
    let instruction = string_field(body, "instruction");
    let target = match (
        string_field(body, "scriptId"),
        string_field(body, "spreadsheet_id"),
    ) {
        (Some(script_id), _) => Some(Target::Project(script_id.to_string())),
        (None, Some(container_id)) => Some(Target::Container(container_id.to_string())),
        (None, None) => None,
    };
    let (instruction, target) = match (instruction, target) {
        (Some(instruction), Some(target)) => (instruction, target),
        _ => return ApiResponse::error(400, "Instruction or Script ID not provided"),
    };

    let Some(token) = bearer_token(authorization) else {
        return ApiResponse::error(401, "Unauthorized");
    };
    let source = CredentialSource::supplied(token);

    match pipeline
        .run_instruction(generator, &source, &target, instruction)
        .await
    {
        Ok(report) => ApiResponse {
            status: 200,
            body: json!({
                "received_instruction": report.explanation,
                "script_id": report.run.handle.project_id,
                "version": report.run.version.number,
                "execution": report.run.result,
            }),
        },
        Err(e) => ApiResponse::classified(&e),
    }
}

/// `POST /script/create`: `{spreadsheet_id}`.
pub async fn handle_create_script<P: ScriptPlatform, S: Storage>(
    pipeline: &DeploymentPipeline<P, S>,
    authorization: Option<&str>,
    body: &Value,
) -> ApiResponse {
    let Some(spreadsheet_id) = string_field(body, "spreadsheet_id") else {
        return ApiResponse::error(400, "spreadsheet_id must be provided");
    };
    let Some(token) = bearer_token(authorization) else {
        return ApiResponse::error(401, "Unauthorized");
    };
    let source = CredentialSource::supplied(token);

    match pipeline.provision(&source, spreadsheet_id).await {
        Ok(handle) => ApiResponse {
            status: 201,
            body: json!({
                "message": "Script created successfully",
                "script_id": handle.project_id,
            }),
        },
        Err(e) => ApiResponse::classified(&e),
    }
}
