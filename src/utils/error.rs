use crate::domain::model::PipelineStage;
use std::path::PathBuf;
use thiserror::Error;

/// Message shown instead of the raw platform error when the granted OAuth
/// scopes do not cover what the deployed project needs.
pub const REAUTHORIZE_MESSAGE: &str = "This document hasn't been authorized for end-to-end automation. Please reauthorize to grant the missing permissions.";

const SCOPE_INSUFFICIENT_MARKERS: &[&str] = &[
    "ACCESS_TOKEN_SCOPE_INSUFFICIENT",
    "insufficient authentication scopes",
];

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Authorization failed: {message}")]
    AuthorizationError { message: String },

    /// `rejected` is set when the platform refused the refresh token itself,
    /// as opposed to the refresh call failing in transit.
    #[error("Token refresh failed: {message}")]
    RefreshError { message: String, rejected: bool },

    #[error("Invalid credential: {reason}")]
    InvalidCredentialError { reason: String },

    #[error("Bundling failed at {}: {message}", path.display())]
    BundlingError { path: PathBuf, message: String },

    #[error("Project creation failed: {payload}")]
    ProjectCreateError { status: Option<u16>, payload: String },

    #[error("Content push failed: {payload}")]
    PushError { status: Option<u16>, payload: String },

    #[error("Deployment failed: {payload}")]
    DeploymentError { status: Option<u16>, payload: String },

    #[error("Script execution request failed: {payload}")]
    ExecutionError { status: Option<u16>, payload: String },

    #[error("Code generation failed: {message}")]
    GenerationError { message: String },

    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Missing configuration: {field}")]
    MissingConfigError { field: String },

    #[error("Invalid value '{value}' for {field}: {reason}")]
    InvalidConfigValueError {
        field: String,
        value: String,
        reason: String,
    },

    /// A caller-supplied identifier that cannot be used as given.
    #[error("Invalid {field} '{value}': {reason}")]
    InvalidInputError {
        field: String,
        value: String,
        reason: String,
    },
}

pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Authentication,
    Bundling,
    Platform,
    Generation,
    Configuration,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl AgentError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::AuthorizationError { .. }
            | Self::RefreshError { .. }
            | Self::InvalidCredentialError { .. } => ErrorCategory::Authentication,
            Self::BundlingError { .. } => ErrorCategory::Bundling,
            Self::ProjectCreateError { .. }
            | Self::PushError { .. }
            | Self::DeploymentError { .. }
            | Self::ExecutionError { .. }
            | Self::HttpError(_) => ErrorCategory::Platform,
            Self::GenerationError { .. } => ErrorCategory::Generation,
            Self::ConfigError { .. }
            | Self::MissingConfigError { .. }
            | Self::InvalidConfigValueError { .. }
            | Self::InvalidInputError { .. } => ErrorCategory::Configuration,
            Self::IoError(_) | Self::SerializationError(_) => ErrorCategory::System,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            // A timed-out or dropped platform call is safe to retry from scratch.
            Self::ProjectCreateError { status: None, .. }
            | Self::PushError { status: None, .. }
            | Self::DeploymentError { status: None, .. }
            | Self::ExecutionError { status: None, .. }
            | Self::HttpError(_) => ErrorSeverity::Medium,
            Self::ProjectCreateError { .. }
            | Self::PushError { .. }
            | Self::DeploymentError { .. }
            | Self::ExecutionError { .. }
            | Self::GenerationError { .. }
            | Self::BundlingError { .. }
            | Self::InvalidInputError { .. } => ErrorSeverity::High,
            Self::AuthorizationError { .. }
            | Self::RefreshError { .. }
            | Self::InvalidCredentialError { .. } => ErrorSeverity::High,
            Self::ConfigError { .. }
            | Self::MissingConfigError { .. }
            | Self::InvalidConfigValueError { .. }
            | Self::IoError(_)
            | Self::SerializationError(_) => ErrorSeverity::Critical,
        }
    }

    /// Raw platform payload for the kinds that carry one.
    pub fn platform_payload(&self) -> Option<&str> {
        match self {
            Self::ProjectCreateError { payload, .. }
            | Self::PushError { payload, .. }
            | Self::DeploymentError { payload, .. }
            | Self::ExecutionError { payload, .. } => Some(payload),
            _ => None,
        }
    }

    /// True when a create/push/execute failure came back from the platform
    /// with an insufficient-scope indicator.
    pub fn is_scope_insufficient(&self) -> bool {
        let payload = match self {
            Self::ProjectCreateError { payload, .. }
            | Self::PushError { payload, .. }
            | Self::ExecutionError { payload, .. } => payload,
            _ => return false,
        };
        let lowered = payload.to_ascii_lowercase();
        SCOPE_INSUFFICIENT_MARKERS
            .iter()
            .any(|marker| payload.contains(marker) || lowered.contains(&marker.to_ascii_lowercase()))
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidCredentialError { .. }
            | Self::AuthorizationError { .. }
            | Self::RefreshError { .. } => 401,
            Self::InvalidInputError { .. } => 400,
            _ => 500,
        }
    }

    pub fn user_friendly_message(&self) -> String {
        if self.is_scope_insufficient() {
            return REAUTHORIZE_MESSAGE.to_string();
        }
        match self.platform_payload() {
            Some(payload) => payload.to_string(),
            None => self.to_string(),
        }
    }

    pub fn recovery_suggestion(&self) -> &'static str {
        if self.is_scope_insufficient() {
            return "Reauthorize the application so the token carries every required scope";
        }
        match self {
            Self::AuthorizationError { .. } => {
                "Run the command again in a terminal with a browser available to complete authorization"
            }
            Self::RefreshError { rejected: true, .. } => {
                "The saved token was revoked; run again to authorize from scratch"
            }
            Self::RefreshError { .. } => "Check network connectivity and retry",
            Self::InvalidCredentialError { .. } => "Send a non-empty bearer token in the Authorization header",
            Self::BundlingError { .. } => "Check that the library directory exists and is readable",
            Self::ProjectCreateError { .. } => "Verify the spreadsheet id and that the Apps Script API is enabled",
            Self::PushError { .. } => "Inspect the platform message; a timed-out push can be retried safely",
            Self::DeploymentError { .. } => "Retry the cycle; the pushed version is kept by the platform",
            Self::ExecutionError { .. } => "Retry the cycle or check the deployment in the script editor",
            Self::GenerationError { .. } => "Rephrase the instruction or check the language model settings",
            Self::HttpError(_) => "Check network connectivity and retry",
            Self::InvalidInputError { .. } => "Pass the spreadsheet id exactly as it appears in the document URL",
            Self::ConfigError { .. }
            | Self::MissingConfigError { .. }
            | Self::InvalidConfigValueError { .. } => "Fix the configuration file and try again",
            Self::IoError(_) | Self::SerializationError(_) => {
                "Check file permissions and the state directory"
            }
        }
    }
}

/// A pipeline failure tagged with the last state reached and the message
/// that is safe to show to an end user.
#[derive(Error, Debug)]
#[error("{message}")]
pub struct ClassifiedError {
    pub stage: PipelineStage,
    pub category: ErrorCategory,
    pub message: String,
    #[source]
    pub source: AgentError,
}

impl ClassifiedError {
    pub fn classify(stage: PipelineStage, error: AgentError) -> Self {
        Self {
            stage,
            category: error.category(),
            message: error.user_friendly_message(),
            source: error,
        }
    }

    pub fn http_status(&self) -> u16 {
        self.source.http_status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_marker_replaces_push_payload() {
        let err = AgentError::PushError {
            status: Some(403),
            payload: r#"{"error":{"code":403,"status":"PERMISSION_DENIED","details":[{"reason":"ACCESS_TOKEN_SCOPE_INSUFFICIENT"}]}}"#.to_string(),
        };
        assert!(err.is_scope_insufficient());

        let classified = ClassifiedError::classify(PipelineStage::Authenticated, err);
        assert_eq!(classified.message, REAUTHORIZE_MESSAGE);
        assert_eq!(classified.category, ErrorCategory::Platform);
        assert_eq!(classified.http_status(), 500);
    }

    #[test]
    fn test_other_platform_errors_pass_through_verbatim() {
        let payload = r#"{"error":{"code":400,"message":"Syntax error: Unexpected token"}}"#;
        let err = AgentError::PushError {
            status: Some(400),
            payload: payload.to_string(),
        };
        assert!(!err.is_scope_insufficient());
        let classified = ClassifiedError::classify(PipelineStage::Authenticated, err);
        assert_eq!(classified.message, payload);
    }

    #[test]
    fn test_deployment_errors_are_not_reclassified() {
        let err = AgentError::DeploymentError {
            status: Some(403),
            payload: "ACCESS_TOKEN_SCOPE_INSUFFICIENT".to_string(),
        };
        assert!(!err.is_scope_insufficient());
    }

    #[test]
    fn test_insufficient_scope_text_is_detected_case_insensitively() {
        let err = AgentError::ExecutionError {
            status: Some(403),
            payload: "Request had Insufficient Authentication Scopes.".to_string(),
        };
        assert!(err.is_scope_insufficient());
    }

    #[test]
    fn test_credential_errors_map_to_unauthorized() {
        let err = AgentError::InvalidCredentialError {
            reason: "empty".to_string(),
        };
        assert_eq!(err.http_status(), 401);
        assert_eq!(err.category(), ErrorCategory::Authentication);
    }

    #[test]
    fn test_bad_caller_input_maps_to_bad_request() {
        let err = AgentError::InvalidInputError {
            field: "spreadsheet_id".to_string(),
            value: "../x".to_string(),
            reason: "not an id".to_string(),
        };
        assert_eq!(err.http_status(), 400);
        let classified = ClassifiedError::classify(PipelineStage::Init, err);
        assert_eq!(classified.http_status(), 400);
        assert!(classified.message.contains("../x"));
    }

    #[test]
    fn test_transport_failures_are_retryable() {
        let err = AgentError::PushError {
            status: None,
            payload: "timed out".to_string(),
        };
        assert_eq!(err.severity(), ErrorSeverity::Medium);
    }
}
