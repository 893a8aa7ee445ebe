use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::utils::logger::redact;

/// Logical name of the manifest every project carries exactly once.
pub const MANIFEST_NAME: &str = "appsscript";

/// Name of the unit that carries language-model output.
pub const GENERATED_UNIT_NAME: &str = "generated";

/// Seconds before the real expiry at which a credential is treated as expired.
pub const EXPIRY_SKEW_SECONDS: i64 = 60;

/// OAuth credential. Serialized form is the on-disk token cache.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    #[serde(rename = "token")]
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// `None` for caller-supplied bearer tokens whose lifecycle we do not own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scopes: BTreeSet<String>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &redact(&self.access_token))
            .field("refresh_token", &self.refresh_token.as_deref().map(redact))
            .field("expiry", &self.expiry)
            .field("scopes", &self.scopes)
            .finish()
    }
}

impl Credential {
    /// Build a credential from a token endpoint response. A grant without a
    /// refresh token keeps `previous_refresh`; a grant without a scope string
    /// is assumed to carry the requested scopes.
    pub fn from_grant(
        grant: TokenGrant,
        previous_refresh: Option<String>,
        requested_scopes: &[String],
    ) -> Self {
        let expiry = grant
            .expires_in
            .map(|secs| Utc::now() + chrono::Duration::seconds(secs));
        let scopes = match grant.scope.as_deref() {
            Some(scope) if !scope.trim().is_empty() => {
                scope.split_whitespace().map(str::to_string).collect()
            }
            _ => requested_scopes.iter().cloned().collect(),
        };

        Self {
            access_token: grant.access_token,
            refresh_token: grant.refresh_token.or(previous_refresh),
            expiry,
            scopes,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_within(0)
    }

    pub fn expires_within(&self, seconds: i64) -> bool {
        match self.expiry {
            Some(expiry) => Utc::now() + chrono::Duration::seconds(seconds) >= expiry,
            None => false,
        }
    }

    pub fn covers(&self, required: &[String]) -> bool {
        required.iter().all(|scope| self.scopes.contains(scope))
    }

    /// Usable right now for calls needing `required`.
    pub fn is_valid_for(&self, required: &[String]) -> bool {
        !self.access_token.is_empty()
            && !self.expires_within(EXPIRY_SKEW_SECONDS)
            && self.covers(required)
    }
}

/// Token endpoint response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileKind {
    #[serde(rename = "SERVER_JS")]
    ServerCode,
    #[serde(rename = "HTML")]
    Markup,
    #[serde(rename = "JSON")]
    Manifest,
    #[serde(rename = "ENUM_TYPE_UNSPECIFIED")]
    Unknown,
}

impl FileKind {
    pub fn from_extension(extension: Option<&str>) -> Self {
        match extension {
            Some("js") => Self::ServerCode,
            Some("html") => Self::Markup,
            Some("json") => Self::Manifest,
            _ => Self::Unknown,
        }
    }
}

/// One file of a project push. Serializes to the platform's file shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceUnit {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: FileKind,
    #[serde(rename = "source")]
    pub content: String,
}

impl SourceUnit {
    pub fn new(name: impl Into<String>, kind: FileKind, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectHandle {
    pub project_id: String,
    pub container_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub project_id: String,
    pub number: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deployment {
    pub deployment_id: String,
    pub version_number: u64,
    pub manifest_file: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StackFrame {
    pub function: Option<String>,
    pub line_number: Option<u64>,
}

/// Error raised by the deployed script itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScriptFailure {
    pub message: String,
    pub error_type: Option<String>,
    pub stack: Vec<StackFrame>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionResult {
    Returned { value: serde_json::Value },
    ScriptFailed { failure: ScriptFailure },
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        matches!(self, Self::Returned { .. })
    }

    pub fn value(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Returned { value } => Some(value),
            Self::ScriptFailed { .. } => None,
        }
    }
}

/// Output of the prompt generator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedScript {
    #[serde(default)]
    pub explanation: String,
    #[serde(default)]
    pub code: String,
}

/// What a cycle deploys into: a known project, or a container whose project
/// is looked up from (or recorded into) the pointer store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Project(String),
    Container(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Init,
    Authenticated,
    ContentPushed,
    Deployed,
    Executed,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "INIT",
            Self::Authenticated => "AUTHENTICATED",
            Self::ContentPushed => "CONTENT_PUSHED",
            Self::Deployed => "DEPLOYED",
            Self::Executed => "EXECUTED",
        };
        f.write_str(name)
    }
}

/// Everything one deploy-and-run cycle produced.
#[derive(Debug, Clone)]
pub struct DeployedRun {
    pub handle: ProjectHandle,
    pub version: Version,
    pub deployment: Deployment,
    pub result: ExecutionResult,
}

/// A deployed run plus the generator's explanation of the code it ran.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub explanation: String,
    pub run: DeployedRun,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scopes() -> Vec<String> {
        vec![
            "https://www.googleapis.com/auth/spreadsheets".to_string(),
            "https://www.googleapis.com/auth/script.projects".to_string(),
        ]
    }

    #[test]
    fn test_grant_without_refresh_token_keeps_previous() {
        let grant = TokenGrant {
            access_token: "new".to_string(),
            refresh_token: None,
            expires_in: Some(3600),
            scope: None,
            token_type: Some("Bearer".to_string()),
        };
        let credential = Credential::from_grant(grant, Some("old-refresh".to_string()), &scopes());

        assert_eq!(credential.refresh_token.as_deref(), Some("old-refresh"));
        assert!(credential.covers(&scopes()));
        assert!(credential.is_valid_for(&scopes()));
    }

    #[test]
    fn test_debug_output_hides_tokens() {
        let credential = Credential {
            access_token: "ya29.a0AfB_bysupersecretvalue".to_string(),
            refresh_token: Some("1//0gLongRefreshSecretValue".to_string()),
            expiry: None,
            scopes: BTreeSet::new(),
        };
        let printed = format!("{:?}", credential);
        assert!(!printed.contains("supersecret"));
        assert!(!printed.contains("RefreshSecret"));
        assert!(printed.contains("ya29.a***"));
    }

    #[test]
    fn test_expiry_skew() {
        let credential = Credential {
            access_token: "a".to_string(),
            refresh_token: None,
            expiry: Some(Utc::now() + chrono::Duration::seconds(30)),
            scopes: BTreeSet::new(),
        };
        assert!(!credential.is_expired());
        assert!(!credential.is_valid_for(&[]));
    }

    #[test]
    fn test_scope_string_is_split() {
        let grant = TokenGrant {
            access_token: "a".to_string(),
            refresh_token: None,
            expires_in: Some(3600),
            scope: Some("https://www.googleapis.com/auth/spreadsheets".to_string()),
            token_type: None,
        };
        let credential = Credential::from_grant(grant, None, &scopes());
        assert!(!credential.covers(&scopes()));
    }

    #[test]
    fn test_source_unit_wire_shape() {
        let unit = SourceUnit::new("lib/util", FileKind::ServerCode, "function a(){}");
        let value = serde_json::to_value(&unit).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"name": "lib/util", "type": "SERVER_JS", "source": "function a(){}"})
        );
    }

    #[test]
    fn test_kind_from_extension() {
        assert_eq!(FileKind::from_extension(Some("js")), FileKind::ServerCode);
        assert_eq!(FileKind::from_extension(Some("html")), FileKind::Markup);
        assert_eq!(FileKind::from_extension(Some("json")), FileKind::Manifest);
        assert_eq!(FileKind::from_extension(Some("gs")), FileKind::Unknown);
        assert_eq!(FileKind::from_extension(None), FileKind::Unknown);
    }
}
