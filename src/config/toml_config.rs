use crate::core::bundler::{ExecutionApi, Manifest};
use crate::core::pipeline::{PipelineSettings, DEFAULT_ENTRY_POINT};
use crate::core::project_manager::DEFAULT_API_BASE;
use crate::utils::error::{AgentError, Result};
use crate::utils::validation::{
    validate_identifier, validate_non_empty_string, validate_path, validate_positive_number,
    validate_scopes, validate_url, Validate,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/spreadsheets",
    "https://www.googleapis.com/auth/script.projects",
];

pub const DEFAULT_LLM_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub platform: PlatformConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    pub api_base: String,
    pub script_title: String,
    pub time_zone: String,
    pub runtime_version: String,
    pub exception_logging: String,
    pub scopes: Vec<String>,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            script_title: "Sheet Agent Script".to_string(),
            time_zone: "America/New_York".to_string(),
            runtime_version: "V8".to_string(),
            exception_logging: "CLOUD".to_string(),
            scopes: DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    pub client_secrets_path: Option<PathBuf>,
    pub token_cache_path: PathBuf,
    /// Overrides the value found in the client secrets file.
    pub token_uri: Option<String>,
    pub auth_uri: Option<String>,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            client_secrets_path: None,
            token_cache_path: PathBuf::from("token.json"),
            token_uri: None,
            auth_uri: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    pub system_prompt: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_LLM_ENDPOINT.to_string(),
            model: "gpt-4".to_string(),
            api_key: None,
            system_prompt: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub library_dir: Option<PathBuf>,
    pub state_dir: PathBuf,
    pub entry_point: String,
    pub timeout_seconds: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            library_dir: None,
            state_dir: PathBuf::from(".sheet-agent"),
            entry_point: DEFAULT_ENTRY_POINT.to_string(),
            timeout_seconds: None,
        }
    }
}

impl AgentConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(|e| AgentError::ConfigError {
            message: format!("cannot read {}: {}", path.as_ref().display(), e),
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let processed_content = Self::substitute_env_vars(content)?;

        toml::from_str(&processed_content).map_err(|e| AgentError::ConfigError {
            message: format!("TOML parsing error: {}", e),
        })
    }

    /// Replace `${VAR}` with the environment value; unknown variables stay as written.
    fn substitute_env_vars(content: &str) -> Result<String> {
        let re = Regex::new(r"\$\{([^}]+)\}").map_err(|e| AgentError::ConfigError {
            message: e.to_string(),
        })?;

        let result = re.replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_else(|_| format!("${{{}}}", var_name))
        });

        Ok(result.to_string())
    }

    pub fn manifest(&self) -> Manifest {
        Manifest {
            time_zone: self.platform.time_zone.clone(),
            exception_logging: self.platform.exception_logging.clone(),
            runtime_version: self.platform.runtime_version.clone(),
            oauth_scopes: self.platform.scopes.clone(),
            execution_api: Some(ExecutionApi {
                access: "MYSELF".to_string(),
            }),
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            entry_point: self.pipeline.entry_point.clone(),
            library_dir: self.pipeline.library_dir.clone(),
            timeout: self.pipeline.timeout_seconds.map(Duration::from_secs),
        }
    }
}

impl Validate for AgentConfig {
    fn validate(&self) -> Result<()> {
        validate_url("platform.api_base", &self.platform.api_base)?;
        validate_non_empty_string("platform.script_title", &self.platform.script_title)?;
        validate_non_empty_string("platform.time_zone", &self.platform.time_zone)?;
        validate_scopes("platform.scopes", &self.platform.scopes)?;

        if let Some(uri) = &self.oauth.token_uri {
            validate_url("oauth.token_uri", uri)?;
        }
        if let Some(uri) = &self.oauth.auth_uri {
            validate_url("oauth.auth_uri", uri)?;
        }
        validate_path(
            "oauth.token_cache_path",
            &self.oauth.token_cache_path.to_string_lossy(),
        )?;

        validate_url("llm.endpoint", &self.llm.endpoint)?;
        validate_non_empty_string("llm.model", &self.llm.model)?;

        validate_path(
            "pipeline.state_dir",
            &self.pipeline.state_dir.to_string_lossy(),
        )?;
        if let Some(dir) = &self.pipeline.library_dir {
            validate_path("pipeline.library_dir", &dir.to_string_lossy())?;
        }
        validate_identifier("pipeline.entry_point", &self.pipeline.entry_point)?;
        if let Some(seconds) = self.pipeline.timeout_seconds {
            validate_positive_number("pipeline.timeout_seconds", seconds, 1)?;
        }

        Ok(())
    }
}
