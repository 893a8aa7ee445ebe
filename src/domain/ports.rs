use crate::domain::model::{
    Credential, Deployment, ExecutionResult, GeneratedScript, ProjectHandle, SourceUnit,
    TokenGrant, Version,
};
use crate::utils::error::Result;
use async_trait::async_trait;

pub trait Storage: Send + Sync {
    fn read_file(&self, path: &str) -> impl std::future::Future<Output = Result<Vec<u8>>> + Send;
    fn write_file(
        &self,
        path: &str,
        data: &[u8],
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Exchanges a refresh token for a new access token.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant>;
}

/// Obtains a brand new grant by asking the user for consent.
#[async_trait]
pub trait InteractiveAuthorizer: Send + Sync {
    async fn authorize(&self, scopes: &[String]) -> Result<TokenGrant>;
}

/// Natural language instruction in, script code out.
#[async_trait]
pub trait CodeGenerator: Send + Sync {
    async fn generate(&self, instruction: &str) -> Result<GeneratedScript>;
}

/// Remote script-project lifecycle. Every call is handed a credential that
/// was valid when acquired; implementations never refresh.
#[async_trait]
pub trait ScriptPlatform: Send + Sync {
    async fn create_project(&self, credential: &Credential, container_id: &str)
        -> Result<ProjectHandle>;

    /// Replace the project's content with `units` and snapshot it as a new version.
    async fn push_content(
        &self,
        credential: &Credential,
        handle: &ProjectHandle,
        units: &[SourceUnit],
    ) -> Result<Version>;

    async fn create_deployment(
        &self,
        credential: &Credential,
        handle: &ProjectHandle,
        version: &Version,
    ) -> Result<Deployment>;

    async fn execute(
        &self,
        credential: &Credential,
        deployment: &Deployment,
        entry_point: &str,
        arguments: &[serde_json::Value],
    ) -> Result<ExecutionResult>;
}
