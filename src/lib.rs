pub mod adapters;
pub mod app;
pub mod config;
pub mod core;
pub mod domain;
pub mod utils;

pub use adapters::storage::{LocalStorage, ProjectPointers};
pub use config::AgentConfig;
pub use core::{
    bundler::{Bundler, Manifest},
    credential_store::{CredentialSource, CredentialStore},
    pipeline::{DeploymentPipeline, PipelineSettings},
    project_manager::ProjectManager,
    token_cache::TokenCache,
};
pub use domain::model::{ExecutionResult, PipelineStage, SourceUnit, Target};
pub use utils::error::{AgentError, ClassifiedError, Result};
