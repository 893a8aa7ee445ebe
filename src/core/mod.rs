pub mod bundler;
pub mod credential_store;
pub mod pipeline;
pub mod project_manager;
pub mod token_cache;

pub use crate::domain::ports::{CodeGenerator, ScriptPlatform, Storage};
pub use crate::utils::error::Result;
