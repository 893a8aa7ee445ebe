use crate::domain::ports::Storage;
use crate::utils::error::{AgentError, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct LocalStorage {
    base_path: String,
}

impl LocalStorage {
    pub fn new(base_path: impl Into<String>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }
}

impl Storage for LocalStorage {
    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let full_path = Path::new(&self.base_path).join(path);
        let data = fs::read(full_path)?;
        Ok(data)
    }

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        let full_path = Path::new(&self.base_path).join(path);

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(full_path, data)?;
        Ok(())
    }
}

const POINTER_SUFFIX: &str = ".script-id";

/// Container ids double as file names, so only letters, digits, `-`
/// and `_` are accepted.
pub fn validate_container_id(container_id: &str) -> Result<()> {
    let valid = !container_id.is_empty()
        && container_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid {
        return Err(AgentError::InvalidInputError {
            field: "spreadsheet_id".to_string(),
            value: container_id.to_string(),
            reason: "only letters, digits, '-' and '_' are allowed".to_string(),
        });
    }
    Ok(())
}

/// Remembers which remote project was created for which container, one
/// small text file per container.
#[derive(Debug, Clone)]
pub struct ProjectPointers<S: Storage> {
    storage: S,
}

impl<S: Storage> ProjectPointers<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    fn key(container_id: &str) -> Result<String> {
        validate_container_id(container_id)?;
        Ok(format!("{}{}", container_id, POINTER_SUFFIX))
    }

    pub async fn lookup(&self, container_id: &str) -> Result<Option<String>> {
        let key = Self::key(container_id)?;
        match self.storage.read_file(&key).await {
            Ok(data) => {
                let id = String::from_utf8_lossy(&data).trim().to_string();
                Ok(if id.is_empty() { None } else { Some(id) })
            }
            Err(AgentError::IoError(e)) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn record(&self, container_id: &str, project_id: &str) -> Result<()> {
        let key = Self::key(container_id)?;
        self.storage.write_file(&key, project_id.as_bytes()).await?;
        tracing::debug!("Recorded project {} for container {}", project_id, container_id);
        Ok(())
    }
}
