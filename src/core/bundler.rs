//! Turns a directory of support files into the ordered unit list of a push.
//!
//! Every pass starts with one synthesized manifest, followed by the files
//! under the root sorted by relative path.

use crate::domain::model::{FileKind, SourceUnit, MANIFEST_NAME};
use crate::utils::error::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Component, Path};
use walkdir::WalkDir;

/// Platform metadata written as the project's manifest file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub time_zone: String,
    pub exception_logging: String,
    pub runtime_version: String,
    pub oauth_scopes: Vec<String>,
    /// Needed for the project to be callable through the execution API.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_api: Option<ExecutionApi>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionApi {
    pub access: String,
}

#[derive(Debug, Clone)]
pub struct Bundler {
    manifest: Manifest,
}

impl Bundler {
    pub fn new(manifest: Manifest) -> Self {
        Self { manifest }
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn manifest_unit(&self) -> Result<SourceUnit> {
        let source = serde_json::to_string_pretty(&self.manifest)?;
        Ok(SourceUnit::new(MANIFEST_NAME, FileKind::Manifest, source))
    }

    pub fn bundle(&self, root: &Path) -> Result<Vec<SourceUnit>> {
        let metadata = fs::metadata(root).map_err(|e| bundling_error(root, e))?;
        if !metadata.is_dir() {
            return Err(AgentError::BundlingError {
                path: root.to_path_buf(),
                message: "not a directory".to_string(),
            });
        }
        fs::read_dir(root).map_err(|e| bundling_error(root, e))?;

        let mut files = Vec::new();
        for entry in WalkDir::new(root).follow_links(true).sort_by_file_name() {
            let entry = entry.map_err(|e| AgentError::BundlingError {
                path: e.path().unwrap_or(root).to_path_buf(),
                message: e.to_string(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let relative = path.strip_prefix(root).unwrap_or(path);
            let name = logical_name(relative);
            if name == MANIFEST_NAME {
                tracing::warn!(
                    "Skipping {} in favour of the generated manifest",
                    path.display()
                );
                continue;
            }

            let content = fs::read_to_string(path).map_err(|e| bundling_error(path, e))?;
            let kind = FileKind::from_extension(path.extension().and_then(|ext| ext.to_str()));
            files.push(SourceUnit::new(name, kind, content));
        }

        // stable, so `a.html` stays ahead of `a.js`
        files.sort_by(|a, b| a.name.cmp(&b.name));

        let mut units = Vec::with_capacity(files.len() + 1);
        units.push(self.manifest_unit()?);
        units.extend(files);

        tracing::debug!("Bundled {} units from {}", units.len(), root.display());
        Ok(units)
    }

    /// Generated units first, then the manifest and library files. Any
    /// manifest-named unit among `generated` is dropped.
    pub fn assemble(
        &self,
        generated: Vec<SourceUnit>,
        library_dir: Option<&Path>,
    ) -> Result<Vec<SourceUnit>> {
        let mut units: Vec<SourceUnit> = generated
            .into_iter()
            .filter(|unit| unit.name != MANIFEST_NAME)
            .collect();

        match library_dir {
            Some(dir) => units.extend(self.bundle(dir)?),
            None => units.push(self.manifest_unit()?),
        }
        Ok(units)
    }
}

fn bundling_error(path: &Path, e: std::io::Error) -> AgentError {
    AgentError::BundlingError {
        path: path.to_path_buf(),
        message: e.to_string(),
    }
}

/// `sub/dir/foo.js` -> `sub/dir/foo`, always with `/` separators.
fn logical_name(relative: &Path) -> String {
    let stem = relative.with_extension("");
    stem.components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
