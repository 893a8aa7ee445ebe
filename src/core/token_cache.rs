use crate::domain::model::Credential;
use crate::utils::error::Result;
use fs4::FileExt;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// JSON token cache guarded by an advisory lock on a sibling `.lock` file.
#[derive(Debug, Clone)]
pub struct TokenCache {
    path: PathBuf,
}

/// Held for the duration of a cache read or write; released on drop.
struct CacheLock {
    file: File,
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!("Failed to release token cache lock: {}", e);
        }
    }
}

impl TokenCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name: OsString = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| OsString::from("token.json"));
        name.push(suffix);
        self.path.with_file_name(name)
    }

    fn acquire_lock(&self, exclusive: bool) -> Result<CacheLock> {
        let lock_path = self.sibling(".lock");
        if let Some(parent) = lock_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)?;
        if exclusive {
            FileExt::lock_exclusive(&file)?;
        } else {
            FileExt::lock_shared(&file)?;
        }
        Ok(CacheLock { file })
    }

    /// Cached credential, or `None` when the cache is absent or unreadable.
    pub fn load(&self) -> Result<Option<Credential>> {
        let _lock = self.acquire_lock(false)?;
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str::<Credential>(&content) {
            Ok(credential) => Ok(Some(credential)),
            Err(e) => {
                tracing::warn!(
                    "Ignoring malformed token cache {}: {}",
                    self.path.display(),
                    e
                );
                Ok(None)
            }
        }
    }

    /// Write through a temp file and rename so readers never see a partial token.
    pub fn save(&self, credential: &Credential) -> Result<()> {
        let _lock = self.acquire_lock(true)?;
        let serialized = serde_json::to_string_pretty(credential)?;
        let tmp_path = self.sibling(".tmp");

        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(serialized.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        tracing::debug!("Token cache written to {}", self.path.display());
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        let _lock = self.acquire_lock(true)?;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn credential() -> Credential {
        Credential {
            access_token: "ya29.cached".to_string(),
            refresh_token: Some("1//refresh".to_string()),
            expiry: Some(chrono::Utc::now() + chrono::Duration::hours(1)),
            scopes: BTreeSet::from(["https://www.googleapis.com/auth/spreadsheets".to_string()]),
        }
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let cache = TokenCache::new(dir.path().join("token.json"));

        let saved = credential();
        cache.save(&saved).unwrap();
        let loaded = cache.load().unwrap().unwrap();

        assert_eq!(loaded, saved);
        assert!(!dir.path().join("token.json.tmp").exists());
    }

    #[test]
    fn test_missing_cache_is_none() {
        let dir = TempDir::new().unwrap();
        let cache = TokenCache::new(dir.path().join("absent.json"));
        assert!(cache.load().unwrap().is_none());
    }

    #[test]
    fn test_malformed_cache_is_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("token.json");
        fs::write(&path, "{not json").unwrap();

        let cache = TokenCache::new(&path);
        assert!(cache.load().unwrap().is_none());
    }

    #[test]
    fn test_concurrent_saves_leave_a_parseable_cache() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("token.json");
        TokenCache::new(&path).save(&credential()).unwrap();

        let writers: Vec<_> = (0..8)
            .map(|i| {
                let cache = TokenCache::new(&path);
                std::thread::spawn(move || {
                    for round in 0..10 {
                        let mut credential = credential();
                        credential.access_token = format!("ya29.writer-{}-{}", i, round);
                        cache.save(&credential).unwrap();
                        let seen = cache.load().unwrap();
                        assert!(seen.is_some(), "reader saw a partial cache");
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let last = TokenCache::new(&path).load().unwrap().unwrap();
        assert!(last.access_token.starts_with("ya29.writer-"));
        assert!(!dir.path().join("token.json.tmp").exists());
    }

    #[test]
    fn test_clear_removes_file() {
        let dir = TempDir::new().unwrap();
        let cache = TokenCache::new(dir.path().join("token.json"));
        cache.save(&credential()).unwrap();

        cache.clear().unwrap();
        assert!(cache.load().unwrap().is_none());
        cache.clear().unwrap();
    }
}
