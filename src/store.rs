//! File-backed record store
//!
//! Stands in for the remote record store when driving sessions from the
//! command line. Requests live in a TOML file:
//!
//! ```toml
//! [[request]]
//! id = "req-17"
//! user = "jdoe"
//! card_data = "tok_8f2a91c4"
//! issued_at = 1718000000
//! consumed = false
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rfaccess_core::payload::CardPayload;
use rfaccess_core::profile::CardProfile;
use rfaccess_core::ProgramRequest;
use rfaccess_session::{RecordStore, StoreError, UserId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors reading or writing the store file
#[derive(Debug, Error)]
pub enum FileStoreError {
    #[error("cannot access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed store file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("cannot serialize store: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("no request with id '{0}'")]
    UnknownRequest(String),
}

impl From<FileStoreError> for StoreError {
    fn from(e: FileStoreError) -> Self {
        StoreError::Unreachable(e.to_string())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default, rename = "request")]
    requests: Vec<StoredRequest>,
}

/// One request record as stored on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoredRequest {
    pub id: String,
    pub user: String,
    pub card_data: String,
    /// Unix seconds
    #[serde(default)]
    pub issued_at: u64,
    #[serde(default)]
    pub consumed: bool,
}

impl StoredRequest {
    fn issued_at(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(self.issued_at)
    }
}

/// Record store kept in a TOML file
///
/// A missing file is an empty store.
pub struct FileStore {
    path: PathBuf,
    profile: CardProfile,
    lock: Mutex<()>,
}

impl FileStore {
    /// Open a store file, laying out tokens for `profile`
    pub fn open(path: impl AsRef<Path>, profile: CardProfile) -> Result<Self, FileStoreError> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
            profile,
            lock: Mutex::new(()),
        };
        let count = store.load()?.requests.len();
        log::debug!("Opened record store {} ({} requests)", store.path.display(), count);
        Ok(store)
    }

    /// Every record, consumed ones included
    pub fn requests(&self) -> Result<Vec<StoredRequest>, FileStoreError> {
        Ok(self.load()?.requests)
    }

    fn load(&self) -> Result<StoreFile, FileStoreError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(StoreFile::default()),
            Err(source) => {
                return Err(FileStoreError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        Ok(toml::from_str(&content)?)
    }

    fn save(&self, file: &StoreFile) -> Result<(), FileStoreError> {
        let content = toml::to_string_pretty(file)?;
        fs::write(&self.path, content).map_err(|source| FileStoreError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

impl RecordStore for FileStore {
    fn list_pending(&self, user: &UserId) -> Result<Vec<ProgramRequest>, StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut records: Vec<StoredRequest> = self
            .load()?
            .requests
            .into_iter()
            .filter(|r| r.user == user.as_str() && !r.consumed)
            .collect();
        records.sort_by_key(|r| r.issued_at);

        let mut pending = Vec::with_capacity(records.len());
        for record in records {
            match CardPayload::from_token(&record.card_data, &self.profile) {
                Ok(payload) => {
                    let issued_at = record.issued_at();
                    pending.push(ProgramRequest::new(record.id, payload, issued_at));
                }
                Err(e) => log::warn!("Skipping request {}: {}", record.id, e),
            }
        }
        Ok(pending)
    }

    fn mark_consumed(&self, request_id: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = self.load()?;
        let record = file
            .requests
            .iter_mut()
            .find(|r| r.id == request_id)
            .ok_or_else(|| FileStoreError::UnknownRequest(request_id.to_string()))?;
        record.consumed = true;
        self.save(&file)?;
        log::debug!("Marked request {} consumed", request_id);
        Ok(())
    }
}

/// Store used when a request came from a launch URI and no file was given
///
/// It has nothing pending and accepts every consume notification.
pub struct DetachedStore;

impl RecordStore for DetachedStore {
    fn list_pending(&self, _user: &UserId) -> Result<Vec<ProgramRequest>, StoreError> {
        Ok(Vec::new())
    }

    fn mark_consumed(&self, request_id: &str) -> Result<(), StoreError> {
        log::info!("Request {} consumed (no store file to update)", request_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_store(dir: &TempDir, content: &str) -> PathBuf {
        let path = dir.path().join("store.toml");
        fs::write(&path, content).unwrap();
        path
    }

    const SAMPLE: &str = r#"
[[request]]
id = "late"
user = "jdoe"
card_data = "tok_late"
issued_at = 200

[[request]]
id = "early"
user = "jdoe"
card_data = "tok_early"
issued_at = 100

[[request]]
id = "done"
user = "jdoe"
card_data = "tok_done"
issued_at = 50
consumed = true

[[request]]
id = "other"
user = "asmith"
card_data = "tok_other"
issued_at = 10
"#;

    #[test]
    fn test_pending_is_per_user_and_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_store(&dir, SAMPLE);
        let store = FileStore::open(&path, CardProfile::default()).unwrap();

        let pending = store.list_pending(&UserId::new("jdoe")).unwrap();
        let ids: Vec<&str> = pending.iter().map(|r| r.id()).collect();
        assert_eq!(ids, vec!["early", "late"]);
        assert_eq!(pending[0].issued_at(), UNIX_EPOCH + Duration::from_secs(100));

        assert!(store.list_pending(&UserId::new("nobody")).unwrap().is_empty());
    }

    #[test]
    fn test_mark_consumed_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_store(&dir, SAMPLE);
        let store = FileStore::open(&path, CardProfile::default()).unwrap();

        store.mark_consumed("early").unwrap();
        let reopened = FileStore::open(&path, CardProfile::default()).unwrap();
        let pending = reopened.list_pending(&UserId::new("jdoe")).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id(), "late");
        assert_eq!(reopened.requests().unwrap().len(), 4);

        assert!(matches!(
            store.mark_consumed("missing"),
            Err(StoreError::Unreachable(_))
        ));
    }

    #[test]
    fn test_oversized_token_is_skipped() {
        let content = format!(
            "[[request]]\nid = \"big\"\nuser = \"jdoe\"\ncard_data = \"{}\"\n\n\
             [[request]]\nid = \"ok\"\nuser = \"jdoe\"\ncard_data = \"tok\"\n",
            "x".repeat(200)
        );
        let dir = tempfile::tempdir().unwrap();
        let path = temp_store(&dir, &content);
        let store = FileStore::open(&path, CardProfile::default()).unwrap();
        let pending = store.list_pending(&UserId::new("jdoe")).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id(), "ok");
    }

    #[test]
    fn test_missing_and_malformed_files() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        let store = FileStore::open(&missing, CardProfile::default()).unwrap();
        assert!(store.requests().unwrap().is_empty());

        let path = temp_store(&dir, "[[request]]\nid = 3\n");
        assert!(matches!(
            FileStore::open(&path, CardProfile::default()),
            Err(FileStoreError::Parse(_))
        ));
    }
}
