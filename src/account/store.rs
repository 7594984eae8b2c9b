//! Persistent account store: file-locked, atomic-rename JSON persistence with
//! identity-based merge on every write.

use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use fs2::FileExt;
use tracing::{error, warn};

use crate::account::types::{Account, StorageDocument, STORAGE_VERSION};
use crate::error::{CoreError, Result};

pub struct PersistentAccountStore {
    path: PathBuf,
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

impl PersistentAccountStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the document, quarantining and returning an empty document on
    /// parse failure or schema mismatch.
    pub fn load(&self) -> Result<StorageDocument> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(StorageDocument::default());
            }
            Err(e) => return Err(CoreError::StorageIO(e)),
        };
        if contents.trim().is_empty() {
            return Ok(StorageDocument::default());
        }
        match serde_json::from_str::<StorageDocument>(&contents) {
            Ok(mut doc) if doc.version == STORAGE_VERSION => {
                doc.clamp_active_index();
                Ok(doc)
            }
            Ok(doc) => {
                warn!(found = doc.version, expected = STORAGE_VERSION, "older storage schema, migrating to empty baseline");
                Ok(StorageDocument::default())
            }
            Err(e) => {
                self.quarantine(&contents);
                error!(error = %e, "account store parse failure, quarantined");
                Ok(StorageDocument::default())
            }
        }
    }

    fn quarantine(&self, contents: &str) {
        let ts = now_ms();
        let quarantine_path = self
            .path
            .with_extension(format!("corrupt.{ts}.json"));
        if let Err(e) = fs::write(&quarantine_path, contents) {
            error!(error = %e, "failed to write quarantine file");
            return;
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(meta) = fs::metadata(&quarantine_path) {
                let mut perms = meta.permissions();
                perms.set_mode(0o600);
                let _ = fs::set_permissions(&quarantine_path, perms);
            }
        }
    }

    /// Overwrite the document: write-to-temp, then atomic rename, holding the
    /// exclusive lock for the whole operation.
    pub fn save(&self, doc: &StorageDocument) -> Result<()> {
        self.update_with_lock(|_| Ok(doc.clone()))
    }

    /// Read-modify-write under an exclusive file lock. `transform` receives the
    /// freshly-read on-disk document (never a stale snapshot) and returns the
    /// document to persist.
    pub fn update_with_lock<F>(&self, transform: F) -> Result<StorageDocument>
    where
        F: FnOnce(StorageDocument) -> Result<StorageDocument>,
    {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(CoreError::StorageIO)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.path)
            .map_err(CoreError::StorageIO)?;

        file.lock_exclusive()
            .map_err(|e| CoreError::StorageBusy(e.to_string()))?;

        let result = (|| -> Result<StorageDocument> {
            let mut contents = String::new();
            file.seek(SeekFrom::Start(0)).map_err(CoreError::StorageIO)?;
            file.read_to_string(&mut contents).map_err(CoreError::StorageIO)?;

            let current = if contents.trim().is_empty() {
                StorageDocument::default()
            } else {
                match serde_json::from_str::<StorageDocument>(&contents) {
                    Ok(mut doc) if doc.version == STORAGE_VERSION => {
                        doc.clamp_active_index();
                        doc
                    }
                    Ok(_) => StorageDocument::default(),
                    Err(e) => {
                        self.quarantine(&contents);
                        error!(error = %e, "account store parse failure during update, quarantined");
                        StorageDocument::default()
                    }
                }
            };

            let mut next = transform(current)?;
            next.clamp_active_index();

            let json = serde_json::to_string_pretty(&next).map_err(|e| {
                CoreError::StorageIO(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
            })?;

            let tmp_path = self.path.with_extension("json.tmp");
            {
                let mut tmp = OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&tmp_path)
                    .map_err(CoreError::StorageIO)?;
                tmp.write_all(json.as_bytes()).map_err(CoreError::StorageIO)?;
                tmp.sync_all().map_err(CoreError::StorageIO)?;
            }
            if let Err(e) = fs::rename(&tmp_path, &self.path) {
                let _ = fs::remove_file(&tmp_path);
                return Err(CoreError::StorageIO(e));
            }

            Ok(next)
        })();

        let _ = FileExt::unlock(&file);
        result
    }

    /// Create-or-merge a single account identity into the store.
    pub fn upsert_account(&self, account: Account) -> Result<StorageDocument> {
        self.update_with_lock(move |mut doc| {
            doc.merge_account(account);
            Ok(doc)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::types::{LastSwitchReason, Plan};
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn sample_account(id: &str) -> Account {
        Account {
            refresh_token: format!("rt-{id}"),
            account_id: Some(id.to_string()),
            email: Some(format!("{id}@example.com")),
            plan: Some(Plan::Pro),
            enabled: true,
            added_at: now_ms(),
            last_used: now_ms(),
            last_switch_reason: Some(LastSwitchReason::Initial),
            rate_limit_reset_times: HashMap::new(),
            cooling_down_until: None,
            cooldown_reason: None,
            access_token: Some("at".into()),
            expires_at: None,
            notes: None,
        }
    }

    #[test]
    fn round_trip_preserves_content() {
        let dir = tempdir().unwrap();
        let store = PersistentAccountStore::new(dir.path().join("accounts.json"));
        let mut doc = StorageDocument::default();
        doc.accounts.push(sample_account("a1"));
        doc.accounts.push(sample_account("a2"));
        store.save(&doc).unwrap();

        let reloaded = store.load().unwrap();
        assert_eq!(reloaded.accounts.len(), 2);
        assert_eq!(reloaded.accounts[0].account_id, Some("a1".to_string()));
        assert_eq!(reloaded.accounts[1].account_id, Some("a2".to_string()));
    }

    #[test]
    fn load_missing_file_returns_empty() {
        let dir = tempdir().unwrap();
        let store = PersistentAccountStore::new(dir.path().join("missing.json"));
        let doc = store.load().unwrap();
        assert!(doc.accounts.is_empty());
    }

    #[test]
    fn parse_failure_quarantines_and_treats_as_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("accounts.json");
        fs::write(&path, "{ not json").unwrap();
        let store = PersistentAccountStore::new(path.clone());

        let doc = store.load().unwrap();
        assert!(doc.accounts.is_empty());

        let siblings: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert!(siblings.iter().any(|n| n.contains("corrupt")));
    }

    #[test]
    fn update_with_lock_sees_current_state_not_stale_snapshot() {
        let dir = tempdir().unwrap();
        let store = PersistentAccountStore::new(dir.path().join("accounts.json"));
        store.upsert_account(sample_account("a1")).unwrap();
        store.upsert_account(sample_account("a2")).unwrap();

        let doc = store.load().unwrap();
        assert_eq!(doc.accounts.len(), 2);
    }

    #[test]
    fn write_is_atomic_no_tmp_left_on_success() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("accounts.json");
        let store = PersistentAccountStore::new(path.clone());
        store.upsert_account(sample_account("a1")).unwrap();
        assert!(!path.with_extension("json.tmp").exists());
        assert!(path.exists());
    }
}
