use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, warn};

use crate::core::RecoveryToken;

pub const TOKEN_KEY: &str = "reportgate.recoveryToken";

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries().remove(key);
        Ok(())
    }
}

/// One JSON object per file; one file is one tab scope.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn for_tab(state_dir: &Path, tab: &str) -> Result<Self> {
        let tab = tab.trim();
        if tab.is_empty()
            || !tab
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(anyhow!(
                "タブIDが不正です: {tab}（英数字と - _ のみ指定できます）"
            ));
        }
        Ok(Self::new(state_dir.join("tabs").join(format!("{tab}.json"))))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<BTreeMap<String, String>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let s = std::fs::read_to_string(&self.path).with_context(|| {
            format!("タブストレージの読み取りに失敗しました: {}", self.path.display())
        })?;
        if s.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&s).with_context(|| {
            format!("タブストレージ(JSON)の解析に失敗しました: {}", self.path.display())
        })
    }

    fn delete_file(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| {
                format!("タブストレージの削除に失敗しました: {}", self.path.display())
            }),
        }
    }

    fn write_all(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("ディレクトリの作成に失敗しました: {}", parent.display())
            })?;
        }
        let buf = serde_json::to_vec_pretty(entries)
            .context("タブストレージ(JSON)のシリアライズに失敗しました")?;
        std::fs::write(&self.path, buf).with_context(|| {
            format!("タブストレージの書き込みに失敗しました: {}", self.path.display())
        })
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.read_all()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.read_all().unwrap_or_default();
        entries.insert(key.to_string(), value.to_string());
        self.write_all(&entries)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = match self.read_all() {
            Ok(entries) => entries,
            Err(err) => {
                warn!(error = %err, path = %self.path.display(), "discarding unreadable tab storage");
                return self.delete_file();
            }
        };
        if entries.remove(key).is_none() {
            return Ok(());
        }
        if entries.is_empty() {
            return self.delete_file();
        }
        self.write_all(&entries)
    }
}

pub struct RecoveryTokenStore {
    storage: Arc<dyn KeyValueStore>,
}

impl RecoveryTokenStore {
    pub fn new(storage: Arc<dyn KeyValueStore>) -> Self {
        Self { storage }
    }

    pub fn save(&self, token: &RecoveryToken) -> Result<()> {
        let value = serde_json::to_string(token)
            .context("リカバリトークンのシリアライズに失敗しました")?;
        self.storage.set(TOKEN_KEY, &value)?;
        debug!(hint = %token.report_identity_hint, "recovery token saved");
        Ok(())
    }

    /// Unreadable or corrupted tokens read as absent and are dropped.
    pub fn read(&self) -> Option<RecoveryToken> {
        let raw = match self.storage.get(TOKEN_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(err) => {
                warn!(error = %err, "recovery token storage unreadable");
                return None;
            }
        };
        match serde_json::from_str::<RecoveryToken>(&raw) {
            Ok(token) if !token.report_identity_hint.trim().is_empty() => Some(token),
            Ok(_) | Err(_) => {
                warn!("dropping corrupted recovery token");
                if let Err(err) = self.storage.remove(TOKEN_KEY) {
                    warn!(error = %err, "failed to drop corrupted recovery token");
                }
                None
            }
        }
    }

    pub fn clear(&self) -> Result<()> {
        self.storage.remove(TOKEN_KEY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn temp_dir() -> PathBuf {
        static SEQ: AtomicU64 = AtomicU64::new(0);
        let seq = SEQ.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!(
            "reportgate-recovery-test-{}-{seq}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).expect("create dir");
        dir
    }

    #[test]
    fn save_read_clear_round_trip_in_memory() {
        let store = RecoveryTokenStore::new(Arc::new(MemoryStore::new()));
        assert!(store.read().is_none());

        store
            .save(&RecoveryToken::new("abc123", "example.com"))
            .expect("save");
        let token = store.read().expect("token");
        assert_eq!(token.report_identity_hint, "abc123");
        assert_eq!(token.input(), Some("example.com"));

        store.clear().expect("clear");
        assert!(store.read().is_none());
    }

    #[test]
    fn second_save_replaces_the_live_token() {
        let store = RecoveryTokenStore::new(Arc::new(MemoryStore::new()));
        store.save(&RecoveryToken::new("first", "")).expect("save");
        store.save(&RecoveryToken::new("second", "")).expect("save");
        assert_eq!(
            store.read().map(|t| t.report_identity_hint),
            Some("second".to_string())
        );
    }

    #[test]
    fn corrupted_token_reads_as_absent_and_is_removed() {
        let storage = Arc::new(MemoryStore::new());
        storage.set(TOKEN_KEY, "{not json").expect("set");
        let store = RecoveryTokenStore::new(storage.clone());
        assert!(store.read().is_none());
        assert_eq!(storage.get(TOKEN_KEY).expect("get"), None);

        storage
            .set(TOKEN_KEY, r#"{"reportIdentityHint":"  "}"#)
            .expect("set");
        assert!(store.read().is_none());
    }

    #[test]
    fn token_wire_format_uses_camel_case() {
        let storage = Arc::new(MemoryStore::new());
        let store = RecoveryTokenStore::new(storage.clone());
        store
            .save(&RecoveryToken::new("abc123", "example.com"))
            .expect("save");
        let raw = storage.get(TOKEN_KEY).expect("get").expect("present");
        let v: serde_json::Value = serde_json::from_str(&raw).expect("json");
        assert_eq!(v["reportIdentityHint"], "abc123");
        assert_eq!(v["inputHint"], "example.com");
    }

    #[test]
    fn file_store_persists_per_tab() {
        let dir = temp_dir();
        let tab_a = FileStore::for_tab(&dir, "tab-a").expect("tab a");
        let tab_b = FileStore::for_tab(&dir, "tab-b").expect("tab b");

        RecoveryTokenStore::new(Arc::new(tab_a.clone()))
            .save(&RecoveryToken::new("abc123", "example.com"))
            .expect("save");

        let reopened = RecoveryTokenStore::new(Arc::new(FileStore::for_tab(&dir, "tab-a").unwrap()));
        assert_eq!(
            reopened.read().map(|t| t.report_identity_hint),
            Some("abc123".to_string())
        );
        assert!(RecoveryTokenStore::new(Arc::new(tab_b)).read().is_none());

        reopened.clear().expect("clear");
        assert!(!tab_a.path().exists());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn file_store_rejects_path_like_tab_ids() {
        let dir = temp_dir();
        assert!(FileStore::for_tab(&dir, "../escape").is_err());
        assert!(FileStore::for_tab(&dir, "").is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
