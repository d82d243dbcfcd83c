use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::Serialize;
use time::OffsetDateTime;
use tracing::debug;
use walkdir::WalkDir;

use crate::clock::Clock;
use crate::core::{NormalizedInput, ReportIdentity, StoredReport};

#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotMeta {
    pub analyzer_key: String,
    pub input: Option<NormalizedInput>,
    pub saved_at: OffsetDateTime,
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// `Ok(None)` for a missing or expired snapshot, `Err` for an unreadable one.
    async fn load(&self, id: &ReportIdentity) -> Result<Option<StoredReport>>;

    async fn save(
        &self,
        id: &ReportIdentity,
        payload: &serde_json::Value,
        meta: &SnapshotMeta,
    ) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    entries: Mutex<BTreeMap<ReportIdentity, StoredReport>>,
    loads: AtomicU32,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, report: StoredReport) {
        self.lock().insert(report.report_id.clone(), report);
    }

    pub fn get(&self, id: &ReportIdentity) -> Option<StoredReport> {
        self.lock().get(id).cloned()
    }

    pub fn loads(&self) -> u32 {
        self.loads.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<ReportIdentity, StoredReport>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn load(&self, id: &ReportIdentity) -> Result<Option<StoredReport>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(self.get(id))
    }

    async fn save(
        &self,
        id: &ReportIdentity,
        payload: &serde_json::Value,
        meta: &SnapshotMeta,
    ) -> Result<()> {
        self.insert(StoredReport {
            report_id: id.clone(),
            analyzer_key: meta.analyzer_key.clone(),
            input: meta.input.clone(),
            saved_at: meta.saved_at,
            payload: payload.clone(),
        });
        Ok(())
    }
}

pub struct FileSnapshotStore {
    dir: PathBuf,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotEntry {
    pub report_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analyzer_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saved_at: Option<String>,
    pub bytes: u64,
    pub expired: bool,
    pub corrupt: bool,
    #[serde(skip)]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PruneOutcome {
    pub removed: Vec<String>,
    pub kept: usize,
    pub errors: Vec<String>,
}

impl FileSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            dir: dir.into(),
            ttl,
            clock,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &ReportIdentity) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn is_expired(&self, saved_at: OffsetDateTime) -> bool {
        let age = self.clock.now() - saved_at;
        age > time::Duration::ZERO && age.unsigned_abs() > self.ttl
    }

    pub fn list(&self) -> Result<Vec<SnapshotEntry>> {
        if !self.dir.exists() {
            return Ok(vec![]);
        }
        let mut out = Vec::new();
        for entry in WalkDir::new(&self.dir).min_depth(1).max_depth(1) {
            let entry = entry.with_context(|| {
                format!("スナップショットの列挙に失敗しました: {}", self.dir.display())
            })?;
            let path = entry.path();
            if !entry.file_type().is_file()
                || path.extension().and_then(|e| e.to_str()) != Some("json")
            {
                continue;
            }
            let report_id = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            let bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
            let parsed = std::fs::read(path)
                .ok()
                .and_then(|buf| serde_json::from_slice::<StoredReport>(&buf).ok());
            let item = match parsed {
                Some(report) => SnapshotEntry {
                    report_id,
                    analyzer_key: Some(report.analyzer_key.clone()),
                    saved_at: report
                        .saved_at
                        .format(&time::format_description::well_known::Rfc3339)
                        .ok(),
                    bytes,
                    expired: self.is_expired(report.saved_at),
                    corrupt: false,
                    path: path.to_path_buf(),
                },
                None => SnapshotEntry {
                    report_id,
                    analyzer_key: None,
                    saved_at: None,
                    bytes,
                    expired: false,
                    corrupt: true,
                    path: path.to_path_buf(),
                },
            };
            out.push(item);
        }
        out.sort_by(|a, b| a.report_id.cmp(&b.report_id));
        Ok(out)
    }

    /// Removes expired and unreadable snapshots.
    pub fn prune(&self) -> Result<PruneOutcome> {
        let mut outcome = PruneOutcome::default();
        for entry in self.list()? {
            if !(entry.expired || entry.corrupt) {
                outcome.kept += 1;
                continue;
            }
            match std::fs::remove_file(&entry.path) {
                Ok(()) => outcome.removed.push(entry.report_id),
                Err(err) => outcome
                    .errors
                    .push(format!("{}: {err}", entry.path.display())),
            }
        }
        Ok(outcome)
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn load(&self, id: &ReportIdentity) -> Result<Option<StoredReport>> {
        let path = self.path_for(id);
        let buf = match tokio::fs::read(&path).await {
            Ok(buf) => buf,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("スナップショットの読み取りに失敗しました: {}", path.display())
                });
            }
        };
        let report: StoredReport = serde_json::from_slice(&buf).with_context(|| {
            format!("スナップショット(JSON)が壊れています: {}", path.display())
        })?;
        if &report.report_id != id {
            return Err(anyhow!(
                "スナップショットのreport_idが一致しません: {} != {id}",
                report.report_id
            ));
        }
        if self.is_expired(report.saved_at) {
            debug!(report_id = %id, "stored snapshot expired");
            return Ok(None);
        }
        Ok(Some(report))
    }

    async fn save(
        &self,
        id: &ReportIdentity,
        payload: &serde_json::Value,
        meta: &SnapshotMeta,
    ) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await.with_context(|| {
            format!("ディレクトリの作成に失敗しました: {}", self.dir.display())
        })?;
        let report = StoredReport {
            report_id: id.clone(),
            analyzer_key: meta.analyzer_key.clone(),
            input: meta.input.clone(),
            saved_at: meta.saved_at,
            payload: payload.clone(),
        };
        let buf = serde_json::to_vec_pretty(&report)
            .context("スナップショット(JSON)のシリアライズに失敗しました")?;

        let path = self.path_for(id);
        let tmp = self.dir.join(format!(".{id}.json.tmp"));
        tokio::fs::write(&tmp, buf).await.with_context(|| {
            format!("スナップショットの書き込みに失敗しました: {}", tmp.display())
        })?;
        tokio::fs::rename(&tmp, &path).await.with_context(|| {
            format!("スナップショットの書き込みに失敗しました: {}", path.display())
        })?;
        Ok(())
    }
}
