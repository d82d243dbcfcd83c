use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::core::{CoordinatorPhase, ReportIdentity, SessionOutcome};

const MAX_ERROR_BYTES: usize = 8 * 1024;

#[derive(Debug, Serialize)]
struct SessionLog {
    schema_version: &'static str,
    tool_version: String,
    command: String,
    started_at: String,
    finished_at: String,
    analyzer: String,
    page_url: String,
    state_dir: String,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    phase: Option<CoordinatorPhase>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    trace: Vec<CoordinatorPhase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    report_id: Option<ReportIdentity>,
    unlocked: bool,
    rendered: bool,
    scan_calls: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    unlock_events: Vec<ReportIdentity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug)]
pub struct SessionRecord<'a> {
    pub command: &'a str,
    pub analyzer: &'a str,
    pub page_url: &'a str,
    pub started_at: OffsetDateTime,
    pub finished_at: OffsetDateTime,
    pub outcome: Option<&'a SessionOutcome>,
    pub unlock_events: &'a [ReportIdentity],
    pub error: Option<String>,
}

pub fn logs_dir(state_dir: &Path) -> PathBuf {
    state_dir.join("logs")
}

pub fn write_session_log(
    state_dir: &Path,
    home_dir: &Path,
    record: &SessionRecord<'_>,
) -> Result<PathBuf> {
    let dir = logs_dir(state_dir);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("ログディレクトリの作成に失敗しました: {}", dir.display()))?;

    let pid = std::process::id();
    let ts = record.finished_at.unix_timestamp_nanos();
    let file_name = format!("{}-{pid}-{ts}.json", record.command.replace(' ', "-"));
    let path = dir.join(file_name);

    let outcome = record.outcome;
    let status = match (&record.error, outcome) {
        (Some(_), _) => "error",
        (None, Some(o)) if o.in_flight => "in_flight",
        (None, Some(_)) => "ok",
        (None, None) => "error",
    };

    let log = SessionLog {
        schema_version: "1.0",
        tool_version: env!("CARGO_PKG_VERSION").to_string(),
        command: record.command.to_string(),
        started_at: record
            .started_at
            .format(&Rfc3339)
            .unwrap_or_else(|_| "unknown".to_string()),
        finished_at: record
            .finished_at
            .format(&Rfc3339)
            .unwrap_or_else(|_| "unknown".to_string()),
        analyzer: record.analyzer.to_string(),
        page_url: record.page_url.to_string(),
        state_dir: mask_home(state_dir, home_dir),
        status,
        phase: outcome.map(|o| o.phase),
        trace: outcome.map(|o| o.trace.clone()).unwrap_or_default(),
        report_id: outcome.and_then(|o| o.report_id.clone()),
        unlocked: outcome.is_some_and(|o| o.unlocked),
        rendered: outcome.is_some_and(|o| o.rendered),
        scan_calls: outcome.map_or(0, |o| o.scan_calls),
        unlock_events: record.unlock_events.to_vec(),
        error: record
            .error
            .as_deref()
            .map(|e| truncate_string(e, MAX_ERROR_BYTES)),
    };

    let buf = serde_json::to_vec_pretty(&log).context("ログ(JSON)のシリアライズに失敗しました")?;
    std::fs::write(&path, buf)
        .with_context(|| format!("ログの書き込みに失敗しました: {}", path.display()))?;
    Ok(path)
}

fn mask_home(path: &Path, home_dir: &Path) -> String {
    let Ok(stripped) = path.strip_prefix(home_dir) else {
        return path.display().to_string();
    };
    let stripped = stripped.display().to_string();
    if stripped.is_empty() {
        "~".to_string()
    } else {
        format!("~/{stripped}")
    }
}

fn truncate_string(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut idx = max_bytes;
    while idx > 0 && !s.is_char_boundary(idx) {
        idx = idx.saturating_sub(1);
    }
    let head = &s[..idx];
    format!("{head}\n...(truncated, total={} bytes)", s.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn temp_home() -> PathBuf {
        static HOME_SEQ: AtomicU64 = AtomicU64::new(0);
        let seq = HOME_SEQ.fetch_add(1, Ordering::Relaxed);
        let home = std::env::temp_dir().join(format!(
            "reportgate-log-test-{}-{seq}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&home);
        std::fs::create_dir_all(&home).expect("create home");
        home
    }

    #[test]
    fn write_session_log_records_outcome_with_masked_state_dir() {
        let home = temp_home();
        let state = home.join(".config/reportgate/state");
        let outcome = SessionOutcome {
            phase: CoordinatorPhase::DisplayStored,
            trace: vec![
                CoordinatorPhase::Init,
                CoordinatorPhase::TryStored,
                CoordinatorPhase::DisplayStored,
            ],
            report_id: ReportIdentity::parse("abc123"),
            unlocked: true,
            rendered: true,
            scan_calls: 0,
            in_flight: false,
            canonical_url: None,
        };
        let now = OffsetDateTime::now_utc();
        let unlocks = vec![ReportIdentity::parse("abc123").expect("id")];
        let record = SessionRecord {
            command: "session",
            analyzer: "seo",
            page_url: "https://app.example/seo?report_id=abc123",
            started_at: now,
            finished_at: now,
            outcome: Some(&outcome),
            unlock_events: &unlocks,
            error: None,
        };

        let path = write_session_log(&state, &home, &record).expect("write log");
        assert!(path.starts_with(state.join("logs")));

        let v: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).expect("read log")).expect("parse json");
        assert_eq!(v["status"], "ok");
        assert_eq!(v["phase"], "DISPLAY_STORED");
        assert_eq!(v["state_dir"], "~/.config/reportgate/state");
        assert_eq!(v["trace"].as_array().map(Vec::len), Some(3));
        assert_eq!(v["unlock_events"][0], "abc123");
        assert!(v.get("error").is_none());

        let _ = std::fs::remove_dir_all(&home);
    }

    #[test]
    fn write_session_log_marks_errors_and_truncates_them() {
        let home = temp_home();
        let now = OffsetDateTime::now_utc();
        let record = SessionRecord {
            command: "scan",
            analyzer: "seo",
            page_url: "https://app.example/seo",
            started_at: now,
            finished_at: now,
            outcome: None,
            unlock_events: &[],
            error: Some("あ".repeat(MAX_ERROR_BYTES)),
        };

        let path = write_session_log(&home, &home, &record).expect("write log");
        let v: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).expect("read log")).expect("parse json");
        assert_eq!(v["status"], "error");
        assert_eq!(v["state_dir"], "~");
        let error = v["error"].as_str().expect("error string");
        assert!(error.contains("truncated"));

        let _ = std::fs::remove_dir_all(&home);
    }
}
