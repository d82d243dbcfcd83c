use anyhow::Error;
use std::io::{self, Write};
use unicode_width::UnicodeWidthChar;

use crate::core::{CoordinatorPhase, EntitlementSnapshot, RecoveryToken, ReportIdentity, SessionOutcome};
use crate::engine::SessionReport;
use crate::store::{PruneOutcome, SnapshotEntry};

#[derive(Debug, Clone)]
pub struct UiConfig {
    pub color: bool,
    pub quiet: bool,
    pub verbose: bool,
}

pub fn eprintln_error(err: &Error) {
    let mut stderr = io::stderr().lock();
    let _ = writeln!(stderr, "エラー:");
    let _ = writeln!(stderr, "  {err}");

    let mut causes = err.chain().skip(1).peekable();
    if causes.peek().is_some() {
        let _ = writeln!(stderr, "原因:");
        for cause in causes {
            let _ = writeln!(stderr, "  - {cause}");
        }
    }

    let _ = writeln!(stderr, "次に:");
    let _ = writeln!(
        stderr,
        "  - 詳細を見るには `--verbose` を付けて再実行してください"
    );
    let _ = writeln!(
        stderr,
        "  - 利用可能なコマンド/オプションは `reportgate --help` を参照してください"
    );
}

pub fn print_session(report: &SessionReport, cfg: &UiConfig) {
    if cfg.quiet {
        return;
    }
    let outcome = &report.outcome;
    let mut out = io::stdout().lock();

    let _ = writeln!(
        out,
        "状態: {}  レポート: {}  ロック: {}",
        format_phase(outcome.phase, cfg.color),
        outcome
            .report_id
            .as_ref()
            .map_or("-", ReportIdentity::as_str),
        if outcome.unlocked { "解除" } else { "ロック中" }
    );
    if outcome.in_flight {
        let _ = writeln!(out, "- 同じレポートのスキャンが進行中のため、新たな呼び出しは行っていません");
    }
    if outcome.scan_calls > 0 {
        let _ = writeln!(out, "- スキャン呼び出し: {}回", outcome.scan_calls);
    }
    match &report.render {
        Some(render) => {
            let _ = writeln!(out, "- 表示: {:?}", render.source);
            if let Some(hint) = &render.input_hint {
                let _ = writeln!(out, "- 対象: {hint}");
            }
        }
        None if !outcome.rendered => {
            let _ = writeln!(out, "- 表示するレポートはありません（入力待ち）");
        }
        None => {}
    }
    for id in &report.unlock_events {
        let _ = writeln!(out, "- ロック解除: {id}");
    }
    if let Some(url) = &outcome.canonical_url {
        let _ = writeln!(out, "- URL: {url}");
    }

    if cfg.verbose {
        let _ = writeln!(out);
        print_trace_table(&mut out, outcome, cfg.color);
        if let Some(path) = &report.log_path {
            let _ = writeln!(out, "ログ: {path}");
        }
    }
}

pub fn print_token(token: Option<&RecoveryToken>, cfg: &UiConfig) {
    if cfg.quiet {
        return;
    }
    let mut out = io::stdout().lock();
    match token {
        Some(token) => {
            let _ = writeln!(out, "リカバリトークン: {}", token.report_identity_hint);
            if let Some(input) = token.input() {
                let _ = writeln!(out, "- 対象: {input}");
            }
        }
        None => {
            let _ = writeln!(out, "リカバリトークンはありません");
        }
    }
}

pub fn print_access(
    snapshot: &EntitlementSnapshot,
    check: Option<&ReportIdentity>,
    cfg: &UiConfig,
) {
    if cfg.quiet {
        return;
    }
    let mut out = io::stdout().lock();
    let _ = writeln!(
        out,
        "プラン: {}  購入済みレポート: {}件",
        if snapshot.is_pro { "Pro" } else { "Free" },
        snapshot.purchased_ids.len()
    );
    for id in &snapshot.purchased_ids {
        let _ = writeln!(out, "- {id}");
    }
    if let Some(id) = check {
        let granted = snapshot.grants(id);
        let _ = writeln!(
            out,
            "{id}: {}",
            if granted { "閲覧可" } else { "ロック中" }
        );
    }
}

pub fn print_snapshots(entries: &[SnapshotEntry], cfg: &UiConfig) {
    if cfg.quiet {
        return;
    }
    let mut out = io::stdout().lock();
    if entries.is_empty() {
        let _ = writeln!(out, "保存済みのレポートはありません");
        return;
    }

    let label_id = "レポートID";
    let label_analyzer = "解析";
    let label_size = "サイズ";
    let label_saved = "保存日時";

    let id_w = entries
        .iter()
        .map(|e| visible_width_ansi(&e.report_id))
        .max()
        .unwrap_or(0)
        .max(visible_width_ansi(label_id));
    let analyzer_w = entries
        .iter()
        .map(|e| visible_width_ansi(e.analyzer_key.as_deref().unwrap_or("-")))
        .max()
        .unwrap_or(0)
        .max(visible_width_ansi(label_analyzer));
    let size_w = entries
        .iter()
        .map(|e| visible_width_ansi(&format_bytes(e.bytes)))
        .max()
        .unwrap_or(0)
        .max(visible_width_ansi(label_size));

    let _ = writeln!(
        out,
        "{}  {}  {}  {}",
        pad_end_display(label_id, id_w),
        pad_end_display(label_analyzer, analyzer_w),
        pad_start_display(label_size, size_w),
        label_saved
    );
    let _ = writeln!(
        out,
        "{}  {}  {}  {}",
        "-".repeat(id_w),
        "-".repeat(analyzer_w),
        "-".repeat(size_w),
        "-".repeat(visible_width_ansi(label_saved))
    );
    for entry in entries {
        let mut saved = entry.saved_at.clone().unwrap_or_else(|| "-".to_string());
        if entry.corrupt {
            saved = paint("破損", "31", cfg.color);
        } else if entry.expired {
            saved = format!("{saved} {}", paint("(期限切れ)", "33", cfg.color));
        }
        let _ = writeln!(
            out,
            "{}  {}  {}  {saved}",
            pad_end_display(&entry.report_id, id_w),
            pad_end_display(entry.analyzer_key.as_deref().unwrap_or("-"), analyzer_w),
            pad_start_display(&format_bytes(entry.bytes), size_w),
        );
    }
}

pub fn print_prune(outcome: &PruneOutcome, cfg: &UiConfig) {
    if cfg.quiet {
        return;
    }
    let mut out = io::stdout().lock();
    let _ = writeln!(
        out,
        "削除: {}件  保持: {}件  エラー: {}件",
        outcome.removed.len(),
        outcome.kept,
        outcome.errors.len()
    );
    for id in &outcome.removed {
        let _ = writeln!(out, "- 削除: {id}");
    }
    for err in &outcome.errors {
        let _ = writeln!(out, "- エラー: {err}");
    }
}

fn print_trace_table(out: &mut dyn Write, outcome: &SessionOutcome, color: bool) {
    let label_step = "#";
    let label_phase = "フェーズ";
    let step_w = outcome.trace.len().to_string().len().max(label_step.len());
    let phase_w = outcome
        .trace
        .iter()
        .map(|p| visible_width_ansi(p.as_str()))
        .max()
        .unwrap_or(0)
        .max(visible_width_ansi(label_phase));

    let _ = writeln!(
        out,
        "{}  {}",
        pad_start_display(label_step, step_w),
        label_phase
    );
    let _ = writeln!(out, "{}  {}", "-".repeat(step_w), "-".repeat(phase_w));
    for (i, phase) in outcome.trace.iter().enumerate() {
        let _ = writeln!(
            out,
            "{}  {}",
            pad_start_display(&(i + 1).to_string(), step_w),
            pad_end_ansi(&format_phase(*phase, color), phase_w)
        );
    }
}

fn format_phase(phase: CoordinatorPhase, color: bool) -> String {
    let code = match phase {
        CoordinatorPhase::DisplayStored
        | CoordinatorPhase::DisplayFresh
        | CoordinatorPhase::ResultsRestored => "32",
        CoordinatorPhase::Degraded => "33",
        CoordinatorPhase::Idle => "90",
        _ => "36",
    };
    paint(phase.as_str(), code, color)
}

fn paint(s: &str, code: &str, color: bool) -> String {
    if !color {
        return s.to_string();
    }
    format!("\x1b[{code}m{s}\x1b[0m")
}

fn pad_end_ansi(s: &str, width: usize) -> String {
    let w = visible_width_ansi(s);
    if w >= width {
        return s.to_string();
    }
    format!("{s}{}", " ".repeat(width - w))
}

fn pad_end_display(s: &str, width: usize) -> String {
    pad_end_ansi(s, width)
}

fn pad_start_display(s: &str, width: usize) -> String {
    let w = visible_width_ansi(s);
    if w >= width {
        return s.to_string();
    }
    format!("{}{}", " ".repeat(width - w), s)
}

fn visible_width_ansi(s: &str) -> usize {
    let mut width: usize = 0;
    let mut chars = s.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '\x1b' && chars.peek() == Some(&'[') {
            let _ = chars.next();
            for ch2 in chars.by_ref() {
                if ch2 == 'm' {
                    break;
                }
            }
            continue;
        }
        width = width.saturating_add(UnicodeWidthChar::width(ch).unwrap_or(0));
    }
    width
}

pub fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;

    let b = bytes as f64;
    if b < KB {
        return format!("{bytes} B");
    }
    if b < MB {
        return format!("{:.1} KiB", b / KB);
    }
    format!("{:.1} MiB", b / MB)
}
