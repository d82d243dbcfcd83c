use std::io;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, CommandFactory, Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use crate::core::ReportIdentity;
use crate::engine::{DEFAULT_TAB, Engine, EngineOptions, SessionRequest};
use crate::ui::UiConfig;

#[derive(Debug, Parser)]
#[command(
    name = "reportgate",
    version,
    about = "解析レポートの表示・購入後の復元・ロック解除を1ページ分のセッションとして実行する"
)]
pub struct Cli {
    #[arg(long, global = true)]
    pub json: bool,
    #[arg(long = "no-color", global = true)]
    pub no_color: bool,
    #[arg(long, global = true)]
    pub verbose: bool,
    #[arg(long, global = true)]
    pub quiet: bool,
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    /// Overall budget for one session in seconds.
    #[arg(long, global = true)]
    pub timeout: Option<u64>,
    /// Overrides `backend.base_url`.
    #[arg(long, global = true)]
    pub backend: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// One analyzer page load driven by its URL.
    Session(SessionArgs),
    /// Manual scan from the analyzer's input box.
    Scan(ScanArgs),
    /// Saves the recovery token before leaving for checkout.
    Checkout(CheckoutArgs),
    Token(TokenArgs),
    ReportId(ReportIdArgs),
    Access(AccessArgs),
    Snapshots(SnapshotsArgs),
    Completion(CompletionArgs),
    Config(ConfigArgs),
}

#[derive(Debug, Args)]
pub struct PageArgs {
    #[arg(long)]
    pub analyzer: String,
    /// Page URL; defaults to `http://localhost/<analyzer>`.
    #[arg(long)]
    pub page: Option<String>,
    #[arg(long, default_value = DEFAULT_TAB)]
    pub tab: String,
}

impl PageArgs {
    fn request(&self) -> SessionRequest {
        SessionRequest {
            analyzer: self.analyzer.clone(),
            page_url: self
                .page
                .clone()
                .unwrap_or_else(|| format!("http://localhost/{}", self.analyzer)),
            tab: self.tab.clone(),
        }
    }
}

#[derive(Debug, Args)]
pub struct SessionArgs {
    #[command(flatten)]
    pub page: PageArgs,
    /// Overrides `session.billing_timeout_ms`.
    #[arg(long)]
    pub billing_timeout_ms: Option<u64>,
}

#[derive(Debug, Args)]
pub struct ScanArgs {
    pub input: String,
    #[command(flatten)]
    pub page: PageArgs,
}

#[derive(Debug, Args)]
pub struct CheckoutArgs {
    #[arg(long)]
    pub report_id: String,
    #[arg(long)]
    pub page: String,
    #[arg(long)]
    pub input: Option<String>,
    #[arg(long, default_value = DEFAULT_TAB)]
    pub tab: String,
}

#[derive(Debug, Args)]
pub struct TokenArgs {
    #[command(subcommand)]
    pub command: TokenCommand,
    #[arg(long, default_value = DEFAULT_TAB, global = true)]
    pub tab: String,
}

#[derive(Debug, Subcommand)]
pub enum TokenCommand {
    Show,
    Clear,
}

#[derive(Debug, Args)]
pub struct ReportIdArgs {
    #[arg(long)]
    pub analyzer: String,
    pub input: String,
    /// Scan start time (RFC 3339); defaults to now.
    #[arg(long)]
    pub at: Option<String>,
}

#[derive(Debug, Args)]
pub struct AccessArgs {
    #[arg(long)]
    pub report_id: Option<String>,
}

#[derive(Debug, Args)]
pub struct SnapshotsArgs {
    #[command(subcommand)]
    pub command: SnapshotsCommand,
}

#[derive(Debug, Subcommand)]
pub enum SnapshotsCommand {
    List,
    /// Removes expired and unreadable snapshots.
    Prune,
}

#[derive(Debug, Args)]
pub struct CompletionArgs {
    pub shell: String,
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[arg(long)]
    pub show: bool,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    let stdout_is_tty = io::stdout().is_terminal();
    let stderr_is_tty = io::stderr().is_terminal();
    init_tracing(cli.verbose, cli.quiet, stderr_is_tty && !cli.no_color);

    let home_dir = crate::engine::effective_home_dir()?;
    let mut cfg = crate::config::load(cli.config.as_deref(), &home_dir)
        .map_err(crate::exit::invalid_args_err)?;
    if let Some(base_url) = cli.backend.as_deref() {
        cfg.backend.base_url = base_url.trim().to_string();
    }
    if let Commands::Session(args) = &cli.command {
        if let Some(ms) = args.billing_timeout_ms {
            cfg.session.billing_timeout_ms = ms;
        }
    }

    let ui_cfg = UiConfig {
        color: stdout_is_tty && cfg.ui.color && !cli.no_color,
        quiet: cli.quiet,
        verbose: cli.verbose,
    };

    let engine = Engine::new(
        cfg,
        EngineOptions {
            timeout: cli.timeout.filter(|t| *t > 0).map(Duration::from_secs),
            show_progress: stderr_is_tty && !cli.quiet && !cli.json,
            write_logs: true,
        },
    )?;

    match cli.command {
        Commands::Session(args) => {
            let report = engine.run_session(&args.page.request())?;
            if cli.json {
                write_json(&report)?;
            } else {
                crate::ui::print_session(&report, &ui_cfg);
            }
        }
        Commands::Scan(args) => {
            let report = engine.run_scan(&args.page.request(), &args.input)?;
            if cli.json {
                write_json(&report)?;
            } else {
                crate::ui::print_session(&report, &ui_cfg);
            }
        }
        Commands::Checkout(args) => {
            let return_url =
                engine.checkout(&args.tab, &args.page, &args.report_id, args.input.as_deref())?;
            if cli.json {
                write_json(&serde_json::json!({ "return_url": return_url }))?;
            } else if !ui_cfg.quiet {
                println!("リカバリトークンを保存しました");
                println!("決済後の戻り先: {return_url}");
            }
        }
        Commands::Token(args) => {
            let store = engine.token_store(&args.tab)?;
            match args.command {
                TokenCommand::Show => {
                    let token = store.read();
                    if cli.json {
                        write_json(&serde_json::json!({ "token": token }))?;
                    } else {
                        crate::ui::print_token(token.as_ref(), &ui_cfg);
                    }
                }
                TokenCommand::Clear => {
                    store.clear().map_err(crate::exit::backend_failed_err)?;
                    if !ui_cfg.quiet && !cli.json {
                        println!("リカバリトークンを削除しました");
                    }
                }
            }
        }
        Commands::ReportId(args) => {
            let at = match args.at.as_deref() {
                Some(s) => Some(
                    time::OffsetDateTime::parse(s, &time::format_description::well_known::Rfc3339)
                        .map_err(|e| crate::exit::invalid_args(format!("--at が不正です: {s}（{e}）")))?,
                ),
                None => None,
            };
            let id = engine.compute_report_id(&args.analyzer, &args.input, at)?;
            if cli.json {
                write_json(&serde_json::json!({ "report_id": id }))?;
            } else {
                println!("{id}");
            }
        }
        Commands::Access(args) => {
            let check = match args.report_id.as_deref() {
                Some(raw) => Some(ReportIdentity::parse(raw).ok_or_else(|| {
                    crate::exit::invalid_args(format!("レポートIDが不正です: {raw}"))
                })?),
                None => None,
            };
            let snapshot = engine.fetch_entitlements()?;
            if cli.json {
                let unlocked = check.as_ref().map(|id| snapshot.grants(id));
                write_json(&serde_json::json!({
                    "entitlement": snapshot,
                    "unlocked": unlocked,
                }))?;
            } else {
                crate::ui::print_access(&snapshot, check.as_ref(), &ui_cfg);
            }
        }
        Commands::Snapshots(args) => {
            let store = engine.snapshot_store();
            match args.command {
                SnapshotsCommand::List => {
                    let entries = store.list().map_err(crate::exit::backend_failed_err)?;
                    if cli.json {
                        write_json(&entries)?;
                    } else {
                        crate::ui::print_snapshots(&entries, &ui_cfg);
                    }
                }
                SnapshotsCommand::Prune => {
                    let outcome = store.prune().map_err(crate::exit::backend_failed_err)?;
                    if cli.json {
                        write_json(&outcome)?;
                    } else {
                        crate::ui::print_prune(&outcome, &ui_cfg);
                    }
                }
            }
        }
        Commands::Completion(args) => {
            let shell = parse_shell(&args.shell)?;
            let mut cmd = Cli::command();
            let mut out = std::io::stdout().lock();
            clap_complete::generate(shell, &mut cmd, "reportgate", &mut out);
        }
        Commands::Config(args) => {
            if args.show {
                if cli.json {
                    write_json(engine.config())?;
                } else {
                    println!("{}", toml::to_string_pretty(engine.config())?);
                }
            } else if !ui_cfg.quiet {
                eprintln!("config: `reportgate config --show` を使用してください");
            }
        }
    }

    Ok(())
}

/// `REPORTGATE_LOG` takes `EnvFilter` directives; `--verbose` adds
/// `reportgate=debug` on top.
fn init_tracing(verbose: bool, quiet: bool, ansi: bool) {
    let base = match std::env::var("REPORTGATE_LOG") {
        Ok(v) if !v.trim().is_empty() => v,
        _ if quiet => "error".to_string(),
        _ => "warn".to_string(),
    };
    let mut filter = EnvFilter::new(base);
    if verbose {
        if let Ok(directive) = "reportgate=debug".parse() {
            filter = filter.add_directive(directive);
        }
    }
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(ansi)
        .with_target(false)
        .try_init();
}

fn write_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    use std::io::Write;

    let buf = serde_json::to_vec_pretty(value)?;

    let mut stdout = std::io::stdout().lock();
    match stdout.write_all(&buf) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => return Ok(()),
        Err(err) => return Err(err.into()),
    }
    match stdout.write_all(b"\n") {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn parse_shell(s: &str) -> Result<clap_complete::Shell> {
    let s = s.trim().to_ascii_lowercase();
    match s.as_str() {
        "bash" => Ok(clap_complete::Shell::Bash),
        "zsh" => Ok(clap_complete::Shell::Zsh),
        "fish" => Ok(clap_complete::Shell::Fish),
        other => Err(crate::exit::invalid_args(format!(
            "未対応のシェルです: {other}（bash|zsh|fish を指定してください）"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn page_defaults_to_localhost_for_the_analyzer() {
        let cli = Cli::try_parse_from(["reportgate", "session", "--analyzer", "seo"]).unwrap();
        let Commands::Session(args) = cli.command else {
            panic!("expected session");
        };
        let req = args.page.request();
        assert_eq!(req.page_url, "http://localhost/seo");
        assert_eq!(req.tab, DEFAULT_TAB);
    }

    #[test]
    fn parse_shell_rejects_unknown_shells() {
        assert!(parse_shell("Zsh").is_ok());
        assert_eq!(
            crate::exit::exit_code(&parse_shell("tcsh").unwrap_err()),
            2
        );
    }
}
