use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize)]
pub struct EffectiveConfig {
    pub backend: BackendConfig,
    pub session: SessionConfig,
    pub storage: StorageConfig,
    pub ui: UiConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendConfig {
    pub base_url: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionConfig {
    pub billing_timeout_ms: u64,
    pub identity_window_secs: u64,
    pub entitlement_max_age_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StorageConfig {
    /// Empty means `~/.config/reportgate/state`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
    pub snapshot_ttl_hours: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UiConfig {
    pub color: bool,
}

impl Default for EffectiveConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig {
                base_url: "http://127.0.0.1:8000/api".to_string(),
                request_timeout_secs: 30,
            },
            session: SessionConfig {
                billing_timeout_ms: 4000,
                identity_window_secs: 60,
                entitlement_max_age_secs: 300,
            },
            storage: StorageConfig {
                dir: None,
                snapshot_ttl_hours: 24 * 30,
            },
            ui: UiConfig { color: true },
            config_path: None,
        }
    }
}

impl EffectiveConfig {
    pub fn billing_timeout(&self) -> Duration {
        Duration::from_millis(self.session.billing_timeout_ms)
    }

    pub fn identity_window(&self) -> Duration {
        Duration::from_secs(self.session.identity_window_secs)
    }

    pub fn entitlement_max_age(&self) -> Duration {
        Duration::from_secs(self.session.entitlement_max_age_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.backend.request_timeout_secs)
    }

    pub fn snapshot_ttl(&self) -> Duration {
        Duration::from_secs(self.storage.snapshot_ttl_hours.saturating_mul(3600))
    }

    pub fn state_dir(&self, home_dir: &Path) -> PathBuf {
        match self.storage.dir.as_deref() {
            Some(dir) => expand_home(dir, home_dir),
            None => home_dir.join(".config/reportgate/state"),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    backend: Option<RawBackendConfig>,
    session: Option<RawSessionConfig>,
    storage: Option<RawStorageConfig>,
    ui: Option<RawUiConfig>,
}

#[derive(Debug, Deserialize)]
struct RawBackendConfig {
    base_url: Option<String>,
    request_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawSessionConfig {
    billing_timeout_ms: Option<u64>,
    identity_window_secs: Option<u64>,
    entitlement_max_age_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawStorageConfig {
    dir: Option<String>,
    snapshot_ttl_hours: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawUiConfig {
    color: Option<bool>,
}

pub fn default_config_path(home_dir: &Path) -> PathBuf {
    home_dir.join(".config/reportgate/config.toml")
}

/// `--config`, then `REPORTGATE_CONFIG`, then the default path.
pub fn resolve_config_path(flag: Option<&Path>, home_dir: &Path) -> PathBuf {
    if let Some(path) = flag {
        return path.to_path_buf();
    }
    match std::env::var("REPORTGATE_CONFIG") {
        Ok(v) if !v.trim().is_empty() => expand_home(v.trim(), home_dir),
        _ => default_config_path(home_dir),
    }
}

pub fn load(config_path: Option<&Path>, home_dir: &Path) -> Result<EffectiveConfig> {
    let mut cfg = EffectiveConfig::default();
    let path = resolve_config_path(config_path, home_dir);

    if path.exists() {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("設定ファイルの読み取りに失敗しました: {}", path.display()))?;
        let raw: RawConfig =
            toml::from_str(&s).context("設定ファイル(TOML)の解析に失敗しました")?;
        apply_raw_config(&mut cfg, raw);
        cfg.config_path = Some(path.display().to_string());
    } else if config_path.is_some() {
        anyhow::bail!("設定ファイルが見つかりません: {}", path.display());
    }

    apply_env_overrides(&mut cfg)?;
    validate(&cfg)?;

    Ok(cfg)
}

fn apply_raw_config(cfg: &mut EffectiveConfig, raw: RawConfig) {
    if let Some(backend) = raw.backend {
        if let Some(base_url) = backend.base_url {
            cfg.backend.base_url = base_url;
        }
        if let Some(secs) = backend.request_timeout_secs {
            cfg.backend.request_timeout_secs = secs;
        }
    }

    if let Some(session) = raw.session {
        if let Some(ms) = session.billing_timeout_ms {
            cfg.session.billing_timeout_ms = ms;
        }
        if let Some(secs) = session.identity_window_secs {
            cfg.session.identity_window_secs = secs;
        }
        if let Some(secs) = session.entitlement_max_age_secs {
            cfg.session.entitlement_max_age_secs = secs;
        }
    }

    if let Some(storage) = raw.storage {
        if let Some(dir) = storage.dir {
            cfg.storage.dir = Some(dir).filter(|d| !d.trim().is_empty());
        }
        if let Some(hours) = storage.snapshot_ttl_hours {
            cfg.storage.snapshot_ttl_hours = hours;
        }
    }

    if let Some(ui) = raw.ui {
        if let Some(color) = ui.color {
            cfg.ui.color = color;
        }
    }
}

fn apply_env_overrides(cfg: &mut EffectiveConfig) -> Result<()> {
    if let Ok(v) = std::env::var("REPORTGATE_BACKEND_URL") {
        let v = v.trim();
        if !v.is_empty() {
            cfg.backend.base_url = v.to_string();
        }
    }
    if let Ok(v) = std::env::var("REPORTGATE_REQUEST_TIMEOUT_SECS") {
        cfg.backend.request_timeout_secs = parse_u64(&v, "REPORTGATE_REQUEST_TIMEOUT_SECS")?;
    }
    if let Ok(v) = std::env::var("REPORTGATE_BILLING_TIMEOUT_MS") {
        cfg.session.billing_timeout_ms = parse_u64(&v, "REPORTGATE_BILLING_TIMEOUT_MS")?;
    }
    if let Ok(v) = std::env::var("REPORTGATE_IDENTITY_WINDOW_SECS") {
        cfg.session.identity_window_secs = parse_u64(&v, "REPORTGATE_IDENTITY_WINDOW_SECS")?;
    }
    if let Ok(v) = std::env::var("REPORTGATE_ENTITLEMENT_MAX_AGE_SECS") {
        cfg.session.entitlement_max_age_secs =
            parse_u64(&v, "REPORTGATE_ENTITLEMENT_MAX_AGE_SECS")?;
    }
    if let Ok(v) = std::env::var("REPORTGATE_STATE_DIR") {
        let v = v.trim();
        if !v.is_empty() {
            cfg.storage.dir = Some(v.to_string());
        }
    }
    if let Ok(v) = std::env::var("REPORTGATE_SNAPSHOT_TTL_HOURS") {
        cfg.storage.snapshot_ttl_hours = parse_u64(&v, "REPORTGATE_SNAPSHOT_TTL_HOURS")?;
    }
    if let Ok(v) = std::env::var("REPORTGATE_UI_COLOR") {
        cfg.ui.color = parse_bool(&v).with_context(|| "REPORTGATE_UI_COLOR")?;
    }

    Ok(())
}

fn validate(cfg: &EffectiveConfig) -> Result<()> {
    url::Url::parse(&cfg.backend.base_url)
        .with_context(|| format!("backend.base_url が不正です: {}", cfg.backend.base_url))?;
    if cfg.session.identity_window_secs == 0 {
        anyhow::bail!("session.identity_window_secs は 1 以上を指定してください");
    }
    if cfg.backend.request_timeout_secs == 0 {
        anyhow::bail!("backend.request_timeout_secs は 1 以上を指定してください");
    }
    Ok(())
}

fn expand_home(path: &str, home_dir: &Path) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => home_dir.join(rest),
        None if path == "~" => home_dir.to_path_buf(),
        None => PathBuf::from(path),
    }
}

fn parse_u64(s: &str, name: &str) -> Result<u64> {
    s.trim()
        .parse::<u64>()
        .with_context(|| format!("{name}: 数値が不正です: {s}"))
}

fn parse_bool(s: &str) -> Result<bool> {
    let s = s.trim().to_ascii_lowercase();
    match s.as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(anyhow::anyhow!(
            "真偽値が不正です: {s}（true|false|1|0|yes|no|on|off を指定してください）"
        )),
    }
}
