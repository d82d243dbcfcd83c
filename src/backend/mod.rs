use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::core::{NormalizedInput, ReportIdentity};
use crate::entitlement::{BillingBackend, BillingStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanCall {
    pub report_id: ReportIdentity,
    #[serde(rename = "url", skip_serializing_if = "Option::is_none")]
    pub input: Option<NormalizedInput>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

impl ScanResponse {
    /// The backend's own failure report, if it sent one.
    pub fn failure(&self) -> Option<String> {
        if self.success == Some(false) || self.error.is_some() {
            return Some(
                self.error
                    .clone()
                    .unwrap_or_else(|| "バックエンドがスキャン失敗を返しました".to_string()),
            );
        }
        None
    }

    pub fn into_payload(self) -> serde_json::Value {
        let mut payload = self.payload;
        if let Some(url) = self.screenshot_url {
            payload.insert("screenshotUrl".to_string(), serde_json::Value::String(url));
        }
        serde_json::Value::Object(payload)
    }
}

#[async_trait]
pub trait ScanBackend: Send + Sync {
    async fn scan(&self, analyzer_key: &str, call: &ScanCall) -> Result<ScanResponse>;
}

#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let parsed = Url::parse(base_url.trim())
            .with_context(|| format!("バックエンドURLが不正です: {base_url}"))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(anyhow!(
                "バックエンドURLは http/https である必要があります: {base_url}"
            ));
        }
        let client = reqwest::Client::builder()
            .connect_timeout(timeout.min(Duration::from_secs(15)))
            .timeout(timeout)
            .user_agent(concat!("reportgate/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("HTTPクライアントの初期化に失敗しました")?;
        Ok(Self {
            client,
            base_url: parsed.as_str().trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }
}

#[async_trait]
impl BillingBackend for HttpBackend {
    async fn fetch_status(&self) -> Result<BillingStatus> {
        let url = self.endpoint("billing-status");
        debug!(%url, "fetching billing status");
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("リクエストに失敗しました: GET {url}"))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!("billing-status が {status} を返しました"));
        }
        resp.json::<BillingStatus>()
            .await
            .context("billing-status の応答(JSON)を解析できません")
    }
}

#[async_trait]
impl ScanBackend for HttpBackend {
    async fn scan(&self, analyzer_key: &str, call: &ScanCall) -> Result<ScanResponse> {
        let url = self.endpoint(&format!("scan/{analyzer_key}"));
        debug!(%url, report_id = %call.report_id, "requesting scan");
        let resp = self
            .client
            .post(&url)
            .json(call)
            .send()
            .await
            .with_context(|| format!("リクエストに失敗しました: POST {url}"))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .with_context(|| format!("応答の読み取りに失敗しました: POST {url}"))?;
        let parsed = serde_json::from_str::<ScanResponse>(&body);
        if !status.is_success() {
            let detail = parsed
                .ok()
                .and_then(|r| r.error)
                .unwrap_or_else(|| body.trim().chars().take(200).collect());
            return Err(anyhow!("scan/{analyzer_key} が {status} を返しました: {detail}"));
        }
        parsed.with_context(|| format!("scan/{analyzer_key} の応答(JSON)を解析できません"))
    }
}
