use std::time::Duration;

use time::OffsetDateTime;
use url::Url;

use crate::core::{NormalizedInput, ReportIdentity, SessionError};

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

const DIGEST_HEX_LEN: usize = 32;

pub fn normalize_input(raw: &str) -> Result<NormalizedInput, SessionError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(SessionError::invalid_input(raw, "空です"));
    }
    if trimmed.chars().any(char::is_whitespace) {
        return Err(SessionError::invalid_input(raw, "空白を含めることはできません"));
    }

    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };
    let url = Url::parse(&with_scheme)
        .map_err(|err| SessionError::invalid_input(raw, format!("URLとして解析できません: {err}")))?;

    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(SessionError::invalid_input(
                raw,
                format!("未対応のスキームです: {other}"),
            ));
        }
    }
    let host = url.host_str().unwrap_or_default().trim_end_matches('.');
    if host.is_empty() {
        return Err(SessionError::invalid_input(raw, "ホストがありません"));
    }

    let mut out = host.to_string();
    if let Some(port) = url.port() {
        out.push_str(&format!(":{port}"));
    }
    let path = url.path().trim_end_matches('/');
    out.push_str(path);
    if let Some(query) = url.query().filter(|q| !q.is_empty()) {
        out.push('?');
        out.push_str(query);
    }
    Ok(NormalizedInput::new(out))
}

pub fn time_bucket(at: OffsetDateTime, window: Duration) -> i64 {
    let secs = window.as_secs().max(1) as i64;
    at.unix_timestamp().div_euclid(secs)
}

pub fn compute_report_id(
    analyzer_key: &str,
    input: &NormalizedInput,
    scan_started_at: OffsetDateTime,
    window: Duration,
) -> ReportIdentity {
    let bucket = time_bucket(scan_started_at, window);

    let mut hasher = blake3::Hasher::new();
    hasher.update(analyzer_key.trim().as_bytes());
    hasher.update(&[0]);
    hasher.update(input.as_str().as_bytes());
    hasher.update(&[0]);
    hasher.update(&bucket.to_le_bytes());
    let hex = hasher.finalize().to_hex();

    ReportIdentity::from_digest(hex.as_str()[..DIGEST_HEX_LEN].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use time::macros::datetime;

    fn norm(s: &str) -> NormalizedInput {
        normalize_input(s).expect("normalize")
    }

    #[test]
    fn normalize_strips_scheme_case_and_trailing_slash() {
        assert_eq!(norm("example.com").as_str(), "example.com");
        assert_eq!(norm("HTTPS://Example.COM/").as_str(), "example.com");
        assert_eq!(norm("http://example.com/blog/").as_str(), "example.com/blog");
        assert_eq!(norm("example.com:8443/a?b=1").as_str(), "example.com:8443/a?b=1");
        assert_eq!(norm("https://example.com:443/").as_str(), "example.com");
        assert_eq!(norm("203.0.113.7").as_str(), "203.0.113.7");
    }

    #[test]
    fn normalize_rejects_unscannable_inputs() {
        for bad in [
            "",
            "   ",
            "exa mple.com",
            "ftp://example.com",
            "https://",
            ".",
            "https://.../",
        ] {
            let err = normalize_input(bad).expect_err(bad);
            assert!(matches!(err, SessionError::InvalidInput { .. }), "{bad}");
        }
    }

    #[test]
    fn identity_is_hex_and_stable_within_window() {
        let input = norm("example.com");
        let a = compute_report_id(
            "ip-reputation",
            &input,
            datetime!(2026-01-01 00:00:05 UTC),
            DEFAULT_WINDOW,
        );
        let b = compute_report_id(
            "ip-reputation",
            &input,
            datetime!(2026-01-01 00:00:59 UTC),
            DEFAULT_WINDOW,
        );
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), DIGEST_HEX_LEN);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));

        let next_window = compute_report_id(
            "ip-reputation",
            &input,
            datetime!(2026-01-01 00:01:00 UTC),
            DEFAULT_WINDOW,
        );
        assert_ne!(a, next_window);
    }

    #[test]
    fn identity_depends_on_analyzer() {
        let input = norm("example.com");
        let at = datetime!(2026-01-01 12:00:00 UTC);
        assert_ne!(
            compute_report_id("ip-reputation", &input, at, DEFAULT_WINDOW),
            compute_report_id("font-audit", &input, at, DEFAULT_WINDOW)
        );
    }

    #[test]
    fn time_bucket_handles_pre_epoch_times() {
        let w = Duration::from_secs(60);
        assert_eq!(time_bucket(datetime!(1969-12-31 23:59:59 UTC), w), -1);
        assert_eq!(time_bucket(OffsetDateTime::UNIX_EPOCH, w), 0);
    }

    fn host() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9]{0,12}\\.(com|net|org|io)"
    }

    proptest! {
        #[test]
        fn same_window_yields_same_identity(
            h in host(),
            bucket in 0i64..50_000_000,
            off1 in 0i64..60,
            off2 in 0i64..60,
        ) {
            let input = norm(&h);
            let t1 = OffsetDateTime::from_unix_timestamp(bucket * 60 + off1).unwrap();
            let t2 = OffsetDateTime::from_unix_timestamp(bucket * 60 + off2).unwrap();
            prop_assert_eq!(
                compute_report_id("site-crawler", &input, t1, DEFAULT_WINDOW),
                compute_report_id("site-crawler", &input, t2, DEFAULT_WINDOW)
            );
        }

        #[test]
        fn distinct_inputs_yield_distinct_identities(
            a in host(),
            b in host(),
            ts in 0i64..3_000_000_000,
        ) {
            prop_assume!(a != b);
            let at = OffsetDateTime::from_unix_timestamp(ts).unwrap();
            prop_assert_ne!(
                compute_report_id("ip-reputation", &norm(&a), at, DEFAULT_WINDOW),
                compute_report_id("ip-reputation", &norm(&b), at, DEFAULT_WINDOW)
            );
        }
    }
}
