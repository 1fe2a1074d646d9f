// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the metershim project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! SolisCloud HTTP client.
//!
//! Fetches the raw inverter detail for the configured serial number.
//! Focuses on robust networking and clear alert classification; the
//! control law lives in [`super::compensation`].
//!
//! Every request is signed the way the API demands: `Content-MD5` is the
//! Base64 MD5 of the body, `Date` is RFC-1123 GMT, and `Authorization`
//! carries `API <id>:<Base64(HMAC-SHA1(secret, canonical))>` over the
//! canonical string `"POST\n{md5}\n{content-type}\n{date}\n{path}"`.
//!
//! Numeric response fields arrive as numbers *or* strings depending on
//! firmware, several carry a sibling unit field, and the PV power can
//! live in any of four places. The parse helpers below absorb all of
//! that so the rest of the system sees clean kilowatts.

use base64::prelude::*;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use log::{debug, warn};
use md5::{Digest, Md5};
use rand::Rng;
use serde_json::Value;
use sha1::Sha1;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;

use crate::alerts::{AlertEngine, Severity};
use crate::config::CloudConfig;
use crate::snapshot::now_ms;

const PATH_INVERTER_DETAIL: &str = "/v1/api/inverterDetail";
const CONTENT_TYPE_JSON: &str = "application/json";

/// Retry delays after a failed attempt; jitter is added on top.
const RETRY_DELAYS_MS: [u64; 2] = [500, 1000];

/// PV readings at or below this are treated as missing; Solis sometimes
/// reports 0.0 on one field while the others are valid.
const PV_MIN_VALID_KW: f64 = 0.05;

/// One parsed inverter-detail reading.
#[derive(Debug, Clone, PartialEq)]
pub struct SolisDetail {
    /// Net grid power in kW: positive exports, negative imports.
    pub psum_kw: f64,
    /// Reported AC power (kW).
    pub pac_kw: Option<f64>,
    /// Chosen PV power (kW); may come from the AC side.
    pub pv_kw: Option<f64>,
    /// Plausible site load (kW).
    pub load_kw: Option<f64>,
    /// Inverter state: 1 online, 2 offline, 3 alarm.
    pub state: Option<i64>,
    /// Nonzero when the inverter reports a warning.
    pub warning_info: Option<i64>,
    /// When this reading was fetched (epoch ms).
    pub fetched_at_ms: u64,
}

/// HTTP client for the SolisCloud API.
pub struct SolisClient {
    config: CloudConfig,
    client: reqwest::Client,
    alerts: Arc<AlertEngine>,
}

impl SolisClient {
    pub fn new(config: CloudConfig, alerts: Arc<AlertEngine>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(4))
            .timeout(Duration::from_millis(config.request_timeout_ms.max(1000)))
            .user_agent("metershim/1.2 (+solis)")
            .build()
            .unwrap_or_default();
        Self {
            config,
            client,
            alerts,
        }
    }

    /// Fetch and parse the inverter detail.
    ///
    /// Network and API failures are classified into alerts here; the
    /// caller only distinguishes "fresh reading" from "no reading".
    pub async fn fetch_inverter_detail(&self) -> Option<SolisDetail> {
        let body = format!("{{\"sn\":\"{}\"}}", self.config.sn);
        let text = self.post_json_with_retry(PATH_INVERTER_DETAIL, &body).await?;

        let root: Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(e) => {
                self.alerts.raise(
                    "SOLIS_DOWN",
                    format!("Response is not JSON: {}", e),
                    Severity::Warn,
                );
                return None;
            }
        };

        let api_code = root
            .get("code")
            .map(value_to_string)
            .unwrap_or_default();
        if api_code != "0" {
            let msg = root.get("msg").map(value_to_string).unwrap_or_default();
            self.alerts.raise(
                "SOLIS_DOWN",
                format!("API code {} msg={}", api_code, msg),
                Severity::Warn,
            );
            return None;
        }

        let Some(data) = root.get("data").filter(|d| d.is_object()) else {
            self.alerts.raise(
                "SOLIS_DOWN",
                "Response missing 'data' object",
                Severity::Warn,
            );
            return None;
        };

        let detail = match parse_detail(data, now_ms()) {
            Ok(detail) => detail,
            Err(reason) => {
                self.alerts.raise("SOLIS_DOWN", reason, Severity::Warn);
                return None;
            }
        };

        debug!(
            "solis_rich psum={}kW pac={:?}kW pv={:?}kW load={:?}kW state={:?} warn={:?}",
            detail.psum_kw,
            detail.pac_kw,
            detail.pv_kw,
            detail.load_kw,
            detail.state,
            detail.warning_info
        );

        self.alerts.resolve("SOLIS_DOWN");
        self.alerts.resolve("SOLIS_AUTH");
        self.alerts.resolve("SOLIS_RATE_LIMIT");
        Some(detail)
    }

    /// POST the signed JSON body; retry on 429/5xx/timeout/IO.
    ///
    /// Returns the body only on HTTP 200. Alerts for the failure classes
    /// are raised in here so retries do not multiply them.
    async fn post_json_with_retry(&self, path: &str, body: &str) -> Option<String> {
        for attempt in 0..=RETRY_DELAYS_MS.len() {
            let content_md5 = md5_base64(body);
            let date_header = http_date_gmt();
            let canonical = format!(
                "POST\n{}\n{}\n{}\n{}",
                content_md5, CONTENT_TYPE_JSON, date_header, path
            );
            let signature = sign_hmac_sha1(&canonical, &self.config.api_secret);
            let authorization = format!("API {}:{}", self.config.api_id, signature);
            let url = join_url(&self.config.base_uri, path);

            let result = self
                .client
                .post(&url)
                .header("Accept", CONTENT_TYPE_JSON)
                .header("Content-Type", CONTENT_TYPE_JSON)
                .header("Content-MD5", content_md5)
                .header("Date", date_header)
                .header("Authorization", authorization)
                .body(body.to_string())
                .send()
                .await;

            match result {
                Ok(resp) => {
                    self.check_clock_skew(&resp);
                    let status = resp.status();

                    if status.is_success() {
                        return resp.text().await.ok();
                    }

                    let retryable = status.as_u16() == 429 || status.is_server_error();
                    if status.as_u16() == 401 || status.as_u16() == 403 {
                        self.alerts.raise(
                            "SOLIS_AUTH",
                            format!("HTTP {} — check API id/secret/Date", status),
                            Severity::Error,
                        );
                    } else if status.as_u16() == 429 {
                        self.alerts.raise(
                            "SOLIS_RATE_LIMIT",
                            "HTTP 429 — rate limited by Solis",
                            Severity::Warn,
                        );
                    } else if status.is_server_error() {
                        self.alerts.raise(
                            "SOLIS_DOWN",
                            format!("HTTP {} — server error", status),
                            Severity::Warn,
                        );
                    } else {
                        let snippet = resp.text().await.unwrap_or_default();
                        self.alerts.raise(
                            "SOLIS_DOWN",
                            format!("HTTP {} — {}", status, truncate(&snippet, 240)),
                            Severity::Warn,
                        );
                    }

                    if retryable && attempt < RETRY_DELAYS_MS.len() {
                        let sleep_ms = RETRY_DELAYS_MS[attempt] + jitter_ms();
                        warn!(
                            "solis_http_{} — retrying in {} ms (attempt {}/{})",
                            status.as_u16(),
                            sleep_ms,
                            attempt + 1,
                            RETRY_DELAYS_MS.len()
                        );
                        time::sleep(Duration::from_millis(sleep_ms)).await;
                        continue;
                    }
                    return None;
                }
                Err(e) => {
                    let kind = if e.is_timeout() { "timeout" } else { "I/O error" };
                    self.alerts.raise(
                        "SOLIS_DOWN",
                        format!("HTTP {}: {}", kind, e),
                        Severity::Warn,
                    );
                    if attempt < RETRY_DELAYS_MS.len() {
                        time::sleep(Duration::from_millis(
                            RETRY_DELAYS_MS[attempt] + jitter_ms(),
                        ))
                        .await;
                        continue;
                    }
                    return None;
                }
            }
        }
        None
    }

    /// Compare the server's `Date` header with our clock; a signed API
    /// rejects drifted requests, so surface the drift before it bites.
    fn check_clock_skew(&self, resp: &reqwest::Response) {
        let Some(server_date) = resp
            .headers()
            .get(reqwest::header::DATE)
            .and_then(|v| v.to_str().ok())
        else {
            return;
        };
        let Ok(parsed) = DateTime::parse_from_rfc2822(server_date) else {
            return;
        };
        let server_ms = parsed.timestamp_millis();
        let skew_ms = (server_ms - now_ms() as i64).unsigned_abs();
        if skew_ms > self.config.max_clock_skew_ms {
            self.alerts.raise(
                "SOLIS_CLOCK_SKEW",
                format!("Local time off by ~{} ms — check NTP", skew_ms),
                Severity::Warn,
            );
        } else {
            self.alerts.resolve("SOLIS_CLOCK_SKEW");
        }
    }
}

/// Parse the `data` object of a successful response.
pub fn parse_detail(data: &Value, fetched_at_ms: u64) -> Result<SolisDetail, String> {
    let Some(psum_kw) = node_num(data, "psum") else {
        return Err("Missing psum in response".to_string());
    };

    let pac_kw = node_num(data, "pac");
    let pv_kw = choose_pv_kw(data, pac_kw);

    let family_api_kw = read_with_unit_kw(data, "familyLoadPower", "familyLoadPowerStr");
    let total_api_kw = read_with_unit_kw(data, "totalLoadPower", "totalLoadPowerStr");
    let balance_kw = pv_kw.unwrap_or(0.0) + (-psum_kw).max(0.0) - psum_kw.max(0.0);
    let load_kw = pick_plausible_load(family_api_kw, total_api_kw, balance_kw);

    Ok(SolisDetail {
        psum_kw,
        pac_kw,
        pv_kw,
        load_kw: Some(load_kw),
        state: data.get("state").and_then(Value::as_i64),
        warning_info: data.get("warningInfoData").and_then(Value::as_i64),
        fetched_at_ms,
    })
}

/// Read a numeric field; tolerates numbers shipped as strings.
fn node_num(obj: &Value, field: &str) -> Option<f64> {
    match obj.get(field)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Read a value and convert to kW when the paired unit field says "W".
fn read_with_unit_kw(data: &Value, value_field: &str, unit_field: &str) -> Option<f64> {
    let v = node_num(data, value_field)?;
    let unit = data
        .get(unit_field)
        .and_then(Value::as_str)
        .unwrap_or_default();
    if unit.eq_ignore_ascii_case("W") {
        Some(v / 1000.0)
    } else {
        Some(v)
    }
}

/// PV per-string sum: `powTotal` (W) if present, else Σ pow1..pow32.
fn sum_pow_strings_kw(data: &Value) -> Option<f64> {
    if let Some(total_w) = node_num(data, "powTotal") {
        return Some(total_w / 1000.0);
    }
    let mut sum_w = 0.0;
    let mut any = false;
    for i in 1..=32 {
        if let Some(w) = node_num(data, &format!("pow{}", i))
            .or_else(|| node_num(data, &format!("Pow{}", i)))
        {
            sum_w += w;
            any = true;
        }
    }
    any.then_some(sum_w / 1000.0)
}

/// Choose the best PV power (kW): `pac`, then `dcPac` (unit-aware), then
/// the string sum, then `dcAcPower` (W). The first with real magnitude
/// wins; with nothing above the validity floor, the first non-null wins.
fn choose_pv_kw(data: &Value, pac_kw: Option<f64>) -> Option<f64> {
    let dc_pac_kw = read_with_unit_kw(data, "dcPac", "dcPacStr");
    let pow_sum_kw = sum_pow_strings_kw(data);
    let dc_ac_kw = node_num(data, "dcAcPower").map(|w| w / 1000.0);

    let candidates = [pac_kw, dc_pac_kw, pow_sum_kw, dc_ac_kw];
    for candidate in candidates.iter().flatten() {
        if *candidate > PV_MIN_VALID_KW {
            return Some(*candidate);
        }
    }
    candidates.iter().flatten().next().copied()
}

/// Take the API load when it is close to the physical balance; otherwise
/// trust the balance.
fn pick_plausible_load(
    family_api_kw: Option<f64>,
    total_api_kw: Option<f64>,
    balance_kw: f64,
) -> f64 {
    let tolerance = 0.6f64.max(balance_kw.abs() * 0.35);
    if let Some(family) = family_api_kw {
        if (family - balance_kw).abs() <= tolerance {
            return family;
        }
    }
    if let Some(total) = total_api_kw {
        if (total - balance_kw).abs() <= tolerance {
            return total;
        }
    }
    balance_kw
}

/// Base64(MD5(body)), as the `Content-MD5` header wants it.
fn md5_base64(body: &str) -> String {
    let digest = Md5::digest(body.as_bytes());
    BASE64_STANDARD.encode(digest)
}

/// RFC-1123 GMT date for the `Date` header.
fn http_date_gmt() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Base64(HMAC-SHA1(secret, canonical)).
fn sign_hmac_sha1(canonical: &str, secret: &str) -> String {
    let mut mac =
        Hmac::<Sha1>::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(canonical.as_bytes());
    BASE64_STANDARD.encode(mac.finalize().into_bytes())
}

fn jitter_ms() -> u64 {
    rand::thread_rng().gen_range(80..180)
}

fn value_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn truncate(s: &str, limit: usize) -> String {
    if s.len() <= limit {
        s.to_string()
    } else {
        let mut cut = limit;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}…", &s[..cut])
    }
}

fn join_url(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", &base[..base.len() - 1], path),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}
