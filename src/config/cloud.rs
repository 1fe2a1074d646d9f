// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the metershim project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! SolisCloud API and compensation configuration.

use serde::{Deserialize, Serialize};

/// Cloud polling and compensation set-point configuration.
///
/// The API credentials sign every request (HMAC-SHA1 over the canonical
/// string); the remaining knobs shape the compensation control law:
/// minimum import gate, EMA smoothing, hard clamp and slew limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    /// SolisCloud API key id.
    pub api_id: String,

    /// SolisCloud API secret (HMAC key).
    pub api_secret: String,

    /// API base, e.g. `https://www.soliscloud.com`.
    pub base_uri: String,

    /// Serial number of the neighbouring inverter we watch.
    pub sn: String,

    /// Fixed delay between cloud polls (seconds).
    pub fetch_period_s: u64,

    /// Grid import below this threshold is ignored (kW).
    pub min_import_kw: f64,

    /// Readings older than this are treated as absent and force the
    /// set-point to zero (ms).
    pub max_data_age_ms: u64,

    /// EMA factor in [0, 1]; values outside (0, 1) disable smoothing.
    pub smoothing_factor: f64,

    /// Hard upper bound of the compensation set-point (kW).
    pub clamp_max_kw: f64,

    /// Maximum set-point movement per second (kW/s); multiplied by the
    /// fetch period to bound each step.
    pub delta_max_kw_per_sec: f64,

    /// Global kill switch: when false `current_delta_kw()` is always 0
    /// and the feeder does pure pass-through.
    pub override_enabled: bool,

    /// Per-HTTP-request timeout (ms).
    pub request_timeout_ms: u64,

    /// Server/client clock drift above this raises `SOLIS_CLOCK_SKEW` (ms).
    pub max_clock_skew_ms: u64,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            api_id: String::new(),
            api_secret: String::new(),
            base_uri: "https://www.soliscloud.com".to_string(),
            sn: String::new(),
            fetch_period_s: 10,
            min_import_kw: 0.2,
            max_data_age_ms: 300_000,
            smoothing_factor: 0.8,
            clamp_max_kw: 50.0,
            delta_max_kw_per_sec: 2.0,
            override_enabled: true,
            request_timeout_ms: 6000,
            max_clock_skew_ms: 90_000,
        }
    }
}

impl CloudConfig {
    /// True when all fields required for signed requests are present.
    pub fn has_credentials(&self) -> bool {
        !self.api_id.is_empty() && !self.api_secret.is_empty() && !self.sn.is_empty()
    }
}
