// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the metershim project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Meter-side serial bus configuration (Modbus RTU master).

use serde::{Deserialize, Serialize};

/// Configuration for the physical meter bus.
///
/// The reader polls holding registers (function 03) on this port and
/// publishes the raw register image. Timing knobs control the
/// retry/reopen policy described in the reader module.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeterConfig {
    /// Serial device path, e.g. `/dev/ttyUSB0`.
    pub port: String,

    /// Baud rate; framing is always 8-N-1.
    pub baud_rate: u32,

    /// Modbus slave id of the meter.
    pub slave_id: u8,

    /// Fixed delay between poll passes (ms).
    pub poll_interval_ms: u64,

    /// Delay before the first poll after boot (ms).
    pub initial_open_delay_ms: u64,

    /// Back-off after closing a failed port before the next attempt (ms).
    pub reopen_backoff_ms: u64,

    /// Grace period after opening during which timeouts do not count
    /// toward the reopen threshold (ms).
    pub warmup_ms: u64,

    /// Consecutive timeouts (past warmup) that force a close + reopen.
    pub timeouts_before_reopen: u32,

    /// Snapshot age that raises `METER_STALE` (ms).
    pub meter_stale_ms: u64,

    /// Minimum interval between repeated `METER_STALE` raises (ms).
    pub stale_alert_min_period_ms: u64,

    /// Failed register windows in one pass before the pass counts as a
    /// transport failure.
    pub max_window_errors_before_reopen: u32,

    /// Per-Modbus-request timeout (ms).
    pub request_timeout_ms: u64,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            slave_id: 1,
            poll_interval_ms: 1000,
            initial_open_delay_ms: 2000,
            reopen_backoff_ms: 2000,
            warmup_ms: 2000,
            timeouts_before_reopen: 3,
            meter_stale_ms: 15_000,
            stale_alert_min_period_ms: 60_000,
            max_window_errors_before_reopen: 2,
            request_timeout_ms: 1200,
        }
    }
}
