// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the metershim project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Status assembler: the read-side view of the whole pipeline.
//!
//! Collects decoded meter values, the published output image, the
//! compensation state and the last cloud fields into one flat record for
//! external consumers, and logs a one-line summary every 30 seconds.
//! Decoding uses the native Acrel units: voltages 0.1 V × PT at 97..=99,
//! currents 0.01 A × CT at 100..=102, powers W / (PT × CT) as signed
//! 32-bit big-endian at 356..=363.

use log::{info, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;

use crate::cloud::Compensation;
use crate::codec::{read_i32_be, read_u16};
use crate::config::{CloudConfig, ControlConfig};
use crate::control::{REG_I1, REG_P_TOTAL, REG_V1};
use crate::feeder::InverterFeeder;
use crate::snapshot::{now_ms, MeterDataSource};

/// Flat status record for the UI / health consumers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusView {
    /// Grid import derived from the raw psum (kW).
    pub grid_import_kw: f64,
    /// Raw cloud psum (kW, + export / − import); `None` before first fetch.
    pub grid_raw_psum_kw: Option<f64>,
    pub min_import_kw: f64,
    /// The compensation currently applied (safety-gated, kW).
    pub compensation_kw: f64,
    /// Age of the newest cloud update (ms), −1 before the first.
    pub grid_age_ms: i64,

    pub override_enabled: bool,
    /// `NORMAL` when compensating, `PASS-THRU` otherwise.
    pub mode: String,

    pub sm_v1: f64,
    pub sm_v2: f64,
    pub sm_v3: f64,
    pub sm_i1: f64,
    pub sm_i2: f64,
    pub sm_i3: f64,
    /// Meter total active power (W).
    pub sm_p_total_w: i64,
    /// Meter snapshot age (ms), −1 before the first read.
    pub sm_age_ms: i64,
    pub sm_age_human: String,

    pub out_i1: f64,
    pub out_i2: f64,
    pub out_i3: f64,
    /// Total power the inverter currently reads (W).
    pub out_p_total_w: i64,
    /// Output image age (ms), −1 before the first publish.
    pub out_age_ms: i64,
    pub out_age_human: String,

    /// PV power reported by the cloud (kW).
    pub pv_kw: Option<f64>,
    /// Site load (kW).
    pub load_kw: Option<f64>,
    /// ONLINE / OFFLINE / ALARM / numeric / "-".
    pub solis_state: String,
    /// True while the cloud reports an alarm or warning.
    pub alarm: bool,
}

impl StatusView {
    /// Health rule: UP iff the cloud is ONLINE and the meter snapshot is
    /// fresher than 30 s.
    pub fn health_up(&self) -> bool {
        self.solis_state == "ONLINE" && self.sm_age_ms >= 0 && self.sm_age_ms < 30_000
    }
}

/// Pure read-side aggregator over the live components.
pub struct StatusAssembler {
    data: MeterDataSource,
    compensation: Arc<Compensation>,
    feeder: Arc<InverterFeeder>,
    control: ControlConfig,
    cloud: CloudConfig,
}

impl StatusAssembler {
    pub fn new(
        data: MeterDataSource,
        compensation: Arc<Compensation>,
        feeder: Arc<InverterFeeder>,
        control: ControlConfig,
        cloud: CloudConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            data,
            compensation,
            feeder,
            control,
            cloud,
        })
    }

    /// Snapshot everything relevant into one record.
    pub fn build_status_view(&self) -> StatusView {
        let now = now_ms();
        let pt = self.control.scale_pt;
        let ct = self.control.scale_ct;

        let snapshot = self.data.latest();
        let sm_age_ms = snapshot.age_ms(now).map(|a| a as i64).unwrap_or(-1);
        let (sm_v, sm_i) = decode_phases(&snapshot.words, pt, ct);
        let sm_p_total_w = (read_i32_be(&snapshot.words, REG_P_TOTAL) as f64 * pt * ct).round() as i64;

        let out = self.feeder.last_output_image();
        let last_write = self.feeder.last_write_at_ms();
        let out_age_ms = if last_write == 0 {
            -1
        } else {
            now.saturating_sub(last_write) as i64
        };
        let (out_i, out_p_total_w) = match out.as_deref() {
            Some(words) => {
                let (_, currents) = decode_phases(words, pt, ct);
                let total = (read_i32_be(words, REG_P_TOTAL) as f64 * pt * ct).round() as i64;
                (currents, total)
            }
            None => ([0.0; 3], 0),
        };

        let (fields, _raw_delta, last_update_ms) = self.compensation.status_fields();
        let compensation_kw = self.compensation.current_delta_kw();
        let grid_age_ms = if last_update_ms == 0 {
            -1
        } else {
            now.saturating_sub(last_update_ms) as i64
        };
        let grid_import_kw = fields
            .psum_kw
            .map(|p| (-p).max(0.0))
            .unwrap_or(0.0);
        let alarm = fields.state.map(|s| s == 3).unwrap_or(false)
            || fields.warning_info.map(|w| w != 0).unwrap_or(false);

        StatusView {
            grid_import_kw: round3(grid_import_kw),
            grid_raw_psum_kw: fields.psum_kw.map(round3),
            min_import_kw: round3(self.cloud.min_import_kw),
            compensation_kw: round3(compensation_kw),
            grid_age_ms,
            override_enabled: self.cloud.override_enabled,
            mode: if self.cloud.override_enabled {
                "NORMAL".to_string()
            } else {
                "PASS-THRU".to_string()
            },
            sm_v1: round1(sm_v[0]),
            sm_v2: round1(sm_v[1]),
            sm_v3: round1(sm_v[2]),
            sm_i1: round2(sm_i[0]),
            sm_i2: round2(sm_i[1]),
            sm_i3: round2(sm_i[2]),
            sm_p_total_w,
            sm_age_ms,
            sm_age_human: humanize_age(sm_age_ms),
            out_i1: round2(out_i[0]),
            out_i2: round2(out_i[1]),
            out_i3: round2(out_i[2]),
            out_p_total_w,
            out_age_ms,
            out_age_human: humanize_age(out_age_ms),
            pv_kw: fields.pv_kw.map(round3),
            load_kw: fields.load_kw.map(round3),
            solis_state: state_human(fields.state),
            alarm,
        }
    }

    /// Fixed-rate summary logger: first fire after 10 s, then every 30 s.
    pub async fn run_summary_logger(self: Arc<Self>, running: Arc<AtomicBool>) {
        time::sleep(Duration::from_secs(10)).await;
        info!("status summary logger started: every 30s");
        let mut interval = time::interval(Duration::from_secs(30));
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
        while running.load(Ordering::SeqCst) {
            interval.tick().await;
            let v = self.build_status_view();
            info!(
                "Status: gridImport={}kW (psum={}, minImport={}kW) → compensate={}kW; \
                 SM: V1={}V I1={}A, V2={}V I2={}A, V3={}V I3={}A, Ptot={}W (age {}); \
                 Out: I1={}A I2={}A I3={}A, Ptot={}W (age {}); solis={}",
                v.grid_import_kw,
                v.grid_raw_psum_kw
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                v.min_import_kw,
                v.compensation_kw,
                v.sm_v1,
                v.sm_i1,
                v.sm_v2,
                v.sm_i2,
                v.sm_v3,
                v.sm_i3,
                v.sm_p_total_w,
                v.sm_age_human,
                v.out_i1,
                v.out_i2,
                v.out_i3,
                v.out_p_total_w,
                v.out_age_human,
                v.solis_state,
            );
            if !v.health_up() && v.sm_age_ms >= 0 {
                warn!(
                    "status_degraded solis={} smAgeMs={}",
                    v.solis_state, v.sm_age_ms
                );
            }
        }
    }
}

fn decode_phases(words: &[u16], pt: f64, ct: f64) -> ([f64; 3], [f64; 3]) {
    let mut volts = [0.0; 3];
    let mut amps = [0.0; 3];
    for i in 0..3 {
        volts[i] = 0.1 * read_u16(words, REG_V1 + i) as f64 * pt;
        amps[i] = 0.01 * read_u16(words, REG_I1 + i) as f64 * ct;
    }
    (volts, amps)
}

fn state_human(state: Option<i64>) -> String {
    match state {
        None => "-".to_string(),
        Some(1) => "ONLINE".to_string(),
        Some(2) => "OFFLINE".to_string(),
        Some(3) => "ALARM".to_string(),
        Some(other) => other.to_string(),
    }
}

/// "-" for unknown, otherwise a compact `1.2 s` / `3 m 5 s` / `2 h 7 m`.
fn humanize_age(age_ms: i64) -> String {
    if age_ms < 0 {
        return "-".to_string();
    }
    let secs = age_ms as f64 / 1000.0;
    if secs < 60.0 {
        format!("{:.1} s", secs)
    } else if secs < 3600.0 {
        format!("{} m {} s", (secs / 60.0) as u64, (secs % 60.0) as u64)
    } else {
        format!("{} h {} m", (secs / 3600.0) as u64, ((secs % 3600.0) / 60.0) as u64)
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}
