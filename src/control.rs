// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the metershim project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Power-control transform.
//!
//! Builds the outgoing register image for the inverter from the latest
//! meter snapshot and the compensation set-point. The transform works on
//! raw Acrel registers: u16 voltages (0.1 V × PT) at 97..=99, u16 currents
//! (0.01 A × CT) at 100..=102, and signed 32-bit big-endian powers
//! (W / (PT × CT)) at 356/358/360 with the total at 362.
//!
//! With no compensation the transform is the identity, so every register
//! the meter reported passes through byte-exact. With compensation, the
//! added watts are split across the *alive* phases (decoded voltage at or
//! above `phase_min_volt`) and mirrored coherently into the current
//! registers so the inverter sees a physically consistent load. Positive
//! watts are added; the inverter reacts to the larger apparent load by
//! raising its output.
//!
//! If the snapshot is too old, the meter looks offline (all phase
//! voltages under 1 V) or no phase is alive, the compensation path writes
//! zero currents and powers instead: a dead meter must never be dressed
//! up as a loaded one. Voltages stay untouched so the inverter can still
//! tell "offline meter" from "dead bus".

use crate::codec::{
    clamp, clamp_i32, clamp_u16, read_i32_be, read_u16, safe_div, write_i32_be, write_u16,
};
use crate::config::ControlConfig;
use crate::snapshot::MeterSnapshot;

/// Acrel register addresses used by the transform.
pub const REG_V1: usize = 97;
pub const REG_I1: usize = 100;
pub const REG_FREQ: usize = 119;
pub const REG_P1: usize = 356;
pub const REG_P2: usize = 358;
pub const REG_P3: usize = 360;
pub const REG_P_TOTAL: usize = 362;

/// Minimum output image length: everything through the total power pair.
pub const MIN_OUTPUT_LEN: usize = 364;

/// Image length used when there is no snapshot to clone.
const EMPTY_OUTPUT_LEN: usize = 400;

/// Build the outgoing register image.
///
/// Pure function: the snapshot is never mutated, and registers other than
/// the currents at 100..=102 and the powers at 356..=363 are never
/// touched.
///
/// ### Parameters
///
/// * `snapshot` - latest meter snapshot, `None` before the first read
/// * `delta_kw` - compensation set-point; non-finite or <= 0 means none
/// * `now_ms` - current time, for the snapshot age check
/// * `config` - scaling ratios and safety limits
pub fn prepare_output(
    snapshot: Option<&MeterSnapshot>,
    delta_kw: f64,
    now_ms: u64,
    config: &ControlConfig,
) -> Vec<u16> {
    let mut out = match snapshot {
        Some(s) => {
            let mut words = s.words.clone();
            if words.len() < MIN_OUTPUT_LEN {
                words.resize(MIN_OUTPUT_LEN, 0);
            }
            words
        }
        None => vec![0; EMPTY_OUTPUT_LEN],
    };

    // No compensation: identity, even on a stale or offline image.
    if !delta_kw.is_finite() || delta_kw <= 0.0 {
        return out;
    }

    let recent = snapshot
        .and_then(|s| s.age_ms(now_ms))
        .map(|age| age <= config.stale_to_zero_ms)
        .unwrap_or(false);
    if !recent || meter_offline(&out, config) {
        zero_currents_and_powers(&mut out);
        return out;
    }

    let volts: Vec<f64> = (0..3)
        .map(|i| decode_volt(&out, REG_V1 + i, config))
        .collect();
    let alive: Vec<usize> = (0..3)
        .filter(|&i| volts[i] >= config.phase_min_volt)
        .collect();
    if alive.is_empty() {
        zero_currents_and_powers(&mut out);
        return out;
    }

    let pf = clamp(config.min_power_factor, 0.1, 1.0);
    let w_add = (delta_kw * 1000.0) / alive.len() as f64;

    for &i in &alive {
        // currents: raw = A / (0.01 * CT)
        let amps = 0.01 * read_u16(&out, REG_I1 + i) as f64 * config.scale_ct;
        let add_amps = safe_div(
            w_add.abs(),
            (volts[i] * pf).max(config.safe_div_min_volt),
        );
        let raw_amps = ((amps + add_amps) * 100.0 / config.scale_ct.max(1e-9)).round() as i64;
        write_u16(&mut out, REG_I1 + i, clamp_u16(raw_amps) as u32);

        // per-phase power: raw = W / (PT * CT)
        let reg = REG_P1 + 2 * i;
        let watts = read_i32_be(&out, reg) as f64 * config.scale_pt * config.scale_ct;
        let raw_watts =
            ((watts + w_add) / (config.scale_pt * config.scale_ct).max(1e-9)).round() as i64;
        write_i32_be(&mut out, reg, clamp_i32(raw_watts));
    }

    let total_add = w_add * alive.len() as f64;
    let total_watts = read_i32_be(&out, REG_P_TOTAL) as f64 * config.scale_pt * config.scale_ct;
    let raw_total =
        ((total_watts + total_add) / (config.scale_pt * config.scale_ct).max(1e-9)).round() as i64;
    write_i32_be(&mut out, REG_P_TOTAL, clamp_i32(raw_total));

    out
}

/// All three phase voltages under 1 V after PT scaling: the meter is
/// powered but sees no grid, or the frame is empty.
fn meter_offline(words: &[u16], config: &ControlConfig) -> bool {
    (0..3).all(|i| decode_volt(words, REG_V1 + i, config) < 1.0)
}

fn decode_volt(words: &[u16], index: usize, config: &ControlConfig) -> f64 {
    0.1 * read_u16(words, index) as f64 * config.scale_pt
}

fn zero_currents_and_powers(words: &mut [u16]) {
    for i in 0..3 {
        write_u16(words, REG_I1 + i, 0);
    }
    for reg in [REG_P1, REG_P2, REG_P3, REG_P_TOTAL] {
        write_i32_be(words, reg, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::RAW_IMAGE_LEN;

    fn config() -> ControlConfig {
        ControlConfig::default()
    }

    /// 230/231/229 V, 0.5/0.6/0.4 A, 180 W total, 50.00 Hz.
    fn live_snapshot(acquired_at_ms: u64) -> MeterSnapshot {
        let mut words = vec![0u16; RAW_IMAGE_LEN];
        words[REG_V1] = 2300;
        words[REG_V1 + 1] = 2310;
        words[REG_V1 + 2] = 2290;
        words[REG_I1] = 50;
        words[REG_I1 + 1] = 60;
        words[REG_I1 + 2] = 40;
        words[REG_FREQ] = 5000;
        crate::codec::write_i32_be(&mut words, REG_P_TOTAL, 180);
        MeterSnapshot::new(words, acquired_at_ms)
    }

    #[test]
    fn zero_delta_is_identity() {
        let snapshot = live_snapshot(1_000);
        let out = prepare_output(Some(&snapshot), 0.0, 2_000, &config());
        assert_eq!(out, snapshot.words);
    }

    #[test]
    fn negative_and_non_finite_deltas_pass_through() {
        let snapshot = live_snapshot(1_000);
        for delta in [-1.0, -0.001, f64::NAN, f64::NEG_INFINITY] {
            let out = prepare_output(Some(&snapshot), delta, 2_000, &config());
            assert_eq!(out, snapshot.words);
        }
    }

    #[test]
    fn pass_through_pads_short_images() {
        let snapshot = MeterSnapshot::new(vec![7u16; 120], 1_000);
        let out = prepare_output(Some(&snapshot), 0.0, 2_000, &config());
        assert_eq!(out.len(), MIN_OUTPUT_LEN);
        assert_eq!(&out[..120], &snapshot.words[..]);
        assert!(out[120..].iter().all(|&w| w == 0));
    }

    #[test]
    fn missing_snapshot_yields_zeros() {
        let out = prepare_output(None, 5.0, 1_000, &config());
        assert!(out.len() >= MIN_OUTPUT_LEN);
        assert!(out.iter().all(|&w| w == 0));
    }

    #[test]
    fn three_kilowatts_across_three_phases() {
        let snapshot = live_snapshot(10_000);
        let out = prepare_output(Some(&snapshot), 3.0, 11_000, &config());

        // 1000 W per phase; dI = 1000 / (V * 0.95)
        let expected = |v: f64, i: f64| ((i + 1000.0 / (v * 0.95)) * 100.0).round() as u16;
        assert_eq!(out[REG_I1], expected(230.0, 0.5));
        assert_eq!(out[REG_I1 + 1], expected(231.0, 0.6));
        assert_eq!(out[REG_I1 + 2], expected(229.0, 0.4));

        assert_eq!(read_i32_be(&out, REG_P1), 1000);
        assert_eq!(read_i32_be(&out, REG_P2), 1000);
        assert_eq!(read_i32_be(&out, REG_P3), 1000);
        assert_eq!(read_i32_be(&out, REG_P_TOTAL), 180 + 3000);

        // everything else passes through
        assert_eq!(out[REG_V1], 2300);
        assert_eq!(out[REG_FREQ], 5000);
        assert_eq!(out[0], 0);
    }

    #[test]
    fn stale_snapshot_zeroes_currents_and_powers() {
        let snapshot = live_snapshot(1_000);
        let now = 1_000 + config().stale_to_zero_ms + 1;
        let out = prepare_output(Some(&snapshot), 2.0, now, &config());

        for i in 0..3 {
            assert_eq!(out[REG_I1 + i], 0);
        }
        for reg in [REG_P1, REG_P2, REG_P3, REG_P_TOTAL] {
            assert_eq!(read_i32_be(&out, reg), 0);
        }
        // voltages survive so the inverter can tell offline from dead
        assert_eq!(out[REG_V1], 2300);
    }

    #[test]
    fn never_acquired_snapshot_counts_as_stale() {
        let snapshot = MeterSnapshot::empty();
        let out = prepare_output(Some(&snapshot), 2.0, 5_000, &config());
        assert_eq!(read_i32_be(&out, REG_P_TOTAL), 0);
        assert_eq!(out[REG_I1], 0);
    }

    #[test]
    fn offline_meter_zeroes_even_when_fresh() {
        let mut snapshot = live_snapshot(1_000);
        snapshot.words[REG_V1] = 5; // 0.5 V
        snapshot.words[REG_V1 + 1] = 0;
        snapshot.words[REG_V1 + 2] = 9;
        let out = prepare_output(Some(&snapshot), 2.0, 1_500, &config());
        assert_eq!(out[REG_I1], 0);
        assert_eq!(read_i32_be(&out, REG_P_TOTAL), 0);
    }

    #[test]
    fn dead_phase_is_skipped_and_load_rebalanced() {
        let mut snapshot = live_snapshot(1_000);
        snapshot.words[REG_V1 + 2] = 500; // 50 V: below phase_min_volt
        let out = prepare_output(Some(&snapshot), 3.0, 1_500, &config());

        // 1500 W on each of the two alive phases, dead phase untouched
        assert_eq!(read_i32_be(&out, REG_P1), 1500);
        assert_eq!(read_i32_be(&out, REG_P2), 1500);
        assert_eq!(read_i32_be(&out, REG_P3), 0);
        assert_eq!(out[REG_I1 + 2], 40);
        assert_eq!(read_i32_be(&out, REG_P_TOTAL), 180 + 3000);
    }

    #[test]
    fn compensation_is_monotone_in_delta() {
        let snapshot = live_snapshot(1_000);
        let mut previous_total = i32::MIN;
        for delta in [0.1, 0.5, 1.0, 2.0, 5.0, 20.0, 50.0] {
            let out = prepare_output(Some(&snapshot), delta, 1_500, &config());
            let total = read_i32_be(&out, REG_P_TOTAL);
            assert!(
                total >= previous_total,
                "total power went down at delta={}",
                delta
            );
            previous_total = total;
        }
    }

    #[test]
    fn current_registers_saturate_instead_of_wrapping() {
        let snapshot = live_snapshot(1_000);
        // absurd compensation: register must clamp at u16::MAX
        let out = prepare_output(Some(&snapshot), 50_000.0, 1_500, &config());
        assert_eq!(out[REG_I1], u16::MAX);
    }

    #[test]
    fn pt_ct_scaling_round_trips() {
        let mut cfg = config();
        cfg.scale_pt = 2.0;
        cfg.scale_ct = 5.0;
        let mut snapshot = live_snapshot(1_000);
        // 1150 raw * 0.1 * PT(2.0) = 230 V
        snapshot.words[REG_V1] = 1150;
        snapshot.words[REG_V1 + 1] = 1150;
        snapshot.words[REG_V1 + 2] = 1150;

        let out = prepare_output(Some(&snapshot), 3.0, 1_500, &cfg);
        // per-phase 1000 W; raw power = W / (PT*CT) = 1000/10 = 100
        assert_eq!(read_i32_be(&out, REG_P1), 100);
        // total raw = (180*10 + 3000) / 10 = 480
        assert_eq!(read_i32_be(&out, REG_P_TOTAL), 480);
    }
}
