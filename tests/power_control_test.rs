// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the metershim project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! End-to-end tests of the compensation pipeline without serial hardware:
//! cloud reading → compensation set-point → power-control transform.
//! These walk the same path the feeder's tick walks, minus the bus.

use metershim::alerts::AlertEngine;
use metershim::cloud::{Compensation, SolisDetail};
use metershim::codec::{read_i32_be, write_i32_be};
use metershim::config::{CloudConfig, ControlConfig};
use metershim::control::{prepare_output, REG_I1, REG_P_TOTAL, REG_V1};
use metershim::snapshot::{now_ms, MeterSnapshot, RAW_IMAGE_LEN};

fn cloud_config() -> CloudConfig {
    CloudConfig {
        api_id: "id".into(),
        api_secret: "secret".into(),
        sn: "sn".into(),
        ..CloudConfig::default()
    }
}

fn reading(psum_kw: f64, state: i64, warning_info: i64) -> SolisDetail {
    SolisDetail {
        psum_kw,
        pac_kw: None,
        pv_kw: None,
        load_kw: None,
        state: Some(state),
        warning_info: Some(warning_info),
        fetched_at_ms: now_ms(),
    }
}

/// Meter frame: V=[230.0, 231.0, 229.0] V, I=[0.5, 0.6, 0.4] A,
/// P_total=180 W, 50.00 Hz.
fn meter_snapshot() -> MeterSnapshot {
    let mut words = vec![0u16; RAW_IMAGE_LEN];
    words[REG_V1] = 2300;
    words[REG_V1 + 1] = 2310;
    words[REG_V1 + 2] = 2290;
    words[REG_I1] = 50;
    words[REG_I1 + 1] = 60;
    words[REG_I1 + 2] = 40;
    words[119] = 5000;
    write_i32_be(&mut words, REG_P_TOTAL, 180);
    MeterSnapshot::new(words, now_ms())
}

#[test]
fn steady_pass_through_with_override_disabled() {
    let mut config = cloud_config();
    config.override_enabled = false;
    let compensation = Compensation::new(config);
    let alerts = AlertEngine::new();

    // heavy import reported, but the override is off
    compensation.apply_reading(&reading(-4.0, 1, 0), &alerts);
    let delta = compensation.current_delta_kw();
    assert_eq!(delta, 0.0);

    let snapshot = meter_snapshot();
    let out = prepare_output(Some(&snapshot), delta, now_ms(), &ControlConfig::default());

    // output bytes at the meter map regions equal the meter's
    assert_eq!(&out[97..103], &snapshot.words[97..103]);
    assert_eq!(&out[356..364], &snapshot.words[356..364]);
}

#[test]
fn import_flows_through_to_the_register_image() {
    let mut config = cloud_config();
    config.smoothing_factor = 1.0; // reach the target in one cycle
    let compensation = Compensation::new(config);
    let alerts = AlertEngine::new();

    compensation.apply_reading(&reading(-3.0, 1, 0), &alerts);
    let delta = compensation.current_delta_kw();
    assert!((delta - 3.0).abs() < 1e-9);

    let snapshot = meter_snapshot();
    let out = prepare_output(Some(&snapshot), delta, now_ms(), &ControlConfig::default());

    // 1000 W per phase lands in the power registers
    assert_eq!(read_i32_be(&out, 356), 1000);
    assert_eq!(read_i32_be(&out, 358), 1000);
    assert_eq!(read_i32_be(&out, 360), 1000);
    assert_eq!(read_i32_be(&out, REG_P_TOTAL), 3180);

    // currents rise coherently: dI = 1000 / (V * 0.95)
    let expected = |v: f64, i: f64| ((i + 1000.0 / (v * 0.95)) * 100.0).round() as u16;
    assert_eq!(out[REG_I1], expected(230.0, 0.5));
    assert_eq!(out[REG_I1 + 1], expected(231.0, 0.6));
    assert_eq!(out[REG_I1 + 2], expected(229.0, 0.4));
}

#[test]
fn alarm_state_pauses_the_whole_pipeline() {
    let mut config = cloud_config();
    config.smoothing_factor = 1.0;
    let compensation = Compensation::new(config);
    let alerts = AlertEngine::new();

    // healthy first: compensation engages
    compensation.apply_reading(&reading(-5.0, 1, 0), &alerts);
    assert!(compensation.current_delta_kw() > 0.0);

    // then the inverter alarms
    compensation.apply_reading(&reading(-5.0, 3, 42), &alerts);
    assert!(alerts.is_active("SOLIS_ALARM"));
    let delta = compensation.current_delta_kw();
    assert_eq!(delta, 0.0);

    // transform becomes the identity regardless of the meter
    let snapshot = meter_snapshot();
    let out = prepare_output(Some(&snapshot), delta, now_ms(), &ControlConfig::default());
    assert_eq!(out, snapshot.words);
}

#[test]
fn slew_limits_each_cycle_step() {
    let mut config = cloud_config();
    config.smoothing_factor = 1.0;
    config.delta_max_kw_per_sec = 0.05;
    config.fetch_period_s = 10; // 0.5 kW max per cycle
    let compensation = Compensation::new(config);
    let alerts = AlertEngine::new();

    compensation.apply_reading(&reading(-10.0, 1, 0), &alerts);
    let first = compensation.current_delta_kw();
    assert!(first <= 0.5 + 1e-9);

    compensation.apply_reading(&reading(-10.0, 1, 0), &alerts);
    let second = compensation.current_delta_kw();
    assert!(second <= 1.0 + 1e-9);
    assert!(second > first);
}

#[test]
fn stale_snapshot_is_never_augmented() {
    let compensation = Compensation::new(cloud_config());
    let alerts = AlertEngine::new();
    compensation.apply_reading(&reading(-3.0, 1, 0), &alerts);
    let delta = compensation.current_delta_kw();
    assert!(delta > 0.0);

    let control = ControlConfig::default();
    let mut snapshot = meter_snapshot();
    snapshot.acquired_at_ms = now_ms() - control.stale_to_zero_ms - 1_000;

    let out = prepare_output(Some(&snapshot), delta, now_ms(), &control);
    for i in 0..3 {
        assert_eq!(out[REG_I1 + i], 0);
    }
    for reg in [356, 358, 360, 362] {
        assert_eq!(read_i32_be(&out, reg), 0);
    }
    // voltages survive the safety zero
    assert_eq!(out[REG_V1], 2300);
}
