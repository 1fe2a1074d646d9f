// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the metershim project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Compensation set-point computer.
//!
//! Converts cloud readings into the kW figure the power-control transform
//! adds to the meter image. The control law, in order:
//!
//! 1. alarm gate: an inverter that is offline or alarming gets zero
//! 2. `import_kw = max(0, -psum)`, gated by `min_import_kw`
//! 3. clamp to `clamp_max_kw`
//! 4. EMA smoothing when `0 < smoothing_factor < 1`
//! 5. slew limit: one cycle moves at most
//!    `delta_max_kw_per_sec × fetch_period_s`
//! 6. final clamp to `[0, clamp_max_kw]`
//!
//! The public reader [`Compensation::current_delta_kw`] is safety-gated:
//! it returns zero when the override is disabled or the data is stale, so
//! a wedged cloud can never freeze a nonzero compensation in place.

use log::{debug, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time;

use super::client::{SolisClient, SolisDetail};
use crate::alerts::{AlertEngine, Severity};
use crate::codec::clamp;
use crate::config::CloudConfig;
use crate::snapshot::now_ms;

/// Last-seen cloud fields, cached for the status assembler.
#[derive(Debug, Clone, Default)]
pub struct CloudFields {
    pub psum_kw: Option<f64>,
    pub pac_kw: Option<f64>,
    pub pv_kw: Option<f64>,
    pub load_kw: Option<f64>,
    pub state: Option<i64>,
    pub warning_info: Option<i64>,
}

#[derive(Debug, Default)]
struct CompState {
    delta_kw: f64,
    last_update_ms: u64,
    fields: CloudFields,
}

/// Shared compensation set-point.
pub struct Compensation {
    config: CloudConfig,
    state: Mutex<CompState>,
}

impl Compensation {
    pub fn new(config: CloudConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(CompState::default()),
        })
    }

    /// The safety-gated set-point used by the feeder.
    ///
    /// Zero when the override is globally disabled, nothing was ever
    /// fetched, or the newest fetch is older than `max_data_age_ms`.
    pub fn current_delta_kw(&self) -> f64 {
        self.current_delta_kw_at(now_ms())
    }

    fn current_delta_kw_at(&self, now: u64) -> f64 {
        if !self.config.override_enabled {
            return 0.0;
        }
        let state = self.state.lock().unwrap();
        if state.last_update_ms == 0
            || now.saturating_sub(state.last_update_ms) > self.config.max_data_age_ms
        {
            return 0.0;
        }
        state.delta_kw
    }

    /// Last-seen cloud fields plus the raw (ungated) set-point.
    pub fn status_fields(&self) -> (CloudFields, f64, u64) {
        let state = self.state.lock().unwrap();
        (state.fields.clone(), state.delta_kw, state.last_update_ms)
    }

    /// Apply one fresh reading.
    pub fn apply_reading(&self, detail: &SolisDetail, alerts: &AlertEngine) {
        self.apply_reading_at(detail, alerts, now_ms());
    }

    fn apply_reading_at(&self, detail: &SolisDetail, alerts: &AlertEngine, now: u64) {
        let mut state = self.state.lock().unwrap();
        state.fields = CloudFields {
            psum_kw: Some(detail.psum_kw),
            pac_kw: detail.pac_kw,
            pv_kw: detail.pv_kw,
            load_kw: detail.load_kw,
            state: detail.state,
            warning_info: detail.warning_info,
        };

        let alarmed = detail.state.map(|s| s != 1).unwrap_or(false)
            || detail.warning_info.map(|w| w != 0).unwrap_or(false);
        if alarmed {
            state.delta_kw = 0.0;
            state.last_update_ms = now;
            drop(state);
            alerts.raise(
                "SOLIS_ALARM",
                format!(
                    "Inverter not healthy (state={:?}, warningInfo={:?}) — compensation paused",
                    detail.state, detail.warning_info
                ),
                Severity::Warn,
            );
            alerts.resolve("SOLIS_STALE");
            return;
        }

        let import_kw = (-detail.psum_kw).max(0.0);
        let mut target = if import_kw > self.config.min_import_kw {
            import_kw
        } else {
            0.0
        };
        target = target.min(self.config.clamp_max_kw);

        let previous = if state.delta_kw.is_finite() {
            state.delta_kw
        } else {
            0.0
        };
        let smoothing = self.config.smoothing_factor;
        let ema = if smoothing > 0.0 && smoothing < 1.0 {
            smoothing * target + (1.0 - smoothing) * previous
        } else {
            target
        };

        let step = self.config.delta_max_kw_per_sec * self.config.fetch_period_s as f64;
        let mut next = previous + clamp(ema - previous, -step, step);
        next = clamp(next, 0.0, self.config.clamp_max_kw);

        debug!(
            "solis_update psum={} → import={} → target={} → delta={}",
            detail.psum_kw, import_kw, target, next
        );
        state.delta_kw = next;
        state.last_update_ms = now;
        drop(state);

        alerts.resolve("SOLIS_ALARM");
        alerts.resolve("SOLIS_STALE");
    }

    /// Called when a poll produced no reading: once the data is both
    /// stale and nonzero, decay to zero and say so.
    pub fn on_poll_failure(&self, alerts: &AlertEngine) {
        self.on_poll_failure_at(alerts, now_ms());
    }

    fn on_poll_failure_at(&self, alerts: &AlertEngine, now: u64) {
        let mut state = self.state.lock().unwrap();
        let age = now.saturating_sub(state.last_update_ms);
        if state.last_update_ms > 0 && age > self.config.max_data_age_ms && state.delta_kw != 0.0 {
            state.delta_kw = 0.0;
            drop(state);
            alerts.raise(
                "SOLIS_STALE",
                format!("No fresh Solis data for {} ms", age),
                Severity::Warn,
            );
        }
    }
}

/// Periodic cloud poll task.
pub struct CloudPoller {
    client: SolisClient,
    compensation: Arc<Compensation>,
    alerts: Arc<AlertEngine>,
    running: Arc<AtomicBool>,
    fetch_period: Duration,
}

impl CloudPoller {
    pub fn new(
        config: CloudConfig,
        compensation: Arc<Compensation>,
        alerts: Arc<AlertEngine>,
        running: Arc<AtomicBool>,
    ) -> Self {
        let fetch_period = Duration::from_secs(config.fetch_period_s.max(1));
        Self {
            client: SolisClient::new(config, alerts.clone()),
            compensation,
            alerts,
            running,
            fetch_period,
        }
    }

    /// Fixed-delay poll loop: first fire after 5 s, then every
    /// `fetch_period_s` after each cycle completes.
    pub async fn run(self) {
        time::sleep(Duration::from_secs(5)).await;
        info!(
            "solis polling started: every {} s",
            self.fetch_period.as_secs()
        );
        while self.running.load(Ordering::SeqCst) {
            match self.client.fetch_inverter_detail().await {
                Some(detail) => self.compensation.apply_reading(&detail, &self.alerts),
                None => self.compensation.on_poll_failure(&self.alerts),
            }
            time::sleep(self.fetch_period).await;
        }
        info!("solis polling stopped");
    }
}
