// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the metershim project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Lifecycle pings and the daily heartbeat.
//!
//! The lifecycle notifier announces start and stop; the heartbeat sends
//! one status summary per day at a configured UTC hour, so a silently
//! dead site is noticed within a day even when no alert ever fired.

use chrono::{Duration as ChronoDuration, Timelike, Utc};
use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;

use super::telegram::TelegramSink;
use crate::config::AlertsConfig;
use crate::status::StatusAssembler;

/// Sends the startup and shutdown pings.
pub struct LifecycleNotifier {
    sink: Arc<TelegramSink>,
    config: AlertsConfig,
}

impl LifecycleNotifier {
    pub fn new(sink: Arc<TelegramSink>, config: AlertsConfig) -> Self {
        Self { sink, config }
    }

    pub fn on_ready(&self) {
        if self.config.startup_ping {
            self.sink
                .send_with_prefix(&format!("✅ *STARTED* — {}", Utc::now().to_rfc3339()));
        }
    }

    pub fn on_shutdown(&self) {
        if self.config.shutdown_ping {
            self.sink
                .send_with_prefix(&format!("🛑 *STOPPING* — {}", Utc::now().to_rfc3339()));
        }
    }
}

/// Daily heartbeat loop: fires once per day at `heartbeat_hour_utc`.
pub async fn run_daily_heartbeat(
    config: AlertsConfig,
    sink: Arc<TelegramSink>,
    status: Arc<StatusAssembler>,
    running: Arc<AtomicBool>,
) {
    if !config.heartbeat_enabled {
        info!("daily heartbeat disabled");
        return;
    }
    info!(
        "daily heartbeat scheduled at {:02}:00 UTC",
        config.heartbeat_hour_utc
    );

    while running.load(Ordering::SeqCst) {
        let wait = duration_until_next_fire(config.heartbeat_hour_utc);
        time::sleep(wait).await;
        if !running.load(Ordering::SeqCst) {
            break;
        }

        let v = status.build_status_view();
        let up = v.health_up();
        if !up {
            warn!(
                "heartbeat_degraded solis={} smAge={}",
                v.solis_state, v.sm_age_human
            );
        }
        let message = format!(
            "*HEARTBEAT* — {}\n_solis:_ {}\n_smAge:_ {}\n_gridAge:_ {}",
            if up { "UP" } else { "DEGRADED" },
            v.solis_state,
            v.sm_age_human,
            humanize(v.grid_age_ms),
        );
        sink.send_with_prefix(&message);
    }
}

fn humanize(age_ms: i64) -> String {
    if age_ms < 0 {
        "-".to_string()
    } else {
        format!("{} ms", age_ms)
    }
}

/// Time until the next `hour_utc:00:00`, always in the future.
fn duration_until_next_fire(hour_utc: u32) -> Duration {
    let now = Utc::now();
    let today_fire = now
        .with_hour(hour_utc)
        .and_then(|t| t.with_minute(0))
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now);
    let next = if today_fire > now {
        today_fire
    } else {
        today_fire + ChronoDuration::days(1)
    };
    (next - now).to_std().unwrap_or(Duration::from_secs(60))
}
