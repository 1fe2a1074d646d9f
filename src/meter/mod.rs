// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the metershim project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Meter reader: the Modbus RTU master polling the physical meter.
//!
//! Every `poll_interval_ms` the reader fetches two holding-register
//! windows (function 03), per-phase voltages/currents/frequency at
//! 97..=122 and the signed 32-bit powers at 356..=363, and places them
//! at their native offsets inside a fresh 400-word image, published
//! atomically through [`MeterDataSource`].
//!
//! Cheap RS-485 adapters disappear, wedge and babble, so the port
//! lifecycle handles each case explicitly:
//!
//! - a vanished device path closes the port and backs off
//! - timeouts inside the post-open warmup window are forgiven
//! - `timeouts_before_reopen` consecutive timeouts force a close + reopen
//! - any transport error closes the port immediately
//! - an external force-reopen flag (set when a Modbus task dies) makes the
//!   next pass start from a fresh port
//!
//! State machine: `Closed → Opening → Warmup → Steady`, with `Failing`
//! covering the backoff stretches. All transitions are local to the
//! single poll task; consumers only ever see published snapshots.

use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time;
use tokio_modbus::client::{rtu, Context, Reader};
use tokio_modbus::Slave;

use crate::alerts::{AlertEngine, Severity};
use crate::config::{MeterConfig, SerialIoConfig};
use crate::serial::{device_present, open_serial};
use crate::snapshot::{now_ms, MeterDataSource, MeterSnapshot, RAW_IMAGE_LEN};

/// Register windows read on every pass: `(start, count)`.
const WINDOW_VOLTAGE_CURRENT: (u16, u16) = (97, 26);
const WINDOW_POWER: (u16, u16) = (356, 8);

/// Port lifecycle states, for logs and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Closed,
    Opening,
    Warmup,
    Steady,
    Failing,
}

/// Failure classes of a poll pass; the reopen policy branches on these.
#[derive(Debug, Error)]
pub enum MeterReadError {
    #[error("modbus request timed out")]
    Timeout,
    #[error("too many register windows failed ({0})")]
    WindowErrors(u32),
    #[error("modbus transport error: {0}")]
    Transport(String),
}

/// The Modbus RTU master task for the physical meter.
pub struct MeterReader {
    config: MeterConfig,
    io: SerialIoConfig,
    alerts: Arc<AlertEngine>,
    data: MeterDataSource,
    running: Arc<AtomicBool>,
    force_reopen: Arc<AtomicBool>,
}

impl MeterReader {
    pub fn new(
        config: MeterConfig,
        io: SerialIoConfig,
        alerts: Arc<AlertEngine>,
        running: Arc<AtomicBool>,
        force_reopen: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config,
            io,
            alerts,
            data: MeterDataSource::new(),
            running,
            force_reopen,
        }
    }

    /// Handle to the published snapshots.
    pub fn data_source(&self) -> MeterDataSource {
        self.data.clone()
    }

    /// The poll loop. Runs until the shared running flag clears.
    pub async fn run(self) {
        time::sleep(Duration::from_millis(self.config.initial_open_delay_ms)).await;

        let mut ctx: Option<Context> = None;
        let mut state = PortState::Closed;
        let mut last_open_at: u64 = 0;
        let mut consecutive_timeouts: u32 = 0;
        let mut last_stale_alert_at: u64 = 0;

        while self.running.load(Ordering::SeqCst) {
            if self.force_reopen.swap(false, Ordering::SeqCst) && ctx.is_some() {
                warn!("meter_force_reopen requested, closing port");
                self.close(&mut ctx, &mut state);
            }

            self.check_staleness(state, last_open_at, &mut last_stale_alert_at);

            if !device_present(&self.config.port) {
                if self.running.load(Ordering::SeqCst) {
                    self.alerts.raise(
                        "METER_DISCONNECTED",
                        format!("Serial device missing: {}", self.config.port),
                        Severity::Error,
                    );
                }
                self.close(&mut ctx, &mut state);
                state = PortState::Failing;
                self.backoff().await;
                continue;
            }

            if ctx.is_none() {
                state = PortState::Opening;
                match open_serial(&self.config.port, self.config.baud_rate, &self.io) {
                    Ok(stream) => {
                        ctx = Some(rtu::attach_slave(stream, Slave(self.config.slave_id)));
                        last_open_at = now_ms();
                        consecutive_timeouts = 0;
                        state = PortState::Warmup;
                        info!(
                            "meter_port_opened port={} baud={}",
                            self.config.port, self.config.baud_rate
                        );
                        // let the UART settle before the first request
                        time::sleep(Duration::from_millis(200)).await;
                    }
                    Err(e) => {
                        if self.running.load(Ordering::SeqCst) {
                            self.alerts.raise(
                                "METER_DISCONNECTED",
                                format!("Meter port open failed: {:#}", e),
                                Severity::Error,
                            );
                        }
                        ctx = None;
                        state = PortState::Failing;
                        self.backoff().await;
                        continue;
                    }
                }
            }

            let outcome = self.read_pass(ctx.as_mut().unwrap()).await;
            match outcome {
                Ok(image) => {
                    self.data.publish(MeterSnapshot::new(image, now_ms()));
                    consecutive_timeouts = 0;
                    state = PortState::Steady;
                    self.alerts.resolve("METER_DISCONNECTED");
                    self.alerts.resolve("METER_STALE");
                    self.alerts.resolve("MODBUS_UNCAUGHT");
                }
                Err(MeterReadError::Timeout) => {
                    let since_open = now_ms().saturating_sub(last_open_at);
                    consecutive_timeouts += 1;
                    if since_open < self.config.warmup_ms {
                        warn!(
                            "modbus_timeout during warmup ({} ms since open, #{}) — keeping port open",
                            since_open, consecutive_timeouts
                        );
                    } else if consecutive_timeouts < self.config.timeouts_before_reopen.max(1) {
                        warn!(
                            "modbus_timeout (streak #{}) — retrying without reopen",
                            consecutive_timeouts
                        );
                    } else {
                        warn!(
                            "modbus_timeout (streak #{}) — closing and reopening",
                            consecutive_timeouts
                        );
                        if self.running.load(Ordering::SeqCst) {
                            self.alerts.raise(
                                "METER_DISCONNECTED",
                                format!(
                                    "Meter not answering after {} consecutive timeouts",
                                    consecutive_timeouts
                                ),
                                Severity::Error,
                            );
                        }
                        self.close(&mut ctx, &mut state);
                        self.backoff().await;
                    }
                }
                Err(e) => {
                    warn!("meter_read_failed: {}", e);
                    if self.running.load(Ordering::SeqCst) {
                        self.alerts.raise(
                            "METER_DISCONNECTED",
                            format!("Meter read failed: {}", e),
                            Severity::Error,
                        );
                    }
                    self.close(&mut ctx, &mut state);
                    self.backoff().await;
                }
            }

            time::sleep(Duration::from_millis(self.config.poll_interval_ms)).await;
        }

        self.close(&mut ctx, &mut state);
        info!("meter reader stopped");
    }

    /// Read both register windows into a fresh image.
    ///
    /// A window that times out or answers with a Modbus exception is
    /// skipped (its registers stay zero); when too many windows fail, the
    /// whole pass fails with the dominant error class.
    async fn read_pass(&self, ctx: &mut Context) -> Result<Vec<u16>, MeterReadError> {
        let mut image = vec![0u16; RAW_IMAGE_LEN];
        let mut failed_windows: u32 = 0;
        let mut saw_timeout = false;
        let request_timeout = Duration::from_millis(self.config.request_timeout_ms);

        for &(start, count) in &[WINDOW_VOLTAGE_CURRENT, WINDOW_POWER] {
            match time::timeout(request_timeout, ctx.read_holding_registers(start, count)).await {
                Ok(Ok(Ok(words))) => {
                    for (i, word) in words.iter().enumerate() {
                        image[start as usize + i] = *word;
                    }
                }
                Ok(Ok(Err(exception))) => {
                    warn!(
                        "modbus_exception window={}..{} code={}",
                        start,
                        start + count - 1,
                        exception
                    );
                    failed_windows += 1;
                }
                Ok(Err(e)) => {
                    return Err(MeterReadError::Transport(e.to_string()));
                }
                Err(_elapsed) => {
                    warn!(
                        "modbus_timeout window={}..{} after {} ms",
                        start,
                        start + count - 1,
                        request_timeout.as_millis()
                    );
                    failed_windows += 1;
                    saw_timeout = true;
                }
            }
        }

        if failed_windows >= self.config.max_window_errors_before_reopen.max(1) {
            if saw_timeout {
                return Err(MeterReadError::Timeout);
            }
            return Err(MeterReadError::WindowErrors(failed_windows));
        }
        if failed_windows > 0 {
            warn!("meter_pass_partial failed_windows={}", failed_windows);
        }
        debug!(
            "meter_read_ok 97..122={:?} 356..363={:?}",
            &image[97..123],
            &image[356..364]
        );
        Ok(image)
    }

    /// Raise `METER_STALE` (rate-limited) when the newest snapshot is too
    /// old and the port has been open past its warmup; resolve it as soon
    /// as the data is fresh again.
    fn check_staleness(&self, state: PortState, last_open_at: u64, last_alert_at: &mut u64) {
        let now = now_ms();
        let past_warmup = matches!(state, PortState::Warmup | PortState::Steady)
            && now.saturating_sub(last_open_at) >= self.config.warmup_ms;
        if !past_warmup {
            return;
        }

        let snapshot = self.data.latest();
        let stale = snapshot
            .age_ms(now)
            .map(|age| age > self.config.meter_stale_ms)
            .unwrap_or(true);

        if !stale {
            self.alerts.resolve("METER_STALE");
            return;
        }
        if now.saturating_sub(*last_alert_at) < self.config.stale_alert_min_period_ms {
            return;
        }
        *last_alert_at = now;
        if self.running.load(Ordering::SeqCst) {
            let age = snapshot
                .age_ms(now)
                .map(|a| format!("{} ms", a))
                .unwrap_or_else(|| "never".to_string());
            self.alerts.raise(
                "METER_STALE",
                format!("No fresh meter data (age: {})", age),
                Severity::Error,
            );
        }
    }

    fn close(&self, ctx: &mut Option<Context>, state: &mut PortState) {
        if ctx.take().is_some() {
            info!("meter_port_closed port={}", self.config.port);
        }
        *state = PortState::Closed;
    }

    async fn backoff(&self) {
        let ms = self.config.reopen_backoff_ms.clamp(200, 5000);
        time::sleep(Duration::from_millis(ms)).await;
    }
}
