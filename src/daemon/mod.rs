// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the metershim project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Daemon task manager.
//!
//! Builds every component from the configuration, spawns the periodic
//! tasks on the shared runtime and coordinates shutdown. Tasks are
//! spawned through a supervising wrapper: a panic is logged, classified
//! by worker name and raised as `UNCAUGHT` or `MODBUS_UNCAUGHT`
//! (CRITICAL). A Modbus-classified escape additionally arms the meter
//! reader's force-reopen flag, because a dead Modbus task usually leaves
//! a wedged file descriptor behind.
//!
//! Launch order: alert sinks → meter reader → cloud poller → inverter
//! feeder → status logger → heartbeat. Shutdown runs in reverse: clear
//! the running flag, close the serial owners, send the shutdown ping,
//! then join every task with a bounded wait.

use anyhow::Result;
use log::{error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::alerts::heartbeat::{run_daily_heartbeat, LifecycleNotifier};
use crate::alerts::telegram::TelegramSink;
use crate::alerts::{AlertEngine, Severity};
use crate::cloud::{CloudPoller, Compensation};
use crate::config::Config;
use crate::feeder::InverterFeeder;
use crate::meter::MeterReader;
use crate::status::StatusAssembler;

/// Coordinates the background services for the whole process lifetime.
pub struct Daemon {
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    running: Arc<AtomicBool>,
    force_meter_reopen: Arc<AtomicBool>,
    alerts: Arc<AlertEngine>,
    feeder: Option<Arc<InverterFeeder>>,
    lifecycle: Option<LifecycleNotifier>,
    status: Option<Arc<StatusAssembler>>,
}

impl Daemon {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            running: Arc::new(AtomicBool::new(true)),
            force_meter_reopen: Arc::new(AtomicBool::new(false)),
            alerts: Arc::new(AlertEngine::new()),
            feeder: None,
            lifecycle: None,
            status: None,
        }
    }

    /// The process-wide alert engine.
    pub fn alerts(&self) -> Arc<AlertEngine> {
        Arc::clone(&self.alerts)
    }

    /// The current status view, once launched.
    pub fn status(&self) -> Option<Arc<StatusAssembler>> {
        self.status.clone()
    }

    /// Build all components and start their tasks.
    pub fn launch(&mut self, config: Config) -> Result<()> {
        // alert sink first so every later component can notify
        let sink = TelegramSink::start(config.alerts.telegram.clone(), self.running.clone());
        self.alerts.register_sink(sink.clone());
        let lifecycle = LifecycleNotifier::new(sink.clone(), config.alerts.clone());

        // meter reader
        let reader = MeterReader::new(
            config.meter.clone(),
            config.serial_io.clone(),
            self.alerts(),
            self.running.clone(),
            self.force_meter_reopen.clone(),
        );
        let meter_data = reader.data_source();
        self.spawn_supervised("meter-reader", true, reader.run());

        // cloud poller + compensation
        let compensation = Compensation::new(config.cloud.clone());
        let poller = CloudPoller::new(
            config.cloud.clone(),
            Arc::clone(&compensation),
            self.alerts(),
            self.running.clone(),
        );
        self.spawn_supervised("cloud-poller", false, poller.run());

        // inverter feeder
        let feeder = InverterFeeder::new(
            config.inverter.clone(),
            config.serial_io.clone(),
            config.control.clone(),
            meter_data.clone(),
            Arc::clone(&compensation),
            self.alerts(),
            self.running.clone(),
        );
        self.spawn_supervised("feeder-ensure-open", true, feeder.clone().run_ensure_open());
        self.spawn_supervised("feeder-tick", true, feeder.clone().run_tick());
        self.spawn_supervised("feeder-watchdog", false, feeder.clone().run_watchdog());

        // status assembler + summary logger
        let status = StatusAssembler::new(
            meter_data,
            compensation,
            feeder.clone(),
            config.control.clone(),
            config.cloud.clone(),
        );
        self.spawn_supervised(
            "status-summary",
            false,
            status.clone().run_summary_logger(self.running.clone()),
        );

        // daily heartbeat
        if config.alerts.heartbeat_enabled {
            self.spawn_supervised(
                "heartbeat",
                false,
                run_daily_heartbeat(
                    config.alerts.clone(),
                    sink,
                    status.clone(),
                    self.running.clone(),
                ),
            );
        }

        lifecycle.on_ready();
        self.feeder = Some(feeder);
        self.lifecycle = Some(lifecycle);
        self.status = Some(status);
        info!("daemon launched, {} workers supervised", self.tasks.len());
        Ok(())
    }

    /// Spawn a worker and a watcher that converts its panic into an alert.
    fn spawn_supervised<F>(&mut self, name: &'static str, modbus_related: bool, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        let alerts = self.alerts();
        let running = self.running.clone();
        let force_reopen = self.force_meter_reopen.clone();

        let watcher = tokio::spawn(async move {
            match handle.await {
                Ok(()) => {
                    if running.load(Ordering::SeqCst) {
                        warn!("worker '{}' finished unexpectedly", name);
                    }
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    if !running.load(Ordering::SeqCst) {
                        return; // no noise during shutdown
                    }
                    error!("uncaught panic in worker '{}': {}", name, e);
                    let key = if modbus_related {
                        "MODBUS_UNCAUGHT"
                    } else {
                        "UNCAUGHT"
                    };
                    alerts.raise(
                        key,
                        format!("Worker '{}' panicked: {}", name, e),
                        Severity::Critical,
                    );
                    if modbus_related {
                        force_reopen.store(true, Ordering::SeqCst);
                    }
                }
            }
        });
        self.tasks.push((name, watcher));
    }

    /// Signal every task to stop. Does not wait; call [`Daemon::join`].
    pub fn shutdown(&self) {
        info!("shutting down daemon tasks");
        self.running.store(false, Ordering::SeqCst);
    }

    /// Release the serial ports, send the shutdown ping and wait for all
    /// tasks with a bounded timeout each.
    pub async fn join(self) {
        if let Some(feeder) = &self.feeder {
            feeder.close_quietly();
        }
        if let Some(lifecycle) = &self.lifecycle {
            lifecycle.on_shutdown();
        }

        for (name, task) in self.tasks {
            match tokio::time::timeout(Duration::from_secs(5), task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("watcher for '{}' failed: {}", name, e),
                Err(_) => warn!("worker '{}' did not stop within timeout", name),
            }
        }
        info!("daemon stopped");
    }
}

impl Default for Daemon {
    fn default() -> Self {
        Self::new()
    }
}
