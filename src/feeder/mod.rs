// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the metershim project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Inverter feeder: the Modbus RTU slave the inverter reads.
//!
//! Owns the second serial port and a process image of `init_registers`
//! words exposed identically through function 03 (holding) and function
//! 04 (input): inverter firmwares disagree on which one a grid meter
//! answers, so both banks carry the same frame. Requests addressed to a
//! different slave id are ignored without a response, as RS-485 manners
//! demand.
//!
//! Three periodic tasks drive the feeder:
//!
//! - `ensure_open` (5 s): reopens the port after failures, optionally
//!   deferring the first open until the meter has produced a snapshot so
//!   the inverter never reads a half-initialized image
//! - `tick` (1 s): builds the outgoing frame from the latest snapshot and
//!   the compensation set-point, then publishes it into both banks
//! - `watch_output_staleness` (2 s, after a grace period): raises
//!   `INVERTER_OUTPUT_STALE` when publishes stop
//!
//! When the meter input is missing or too old the feeder can keep
//! re-publishing its last good frame (`republish_on_stale`) so the
//! inverter sees a live bus while the alert side escalates the real
//! problem.

use log::{debug, info, warn};
use std::future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_modbus::prelude::*;
use tokio_modbus::server::rtu::Server;
use tokio_modbus::server::Service;

use crate::alerts::{AlertEngine, Severity};
use crate::cloud::Compensation;
use crate::config::{ControlConfig, InverterConfig, SerialIoConfig};
use crate::control::prepare_output;
use crate::serial::{device_present, open_serial};
use crate::snapshot::{now_ms, MeterDataSource};

/// The slave's register banks, one array per function code.
#[derive(Debug)]
pub struct RegisterBank {
    holding: Vec<u16>,
    input: Vec<u16>,
}

impl RegisterBank {
    /// Create pre-zeroed banks of `len` registers each.
    pub fn new(len: usize) -> Self {
        Self {
            holding: vec![0; len],
            input: vec![0; len],
        }
    }

    /// Write `frame` into both banks; registers past the frame up to the
    /// bank length are zeroed. Banks grow when the frame is longer.
    pub fn write_frame(&mut self, frame: &[u16]) {
        let len = self.holding.len().max(frame.len());
        for bank in [&mut self.holding, &mut self.input] {
            bank.resize(len, 0);
            bank[..frame.len()].copy_from_slice(frame);
            bank[frame.len()..].fill(0);
        }
    }

    fn read(&self, bank: &[u16], addr: u16, cnt: u16) -> Result<Vec<u16>, Exception> {
        let start = addr as usize;
        let end = start + cnt as usize;
        if end > bank.len() {
            return Err(Exception::IllegalDataAddress);
        }
        Ok(bank[start..end].to_vec())
    }

    pub fn read_holding(&self, addr: u16, cnt: u16) -> Result<Vec<u16>, Exception> {
        self.read(&self.holding, addr, cnt)
    }

    pub fn read_input(&self, addr: u16, cnt: u16) -> Result<Vec<u16>, Exception> {
        self.read(&self.input, addr, cnt)
    }
}

/// Modbus service answering the inverter's reads from the shared bank.
#[derive(Clone)]
pub struct FeederService {
    slave_id: u8,
    bank: Arc<Mutex<RegisterBank>>,
}

impl FeederService {
    pub fn new(slave_id: u8, bank: Arc<Mutex<RegisterBank>>) -> Self {
        Self { slave_id, bank }
    }
}

impl Service for FeederService {
    type Request = SlaveRequest<'static>;
    type Response = Option<Response>;
    type Exception = Exception;
    type Future = future::Ready<Result<Self::Response, Self::Exception>>;

    fn call(&self, req: Self::Request) -> Self::Future {
        if req.slave != self.slave_id {
            // not ours: stay silent on the shared bus
            return future::ready(Ok(None));
        }
        let result = match req.request {
            Request::ReadHoldingRegisters(addr, cnt) => {
                debug!("inverter_read fc=03 addr={} cnt={}", addr, cnt);
                self.bank
                    .lock()
                    .unwrap()
                    .read_holding(addr, cnt)
                    .map(|words| Some(Response::ReadHoldingRegisters(words)))
            }
            Request::ReadInputRegisters(addr, cnt) => {
                debug!("inverter_read fc=04 addr={} cnt={}", addr, cnt);
                self.bank
                    .lock()
                    .unwrap()
                    .read_input(addr, cnt)
                    .map(|words| Some(Response::ReadInputRegisters(words)))
            }
            _ => {
                warn!("inverter_read unsupported function: {:?}", req.request);
                Err(Exception::IllegalFunction)
            }
        };
        future::ready(result)
    }
}

struct FeederState {
    up: bool,
    server_handle: Option<JoinHandle<()>>,
    last_output: Option<Arc<Vec<u16>>>,
    last_write_ms: u64,
}

/// The inverter-facing RTU slave and its periodic tasks.
pub struct InverterFeeder {
    config: InverterConfig,
    io: SerialIoConfig,
    control: ControlConfig,
    data: MeterDataSource,
    compensation: Arc<Compensation>,
    alerts: Arc<AlertEngine>,
    running: Arc<AtomicBool>,
    bank: Arc<Mutex<RegisterBank>>,
    state: Mutex<FeederState>,
}

impl InverterFeeder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: InverterConfig,
        io: SerialIoConfig,
        control: ControlConfig,
        data: MeterDataSource,
        compensation: Arc<Compensation>,
        alerts: Arc<AlertEngine>,
        running: Arc<AtomicBool>,
    ) -> Arc<Self> {
        let bank = Arc::new(Mutex::new(RegisterBank::new(config.init_registers)));
        Arc::new(Self {
            config,
            io,
            control,
            data,
            compensation,
            alerts,
            running,
            bank,
            state: Mutex::new(FeederState {
                up: false,
                server_handle: None,
                last_output: None,
                last_write_ms: 0,
            }),
        })
    }

    /// The last frame published to the banks, for the status page.
    pub fn last_output_image(&self) -> Option<Arc<Vec<u16>>> {
        self.state.lock().unwrap().last_output.clone()
    }

    /// When the banks were last written (epoch ms), 0 before the first
    /// publish.
    pub fn last_write_at_ms(&self) -> u64 {
        self.state.lock().unwrap().last_write_ms
    }

    /// Re-open watcher: fixed-delay 5 s.
    pub async fn run_ensure_open(self: Arc<Self>) {
        while self.running.load(Ordering::SeqCst) {
            self.ensure_open();
            time::sleep(Duration::from_secs(5)).await;
        }
    }

    /// Frame push loop: fixed-rate 1 s.
    pub async fn run_tick(self: Arc<Self>) {
        let mut interval = time::interval(Duration::from_secs(1));
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
        while self.running.load(Ordering::SeqCst) {
            interval.tick().await;
            self.tick();
        }
    }

    /// Output staleness watchdog: fixed-delay 2 s after a 5 s grace.
    pub async fn run_watchdog(self: Arc<Self>) {
        time::sleep(Duration::from_secs(5)).await;
        while self.running.load(Ordering::SeqCst) {
            self.watch_output_staleness();
            time::sleep(Duration::from_secs(2)).await;
        }
    }

    fn ensure_open(&self) {
        let up = self.state.lock().unwrap().up;
        if up && !device_present(&self.config.port) {
            warn!(
                "serial device {} disappeared; closing inverter slave",
                self.config.port
            );
            self.close_quietly();
            if self.running.load(Ordering::SeqCst) {
                self.alerts.raise(
                    "INVERTER_RTU_DOWN",
                    format!("USB/RS485 adapter missing: {}", self.config.port),
                    Severity::Error,
                );
            }
            return;
        }
        if up {
            return;
        }

        if self.config.defer_open_until_first_frame && self.data.latest().acquired_at_ms == 0 {
            debug!("inverter open deferred: no meter snapshot yet");
            if self.running.load(Ordering::SeqCst) {
                self.alerts.raise(
                    "INVERTER_FEEDER_WAITING_FOR_METER",
                    "No meter snapshot yet; inverter bus held closed",
                    Severity::Warn,
                );
            }
            return;
        }

        match open_serial(&self.config.port, self.config.baud_rate, &self.io) {
            Ok(stream) => {
                {
                    let mut bank = self.bank.lock().unwrap();
                    *bank = RegisterBank::new(self.config.init_registers);
                }
                let service = FeederService::new(self.config.slave_id, Arc::clone(&self.bank));
                let server = Server::new(stream);
                let handle = tokio::spawn(async move {
                    if let Err(e) = server.serve_forever(service).await {
                        warn!("inverter slave server stopped: {}", e);
                    }
                });

                {
                    let mut state = self.state.lock().unwrap();
                    state.server_handle = Some(handle);
                    state.up = true;
                }
                info!(
                    "inverter_slave_opened port={} baud={} initRegisters={}",
                    self.config.port, self.config.baud_rate, self.config.init_registers
                );
                self.alerts.resolve("INVERTER_RTU_DOWN");
                // first frame right away so the inverter never reads zeros
                self.tick();
            }
            Err(e) => {
                if self.running.load(Ordering::SeqCst) {
                    self.alerts.raise(
                        "INVERTER_RTU_DOWN",
                        format!("Inverter-slave open failed: {:#}", e),
                        Severity::Error,
                    );
                }
            }
        }
    }

    /// Build one frame and publish it.
    fn tick(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if !state.up {
                return;
            }
            // a dead server task means the port wedged mid-write
            if state
                .server_handle
                .as_ref()
                .map(|h| h.is_finished())
                .unwrap_or(true)
            {
                state.up = false;
                state.server_handle = None;
                drop(state);
                if self.running.load(Ordering::SeqCst) {
                    self.alerts.raise(
                        "INVERTER_WRITE_FAIL",
                        "Inverter-slave server task died; reopening",
                        Severity::Warn,
                    );
                }
                return;
            }
        }

        let now = now_ms();
        let snapshot = self.data.latest();

        if snapshot.acquired_at_ms == 0 {
            if self.running.load(Ordering::SeqCst) {
                self.alerts.raise(
                    "INVERTER_FEEDER_WAITING_FOR_METER",
                    "No meter snapshot yet",
                    Severity::Warn,
                );
            }
            if self.config.republish_on_stale {
                self.republish_last(now);
            }
            return;
        }

        let age = snapshot.age_ms(now).unwrap_or(u64::MAX);
        if age > self.config.max_sm_age_for_write_ms {
            if self.running.load(Ordering::SeqCst) {
                self.alerts.raise(
                    "INVERTER_FEEDER_STALE_INPUT",
                    format!("Meter snapshot is {} ms old", age),
                    Severity::Error,
                );
            }
            if self.config.republish_on_stale {
                self.republish_last(now);
            }
            return;
        }

        self.alerts.resolve("INVERTER_FEEDER_WAITING_FOR_METER");
        self.alerts.resolve("INVERTER_FEEDER_STALE_INPUT");

        let delta_kw = self.compensation.current_delta_kw();
        let frame = prepare_output(Some(&snapshot), delta_kw, now, &self.control);
        debug!(
            "inverter_publish delta={} kW regs={}",
            delta_kw,
            frame.len()
        );
        self.publish(Arc::new(frame), now);
    }

    fn publish(&self, frame: Arc<Vec<u16>>, now: u64) {
        {
            let mut bank = self.bank.lock().unwrap();
            bank.write_frame(&frame);
        }
        let mut state = self.state.lock().unwrap();
        state.last_output = Some(frame);
        state.last_write_ms = now;
    }

    /// Keep the bus warm with the last good frame.
    fn republish_last(&self, now: u64) {
        let last = self.state.lock().unwrap().last_output.clone();
        if let Some(frame) = last {
            self.publish(frame, now);
        }
    }

    fn watch_output_staleness(&self) {
        let (up, last_write_ms) = {
            let state = self.state.lock().unwrap();
            (state.up, state.last_write_ms)
        };
        if last_write_ms == 0 {
            return; // nothing published yet; the waiting alert covers this
        }
        let age = now_ms().saturating_sub(last_write_ms);
        if age > self.config.out_stale_ms {
            if self.running.load(Ordering::SeqCst) {
                self.alerts.raise(
                    "INVERTER_OUTPUT_STALE",
                    format!("No frame published for {} ms (up={})", age, up),
                    Severity::Error,
                );
            }
        } else {
            self.alerts.resolve("INVERTER_OUTPUT_STALE");
        }
    }

    /// Stop the slave and clear runtime state. Safe to call repeatedly.
    pub fn close_quietly(&self) {
        let handle = {
            let mut state = self.state.lock().unwrap();
            state.up = false;
            state.server_handle.take()
        };
        if let Some(handle) = handle {
            handle.abort();
            info!("inverter_slave_closed port={}", self.config.port);
        }
    }
}
