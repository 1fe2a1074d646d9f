// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the metershim project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Synthetic Acrel meter for bench testing.
//!
//! Serves a plausible three-phase meter image as a Modbus RTU slave so
//! the controller can be exercised end-to-end against a pair of looped
//! serial ports (e.g. `socat -d -d pty,raw pty,raw`) with no hardware.
//! The simulated site draws a slowly breathing load around `--load-kw`
//! with slightly unbalanced phases.
//!
//! ```bash
//! meter-sim --port /dev/pts/3 --load-kw 2.5
//! metershim --meter-port /dev/pts/4
//! ```

use anyhow::Result;
use clap::Parser;
use log::info;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::time;
use tokio_modbus::server::rtu::Server;

use metershim::codec::write_i32_be;
use metershim::config::SerialIoConfig;
use metershim::feeder::{FeederService, RegisterBank};
use metershim::serial::open_serial;

/// Simulated Acrel three-phase meter (Modbus RTU slave)
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Serial device to serve on
    #[arg(long)]
    port: String,

    /// Baud rate (8-N-1 framing)
    #[arg(long, default_value_t = 9600)]
    baud_rate: u32,

    /// Slave id to answer as
    #[arg(long, default_value_t = 1)]
    slave_id: u8,

    /// Mean simulated site load (kW)
    #[arg(long, default_value_t = 1.5)]
    load_kw: f64,

    /// Image refresh period (ms)
    #[arg(long, default_value_t = 1000)]
    period_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();
    let args = Args::parse();

    let stream = open_serial(&args.port, args.baud_rate, &SerialIoConfig::default())?;
    let bank = Arc::new(Mutex::new(RegisterBank::new(400)));
    let service = FeederService::new(args.slave_id, Arc::clone(&bank));

    let server = Server::new(stream);
    tokio::spawn(async move {
        if let Err(e) = server.serve_forever(service).await {
            eprintln!("simulator server stopped: {}", e);
        }
    });
    info!(
        "meter simulator started on {} (slave {}, ~{} kW)",
        args.port, args.slave_id, args.load_kw
    );

    let started = Instant::now();
    loop {
        let frame = build_frame(args.load_kw, started.elapsed().as_secs_f64());
        bank.lock().unwrap().write_frame(&frame);
        time::sleep(Duration::from_millis(args.period_ms)).await;
    }
}

/// Build one Acrel image: voltages at 97..=99 (0.1 V), currents at
/// 100..=102 (0.01 A), frequency at 119 (0.01 Hz), signed powers at
/// 356..=363 (W, i32 big-endian).
fn build_frame(load_kw: f64, elapsed_s: f64) -> Vec<u16> {
    let mut frame = vec![0u16; 400];

    // mains wander a little; phases are never perfectly balanced
    let breathe = 1.0 + 0.08 * (elapsed_s / 37.0).sin();
    let volts = [
        230.0 + 1.5 * (elapsed_s / 11.0).sin(),
        231.0 + 1.2 * (elapsed_s / 13.0).cos(),
        229.0 + 1.8 * (elapsed_s / 17.0).sin(),
    ];
    let share = [0.36, 0.33, 0.31];

    let total_w = load_kw * 1000.0 * breathe;
    let mut phase_w = [0.0; 3];
    for i in 0..3 {
        phase_w[i] = total_w * share[i];
        let amps = phase_w[i] / (volts[i] * 0.95);
        frame[97 + i] = (volts[i] * 10.0).round() as u16;
        frame[100 + i] = (amps * 100.0).round() as u16;
    }
    frame[119] = (50.0_f64 * 100.0 + (elapsed_s / 7.0).sin() * 3.0).round() as u16;

    for i in 0..3 {
        write_i32_be(&mut frame, 356 + 2 * i, phase_w[i].round() as i32);
    }
    write_i32_be(&mut frame, 362, total_w.round() as i32);
    frame
}
