// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the metershim project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Serial port helpers shared by both Modbus buses.
//!
//! Both RS-485 adapters run 8-N-1 with explicit timeouts; the per-request
//! deadline enforcement lives with the callers (the Modbus master wraps
//! each request in a timeout, the slave relies on the stream timeouts).

use anyhow::{Context, Result};
use log::info;
use std::path::Path;
use std::time::Duration;
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialStream, StopBits};

use crate::config::SerialIoConfig;

/// Open a serial port configured for Modbus RTU (8-N-1, no flow control).
pub fn open_serial(path: &str, baud_rate: u32, io: &SerialIoConfig) -> Result<SerialStream> {
    let timeout = Duration::from_millis(io.read_timeout_ms.max(io.write_timeout_ms));
    let builder = tokio_serial::new(path, baud_rate)
        .data_bits(DataBits::Eight)
        .stop_bits(StopBits::One)
        .parity(Parity::None)
        .flow_control(FlowControl::None)
        .timeout(timeout);

    let stream = builder
        .open_native_async()
        .with_context(|| format!("Cannot open serial port {}", path))?;

    info!(
        "serial_open port={} baud={} dataBits=8 stopBits=1 parity=NONE timeoutMs={}",
        path,
        baud_rate,
        timeout.as_millis()
    );
    Ok(stream)
}

/// Check whether the serial device is still there.
///
/// Device paths (`/dev/...`) can vanish when a USB adapter is unplugged;
/// anything that does not look like a path (e.g. `COM3`) is assumed
/// present and left to the open call to reject.
pub fn device_present(path: &str) -> bool {
    if !path.starts_with('/') {
        return true;
    }
    match std::fs::canonicalize(path) {
        Ok(real) => Path::new(&real).exists(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_path_ports_are_assumed_present() {
        assert!(device_present("COM3"));
        assert!(device_present("ttyUSB0"));
    }

    #[test]
    fn missing_device_paths_are_absent() {
        assert!(!device_present("/dev/nonexistent-metershim-port"));
    }

    #[test]
    fn existing_paths_are_present() {
        assert!(device_present("/dev/null"));
    }
}
