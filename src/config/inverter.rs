// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the metershim project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Inverter-side serial bus configuration (Modbus RTU slave).

use serde::{Deserialize, Serialize};

/// Configuration for the inverter-facing bus.
///
/// The feeder owns this port, runs an RTU slave on it and republishes the
/// transformed meter image into the slave's register banks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InverterConfig {
    /// Serial device path, e.g. `/dev/ttyUSB1`.
    pub port: String,

    /// Baud rate; framing is always 8-N-1.
    pub baud_rate: u32,

    /// Slave id this process answers as.
    pub slave_id: u8,

    /// Registers pre-zeroed on open in both the holding and input banks.
    /// Must stay >= 364 so the total power at 362/363 exists from boot.
    pub init_registers: usize,

    /// Maximum snapshot age accepted for a fresh publish (ms). Older input
    /// raises `INVERTER_FEEDER_STALE_INPUT`.
    pub max_sm_age_for_write_ms: u64,

    /// Watchdog limit: no successful publish within this window raises
    /// `INVERTER_OUTPUT_STALE` (ms).
    pub out_stale_ms: u64,

    /// Hold the port closed until the meter has produced a first snapshot.
    pub defer_open_until_first_frame: bool,

    /// When the input is missing or stale, keep re-publishing the last
    /// output image instead of leaving the bank frozen.
    pub republish_on_stale: bool,
}

impl Default for InverterConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB1".to_string(),
            baud_rate: 9600,
            slave_id: 1,
            init_registers: 400,
            max_sm_age_for_write_ms: 60_000,
            out_stale_ms: 30_000,
            defer_open_until_first_frame: true,
            republish_on_stale: true,
        }
    }
}
