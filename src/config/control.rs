// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the metershim project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Power-control transform configuration.

use serde::{Deserialize, Serialize};

/// Scaling ratios and safety limits used when mutating the register image.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Potential-transformer ratio applied to raw voltage words.
    pub scale_pt: f64,

    /// Current-transformer ratio applied to raw current and power words.
    pub scale_ct: f64,

    /// Power factor assumed when converting added watts to added amps,
    /// clamped into [0.1, 1.0] at use.
    pub min_power_factor: f64,

    /// Snapshot age past which the compensation path zeroes currents and
    /// powers instead of augmenting them (ms).
    pub stale_to_zero_ms: u64,

    /// A phase is alive when its decoded voltage reaches this (V).
    pub phase_min_volt: f64,

    /// Divisor floor for the watts-to-amps conversion (V).
    pub safe_div_min_volt: f64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            scale_pt: 1.0,
            scale_ct: 1.0,
            min_power_factor: 0.95,
            stale_to_zero_ms: 300_000,
            phase_min_volt: 100.0,
            safe_div_min_volt: 100.0,
        }
    }
}
