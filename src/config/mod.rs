// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the metershim project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Application configuration.
//!
//! The configuration is a YAML file deserialized into [`Config`], one
//! section per component. Every field has a default, so a partial file
//! (or none at all) yields a runnable configuration; when the file is
//! missing a default one is written next to the requested path so the
//! operator has something to edit.
//!
//! [`Config::validate`] performs the checks that the type system cannot:
//! range clamps with a warning rather than a refusal wherever a safe
//! fallback exists, hard errors only for settings that would corrupt the
//! register image.

mod alerts;
mod cloud;
mod control;
mod inverter;
mod meter;

pub use alerts::{AlertsConfig, TelegramConfig};
pub use cloud::CloudConfig;
pub use control::ControlConfig;
pub use inverter::InverterConfig;
pub use meter::MeterConfig;

use anyhow::{Context, Result};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::codec::WordOrder;

/// Scheduler (worker pool) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Runtime worker threads running all periodic jobs.
    pub workers: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { workers: 8 }
    }
}

/// Serial I/O timeouts shared by both buses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialIoConfig {
    /// Serial read timeout (ms).
    pub read_timeout_ms: u64,
    /// Serial write timeout (ms).
    pub write_timeout_ms: u64,
}

impl Default for SerialIoConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: 1000,
            write_timeout_ms: 1000,
        }
    }
}

/// Root configuration aggregate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    pub serial_io: SerialIoConfig,
    /// Word order of two-word float registers (status decode path).
    pub float_order: WordOrder,
    pub meter: MeterConfig,
    pub inverter: InverterConfig,
    pub cloud: CloudConfig,
    pub control: ControlConfig,
    pub alerts: AlertsConfig,
}

impl Config {
    /// Load configuration from a YAML file.
    ///
    /// A missing file is not an error: the defaults are written to `path`
    /// and returned, so a first run leaves an editable template behind.
    ///
    /// ### Errors
    ///
    /// Fails when the file exists but cannot be read or parsed, or when
    /// [`Config::validate`] rejects the result.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!(
                "Configuration file not found at {:?}, writing defaults",
                path
            );
            let config = Self::default();
            config.save_to_file(path)?;
            return Ok(config);
        }

        debug!("Loading configuration from {:?}", path);
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file at {:?}", path))?;
        let mut config: Config = serde_yml::from_str(&contents)
            .with_context(|| format!("Failed to parse YAML configuration from {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize the configuration back to a YAML file.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml =
            serde_yml::to_string(self).context("Failed to serialize configuration to YAML")?;
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory {:?}", parent))?;
            }
        }
        fs::write(path.as_ref(), yaml)
            .with_context(|| format!("Failed to write configuration to {:?}", path.as_ref()))?;
        Ok(())
    }

    /// Apply command line overrides on top of the loaded file.
    pub fn apply_args(&mut self, meter_port: Option<String>, inverter_port: Option<String>) {
        if let Some(port) = meter_port {
            self.meter.port = port;
        }
        if let Some(port) = inverter_port {
            self.inverter.port = port;
        }
    }

    /// Sanity-check and clamp the configuration.
    ///
    /// Follows a repair-over-refuse policy: out-of-range knobs that have a
    /// safe interpretation are clamped with a warning. Only settings that
    /// would corrupt the register image are hard errors.
    pub fn validate(&mut self) -> Result<()> {
        if self.scheduler.workers == 0 {
            warn!("scheduler.workers is 0, using 1");
            self.scheduler.workers = 1;
        }

        if self.cloud.min_import_kw < 0.0 {
            warn!(
                "cloud.min_import_kw < 0 ({}), clamping to 0",
                self.cloud.min_import_kw
            );
            self.cloud.min_import_kw = 0.0;
        }
        if !(0.0..=1.0).contains(&self.cloud.smoothing_factor) {
            warn!(
                "cloud.smoothing_factor out of [0, 1] ({}), disabling smoothing",
                self.cloud.smoothing_factor
            );
            self.cloud.smoothing_factor = 1.0;
        }
        if self.cloud.max_data_age_ms < 5_000 {
            warn!(
                "cloud.max_data_age_ms too small ({}), bumping to 5000 ms",
                self.cloud.max_data_age_ms
            );
            self.cloud.max_data_age_ms = 5_000;
        }
        if self.cloud.clamp_max_kw <= 0.0 || !self.cloud.clamp_max_kw.is_finite() {
            anyhow::bail!(
                "cloud.clamp_max_kw must be a positive finite number, got {}",
                self.cloud.clamp_max_kw
            );
        }
        if self.cloud.delta_max_kw_per_sec <= 0.0 {
            warn!(
                "cloud.delta_max_kw_per_sec not positive ({}), using 2.0",
                self.cloud.delta_max_kw_per_sec
            );
            self.cloud.delta_max_kw_per_sec = 2.0;
        }
        if self.cloud.override_enabled && !self.cloud.has_credentials() {
            warn!("cloud credentials incomplete, disabling compensation override");
            self.cloud.override_enabled = false;
        }

        if self.inverter.init_registers < 364 {
            anyhow::bail!(
                "inverter.init_registers must be >= 364 so the total power register exists, got {}",
                self.inverter.init_registers
            );
        }
        if self.alerts.heartbeat_hour_utc > 23 {
            anyhow::bail!(
                "alerts.heartbeat_hour_utc must be in 0..=23, got {}",
                self.alerts.heartbeat_hour_utc
            );
        }

        if self.control.scale_pt <= 0.0 || self.control.scale_ct <= 0.0 {
            anyhow::bail!(
                "control scaling ratios must be positive (pt={}, ct={})",
                self.control.scale_pt,
                self.control.scale_ct
            );
        }

        Ok(())
    }
}
