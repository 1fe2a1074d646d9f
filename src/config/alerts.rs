// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the metershim project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Alert sink and heartbeat configuration.

use serde::{Deserialize, Serialize};

/// Telegram notification sink settings.
///
/// Disabled unless both a bot token and at least one chat id are set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    /// Master switch for the sink.
    pub enabled: bool,

    /// Bot token from @BotFather.
    pub bot_token: String,

    /// Destination chat ids; every message is fanned out to all of them.
    pub chat_ids: Vec<String>,

    /// Per-alert-key cooldown before a RAISE is re-sent (ms). RESOLVE is
    /// always forwarded.
    pub cooldown_ms: u64,

    /// Device tag prepended to every message, useful with several sites
    /// reporting into one chat.
    pub prefix: String,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bot_token: String::new(),
            chat_ids: Vec::new(),
            cooldown_ms: 900_000,
            prefix: String::new(),
        }
    }
}

/// Alerting configuration: the Telegram sink plus lifecycle and daily
/// heartbeat pings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    pub telegram: TelegramConfig,

    /// Send a ping when the daemon finishes starting.
    pub startup_ping: bool,

    /// Send a ping while shutting down.
    pub shutdown_ping: bool,

    /// Enable the daily heartbeat summary.
    pub heartbeat_enabled: bool,

    /// UTC hour (0..=23) of the daily heartbeat.
    pub heartbeat_hour_utc: u32,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            telegram: TelegramConfig::default(),
            startup_ping: true,
            shutdown_ping: true,
            heartbeat_enabled: true,
            heartbeat_hour_utc: 10,
        }
    }
}
