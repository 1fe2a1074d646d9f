// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the metershim project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Telegram alert sink.
//!
//! Forwards raises and resolves to one or more Telegram chats. A raise is
//! rate-limited per alert key by a cooldown window; a resolve is always
//! forwarded and clears the key's cooldown slot so the next episode
//! notifies immediately.
//!
//! The [`AlertSink`] callbacks run on whatever task raised the alert, so
//! this sink only formats the message and pushes it onto an unbounded
//! channel; a dedicated forwarding task owns the HTTP client and does the
//! actual sends.

use chrono::DateTime;
use log::{info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use super::{AlertSink, AlertView};
use crate::config::TelegramConfig;
use crate::snapshot::now_ms;

/// Telegram notification sink.
pub struct TelegramSink {
    config: TelegramConfig,
    tx: Option<mpsc::UnboundedSender<String>>,
    last_sent: Mutex<HashMap<String, u64>>,
}

impl TelegramSink {
    /// Create the sink and, when it is operational, spawn its forwarding
    /// task on the current runtime.
    pub fn start(config: TelegramConfig, running: Arc<AtomicBool>) -> Arc<Self> {
        let operational =
            config.enabled && !config.bot_token.is_empty() && !config.chat_ids.is_empty();
        info!(
            "Telegram sink registered: enabled={} tokenSet={} targets={}",
            config.enabled,
            !config.bot_token.is_empty(),
            config.chat_ids.len()
        );

        let tx = if operational {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(forwarding_loop(config.clone(), rx, running));
            Some(tx)
        } else {
            None
        };

        Arc::new(Self {
            config,
            tx,
            last_sent: Mutex::new(HashMap::new()),
        })
    }

    fn enqueue(&self, text: String) {
        if let Some(tx) = &self.tx {
            // receiver only goes away at shutdown; dropping the message then is fine
            let _ = tx.send(text);
        }
    }

    fn header(&self) -> String {
        if self.config.prefix.is_empty() {
            String::new()
        } else {
            format!("*{}*\n", escape_markdown(&self.config.prefix))
        }
    }

    /// Send a free-form message (lifecycle and heartbeat pings) with the
    /// configured device prefix.
    pub fn send_with_prefix(&self, markdown_body: &str) {
        self.enqueue(format!("{}{}", self.header(), markdown_body));
    }
}

impl AlertSink for TelegramSink {
    fn on_raise(&self, alert: &AlertView) {
        if self.tx.is_none() {
            return;
        }
        let now = now_ms();
        {
            let mut last_sent = self.last_sent.lock().unwrap();
            if let Some(&last) = last_sent.get(&alert.key) {
                if now.saturating_sub(last) < self.config.cooldown_ms {
                    return;
                }
            }
            last_sent.insert(alert.key.clone(), now);
        }

        let text = format!(
            "{}⚠️ *{}* `{}`\n{}\n_firstSeen:_ {}\n_lastSeen:_ {}",
            self.header(),
            alert.severity,
            escape_markdown(&alert.key),
            escape_markdown(&alert.message),
            format_ts(alert.first_seen),
            format_ts(alert.last_seen),
        );
        self.enqueue(text);
    }

    fn on_resolve(&self, alert: &AlertView) {
        if self.tx.is_none() {
            return;
        }
        self.last_sent.lock().unwrap().remove(&alert.key);
        let text = format!(
            "{}✅ *RECOVERED* `{}`\n_lastSeen:_ {}",
            self.header(),
            escape_markdown(&alert.key),
            format_ts(alert.last_seen),
        );
        self.enqueue(text);
    }
}

async fn forwarding_loop(
    config: TelegramConfig,
    mut rx: mpsc::UnboundedReceiver<String>,
    running: Arc<AtomicBool>,
) {
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            warn!("Telegram sink disabled, HTTP client build failed: {}", e);
            return;
        }
    };
    let url = format!("https://api.telegram.org/bot{}/sendMessage", config.bot_token);

    while let Some(text) = rx.recv().await {
        for chat_id in &config.chat_ids {
            let form = [
                ("chat_id", chat_id.as_str()),
                ("parse_mode", "Markdown"),
                ("text", text.as_str()),
            ];
            match client.post(&url).form(&form).send().await {
                Ok(resp) if resp.status().is_success() => {
                    info!("Telegram sent to {} ({})", chat_id, resp.status());
                }
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    warn!("Telegram send failed ({}): {}", status, body);
                }
                Err(e) => {
                    warn!("Telegram send exception to {}: {}", chat_id, e);
                }
            }
        }
        if !running.load(Ordering::SeqCst) && rx.is_empty() {
            break;
        }
    }
}

fn format_ts(epoch_ms: u64) -> String {
    DateTime::from_timestamp_millis(epoch_ms as i64)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| format!("{} ms", epoch_ms))
}

fn escape_markdown(s: &str) -> String {
    s.replace('_', "\\_").replace('*', "\\*").replace('`', "\\`")
}
