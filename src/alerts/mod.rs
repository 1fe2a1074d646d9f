// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the metershim project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Alert engine with episode accounting.
//!
//! Alerts are keyed by a stable string (`METER_DISCONNECTED`,
//! `SOLIS_DOWN`, ...). Raising an inactive key starts a new *episode*:
//! `first_seen` resets and the per-episode counter restarts. Resolving an
//! active key closes the episode and, for WARN and above, archives it into
//! a bounded history that feeds the "deck" view.
//!
//! Two bounded rings keep memory flat: the last 50 raw raise/resolve
//! events and the last 100 resolved episodes. Sinks (Telegram, ...) are
//! notified after the state transition commits, outside the engine lock.

pub mod heartbeat;
pub mod telegram;

use log::{info, warn};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use crate::snapshot::now_ms;

const RECENT_CAPACITY: usize = 50;
const EPISODE_HISTORY_CAPACITY: usize = 100;
const DECK_LIMIT_MAX: usize = 50;

/// Alert severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warn,
    Error,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Info => "INFO",
            Severity::Warn => "WARN",
            Severity::Error => "ERROR",
            Severity::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

/// Raise or resolve, as recorded in the event ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    Raise,
    Resolve,
}

/// Point-in-time view of one alert.
#[derive(Debug, Clone, Serialize)]
pub struct AlertView {
    pub key: String,
    pub message: String,
    pub severity: Severity,
    /// Start of the current episode (epoch ms).
    pub first_seen: u64,
    pub last_seen: u64,
    /// Raise count within the current episode.
    pub count: u32,
    pub active: bool,
}

/// One entry of the recent-event ring.
#[derive(Debug, Clone, Serialize)]
pub struct EventView {
    pub key: String,
    pub message: String,
    pub severity: Severity,
    pub ts: u64,
    pub kind: EventKind,
}

/// A finished or still-active episode, as shown in the deck.
#[derive(Debug, Clone, Serialize)]
pub struct EpisodeView {
    pub key: String,
    pub message: String,
    pub severity: Severity,
    pub started_at: u64,
    pub last_seen: u64,
    /// `None` while the episode is still active.
    pub resolved_at: Option<u64>,
    pub count: u32,
    pub active: bool,
}

/// Standard snapshot: active alerts plus the recent raw events.
#[derive(Debug, Clone, Serialize)]
pub struct AlertsSnapshot {
    /// Active alerts sorted by `last_seen`, newest first.
    pub active: Vec<AlertView>,
    /// Recent events, newest first.
    pub recent: Vec<EventView>,
}

/// The newest event with an identical burst collapsed into one item.
#[derive(Debug, Clone, Serialize)]
pub struct CollapsedEvent {
    pub key: String,
    pub message: String,
    pub severity: Severity,
    /// True when the collapsed burst ends in a RAISE.
    pub active: bool,
    pub first_ts: u64,
    pub last_ts: u64,
    pub count: u32,
}

/// Pluggable alert observer.
///
/// Implementations must not block: the engine calls them on the raising
/// task right after the state transition, so anything slow belongs behind
/// a channel.
pub trait AlertSink: Send + Sync {
    fn on_raise(&self, _alert: &AlertView) {}
    fn on_resolve(&self, _alert: &AlertView) {}
}

struct MutableAlert {
    message: String,
    severity: Severity,
    active: bool,
    first_seen: u64,
    last_seen: u64,
    count: u32,
}

impl MutableAlert {
    fn view(&self, key: &str) -> AlertView {
        AlertView {
            key: key.to_string(),
            message: self.message.clone(),
            severity: self.severity,
            first_seen: self.first_seen,
            last_seen: self.last_seen,
            count: self.count,
            active: self.active,
        }
    }
}

struct EngineState {
    alerts: HashMap<String, MutableAlert>,
    recent: VecDeque<EventView>,
    episode_history: VecDeque<EpisodeView>,
}

/// Process-wide alert registry.
///
/// All mutations serialize on one lock with short critical sections;
/// snapshot and deck calls return owned copies.
pub struct AlertEngine {
    state: Mutex<EngineState>,
    sinks: RwLock<Vec<Arc<dyn AlertSink>>>,
    deck_min_severity: Severity,
}

impl AlertEngine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(EngineState {
                alerts: HashMap::new(),
                recent: VecDeque::with_capacity(RECENT_CAPACITY),
                episode_history: VecDeque::with_capacity(EPISODE_HISTORY_CAPACITY),
            }),
            sinks: RwLock::new(Vec::new()),
            deck_min_severity: Severity::Warn,
        }
    }

    /// Register an alert sink. Sinks registered later miss earlier events.
    pub fn register_sink(&self, sink: Arc<dyn AlertSink>) {
        self.sinks.write().unwrap().push(sink);
    }

    /// Raise or refresh an alert. Starts a new episode if it was inactive.
    pub fn raise(&self, key: &str, message: impl Into<String>, severity: Severity) {
        self.raise_at(key, message, severity, now_ms());
    }

    /// Raise with an explicit timestamp (epoch ms).
    pub fn raise_at(&self, key: &str, message: impl Into<String>, severity: Severity, now: u64) {
        let message = message.into();
        let view = {
            let mut state = self.state.lock().unwrap();
            let alert = state
                .alerts
                .entry(key.to_string())
                .or_insert_with(|| MutableAlert {
                    message: message.clone(),
                    severity,
                    active: false,
                    first_seen: now,
                    last_seen: now,
                    count: 0,
                });

            if !alert.active {
                // episode restart
                alert.first_seen = now;
                alert.count = 0;
            }
            alert.active = true;
            alert.severity = severity;
            alert.message = message.clone();
            alert.count += 1;
            alert.last_seen = now;
            let view = alert.view(key);

            push_event(
                &mut state.recent,
                EventView {
                    key: key.to_string(),
                    message,
                    severity,
                    ts: now,
                    kind: EventKind::Raise,
                },
            );
            view
        };

        warn!(
            "ALERT RAISE key={} sev={} msg={}",
            view.key, view.severity, view.message
        );
        for sink in self.sinks.read().unwrap().iter() {
            sink.on_raise(&view);
        }
    }

    /// Resolve an alert; closes the episode and archives it when its
    /// severity qualifies. Resolving an unknown or inactive key is a no-op.
    pub fn resolve(&self, key: &str) {
        self.resolve_at(key, now_ms());
    }

    /// Resolve with an explicit timestamp (epoch ms).
    pub fn resolve_at(&self, key: &str, now: u64) {
        let view = {
            let mut state = self.state.lock().unwrap();
            let Some(alert) = state.alerts.get_mut(key) else {
                return;
            };
            if !alert.active {
                return;
            }

            alert.active = false;
            let episode = EpisodeView {
                key: key.to_string(),
                message: alert.message.clone(),
                severity: alert.severity,
                started_at: alert.first_seen,
                last_seen: alert.last_seen,
                resolved_at: Some(now),
                count: alert.count,
                active: false,
            };
            alert.last_seen = now;
            let view = alert.view(key);

            push_event(
                &mut state.recent,
                EventView {
                    key: key.to_string(),
                    message: "recovered".to_string(),
                    severity: episode.severity,
                    ts: now,
                    kind: EventKind::Resolve,
                },
            );
            if episode.severity >= self.deck_min_severity {
                let history = &mut state.episode_history;
                history.push_back(episode);
                while history.len() > EPISODE_HISTORY_CAPACITY {
                    history.pop_front();
                }
            }
            view
        };

        info!("ALERT RESOLVE key={}", key);
        for sink in self.sinks.read().unwrap().iter() {
            sink.on_resolve(&view);
        }
    }

    /// True when the key currently has an active episode.
    pub fn is_active(&self, key: &str) -> bool {
        let state = self.state.lock().unwrap();
        state.alerts.get(key).map(|a| a.active).unwrap_or(false)
    }

    /// All active alerts (newest first) plus the recent events (newest
    /// first).
    pub fn snapshot(&self) -> AlertsSnapshot {
        let state = self.state.lock().unwrap();
        let mut active: Vec<AlertView> = state
            .alerts
            .iter()
            .filter(|(_, a)| a.active)
            .map(|(k, a)| a.view(k))
            .collect();
        active.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));

        let recent: Vec<EventView> = state.recent.iter().rev().cloned().collect();
        AlertsSnapshot { active, recent }
    }

    /// The deck: newest first, at most `min(max(1, limit), 50)` items.
    ///
    /// Active WARN+ episodes come first (by `last_seen` desc), then the
    /// most recent resolved episodes, skipping duplicates by
    /// `(key, started_at)`.
    pub fn deck(&self, limit: usize) -> Vec<EpisodeView> {
        let cap = limit.clamp(1, DECK_LIMIT_MAX);
        let state = self.state.lock().unwrap();

        let mut out: Vec<EpisodeView> = state
            .alerts
            .iter()
            .filter(|(_, a)| a.active && a.severity >= self.deck_min_severity)
            .map(|(k, a)| EpisodeView {
                key: k.clone(),
                message: a.message.clone(),
                severity: a.severity,
                started_at: a.first_seen,
                last_seen: a.last_seen,
                resolved_at: None,
                count: a.count,
                active: true,
            })
            .collect();
        out.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        out.truncate(cap);

        for episode in state.episode_history.iter().rev() {
            if out.len() >= cap {
                break;
            }
            let duplicate = out
                .iter()
                .any(|e| e.key == episode.key && e.started_at == episode.started_at);
            if !duplicate {
                out.push(episode.clone());
            }
        }
        out
    }

    /// The newest event, with a burst of identical events (same key,
    /// message, severity and kind, consecutive timestamps within `gap_ms`)
    /// collapsed into one item. `None` before the first event.
    pub fn latest_collapsed(&self, gap_ms: u64) -> Option<CollapsedEvent> {
        let state = self.state.lock().unwrap();
        let mut iter = state.recent.iter().rev();
        let newest = iter.next()?;

        let mut first_ts = newest.ts;
        let mut last_older = newest.ts;
        let mut count = 1u32;
        for event in iter {
            if event.key != newest.key
                || event.message != newest.message
                || event.severity != newest.severity
                || event.kind != newest.kind
                || last_older.saturating_sub(event.ts) > gap_ms
            {
                break;
            }
            first_ts = event.ts;
            last_older = event.ts;
            count += 1;
        }

        Some(CollapsedEvent {
            key: newest.key.clone(),
            message: newest.message.clone(),
            severity: newest.severity,
            active: newest.kind == EventKind::Raise,
            first_ts,
            last_ts: newest.ts,
            count,
        })
    }
}

impl Default for AlertEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn push_event(recent: &mut VecDeque<EventView>, event: EventView) {
    recent.push_back(event);
    while recent.len() > RECENT_CAPACITY {
        recent.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn severity_order() {
        assert!(Severity::Info < Severity::Warn);
        assert!(Severity::Warn < Severity::Error);
        assert!(Severity::Error < Severity::Critical);
    }

    #[test]
    fn raise_then_resolve_closes_one_episode() {
        let engine = AlertEngine::new();
        for i in 0..5 {
            engine.raise_at("METER_STALE", "old data", Severity::Error, 1_000 + i);
        }
        engine.resolve_at("METER_STALE", 2_000);

        let snapshot = engine.snapshot();
        assert!(snapshot.active.is_empty());
        // 5 raises + 1 resolve
        assert_eq!(snapshot.recent.len(), 6);
        assert!(matches!(snapshot.recent[0].kind, EventKind::Resolve));

        let deck = engine.deck(10);
        assert_eq!(deck.len(), 1);
        assert_eq!(deck[0].key, "METER_STALE");
        assert_eq!(deck[0].count, 5);
        assert_eq!(deck[0].started_at, 1_000);
        assert_eq!(deck[0].resolved_at, Some(2_000));
    }

    #[test]
    fn new_episode_resets_first_seen_and_count() {
        let engine = AlertEngine::new();
        engine.raise_at("SOLIS_DOWN", "HTTP 502", Severity::Warn, 100);
        engine.raise_at("SOLIS_DOWN", "HTTP 502", Severity::Warn, 200);
        engine.resolve_at("SOLIS_DOWN", 300);
        engine.raise_at("SOLIS_DOWN", "HTTP 503", Severity::Warn, 400);

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.active.len(), 1);
        let active = &snapshot.active[0];
        assert_eq!(active.first_seen, 400);
        assert_eq!(active.count, 1);
        assert_eq!(active.message, "HTTP 503");
    }

    #[test]
    fn resolve_without_raise_is_noop() {
        let engine = AlertEngine::new();
        engine.resolve("NEVER_RAISED");
        assert!(engine.snapshot().recent.is_empty());
        // double resolve only records one event
        engine.raise_at("X", "m", Severity::Warn, 1);
        engine.resolve_at("X", 2);
        engine.resolve_at("X", 3);
        assert_eq!(engine.snapshot().recent.len(), 2);
    }

    #[test]
    fn info_episodes_stay_out_of_history() {
        let engine = AlertEngine::new();
        engine.raise_at("NOTE", "fyi", Severity::Info, 1);
        engine.resolve_at("NOTE", 2);
        assert!(engine.deck(10).is_empty());
    }

    #[test]
    fn event_ring_is_bounded() {
        let engine = AlertEngine::new();
        for i in 0..120u64 {
            engine.raise_at("K", "m", Severity::Warn, i);
            engine.resolve_at("K", i);
        }
        let snapshot = engine.snapshot();
        assert_eq!(snapshot.recent.len(), 50);
        // newest first
        assert!(snapshot.recent[0].ts >= snapshot.recent[49].ts);
    }

    #[test]
    fn deck_is_capped_and_deduplicated() {
        let engine = AlertEngine::new();
        for i in 0..200u64 {
            let key = format!("K{}", i % 120);
            engine.raise_at(&key, "m", Severity::Error, i);
            engine.resolve_at(&key, i + 1);
        }
        for limit in [0usize, 1, 7, 50, 500] {
            let deck = engine.deck(limit);
            assert!(deck.len() <= limit.clamp(1, 50));
            for (i, a) in deck.iter().enumerate() {
                for b in deck.iter().skip(i + 1) {
                    assert!(!(a.key == b.key && a.started_at == b.started_at));
                }
            }
        }
    }

    #[test]
    fn deck_puts_active_before_history() {
        let engine = AlertEngine::new();
        engine.raise_at("OLD", "m", Severity::Error, 10);
        engine.resolve_at("OLD", 20);
        engine.raise_at("LIVE", "m", Severity::Error, 5);

        let deck = engine.deck(10);
        assert_eq!(deck.len(), 2);
        assert_eq!(deck[0].key, "LIVE");
        assert!(deck[0].active);
        assert_eq!(deck[1].key, "OLD");
        assert!(!deck[1].active);
    }

    #[test]
    fn latest_collapsed_merges_bursts() {
        let engine = AlertEngine::new();
        assert!(engine.latest_collapsed(1000).is_none());

        engine.raise_at("K", "m", Severity::Warn, 100);
        engine.raise_at("K", "m", Severity::Warn, 200);
        engine.raise_at("K", "m", Severity::Warn, 260);

        let item = engine.latest_collapsed(100).unwrap();
        assert_eq!(item.count, 2); // 260 and 200 collapse, 100 is too far
        assert_eq!(item.first_ts, 200);
        assert_eq!(item.last_ts, 260);
        assert!(item.active);

        // a different message breaks the burst
        engine.raise_at("K", "other", Severity::Warn, 300);
        let item = engine.latest_collapsed(1000).unwrap();
        assert_eq!(item.count, 1);
        assert_eq!(item.message, "other");
    }

    #[test]
    fn sinks_see_raise_and_resolve() {
        struct Counting {
            raises: AtomicUsize,
            resolves: AtomicUsize,
        }
        impl AlertSink for Counting {
            fn on_raise(&self, _alert: &AlertView) {
                self.raises.fetch_add(1, Ordering::SeqCst);
            }
            fn on_resolve(&self, _alert: &AlertView) {
                self.resolves.fetch_add(1, Ordering::SeqCst);
            }
        }

        let engine = AlertEngine::new();
        let sink = Arc::new(Counting {
            raises: AtomicUsize::new(0),
            resolves: AtomicUsize::new(0),
        });
        engine.register_sink(sink.clone());

        engine.raise("K", "m", Severity::Warn);
        engine.raise("K", "m", Severity::Warn);
        engine.resolve("K");
        engine.resolve("K"); // inactive: no notification

        assert_eq!(sink.raises.load(Ordering::SeqCst), 2);
        assert_eq!(sink.resolves.load(Ordering::SeqCst), 1);
    }
}
