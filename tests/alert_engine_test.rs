// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the metershim project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Alert engine behavior through the public crate API: episode
//! accounting, ring bounds and the deck/collapse views.

use metershim::alerts::{AlertEngine, AlertSink, AlertView, EventKind, Severity};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[test]
fn n_raises_one_resolve_is_one_episode_with_count_n() {
    let engine = AlertEngine::new();
    for _ in 0..7 {
        engine.raise("METER_DISCONNECTED", "port gone", Severity::Error);
    }
    engine.resolve("METER_DISCONNECTED");

    let snapshot = engine.snapshot();
    let raises = snapshot
        .recent
        .iter()
        .filter(|e| matches!(e.kind, EventKind::Raise))
        .count();
    let resolves = snapshot
        .recent
        .iter()
        .filter(|e| matches!(e.kind, EventKind::Resolve))
        .count();
    assert_eq!(raises, 7);
    assert_eq!(resolves, 1);

    let deck = engine.deck(10);
    assert_eq!(deck.len(), 1);
    assert_eq!(deck[0].count, 7);
    assert!(!deck[0].active);
    assert!(deck[0].resolved_at.is_some());
}

#[test]
fn ring_holds_at_most_fifty_events() {
    let engine = AlertEngine::new();
    for i in 0..80 {
        engine.raise(&format!("K{}", i), "m", Severity::Info);
    }
    assert_eq!(engine.snapshot().recent.len(), 50);
    // the newest event is the last raised key
    assert_eq!(engine.snapshot().recent[0].key, "K79");
}

#[test]
fn deck_respects_limit_and_caps_at_fifty() {
    let engine = AlertEngine::new();
    for i in 0..70 {
        let key = format!("K{}", i);
        engine.raise(&key, "m", Severity::Warn);
        engine.resolve(&key);
    }
    assert_eq!(engine.deck(3).len(), 3);
    assert_eq!(engine.deck(0).len(), 1);
    assert_eq!(engine.deck(1000).len(), 50);
}

#[test]
fn active_alerts_sort_newest_first() {
    let engine = AlertEngine::new();
    engine.raise_at("A", "m", Severity::Warn, 100);
    engine.raise_at("B", "m", Severity::Warn, 300);
    engine.raise_at("C", "m", Severity::Warn, 200);

    let active = engine.snapshot().active;
    let keys: Vec<&str> = active.iter().map(|a| a.key.as_str()).collect();
    assert_eq!(keys, vec!["B", "C", "A"]);
}

#[test]
fn collapsed_view_merges_identical_bursts() {
    let engine = AlertEngine::new();
    engine.raise_at("SOLIS_DOWN", "HTTP 502", Severity::Warn, 1_000);
    engine.raise_at("SOLIS_DOWN", "HTTP 502", Severity::Warn, 1_100);
    engine.raise_at("SOLIS_DOWN", "HTTP 502", Severity::Warn, 1_250);

    let item = engine.latest_collapsed(500).unwrap();
    assert_eq!(item.key, "SOLIS_DOWN");
    assert_eq!(item.count, 3);
    assert_eq!(item.first_ts, 1_000);
    assert_eq!(item.last_ts, 1_250);
    assert!(item.active);
}

#[test]
fn sinks_fire_per_transition_not_per_call() {
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

    engine.raise("K", "m", Severity::Error);
    engine.resolve("K");
    engine.resolve("K");
    engine.resolve("NEVER");

    assert_eq!(sink.raises.load(Ordering::SeqCst), 1);
    assert_eq!(sink.resolves.load(Ordering::SeqCst), 1);
}
