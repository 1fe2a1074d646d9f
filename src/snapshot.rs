// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the metershim project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Meter snapshot and the shared latest-value cell.
//!
//! A snapshot is an immutable pair of the raw register image and its
//! acquisition timestamp. The meter reader is the only producer; every
//! other component holds a read-only handle obtained from
//! [`MeterDataSource::latest`]. Snapshots are replaced atomically, so a
//! consumer always observes a consistent `{image, acquired_at}` pair and
//! old images are dropped once the last handle goes away.

use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

/// Working length of the raw Acrel image: index == register address,
/// with headroom above the highest used register (363).
pub const RAW_IMAGE_LEN: usize = 400;

/// Immutable meter snapshot: raw words plus read timestamp.
///
/// `acquired_at_ms == 0` means "never acquired", the boot placeholder
/// before the first successful poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeterSnapshot {
    /// Raw Modbus words, mirroring the meter's native addressing.
    pub words: Vec<u16>,
    /// Epoch milliseconds at the successful read, 0 if never read.
    pub acquired_at_ms: u64,
}

impl MeterSnapshot {
    /// Create a snapshot from a freshly read image.
    pub fn new(words: Vec<u16>, acquired_at_ms: u64) -> Self {
        Self {
            words,
            acquired_at_ms,
        }
    }

    /// The boot placeholder: an all-zero image that was never acquired.
    pub fn empty() -> Self {
        Self {
            words: vec![0; RAW_IMAGE_LEN],
            acquired_at_ms: 0,
        }
    }

    /// Age of this snapshot relative to `now_ms`, or `None` if it was
    /// never acquired.
    pub fn age_ms(&self, now_ms: u64) -> Option<u64> {
        if self.acquired_at_ms == 0 {
            None
        } else {
            Some(now_ms.saturating_sub(self.acquired_at_ms))
        }
    }
}

/// Thread-safe holder of the latest meter snapshot.
///
/// Single writer (the meter reader), any number of readers. The inner
/// `Arc` swap keeps the critical section to a pointer copy.
#[derive(Clone)]
pub struct MeterDataSource {
    latest: Arc<RwLock<Arc<MeterSnapshot>>>,
}

impl MeterDataSource {
    /// Create a data source holding the never-acquired placeholder.
    pub fn new() -> Self {
        Self {
            latest: Arc::new(RwLock::new(Arc::new(MeterSnapshot::empty()))),
        }
    }

    /// Atomically replace the latest snapshot.
    pub fn publish(&self, snapshot: MeterSnapshot) {
        let mut guard = self.latest.write().unwrap();
        *guard = Arc::new(snapshot);
    }

    /// Get a handle to the latest snapshot without blocking other readers.
    pub fn latest(&self) -> Arc<MeterSnapshot> {
        Arc::clone(&self.latest.read().unwrap())
    }
}

impl Default for MeterDataSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Current wall-clock time as epoch milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
