//! Per-peer transfer progress.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Receives progress for every chunk that leaves the send loop.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, peer: u64, bytes_sent: u64, total: u64);

    /// Called once the end-of-file marker went out.
    fn on_complete(&self, _peer: u64, _total: u64) {}
}

// MARK: - ProgressTracker

const THROUGHPUT_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    pub bytes_sent: u64,
    pub total: u64,
    /// Bytes per second over the last rolling second.
    pub throughput_bps: f64,
    pub complete: bool,
}

impl ProgressSnapshot {
    /// Fraction done in `0.0..=1.0`; an empty transfer counts as done.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.bytes_sent as f64 / self.total as f64
        }
    }
}

#[derive(Default)]
struct PeerProgress {
    bytes_sent: u64,
    total: u64,
    complete: bool,
    /// (when, bytes added) samples inside the rolling window.
    samples: VecDeque<(Instant, u64)>,
}

impl PeerProgress {
    fn record(&mut self, bytes_sent: u64, total: u64) {
        let now = Instant::now();
        let delta = bytes_sent.saturating_sub(self.bytes_sent);
        self.bytes_sent = bytes_sent;
        self.total = total;
        self.samples.push_back((now, delta));
        self.evict(now);
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&(t, _)) = self.samples.front() {
            if now.duration_since(t) > THROUGHPUT_WINDOW {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn snapshot(&self) -> ProgressSnapshot {
        let now = Instant::now();
        let recent: u64 = self
            .samples
            .iter()
            .filter(|(t, _)| now.duration_since(*t) <= THROUGHPUT_WINDOW)
            .map(|(_, b)| b)
            .sum();
        ProgressSnapshot {
            bytes_sent: self.bytes_sent,
            total: self.total,
            throughput_bps: recent as f64 / THROUGHPUT_WINDOW.as_secs_f64(),
            complete: self.complete,
        }
    }
}

/// [`ProgressSink`] that keeps the latest state per peer for polling.
#[derive(Default)]
pub struct ProgressTracker {
    peers: Mutex<HashMap<u64, PeerProgress>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self, peer: u64) -> Option<ProgressSnapshot> {
        self.lock().get(&peer).map(PeerProgress::snapshot)
    }

    pub fn peers(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn reset(&self, peer: u64) {
        self.lock().remove(&peer);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, PeerProgress>> {
        self.peers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ProgressSink for ProgressTracker {
    fn on_progress(&self, peer: u64, bytes_sent: u64, total: u64) {
        self.lock().entry(peer).or_default().record(bytes_sent, total);
    }

    fn on_complete(&self, peer: u64, total: u64) {
        let mut peers = self.lock();
        let entry = peers.entry(peer).or_default();
        entry.bytes_sent = total;
        entry.total = total;
        entry.complete = true;
    }
}
