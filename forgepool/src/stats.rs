//! Pool-wide counters and recent-share samples.
//!
//! Hot counters are atomics so the share path never blocks on the stats
//! lock; everything else lives behind a short-lived parking_lot mutex.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;

use crate::job::validator::RejectCode;

/// Bounded ring of recent share samples kept for the API.
pub const MAX_RECENT_SHARE_SAMPLES: usize = 240;

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Serialize)]
pub struct ShareSample {
    pub t: u64,
    pub kind: &'static str,
    pub difficulty: f64,
    pub worker: String,
    pub reason: Option<&'static str>,
}

pub struct PoolStats {
    pub started_at: u64,
    pub templates_fetched: AtomicU64,
    pub job_broadcasts: AtomicU64,
    pub connections_total: AtomicU64,
    pub shares_accepted: AtomicU64,
    pub shares_rejected: AtomicU64,
    pub shares_stale: AtomicU64,
    pub shares_duplicate: AtomicU64,
    pub shares_low_diff: AtomicU64,
    pub blocks_found: AtomicU64,
    pub blocks_rejected: AtomicU64,
    inner: Mutex<StatsInner>,
}

#[derive(Default)]
struct StatsInner {
    current_height: u64,
    current_network_bits: Option<String>,
    last_template_at: u64,
    last_template_source: Option<&'static str>,
    last_template_fetch_ms: u64,
    avg_template_fetch_ms: u64,
    last_broadcast_at: u64,
    last_broadcast_clients: u64,
    last_share_at: u64,
    last_share_worker: Option<String>,
    last_found_block_hash: Option<String>,
    last_found_block_at: u64,
    best_share_difficulty: f64,
    best_share_worker: Option<String>,
    best_share_at: u64,
    recent_shares: VecDeque<ShareSample>,
}

/// Serializable snapshot of everything above, for the API.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub started_at: u64,
    pub uptime_sec: u64,
    pub templates_fetched: u64,
    pub job_broadcasts: u64,
    pub connections_total: u64,
    pub shares_accepted: u64,
    pub shares_rejected: u64,
    pub shares_stale: u64,
    pub shares_duplicate: u64,
    pub shares_low_diff: u64,
    pub blocks_found: u64,
    pub blocks_rejected: u64,
    pub current_height: u64,
    pub current_network_bits: Option<String>,
    pub last_template_at: u64,
    pub last_template_source: Option<&'static str>,
    pub last_template_fetch_ms: u64,
    pub avg_template_fetch_ms: u64,
    pub last_broadcast_at: u64,
    pub last_broadcast_clients: u64,
    pub last_share_at: u64,
    pub last_share_worker: Option<String>,
    pub last_found_block_hash: Option<String>,
    pub last_found_block_at: u64,
    pub best_share_difficulty: f64,
    pub best_share_worker: Option<String>,
    pub best_share_at: u64,
    pub recent_shares: Vec<ShareSample>,
}

impl PoolStats {
    pub fn new() -> Self {
        Self {
            started_at: now_ms(),
            templates_fetched: AtomicU64::new(0),
            job_broadcasts: AtomicU64::new(0),
            connections_total: AtomicU64::new(0),
            shares_accepted: AtomicU64::new(0),
            shares_rejected: AtomicU64::new(0),
            shares_stale: AtomicU64::new(0),
            shares_duplicate: AtomicU64::new(0),
            shares_low_diff: AtomicU64::new(0),
            blocks_found: AtomicU64::new(0),
            blocks_rejected: AtomicU64::new(0),
            inner: Mutex::new(StatsInner::default()),
        }
    }

    /// Record a non-longpoll template fetch latency. Anything above five
    /// seconds is assumed to be a network problem and skipped.
    pub fn record_template_fetch_latency(&self, fetch_ms: u64) {
        if fetch_ms > 5000 {
            return;
        }
        let mut inner = self.inner.lock();
        inner.last_template_fetch_ms = fetch_ms;
        inner.avg_template_fetch_ms = if inner.avg_template_fetch_ms > 0 {
            (inner.avg_template_fetch_ms * 7 + fetch_ms * 3) / 10
        } else {
            fetch_ms
        };
    }

    pub fn record_template(&self, height: u64, bits: &str, source: &'static str) {
        let mut inner = self.inner.lock();
        inner.current_height = height;
        inner.current_network_bits = Some(bits.to_string());
        inner.last_template_at = now_ms();
        inner.last_template_source = Some(source);
    }

    pub fn record_broadcast(&self, clients: u64) {
        self.job_broadcasts.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        inner.last_broadcast_at = now_ms();
        inner.last_broadcast_clients = clients;
    }

    pub fn record_accepted(&self, worker: &str, share_difficulty: f64, now: u64) {
        self.shares_accepted.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        inner.last_share_at = now;
        inner.last_share_worker = Some(worker.to_string());
        if share_difficulty > 0.0 && share_difficulty > inner.best_share_difficulty {
            inner.best_share_difficulty = share_difficulty;
            inner.best_share_worker = Some(worker.to_string());
            inner.best_share_at = now;
        }
    }

    pub fn record_rejected(&self, code: RejectCode) {
        self.shares_rejected.fetch_add(1, Ordering::Relaxed);
        match code {
            RejectCode::Stale => {
                self.shares_stale.fetch_add(1, Ordering::Relaxed);
            }
            RejectCode::Duplicate => {
                self.shares_duplicate.fetch_add(1, Ordering::Relaxed);
            }
            RejectCode::LowDiff => {
                self.shares_low_diff.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    pub fn record_share_sample(
        &self,
        accepted: bool,
        difficulty: f64,
        worker: &str,
        reason: Option<RejectCode>,
    ) {
        let mut inner = self.inner.lock();
        inner.recent_shares.push_back(ShareSample {
            t: now_ms(),
            kind: if accepted { "accepted" } else { "rejected" },
            difficulty: if difficulty.is_finite() && difficulty > 0.0 {
                difficulty
            } else {
                0.0
            },
            worker: worker.to_string(),
            reason: reason.map(|c| c.as_str()),
        });
        while inner.recent_shares.len() > MAX_RECENT_SHARE_SAMPLES {
            inner.recent_shares.pop_front();
        }
    }

    pub fn record_block_found(&self, block_hash: &str) {
        self.blocks_found.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        inner.last_found_block_hash = Some(block_hash.to_string());
        inner.last_found_block_at = now_ms();
    }

    pub fn record_block_rejected(&self) {
        self.blocks_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let inner = self.inner.lock();
        StatsSnapshot {
            started_at: self.started_at,
            uptime_sec: now_ms().saturating_sub(self.started_at) / 1000,
            templates_fetched: self.templates_fetched.load(Ordering::Relaxed),
            job_broadcasts: self.job_broadcasts.load(Ordering::Relaxed),
            connections_total: self.connections_total.load(Ordering::Relaxed),
            shares_accepted: self.shares_accepted.load(Ordering::Relaxed),
            shares_rejected: self.shares_rejected.load(Ordering::Relaxed),
            shares_stale: self.shares_stale.load(Ordering::Relaxed),
            shares_duplicate: self.shares_duplicate.load(Ordering::Relaxed),
            shares_low_diff: self.shares_low_diff.load(Ordering::Relaxed),
            blocks_found: self.blocks_found.load(Ordering::Relaxed),
            blocks_rejected: self.blocks_rejected.load(Ordering::Relaxed),
            current_height: inner.current_height,
            current_network_bits: inner.current_network_bits.clone(),
            last_template_at: inner.last_template_at,
            last_template_source: inner.last_template_source,
            last_template_fetch_ms: inner.last_template_fetch_ms,
            avg_template_fetch_ms: inner.avg_template_fetch_ms,
            last_broadcast_at: inner.last_broadcast_at,
            last_broadcast_clients: inner.last_broadcast_clients,
            last_share_at: inner.last_share_at,
            last_share_worker: inner.last_share_worker.clone(),
            last_found_block_hash: inner.last_found_block_hash.clone(),
            last_found_block_at: inner.last_found_block_at,
            best_share_difficulty: inner.best_share_difficulty,
            best_share_worker: inner.best_share_worker.clone(),
            best_share_at: inner.best_share_at,
            recent_shares: inner.recent_shares.iter().cloned().collect(),
        }
    }
}

impl Default for PoolStats {
    fn default() -> Self {
        Self::new()
    }
}
