//! Per-connection variable difficulty.
//!
//! Pure state machine: the session feeds it accepted and low-difficulty
//! events and asks for retarget/downshift decisions. It never touches the
//! socket, so the banding logic is testable with synthetic timestamps.

use crate::config::Config;

/// Tuning knobs, snapshotted from the config at session start.
#[derive(Debug, Clone)]
pub struct VardiffConfig {
    pub enabled: bool,
    pub target_share_time_ms: u64,
    pub retarget_every_shares: u64,
    pub min_difficulty: f64,
    pub max_difficulty: f64,
}

impl VardiffConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            enabled: config.vardiff.enabled,
            target_share_time_ms: config.vardiff.target_share_time_ms.max(1000),
            retarget_every_shares: config.vardiff.retarget_every_shares.max(1),
            min_difficulty: config.min_difficulty_value(),
            max_difficulty: config.max_difficulty_value(),
        }
    }
}

#[derive(Debug, Default)]
pub struct VardiffState {
    pub accepted_shares: u64,
    pub low_diff_streak: u64,
    last_share_at: u64,
    avg_interval_ms: u64,
}

impl VardiffState {
    /// Fold an accepted share into the interval EMA. Accepted work also
    /// ends any low-difficulty streak.
    pub fn record_accepted(&mut self, now: u64) {
        if self.last_share_at > 0 {
            let delta = now.saturating_sub(self.last_share_at);
            self.avg_interval_ms = if self.avg_interval_ms > 0 {
                (self.avg_interval_ms * 7 + delta * 3) / 10
            } else {
                delta
            };
        }
        self.last_share_at = now;
        self.accepted_shares += 1;
        self.low_diff_streak = 0;
    }

    pub fn record_low_diff(&mut self) {
        self.low_diff_streak += 1;
    }

    pub fn avg_interval_ms(&self) -> u64 {
        self.avg_interval_ms
    }

    /// Periodic retarget against the share-time bands. Returns the new
    /// difficulty when one is warranted, `None` to leave it alone.
    pub fn retarget(&self, config: &VardiffConfig, current: f64) -> Option<f64> {
        if !config.enabled
            || self.accepted_shares < 2
            || self.accepted_shares % config.retarget_every_shares != 0
            || self.avg_interval_ms == 0
        {
            return None;
        }

        let target = config.target_share_time_ms as f64;
        let avg = self.avg_interval_ms as f64;
        let factor = if avg < target * 0.25 {
            4.0
        } else if avg < target * 0.5 {
            2.0
        } else if avg > target * 4.0 {
            0.25
        } else if avg > target * 2.0 {
            0.5
        } else {
            return None;
        };

        let next = (current * factor)
            .floor()
            .clamp(config.min_difficulty.max(1.0), config.max_difficulty);
        if next == current.floor() {
            return None;
        }
        Some(next)
    }

    /// Emergency cut for a miner that has never produced an accepted share
    /// and keeps submitting under target. Fires every ten rejects, drops to
    /// a quarter of the current difficulty, aiming a bit above the
    /// difficulty the reject actually demonstrated.
    pub fn downshift(
        &mut self,
        config: &VardiffConfig,
        current: f64,
        observed_difficulty: f64,
    ) -> Option<f64> {
        if self.accepted_shares != 0 || current <= config.min_difficulty {
            return None;
        }
        if self.low_diff_streak < 10 || self.low_diff_streak % 10 != 0 {
            return None;
        }

        let mut next = (current / 4.0).floor();
        if observed_difficulty.is_finite() && observed_difficulty > 0.0 {
            let observed_target = (observed_difficulty * 2.0).floor().max(1.0);
            next = next.min(observed_target);
        }
        next = next.max(config.min_difficulty.floor());

        if next >= current {
            return None;
        }
        self.low_diff_streak = 0;
        Some(next)
    }
}
