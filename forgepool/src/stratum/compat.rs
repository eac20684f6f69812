//! Firmware compatibility rescue.
//!
//! Some miner firmware disagrees about the byte order of the previous
//! block hash in `mining.notify`. A miner with the wrong interpretation
//! hashes garbage and produces nothing but low-difficulty rejects, so after
//! a persistent streak we walk the connection through the other prevhash
//! encodings until one sticks.

use crate::config::Config;
use crate::encoding::PrevhashMode;

/// Decides whether a stuck connection should try a different prevhash
/// encoding. Consulted after every low-difficulty reject.
pub trait RescueStrategy: Send + Sync {
    fn next_prevhash_mode(
        &self,
        current: PrevhashMode,
        accepted_shares: u64,
        low_diff_streak: u64,
    ) -> Option<PrevhashMode>;
}

/// Rotate to the next encoding every `rotate_every` consecutive rejects,
/// as long as the connection has never had a share accepted.
pub struct PrevhashRotation {
    rotate_every: u64,
}

impl PrevhashRotation {
    pub fn new(rotate_every: u64) -> Self {
        Self {
            rotate_every: rotate_every.max(1),
        }
    }
}

impl RescueStrategy for PrevhashRotation {
    fn next_prevhash_mode(
        &self,
        current: PrevhashMode,
        accepted_shares: u64,
        low_diff_streak: u64,
    ) -> Option<PrevhashMode> {
        if accepted_shares > 0 {
            return None;
        }
        if low_diff_streak < self.rotate_every || low_diff_streak % self.rotate_every != 0 {
            return None;
        }
        let next = current.next();
        if next == current {
            return None;
        }
        Some(next)
    }
}

/// No-op strategy for `compat.rotate_prevhash_mode = false`.
pub struct NoRescue;

impl RescueStrategy for NoRescue {
    fn next_prevhash_mode(&self, _: PrevhashMode, _: u64, _: u64) -> Option<PrevhashMode> {
        None
    }
}

/// A faster cadence under debug validation so a misbehaving miner cycles
/// through all four encodings quickly.
pub fn from_config(config: &Config) -> Box<dyn RescueStrategy> {
    if !config.compat.rotate_prevhash_mode {
        return Box::new(NoRescue);
    }
    let rotate_every = if config.compat.debug_share_validation {
        10
    } else {
        40
    };
    Box::new(PrevhashRotation::new(rotate_every))
}
