//! Mining jobs: immutable per-template work units handed to sessions.

pub mod manager;
pub mod validator;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use ruint::aliases::U256;
use serde_json::json;

use crate::coinbase::{build_coinbase_pieces, CoinbaseInputs};
use crate::encoding::{self, PrevhashMode};
use crate::error::{Error, Result};
use crate::merkle;
use crate::stats::now_ms;
use crate::template::{BlockTemplate, TemplateTransaction};

/// Everything beyond the template a job build needs.
pub struct JobParams<'a> {
    pub job_id: String,
    pub clean_jobs: bool,
    pub prevhash_epoch: u64,
    pub payout_script: &'a [u8],
    pub pool_tag: &'a str,
    pub extranonce1_size: usize,
    pub extranonce2_size: usize,
    pub max_submissions_tracked: usize,
}

/// An immutable mining job. Everything sessions and the validator read is
/// fixed at construction; the only interior mutability is the anti-replay
/// set and the lazily joined transaction blob.
pub struct Job {
    pub job_id: String,
    pub created_at: u64,
    pub clean_jobs: bool,
    pub prevhash_epoch: u64,
    pub segwit: bool,
    pub height: u64,
    pub work_id: Option<String>,
    pub network_target: U256,

    pub prevhash_rpc_hex: String,
    /// Header byte order, spliced directly into rebuilt headers.
    pub prevhash_header: [u8; 32],
    prevhash_by_mode: [String; 4],

    pub version_hex: String,
    pub bits_hex: String,
    pub ntime_hex: String,
    pub min_time: u64,
    pub max_time: u64,

    /// Legacy-serialization halves the merkle root is computed over.
    pub coinbase1: Vec<u8>,
    pub coinbase2: Vec<u8>,
    pub coinbase1_hex: String,
    pub coinbase2_hex: String,
    /// Block-serialization halves used when assembling a submission.
    pub block_coinbase1_hex: String,
    pub block_coinbase2_hex: String,

    pub merkle_branches: Vec<[u8; 32]>,
    pub merkle_branches_hex: Vec<String>,

    pub transactions: Vec<TemplateTransaction>,

    // [mode][clean_jobs] prebuilt mining.notify lines.
    notify_lines: [[String; 2]; 4],
    seen: Mutex<SeenShares>,
    joined_tx_hex: OnceLock<String>,
    prewarm_scheduled: AtomicBool,
}

impl Job {
    pub fn build(template: &BlockTemplate, params: JobParams<'_>) -> Result<Arc<Job>> {
        let witness_commitment = match template.default_witness_commitment.as_deref() {
            Some(hex) if !hex.is_empty() => Some(encoding::hex_to_bytes(hex)?),
            _ => None,
        };
        let aux_flags = match template.coinbaseaux.as_ref().and_then(|a| a.flags.as_deref()) {
            Some(flags) if !flags.is_empty() => encoding::hex_to_bytes(flags)?,
            _ => Vec::new(),
        };

        let pieces = build_coinbase_pieces(&CoinbaseInputs {
            height: template.height,
            aux_flags: &aux_flags,
            pool_tag: params.pool_tag,
            extranonce1_size: params.extranonce1_size,
            extranonce2_size: params.extranonce2_size,
            payout_script: params.payout_script,
            coinbase_value: template.coinbasevalue,
            witness_commitment_script: witness_commitment.as_deref(),
        })?;

        // Merkle leaves are txids in header byte order.
        let mut leaves = Vec::with_capacity(template.transactions.len());
        for tx in &template.transactions {
            let id = tx
                .id_hex()
                .ok_or_else(|| Error::Job("template transaction missing txid/hash".into()))?;
            let bytes = encoding::hex_to_bytes(&encoding::reverse_hex(id)?)?;
            let leaf: [u8; 32] = bytes
                .try_into()
                .map_err(|_| Error::Job(format!("txid {id:?} is not 32 bytes")))?;
            leaves.push(leaf);
        }
        let merkle_branches = merkle::coinbase_branches(&leaves);
        let merkle_branches_hex = merkle_branches.iter().map(hex::encode).collect();

        let prevhash_rpc_hex = encoding::normalize_hex(&template.previousblockhash)?;
        let prevhash_header_bytes =
            encoding::hex_to_bytes(&encoding::reverse_hex(&prevhash_rpc_hex)?)?;
        let prevhash_header: [u8; 32] = prevhash_header_bytes
            .try_into()
            .map_err(|_| Error::Job("previousblockhash is not 32 bytes".into()))?;

        let mut prevhash_by_mode: [String; 4] = Default::default();
        for mode in PrevhashMode::ALL {
            prevhash_by_mode[mode.index()] = encoding::format_prevhash(&prevhash_rpc_hex, mode)?;
        }

        let version_hex = encoding::fixed_hex_u32(template.version);
        let bits_hex = format!("{:0>8}", encoding::normalize_hex(&template.bits)?);
        let ntime_hex = encoding::fixed_hex_u32(template.curtime as u32);

        let mut job = Job {
            job_id: params.job_id,
            created_at: now_ms(),
            clean_jobs: params.clean_jobs,
            prevhash_epoch: params.prevhash_epoch.max(1),
            segwit: witness_commitment.is_some(),
            height: template.height,
            work_id: template.workid.clone().filter(|w| !w.is_empty()),
            network_target: template.network_target()?,
            prevhash_rpc_hex,
            prevhash_header,
            prevhash_by_mode,
            version_hex,
            bits_hex,
            ntime_hex,
            min_time: template.mintime.unwrap_or(template.curtime),
            max_time: template.maxtime.unwrap_or(template.curtime + 600),
            coinbase1_hex: hex::encode(&pieces.merkle_coinbase1),
            coinbase2_hex: hex::encode(&pieces.merkle_coinbase2),
            block_coinbase1_hex: hex::encode(&pieces.block_coinbase1),
            block_coinbase2_hex: hex::encode(&pieces.block_coinbase2),
            coinbase1: pieces.merkle_coinbase1,
            coinbase2: pieces.merkle_coinbase2,
            merkle_branches,
            merkle_branches_hex,
            transactions: template.transactions.clone(),
            notify_lines: Default::default(),
            seen: Mutex::new(SeenShares::new(params.max_submissions_tracked.max(1000))),
            joined_tx_hex: OnceLock::new(),
            prewarm_scheduled: AtomicBool::new(false),
        };
        job.notify_lines = job.build_notify_lines();
        Ok(Arc::new(job))
    }

    fn build_notify_lines(&self) -> [[String; 2]; 4] {
        let mut out: [[String; 2]; 4] = Default::default();
        for mode in PrevhashMode::ALL {
            for (slot, clean) in [(0, false), (1, true)] {
                out[mode.index()][slot] = self.notify_payload(mode, clean);
            }
        }
        out
    }

    fn notify_payload(&self, mode: PrevhashMode, clean_jobs: bool) -> String {
        json!({
            "id": null,
            "method": "mining.notify",
            "params": [
                self.job_id,
                self.prevhash_for_mode(mode),
                self.coinbase1_hex,
                self.coinbase2_hex,
                self.merkle_branches_hex,
                self.version_hex,
                self.bits_hex,
                self.ntime_hex,
                clean_jobs,
            ],
        })
        .to_string()
    }

    pub fn prevhash_for_mode(&self, mode: PrevhashMode) -> &str {
        &self.prevhash_by_mode[mode.index()]
    }

    /// Prebuilt `mining.notify` line (no trailing newline; the transport
    /// frames lines).
    pub fn notify_line(&self, mode: PrevhashMode, clean_jobs: bool) -> &str {
        &self.notify_lines[mode.index()][usize::from(clean_jobs)]
    }

    /// Record a submission tuple. Returns false when it was already seen.
    pub fn remember_submission(&self, key: &str) -> bool {
        self.seen.lock().remember(key)
    }

    /// All non-coinbase transactions concatenated, for block assembly.
    /// Joined once, on first use.
    pub fn joined_transactions_hex(&self) -> &str {
        self.joined_tx_hex.get_or_init(|| {
            self.transactions
                .iter()
                .map(|tx| tx.data.trim().trim_start_matches("0x").to_ascii_lowercase())
                .collect()
        })
    }

    /// Claim the one prewarm slot for this job. Returns false if a prewarm
    /// already ran or is running.
    pub fn try_claim_prewarm(&self) -> bool {
        self.joined_tx_hex.get().is_none()
            && self
                .prewarm_scheduled
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }
}

/// Bounded anti-replay set: a hash set for lookup plus an insertion-order
/// ring for eviction.
struct SeenShares {
    set: HashSet<Arc<str>>,
    ring: VecDeque<Arc<str>>,
    capacity: usize,
}

impl SeenShares {
    fn new(capacity: usize) -> Self {
        Self {
            set: HashSet::with_capacity(capacity.min(4096)),
            ring: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
        }
    }

    fn remember(&mut self, key: &str) -> bool {
        if self.set.contains(key) {
            return false;
        }
        if self.ring.len() >= self.capacity {
            if let Some(evicted) = self.ring.pop_front() {
                self.set.remove(&evicted);
            }
        }
        let key: Arc<str> = Arc::from(key);
        self.ring.push_back(key.clone());
        self.set.insert(key);
        true
    }
}

/// Insertion-ordered bounded job store. Old jobs stay resolvable for a few
/// generations so in-flight shares against them can still validate.
pub struct JobStore {
    jobs: HashMap<String, Arc<Job>>,
    order: VecDeque<String>,
    keep: usize,
}

impl JobStore {
    pub fn new(keep: usize) -> Self {
        Self {
            jobs: HashMap::new(),
            order: VecDeque::new(),
            keep: keep.max(1),
        }
    }

    pub fn insert(&mut self, job: Arc<Job>) {
        self.order.push_back(job.job_id.clone());
        self.jobs.insert(job.job_id.clone(), job);
        while self.jobs.len() > self.keep {
            if let Some(oldest) = self.order.pop_front() {
                self.jobs.remove(&oldest);
            }
        }
    }

    pub fn get(&self, job_id: &str) -> Option<Arc<Job>> {
        self.jobs.get(job_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use serde_json::json;

    pub fn template(height: u64, tx_count: usize) -> BlockTemplate {
        let transactions: Vec<_> = (0..tx_count)
            .map(|i| {
                json!({
                    "data": format!("02000000000{i}"),
                    "txid": format!("{:064x}", i + 1),
                })
            })
            .collect();
        serde_json::from_value(json!({
            "version": 0x20000000u32,
            "previousblockhash": format!("{:064x}", 0xfeedu64),
            "height": height,
            "bits": "1d00ffff",
            "curtime": 1_700_000_000u64,
            "coinbasevalue": 5_000_000_000u64,
            "transactions": transactions,
        }))
        .unwrap()
    }

    pub fn params() -> JobParams<'static> {
        JobParams {
            job_id: "1".into(),
            clean_jobs: true,
            prevhash_epoch: 1,
            payout_script: &[0x51],
            pool_tag: "/forgepool/",
            extranonce1_size: 4,
            extranonce2_size: 8,
            max_submissions_tracked: 1000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{params, template};
    use super::*;

    #[test]
    fn job_builds_stratum_fields() {
        let tpl = template(100, 2);
        let job = Job::build(&tpl, params()).unwrap();

        assert_eq!(job.version_hex, "20000000");
        assert_eq!(job.bits_hex, "1d00ffff");
        assert_eq!(job.ntime_hex, format!("{:08x}", 1_700_000_000u32));
        assert_eq!(job.merkle_branches.len(), 2);
        assert_eq!(job.min_time, 1_700_000_000);
        assert_eq!(job.max_time, 1_700_000_000 + 600);
        assert!(!job.segwit);

        let line = job.notify_line(PrevhashMode::Stratum, true);
        let parsed: serde_json::Value = serde_json::from_str(line).unwrap();
        assert_eq!(parsed["method"], "mining.notify");
        let p = parsed["params"].as_array().unwrap();
        assert_eq!(p[0], "1");
        assert_eq!(p[8], true);
        assert_eq!(
            p[1].as_str().unwrap(),
            job.prevhash_for_mode(PrevhashMode::Stratum)
        );
    }

    #[test]
    fn seen_shares_evict_oldest() {
        let mut seen = SeenShares::new(1000);
        assert!(seen.remember("a"));
        assert!(!seen.remember("a"));
        for i in 0..1000 {
            seen.remember(&format!("k{i}"));
        }
        // "a" was evicted, so it registers as new again.
        assert!(seen.remember("a"));
    }

    #[test]
    fn job_store_prunes_in_insertion_order() {
        let mut store = JobStore::new(2);
        for id in ["1", "2", "3"] {
            let mut p = params();
            p.job_id = id.into();
            store.insert(Job::build(&template(100, 0), p).unwrap());
        }
        assert_eq!(store.len(), 2);
        assert!(store.get("1").is_none());
        assert!(store.get("2").is_some());
        assert!(store.get("3").is_some());
    }

    #[test]
    fn joined_transactions_concatenate_in_template_order() {
        let tpl = template(100, 3);
        let job = Job::build(&tpl, params()).unwrap();
        assert_eq!(
            job.joined_transactions_hex(),
            "020000000000020000000001020000000002"
        );
    }

    #[test]
    fn prewarm_claimed_once() {
        let job = Job::build(&template(100, 1), params()).unwrap();
        assert!(job.try_claim_prewarm());
        assert!(!job.try_claim_prewarm());
    }
}
