//! Template ingestion and job lifecycle.
//!
//! The manager owns the upstream node relationship: it resolves the payout
//! script, verifies the node's proof-of-work algorithm, polls and long-polls
//! `getblocktemplate`, turns accepted templates into jobs, fans jobs out on
//! a broadcast channel, and assembles/submits candidate blocks.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::config::Config;
use crate::encoding::{self, varint};
use crate::error::{Error, Result};
use crate::job::validator::AcceptedShare;
use crate::job::{Job, JobParams, JobStore};
use crate::rpc::NodeClient;
use crate::stats::{now_ms, PoolStats};
use crate::template::BlockTemplate;
use crate::tracing::prelude::*;

/// Where a template came from; startup templates bypass the fingerprint
/// gate so a restart always installs a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateOrigin {
    Startup,
    Poll,
    Longpoll,
}

impl TemplateOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            TemplateOrigin::Startup => "startup",
            TemplateOrigin::Poll => "poll",
            TemplateOrigin::Longpoll => "longpoll",
        }
    }
}

/// Outcome of submitting a candidate block upstream.
#[derive(Debug)]
pub struct BlockSubmitOutcome {
    pub accepted: bool,
    pub block_hash: String,
    pub node_result: Option<serde_json::Value>,
}

struct ManagerState {
    job_seq: u64,
    prevhash_epoch_seq: u64,
    current: Option<Arc<Job>>,
    store: JobStore,
    longpoll_id: Option<String>,
    last_fingerprint: Option<String>,
    last_longpoll_success_at: u64,
}

pub struct JobManager {
    config: Arc<Config>,
    node: Arc<dyn NodeClient>,
    stats: Arc<PoolStats>,
    payout_script: Vec<u8>,
    state: Mutex<ManagerState>,
    job_tx: broadcast::Sender<Arc<Job>>,
}

impl JobManager {
    /// Resolve the payout script and verify the node's algorithm, then
    /// build the manager. Fails fast on a misconfigured payout or a
    /// mismatched node.
    pub async fn new(
        config: Arc<Config>,
        node: Arc<dyn NodeClient>,
        stats: Arc<PoolStats>,
    ) -> Result<Arc<Self>> {
        let payout_script = resolve_payout_script(&config, node.as_ref()).await?;
        info!(
            payout_script = %hex::encode(&payout_script),
            payout_address = %config.pool.payout_address,
            "Resolved payout script"
        );
        verify_node_pow_algo(&config, node.as_ref()).await?;

        let (job_tx, _) = broadcast::channel(16);
        Ok(Arc::new(Self {
            stats,
            node,
            payout_script,
            state: Mutex::new(ManagerState {
                job_seq: 0,
                prevhash_epoch_seq: 0,
                current: None,
                store: JobStore::new(config.jobs.keep_old_jobs),
                longpoll_id: None,
                last_fingerprint: None,
                last_longpoll_success_at: 0,
            }),
            job_tx,
            config,
        }))
    }

    /// Fetch the first template, then spawn the poll (and long-poll) loops.
    pub async fn start(
        self: &Arc<Self>,
        tracker: &TaskTracker,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        self.refresh_template(TemplateOrigin::Startup).await?;
        tracker.spawn(self.clone().poll_loop(shutdown.clone()));
        if self.config.jobs.enable_longpoll {
            tracker.spawn(self.clone().longpoll_loop(shutdown.clone()));
        }
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Job>> {
        self.job_tx.subscribe()
    }

    pub fn current_job(&self) -> Option<Arc<Job>> {
        self.state.lock().current.clone()
    }

    pub fn current_epoch(&self) -> u64 {
        self.state
            .lock()
            .current
            .as_ref()
            .map(|j| j.prevhash_epoch)
            .unwrap_or(0)
    }

    pub fn get_job(&self, job_id: &str) -> Option<Arc<Job>> {
        self.state.lock().store.get(job_id)
    }

    async fn poll_loop(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            let delay = std::time::Duration::from_millis(self.next_poll_delay_ms());
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {
                    if let Err(e) = self.refresh_template(TemplateOrigin::Poll).await {
                        warn!(error = %e, "Template poll failed");
                    }
                }
            }
        }
        debug!("Template poll loop stopped.");
    }

    async fn longpoll_loop(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            let longpoll_id = self.state.lock().longpoll_id.clone();
            tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.node.get_block_template(longpoll_id.as_deref()) => {
                    match result {
                        Ok(template) => {
                            self.state.lock().last_longpoll_success_at = now_ms();
                            if let Err(e) = self.handle_template(&template, TemplateOrigin::Longpoll) {
                                warn!(error = %e, "Longpoll template rejected");
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Longpoll getblocktemplate failed");
                            tokio::select! {
                                _ = shutdown.cancelled() => break,
                                _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => {}
                            }
                        }
                    }
                }
            }
        }
        debug!("Longpoll loop stopped.");
    }

    /// Poll cadence: while the long-poll has succeeded within the grace
    /// window, relax to the healthy interval; otherwise poll at the base
    /// rate.
    fn next_poll_delay_ms(&self) -> u64 {
        let base = self.config.jobs.template_poll_ms.max(250);
        if !self.config.jobs.enable_longpoll {
            return base;
        }
        let healthy = self.config.jobs.template_poll_ms_longpoll_healthy.max(base);
        let grace = self.config.jobs.longpoll_healthy_grace_ms.max(1000);
        let last_success = self.state.lock().last_longpoll_success_at;
        if last_success > 0 && now_ms().saturating_sub(last_success) <= grace {
            healthy
        } else {
            base
        }
    }

    async fn refresh_template(&self, origin: TemplateOrigin) -> Result<()> {
        let start = now_ms();
        let template = self.node.get_block_template(None).await?;
        self.stats
            .record_template_fetch_latency(now_ms().saturating_sub(start));
        self.handle_template(&template, origin)?;
        Ok(())
    }

    /// Compare-and-install a template. Returns the new job when one was
    /// built, `None` when the template was a no-op (unchanged fingerprint
    /// or foreign algorithm).
    pub fn handle_template(
        &self,
        template: &BlockTemplate,
        origin: TemplateOrigin,
    ) -> Result<Option<Arc<Job>>> {
        use std::sync::atomic::Ordering;
        self.stats.templates_fetched.fetch_add(1, Ordering::Relaxed);

        if let Some(algo) = template.pow_algo_name() {
            if !algo.eq_ignore_ascii_case(&self.config.pool.pow_algo) {
                warn!(
                    origin = origin.as_str(),
                    template_algo = algo,
                    expected_algo = %self.config.pool.pow_algo,
                    height = template.height,
                    "Ignoring non-matching template algo"
                );
                return Ok(None);
            }
        }

        let fingerprint = template.fingerprint(self.config.jobs.fingerprint_mode);

        let job = {
            let mut state = self.state.lock();
            if let Some(id) = template.longpollid.clone() {
                state.longpoll_id = Some(id);
            }

            if state.last_fingerprint.as_deref() == Some(fingerprint.as_str())
                && origin != TemplateOrigin::Startup
            {
                return Ok(None);
            }
            state.last_fingerprint = Some(fingerprint);

            let is_new_prevhash = state
                .current
                .as_ref()
                .map(|j| j.prevhash_rpc_hex != template.previousblockhash.to_ascii_lowercase())
                .unwrap_or(true);
            let epoch = if is_new_prevhash {
                state.prevhash_epoch_seq += 1;
                state.prevhash_epoch_seq
            } else {
                state
                    .current
                    .as_ref()
                    .map(|j| j.prevhash_epoch)
                    .unwrap_or_else(|| state.prevhash_epoch_seq.max(1))
            };

            state.job_seq += 1;
            let job = Job::build(
                template,
                JobParams {
                    job_id: format!("{:x}", state.job_seq),
                    clean_jobs: is_new_prevhash,
                    prevhash_epoch: epoch,
                    payout_script: &self.payout_script,
                    pool_tag: &self.config.pool.tag,
                    extranonce1_size: self.config.stratum.extranonce1_size,
                    extranonce2_size: self.config.stratum.extranonce2_size,
                    max_submissions_tracked: self.config.jobs.max_submissions_tracked,
                },
            )?;
            state.current = Some(job.clone());
            state.store.insert(job.clone());
            job
        };

        self.stats
            .record_template(template.height, &template.bits, origin.as_str());

        // No subscribers is fine; sessions pull the current job on join.
        let receivers = self.job_tx.send(job.clone()).map_or(0, |n| n as u64);
        self.stats.record_broadcast(receivers);

        info!(
            origin = origin.as_str(),
            job_id = %job.job_id,
            height = template.height,
            tx_count = 1 + job.transactions.len(),
            clean_jobs = job.clean_jobs,
            segwit = job.segwit,
            "New mining job"
        );
        Ok(Some(job))
    }

    /// Assemble the full block for an accepted candidate share and submit
    /// it upstream.
    pub async fn submit_block_candidate(
        &self,
        job: &Arc<Job>,
        share: &AcceptedShare,
        extranonce1_hex: &str,
        worker: &str,
    ) -> Result<BlockSubmitOutcome> {
        let tx_count_hex = hex::encode(varint(1 + job.transactions.len() as u64));
        let block_hex = format!(
            "{}{}{}{}{}{}{}",
            hex::encode(share.header),
            tx_count_hex,
            job.block_coinbase1_hex,
            extranonce1_hex,
            share.extranonce2_hex,
            job.block_coinbase2_hex,
            job.joined_transactions_hex(),
        );

        let result = self
            .node
            .submit_block(&block_hex, job.work_id.as_deref())
            .await?;

        match result {
            None => {
                self.stats.record_block_found(&share.share_hash_hex);
                info!(
                    block_hash = %share.share_hash_hex,
                    height = job.height,
                    worker,
                    "Block candidate accepted by node"
                );
                Ok(BlockSubmitOutcome {
                    accepted: true,
                    block_hash: share.share_hash_hex.clone(),
                    node_result: None,
                })
            }
            Some(reason) => {
                self.stats.record_block_rejected();
                warn!(
                    block_hash = %share.share_hash_hex,
                    reason = %reason,
                    "Block candidate rejected by node"
                );
                Ok(BlockSubmitOutcome {
                    accepted: false,
                    block_hash: share.share_hash_hex.clone(),
                    node_result: Some(reason),
                })
            }
        }
    }

    /// If an accepted share came close to the network target, join the
    /// transaction blob in the background so a real candidate on this job
    /// submits without the join on its critical path. At most once per job.
    pub fn maybe_prewarm_block_payload(&self, job: &Arc<Job>, share: &AcceptedShare) {
        if !self.config.jobs.enable_near_candidate_prewarm || share.is_block_candidate {
            return;
        }
        let factor = ruint::aliases::U256::from(self.config.jobs.near_candidate_prewarm_factor.max(2));
        let Some(threshold) = job.network_target.checked_mul(factor) else {
            return;
        };
        if share.header_hash_int > threshold {
            return;
        }
        if !job.try_claim_prewarm() {
            return;
        }
        let job = job.clone();
        tokio::spawn(async move {
            let len = job.joined_transactions_hex().len();
            debug!(job_id = %job.job_id, joined_hex_len = len, "Prewarmed block payload");
        });
    }
}

async fn resolve_payout_script(config: &Config, node: &dyn NodeClient) -> Result<Vec<u8>> {
    if !config.pool.payout_script_hex.is_empty() {
        return Ok(encoding::hex_to_bytes(&config.pool.payout_script_hex)?);
    }

    let address = &config.pool.payout_address;
    if address.is_empty() {
        return Err(Error::Config("pool.payout_address missing".into()));
    }

    let info = node.validate_address(address).await.map_err(|e| {
        Error::Config(format!(
            "validateaddress RPC failed ({e}); set pool.payout_script_hex to bypass address lookup"
        ))
    })?;
    if !info.isvalid {
        return Err(Error::Config(
            "pool payout address is invalid according to node".into(),
        ));
    }
    match info.script_pub_key {
        Some(script) if !script.is_empty() => Ok(encoding::hex_to_bytes(&script)?),
        _ => Err(Error::Config(
            "validateaddress did not return scriptPubKey; set pool.payout_script_hex".into(),
        )),
    }
}

async fn verify_node_pow_algo(config: &Config, node: &dyn NodeClient) -> Result<()> {
    let info = match node.get_mining_info().await {
        Ok(info) => info,
        Err(e) => {
            warn!(error = %e, "getmininginfo RPC failed, skipping algo verification");
            return Ok(());
        }
    };
    let Some(node_algo) = info.pow_algo_name() else {
        return Ok(());
    };

    if node_algo.eq_ignore_ascii_case(&config.pool.pow_algo) {
        info!(node_algo, expected_algo = %config.pool.pow_algo, "Verified node mining algo");
        return Ok(());
    }
    if config.node.allow_pow_algo_mismatch {
        warn!(
            node_algo,
            expected_algo = %config.pool.pow_algo,
            "Node mining algo does not match pool configuration"
        );
        return Ok(());
    }
    Err(Error::Template(format!(
        "node mining algo mismatch: node reports {node_algo:?}, pool expects {:?}; \
         point node.rpc_* at a matching daemon or set node.allow_pow_algo_mismatch = true",
        config.pool.pow_algo
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::test_support::template;
    use crate::rpc::{AddressInfo, MiningInfo};
    use async_trait::async_trait;
    use serde_json::Value;

    struct FakeNode;

    #[async_trait]
    impl NodeClient for FakeNode {
        async fn get_block_template(&self, _longpoll_id: Option<&str>) -> Result<BlockTemplate> {
            Ok(template(100, 0))
        }
        async fn submit_block(
            &self,
            _block_hex: &str,
            _work_id: Option<&str>,
        ) -> Result<Option<Value>> {
            Ok(None)
        }
        async fn validate_address(&self, _address: &str) -> Result<AddressInfo> {
            Ok(AddressInfo {
                isvalid: true,
                script_pub_key: Some("51".into()),
            })
        }
        async fn get_mining_info(&self) -> Result<MiningInfo> {
            Ok(MiningInfo::default())
        }
    }

    fn test_config() -> Arc<Config> {
        let mut config = Config::default();
        config.node.rpc_user = "u".into();
        config.node.rpc_pass = "p".into();
        config.pool.payout_script_hex = "51".into();
        Arc::new(config)
    }

    async fn manager() -> Arc<JobManager> {
        JobManager::new(test_config(), Arc::new(FakeNode), Arc::new(PoolStats::new()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn unchanged_fingerprint_is_a_noop_except_at_startup() {
        let m = manager().await;
        let tpl = template(100, 0);

        let first = m.handle_template(&tpl, TemplateOrigin::Startup).unwrap();
        assert!(first.is_some());

        // Same template from polling: skipped.
        assert!(m.handle_template(&tpl, TemplateOrigin::Poll).unwrap().is_none());

        // Same fingerprint from startup again: installed anyway.
        assert!(m
            .handle_template(&tpl, TemplateOrigin::Startup)
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn prevhash_change_bumps_epoch_and_sets_clean_jobs() {
        let m = manager().await;
        let tpl = template(100, 0);
        let first = m.handle_template(&tpl, TemplateOrigin::Startup).unwrap().unwrap();
        assert!(first.clean_jobs);
        assert_eq!(first.prevhash_epoch, 1);

        // Same prevhash, different coinbase value: new job, same epoch.
        let mut same_prev = template(100, 0);
        same_prev.coinbasevalue += 1;
        let second = m.handle_template(&same_prev, TemplateOrigin::Poll).unwrap().unwrap();
        assert!(!second.clean_jobs);
        assert_eq!(second.prevhash_epoch, 1);

        // New prevhash: epoch bumps, clean_jobs set.
        let mut new_prev = template(101, 0);
        new_prev.previousblockhash = format!("{:064x}", 0xbeefu64);
        let third = m.handle_template(&new_prev, TemplateOrigin::Poll).unwrap().unwrap();
        assert!(third.clean_jobs);
        assert_eq!(third.prevhash_epoch, 2);
        assert_eq!(m.current_epoch(), 2);
    }

    #[tokio::test]
    async fn templates_with_foreign_algo_are_ignored() {
        let m = manager().await;
        let mut tpl = template(100, 0);
        tpl.algo = Some("scrypt".into());
        assert!(m
            .handle_template(&tpl, TemplateOrigin::Startup)
            .unwrap()
            .is_none());
        assert!(m.current_job().is_none());
    }

    #[tokio::test]
    async fn job_ids_are_hex_sequence() {
        let m = manager().await;
        let a = m
            .handle_template(&template(100, 0), TemplateOrigin::Startup)
            .unwrap()
            .unwrap();
        let mut tpl = template(100, 0);
        tpl.coinbasevalue += 1;
        let b = m.handle_template(&tpl, TemplateOrigin::Poll).unwrap().unwrap();
        assert_eq!(a.job_id, "1");
        assert_eq!(b.job_id, "2");
        assert!(m.get_job("1").is_some());
        assert!(m.get_job("2").is_some());
    }
}
