//! Per-connection stratum protocol state machine.
//!
//! One session task per miner. The task owns all mutable connection state
//! (subscription, authorization, difficulty, version rolling, vardiff) and
//! multiplexes two event sources: lines from the miner and job broadcasts
//! from the manager. Writes go out under a timeout so one wedged miner
//! never stalls anything but its own task.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::encoding::{self, PrevhashMode};
use crate::error::{Error, Result};
use crate::job::manager::JobManager;
use crate::job::validator::{self, RejectCode, ShareReject, ShareSubmission};
use crate::stats::{now_ms, PoolStats};
use crate::stratum::compat::RescueStrategy;
use crate::stratum::messages::{self, Request};
use crate::stratum::server::PeerInfo;
use crate::stratum::transport::Transport;
use crate::stratum::vardiff::{VardiffConfig, VardiffState};
use crate::target::Difficulty;
use crate::tracing::prelude::*;

/// Version bits the pool is willing to let miners roll (BIP 320 range).
pub const SERVER_VERSION_ROLLING_MASK: u32 = 0x1fff_e000;

pub struct Session {
    config: Arc<Config>,
    manager: Arc<JobManager>,
    stats: Arc<PoolStats>,
    rescue: Arc<dyn RescueStrategy>,
    peer: Arc<PeerInfo>,
    extranonce1_hex: String,
    extranonce1: Vec<u8>,
    subscribed: bool,
    authorized: bool,
    worker_full: String,
    worker_name: String,
    difficulty: Difficulty,
    pending_difficulty: Option<Difficulty>,
    difficulty_sent: Option<String>,
    prevhash_mode: PrevhashMode,
    version_rolling_enabled: bool,
    version_rolling_mask_hex: String,
    vardiff_config: VardiffConfig,
    vardiff: VardiffState,
}

impl Session {
    pub fn new(
        config: Arc<Config>,
        manager: Arc<JobManager>,
        stats: Arc<PoolStats>,
        rescue: Arc<dyn RescueStrategy>,
        peer: Arc<PeerInfo>,
        extranonce1_hex: String,
    ) -> Self {
        let difficulty = config.base_difficulty();
        peer.set_difficulty(difficulty.value());
        let extranonce1 = hex::decode(&extranonce1_hex).unwrap_or_default();
        let worker = peer.worker();
        Self {
            vardiff_config: VardiffConfig::from_config(&config),
            prevhash_mode: config.stratum.prevhash_mode,
            config,
            manager,
            stats,
            rescue,
            peer,
            extranonce1_hex,
            extranonce1,
            subscribed: false,
            authorized: false,
            worker_full: worker.clone(),
            worker_name: worker,
            difficulty,
            pending_difficulty: None,
            difficulty_sent: None,
            version_rolling_enabled: false,
            version_rolling_mask_hex: "00000000".to_string(),
            vardiff: VardiffState::default(),
        }
    }

    pub async fn run<T: Transport>(
        mut self,
        transport: &mut T,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let mut jobs = self.manager.subscribe();
        let idle = Duration::from_millis(self.config.stratum.idle_timeout_ms);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = jobs.recv() => match received {
                    Ok(job) => {
                        let clean = job.clean_jobs;
                        let lines = self.job_push_lines(&job, clean);
                        self.write(transport, lines).await?;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(
                            client_id = self.peer.id,
                            skipped,
                            "Session lagged behind job broadcasts, resyncing"
                        );
                        if let Some(job) = self.manager.current_job() {
                            let lines = self.job_push_lines(&job, true);
                            self.write(transport, lines).await?;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                read = tokio::time::timeout(idle, transport.read_line()) => match read {
                    Err(_) => {
                        warn!(
                            client_id = self.peer.id,
                            remote = %self.peer.remote,
                            idle_timeout_ms = self.config.stratum.idle_timeout_ms,
                            "Miner idle timeout"
                        );
                        break;
                    }
                    Ok(Ok(Some(line))) => {
                        let lines = self.handle_line(&line).await;
                        self.write(transport, lines).await?;
                    }
                    Ok(Ok(None)) => break,
                    Ok(Err(e)) => return Err(e),
                },
            }
        }
        Ok(())
    }

    /// Batch a write under the configured timeout. A miner that stops
    /// draining its socket gets dropped here instead of backing up the
    /// session.
    async fn write<T: Transport>(&self, transport: &mut T, lines: Vec<String>) -> Result<()> {
        if lines.is_empty() {
            return Ok(());
        }
        let limit = Duration::from_millis(self.config.stratum.write_timeout_ms);
        match tokio::time::timeout(limit, transport.send_lines(&lines)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    client_id = self.peer.id,
                    remote = %self.peer.remote,
                    worker = %self.worker_name,
                    "Write stalled, dropping slow miner"
                );
                Err(Error::Protocol("write timed out".into()))
            }
        }
    }

    /// Difficulty (when changed) plus the notify line for a job broadcast.
    /// Nothing goes out before the handshake completes.
    fn job_push_lines(&mut self, job: &crate::job::Job, clean_jobs: bool) -> Vec<String> {
        if !self.subscribed || !self.authorized {
            return Vec::new();
        }
        if let Some(pending) = self.pending_difficulty.take() {
            self.set_difficulty_now(pending);
        }
        let mut lines = Vec::new();
        if let Some(line) = self.push_difficulty(false) {
            lines.push(line);
        }
        lines.push(job.notify_line(self.prevhash_mode, clean_jobs).to_string());
        lines
    }

    async fn handle_line(&mut self, line: &str) -> Vec<String> {
        let request = match messages::parse_request(line) {
            Ok(request) => request,
            Err(e) => {
                warn!(
                    client_id = self.peer.id,
                    remote = %self.peer.remote,
                    "Miner sent unparseable request"
                );
                return vec![messages::error_line(&None, 20, e.message())];
            }
        };

        match request.method.as_str() {
            "mining.subscribe" => self.handle_subscribe(&request),
            "mining.authorize" => self.handle_authorize(&request),
            "mining.submit" => self.handle_submit(&request),
            "mining.configure" => self.handle_configure(&request),
            "mining.suggest_difficulty" => self.handle_suggest_difficulty(&request),
            "mining.extranonce.subscribe" => {
                vec![messages::result_line(&request.id, json!(true))]
            }
            other => vec![messages::error_line(
                &request.id,
                20,
                &format!("Unknown method {other}"),
            )],
        }
    }

    fn handle_subscribe(&mut self, request: &Request) -> Vec<String> {
        self.subscribed = true;
        self.peer.subscribed.store(true, Ordering::Relaxed);
        if let Some(agent) = request.params.first().and_then(Value::as_str) {
            if !agent.is_empty() {
                self.peer.set_user_agent(agent);
            }
        }

        info!(
            client_id = self.peer.id,
            remote = %self.peer.remote,
            extranonce1 = %self.extranonce1_hex,
            extranonce2_size = self.config.stratum.extranonce2_size,
            "Miner subscribed"
        );

        let subscription_id = format!("{:x}{:x}", self.peer.id, now_ms());
        let result = json!([
            [
                ["mining.set_difficulty", subscription_id],
                ["mining.notify", subscription_id]
            ],
            self.extranonce1_hex,
            self.config.stratum.extranonce2_size
        ]);

        let mut lines = vec![messages::result_line(&request.id, result)];
        if let Some(line) = self.push_difficulty(true) {
            lines.push(line);
        }
        if self.authorized {
            if let Some(job) = self.manager.current_job() {
                lines.push(job.notify_line(self.prevhash_mode, job.clean_jobs).to_string());
            }
        }
        lines
    }

    fn handle_authorize(&mut self, request: &Request) -> Vec<String> {
        let full_worker = match request.params.first().and_then(Value::as_str) {
            Some(w) if !w.is_empty() => w.to_string(),
            _ => self.worker_full.clone(),
        };
        let password = request
            .params
            .get(1)
            .and_then(Value::as_str)
            .unwrap_or_default();
        let kv = parse_password_kv(password);

        let token_required =
            !self.config.pool.allow_any_user || !self.config.pool.miner_auth_token.is_empty();
        if token_required {
            let expected = &self.config.pool.miner_auth_token;
            let supplied = kv
                .get("token")
                .or_else(|| kv.get("auth"))
                .map(String::as_str)
                .unwrap_or("");
            if expected.is_empty() || supplied != expected {
                warn!(
                    client_id = self.peer.id,
                    remote = %self.peer.remote,
                    worker = %full_worker,
                    "Miner authorization failed"
                );
                return vec![messages::authorize_failure_line(&request.id)];
            }
        }

        // Standard "address.workername" convention; the bare form serves
        // as both.
        let (_address, name) = match full_worker.find('.') {
            Some(dot) if dot > 0 && dot < full_worker.len() - 1 => {
                (&full_worker[..dot], &full_worker[dot + 1..])
            }
            _ => (full_worker.as_str(), full_worker.as_str()),
        };
        self.worker_name = name.to_string();
        self.worker_full = full_worker.clone();
        self.peer.set_worker(name);
        self.authorized = true;
        self.peer.authorized.store(true, Ordering::Relaxed);

        if let Some(hint) = kv.get("d") {
            match Difficulty::parse(hint) {
                Ok(difficulty) => self.set_difficulty_now(difficulty),
                Err(_) => {
                    return vec![messages::error_line(
                        &request.id,
                        20,
                        "difficulty must be > 0",
                    )]
                }
            }
        }

        info!(
            client_id = self.peer.id,
            remote = %self.peer.remote,
            worker = %self.worker_full,
            difficulty = self.difficulty.value(),
            prevhash_mode = self.prevhash_mode.as_str(),
            "Miner authorized"
        );

        let mut lines = vec![messages::result_line(&request.id, json!(true))];
        if let Some(line) = self.push_difficulty(true) {
            lines.push(line);
        }
        if self.subscribed {
            if let Some(job) = self.manager.current_job() {
                lines.push(job.notify_line(self.prevhash_mode, job.clean_jobs).to_string());
            }
        }
        lines
    }

    fn handle_configure(&mut self, request: &Request) -> Vec<String> {
        let extensions: Vec<&str> = request
            .params
            .first()
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        let options = request.params.get(1).and_then(Value::as_object);

        let mut result = serde_json::Map::new();
        if extensions.contains(&"version-rolling") {
            let requested = options
                .and_then(|o| o.get("version-rolling.mask"))
                .and_then(Value::as_str);
            let mask = negotiate_version_rolling_mask(requested);
            self.version_rolling_enabled = mask != "00000000";
            self.version_rolling_mask_hex = mask.clone();
            result.insert(
                "version-rolling".into(),
                json!(self.version_rolling_enabled),
            );
            result.insert("version-rolling.mask".into(), json!(mask));
            debug!(
                client_id = self.peer.id,
                mask = %self.version_rolling_mask_hex,
                enabled = self.version_rolling_enabled,
                "Negotiated version rolling"
            );
        }
        vec![messages::result_line(&request.id, Value::Object(result))]
    }

    fn handle_suggest_difficulty(&mut self, request: &Request) -> Vec<String> {
        let suggestion = match request.params.first() {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if s.is_empty() => None,
            Some(Value::Number(n)) if n.as_f64() == Some(0.0) => None,
            Some(value) => Some(value),
        };

        let mut lines = Vec::new();
        if let Some(value) = suggestion {
            let parsed = match value {
                Value::String(s) => Difficulty::parse(s).ok(),
                Value::Number(n) => n.as_f64().and_then(|f| Difficulty::from_f64(f).ok()),
                _ => None,
            };
            match parsed {
                Some(difficulty) => {
                    info!(
                        client_id = self.peer.id,
                        worker = %self.worker_name,
                        difficulty = difficulty.value(),
                        "Miner suggested difficulty"
                    );
                    self.set_difficulty_now(difficulty);
                    if let Some(line) = self.push_difficulty(true) {
                        lines.push(line);
                    }
                }
                None => {
                    lines.push(messages::error_line(
                        &request.id,
                        20,
                        "difficulty must be > 0",
                    ));
                    return lines;
                }
            }
        }
        lines.push(messages::result_line(&request.id, json!(true)));
        lines
    }

    fn handle_submit(&mut self, request: &Request) -> Vec<String> {
        if !self.subscribed {
            return vec![messages::reject_line(&request.id, RejectCode::NotSubscribed)];
        }
        if !self.authorized {
            return vec![messages::reject_line(&request.id, RejectCode::Unauthorized)];
        }
        if request.params.len() < 5 {
            return vec![messages::reject_line(&request.id, RejectCode::Invalid)];
        }

        let submitted_worker = param_text(&request.params, 0);
        let worker = if submitted_worker.is_empty() {
            self.worker_name.clone()
        } else {
            submitted_worker
        };
        let job_id = param_text(&request.params, 1);
        let extranonce2_hex = param_text(&request.params, 2);
        let ntime_hex = param_text(&request.params, 3);
        let nonce_hex = param_text(&request.params, 4);
        let version_bits = request.params.get(5).and_then(Value::as_str);

        let Some(job) = self.manager.get_job(&job_id) else {
            return self.finish_reject(
                &request.id,
                &job_id,
                &worker,
                ShareReject::stale("Unknown job"),
            );
        };

        let submission = ShareSubmission {
            extranonce1: &self.extranonce1,
            extranonce1_hex: &self.extranonce1_hex,
            extranonce2_hex: &extranonce2_hex,
            ntime_hex: &ntime_hex,
            nonce_hex: &nonce_hex,
            version_bits_hex: version_bits,
            version_rolling_enabled: self.version_rolling_enabled,
            version_rolling_mask_hex: &self.version_rolling_mask_hex,
        };

        match validator::validate_share(
            &job,
            self.manager.current_epoch(),
            self.difficulty.target(),
            self.config.stratum.extranonce2_size,
            &submission,
        ) {
            Ok(share) => self.finish_accept(&request.id, job, &worker, share),
            Err(reject) => self.finish_reject(&request.id, &job_id, &worker, reject),
        }
    }

    fn finish_accept(
        &mut self,
        id: &Option<Value>,
        job: Arc<crate::job::Job>,
        worker: &str,
        share: validator::AcceptedShare,
    ) -> Vec<String> {
        let now = now_ms();
        let accepted = self.peer.accepted_shares.fetch_add(1, Ordering::Relaxed) + 1;
        self.vardiff.record_accepted(now);
        self.peer.last_share_at.store(now, Ordering::Relaxed);
        self.peer
            .avg_share_interval_ms
            .store(self.vardiff.avg_interval_ms(), Ordering::Relaxed);
        self.stats.record_accepted(worker, share.share_difficulty, now);
        let sample = if share.share_difficulty > 0.0 {
            share.share_difficulty
        } else {
            self.difficulty.value()
        };
        self.stats.record_share_sample(true, sample, worker, None);

        let noteworthy = accepted <= 3 || accepted % 25 == 0 || share.is_block_candidate;
        if noteworthy {
            info!(
                client_id = self.peer.id,
                worker,
                shares_accepted = accepted,
                job_id = %job.job_id,
                difficulty = self.difficulty.value(),
                share_difficulty = share.share_difficulty,
                block_candidate = share.is_block_candidate,
                share_hash = %share.share_hash_hex,
                "Share accepted"
            );
        } else {
            debug!(
                client_id = self.peer.id,
                worker,
                shares_accepted = accepted,
                job_id = %job.job_id,
                share_difficulty = share.share_difficulty,
                "Share accepted"
            );
        }

        let mut lines = vec![messages::result_line(id, json!(true))];

        self.manager.maybe_prewarm_block_payload(&job, &share);

        if share.is_block_candidate {
            // Submit off the session task so the share response is not
            // held behind the node RPC.
            let manager = self.manager.clone();
            let extranonce1_hex = self.extranonce1_hex.clone();
            let worker = worker.to_string();
            tokio::spawn(async move {
                if let Err(e) = manager
                    .submit_block_candidate(&job, &share, &extranonce1_hex, &worker)
                    .await
                {
                    error!(error = %e, worker, "Block submission failed");
                }
            });
        }

        let current = self
            .pending_difficulty
            .as_ref()
            .map(Difficulty::value)
            .unwrap_or_else(|| self.difficulty.value());
        if let Some(next) = self.vardiff.retarget(&self.vardiff_config, current) {
            if let Ok(difficulty) = Difficulty::from_f64(next) {
                info!(
                    client_id = self.peer.id,
                    worker = %self.worker_name,
                    previous_difficulty = current,
                    new_difficulty = next,
                    avg_share_interval_ms = self.vardiff.avg_interval_ms(),
                    target_share_interval_ms = self.vardiff_config.target_share_time_ms,
                    apply_on = "next_job",
                    "Retargeted miner difficulty"
                );
                self.pending_difficulty = Some(difficulty);
            }
        }
        lines
    }

    fn finish_reject(
        &mut self,
        id: &Option<Value>,
        job_id: &str,
        worker: &str,
        reject: ShareReject,
    ) -> Vec<String> {
        let rejected = self.peer.rejected_shares.fetch_add(1, Ordering::Relaxed) + 1;
        if reject.code == RejectCode::LowDiff {
            self.vardiff.record_low_diff();
        }
        self.stats.record_rejected(reject.code);
        let sample = reject
            .share_difficulty
            .filter(|d| *d > 0.0)
            .unwrap_or_else(|| self.difficulty.value());
        self.stats
            .record_share_sample(false, sample, worker, Some(reject.code));

        // Stale and low-difficulty rejects are routine (block transitions,
        // difficulty adjustment) and stay out of the warn stream.
        if reject.code != RejectCode::Stale && reject.code != RejectCode::LowDiff {
            if rejected <= 5 || rejected % 25 == 0 {
                warn!(
                    client_id = self.peer.id,
                    worker,
                    shares_rejected = rejected,
                    job_id,
                    reason_code = reject.code.as_str(),
                    reason = %reject.message,
                    "Share rejected"
                );
            } else {
                debug!(
                    client_id = self.peer.id,
                    worker,
                    shares_rejected = rejected,
                    job_id,
                    reason_code = reject.code.as_str(),
                    "Share rejected"
                );
            }
        }

        let mut lines = Vec::new();
        if reject.code == RejectCode::LowDiff {
            self.maybe_downshift(&reject, &mut lines);
            self.maybe_rotate_prevhash_mode(&mut lines);
        }
        lines.push(messages::reject_line(id, reject.code));
        lines
    }

    /// A brand-new miner that only produces low-difficulty rejects started
    /// too high; cut toward what it is actually hashing and force the new
    /// difficulty out with a clean job.
    fn maybe_downshift(&mut self, reject: &ShareReject, lines: &mut Vec<String>) {
        let observed = reject.share_difficulty.unwrap_or(0.0);
        let current = self.difficulty.value();
        let Some(next) = self.vardiff.downshift(&self.vardiff_config, current, observed) else {
            return;
        };
        let Ok(difficulty) = Difficulty::from_f64(next) else {
            return;
        };
        info!(
            client_id = self.peer.id,
            worker = %self.worker_name,
            previous_difficulty = current,
            new_difficulty = next,
            min_difficulty = self.vardiff_config.min_difficulty,
            "Auto-lowered miner difficulty"
        );
        self.set_difficulty_now(difficulty);
        if let Some(line) = self.push_difficulty(true) {
            lines.push(line);
        }
        if let Some(job) = self.manager.current_job() {
            lines.push(job.notify_line(self.prevhash_mode, true).to_string());
        }
    }

    fn maybe_rotate_prevhash_mode(&mut self, lines: &mut Vec<String>) {
        let Some(mode) = self.rescue.next_prevhash_mode(
            self.prevhash_mode,
            self.vardiff.accepted_shares,
            self.vardiff.low_diff_streak,
        ) else {
            return;
        };
        self.prevhash_mode = mode;
        warn!(
            client_id = self.peer.id,
            remote = %self.peer.remote,
            worker = %self.worker_name,
            prevhash_mode = mode.as_str(),
            low_diff_streak = self.vardiff.low_diff_streak,
            "Switched miner prevhash mode after persistent low difficulty shares"
        );
        if let Some(job) = self.manager.current_job() {
            lines.push(job.notify_line(mode, true).to_string());
        }
    }

    fn set_difficulty_now(&mut self, difficulty: Difficulty) {
        self.peer.set_difficulty(difficulty.value());
        self.difficulty = difficulty;
        self.difficulty_sent = None;
    }

    fn push_difficulty(&mut self, force: bool) -> Option<String> {
        if !self.subscribed {
            return None;
        }
        if !force && self.difficulty_sent.as_deref() == Some(self.difficulty.text()) {
            return None;
        }
        self.difficulty_sent = Some(self.difficulty.text().to_string());
        Some(messages::set_difficulty_line(self.difficulty.value()))
    }
}

fn param_text(params: &[Value], index: usize) -> String {
    match params.get(index) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

/// `key=value` pairs from the authorize password, split on `,` or `;`,
/// keys lowercased. Carries the auth token and the `d=` difficulty hint.
fn parse_password_kv(password: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for part in password.split([';', ',']) {
        if let Some((key, value)) = part.split_once('=') {
            let key = key.trim().to_ascii_lowercase();
            if !key.is_empty() {
                out.insert(key, value.trim().to_string());
            }
        }
    }
    out
}

fn negotiate_version_rolling_mask(requested: Option<&str>) -> String {
    let requested = match requested {
        None => 0xffff_ffff,
        Some("") => 0xffff_ffff,
        Some(raw) => match parse_hex_u32(raw) {
            Some(mask) => mask,
            None => return "00000000".to_string(),
        },
    };
    encoding::fixed_hex_u32(requested & SERVER_VERSION_ROLLING_MASK)
}

fn parse_hex_u32(raw: &str) -> Option<u32> {
    let hex = encoding::normalize_hex(raw).ok()?;
    let hex = format!("{hex:0>8}");
    if hex.len() != 8 {
        return None;
    }
    u32::from_str_radix(&hex, 16).ok()
}
