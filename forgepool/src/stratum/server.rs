//! TCP listener, connection admission, and the peer registry.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::config::Config;
use crate::error::Result;
use crate::job::manager::JobManager;
use crate::stats::{now_ms, PoolStats};
use crate::stratum::compat::RescueStrategy;
use crate::stratum::session::Session;
use crate::stratum::transport::TcpTransport;
use crate::tracing::prelude::*;

/// Shared per-connection record. The session updates it; the registry and
/// the HTTP API read it.
#[derive(Debug)]
pub struct PeerInfo {
    pub id: u64,
    pub remote: String,
    pub ip: String,
    pub connected_at: u64,
    pub subscribed: AtomicBool,
    pub authorized: AtomicBool,
    pub accepted_shares: AtomicU64,
    pub rejected_shares: AtomicU64,
    pub last_share_at: AtomicU64,
    pub avg_share_interval_ms: AtomicU64,
    difficulty_bits: AtomicU64,
    worker: Mutex<String>,
    user_agent: Mutex<String>,
}

impl PeerInfo {
    fn new(id: u64, ip: String, remote: String) -> Self {
        Self {
            id,
            remote,
            ip,
            connected_at: now_ms(),
            subscribed: AtomicBool::new(false),
            authorized: AtomicBool::new(false),
            accepted_shares: AtomicU64::new(0),
            rejected_shares: AtomicU64::new(0),
            last_share_at: AtomicU64::new(0),
            avg_share_interval_ms: AtomicU64::new(0),
            difficulty_bits: AtomicU64::new(0),
            worker: Mutex::new(format!("worker-{id}")),
            user_agent: Mutex::new(String::new()),
        }
    }

    pub fn set_difficulty(&self, value: f64) {
        self.difficulty_bits.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn difficulty(&self) -> f64 {
        f64::from_bits(self.difficulty_bits.load(Ordering::Relaxed))
    }

    pub fn set_worker(&self, name: &str) {
        *self.worker.lock() = name.to_string();
    }

    pub fn worker(&self) -> String {
        self.worker.lock().clone()
    }

    pub fn set_user_agent(&self, agent: &str) {
        *self.user_agent.lock() = agent.to_string();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDenied {
    MaxClients,
    MaxClientsPerIp,
    RateLimited,
}

impl AdmissionDenied {
    pub fn as_str(self) -> &'static str {
        match self {
            AdmissionDenied::MaxClients => "max clients reached",
            AdmissionDenied::MaxClientsPerIp => "max clients per IP reached",
            AdmissionDenied::RateLimited => "connection rate limit exceeded",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub id: u64,
    pub name: String,
    pub remote: String,
    pub connected_at: u64,
    pub session_sec: u64,
    pub accepted_shares: u64,
    pub rejected_shares: u64,
    pub difficulty: f64,
    pub last_share_at: u64,
    pub avg_share_interval_ms: u64,
    pub user_agent: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshot {
    pub connected: usize,
    pub subscribed: usize,
    pub authorized: usize,
    pub workers: Vec<WorkerSnapshot>,
}

struct RegistryInner {
    peers: HashMap<u64, Arc<PeerInfo>>,
    by_ip: HashMap<String, HashSet<u64>>,
    attempts: HashMap<String, VecDeque<u64>>,
}

/// Connection bookkeeping with the admission limits applied atomically at
/// accept time.
pub struct Registry {
    max_clients: usize,
    max_clients_per_ip: usize,
    rate_limit_per_min: usize,
    peer_seq: AtomicU64,
    inner: RwLock<RegistryInner>,
}

impl Registry {
    pub fn new(config: &Config) -> Self {
        Self {
            max_clients: config.stratum.max_clients,
            max_clients_per_ip: config.stratum.max_clients_per_ip,
            rate_limit_per_min: config.stratum.connection_rate_limit_per_min,
            peer_seq: AtomicU64::new(0),
            inner: RwLock::new(RegistryInner {
                peers: HashMap::new(),
                by_ip: HashMap::new(),
                attempts: HashMap::new(),
            }),
        }
    }

    pub fn try_admit(
        &self,
        ip: &str,
        remote: &str,
    ) -> std::result::Result<Arc<PeerInfo>, AdmissionDenied> {
        let now = now_ms();
        let mut inner = self.inner.write();

        if inner.peers.len() >= self.max_clients {
            return Err(AdmissionDenied::MaxClients);
        }

        let attempts = inner.attempts.entry(ip.to_string()).or_default();
        while attempts.front().is_some_and(|&t| t + 60_000 <= now) {
            attempts.pop_front();
        }
        if attempts.len() >= self.rate_limit_per_min {
            return Err(AdmissionDenied::RateLimited);
        }
        attempts.push_back(now);

        let from_ip = inner.by_ip.get(ip).map_or(0, HashSet::len);
        if from_ip >= self.max_clients_per_ip {
            return Err(AdmissionDenied::MaxClientsPerIp);
        }

        let id = self.peer_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let peer = Arc::new(PeerInfo::new(id, ip.to_string(), remote.to_string()));
        inner.peers.insert(id, peer.clone());
        inner.by_ip.entry(ip.to_string()).or_default().insert(id);
        Ok(peer)
    }

    pub fn remove(&self, peer: &PeerInfo) {
        let mut inner = self.inner.write();
        inner.peers.remove(&peer.id);
        if let Some(set) = inner.by_ip.get_mut(&peer.ip) {
            set.remove(&peer.id);
            if set.is_empty() {
                inner.by_ip.remove(&peer.ip);
            }
        }
    }

    /// Drop stale rate-limit buckets so idle IPs do not accumulate.
    pub fn sweep_attempts(&self) {
        let now = now_ms();
        let mut inner = self.inner.write();
        inner.attempts.retain(|_, attempts| {
            while attempts.front().is_some_and(|&t| t + 60_000 <= now) {
                attempts.pop_front();
            }
            !attempts.is_empty()
        });
    }

    pub fn connected(&self) -> usize {
        self.inner.read().peers.len()
    }

    pub fn clients_from_ip(&self, ip: &str) -> usize {
        self.inner.read().by_ip.get(ip).map_or(0, HashSet::len)
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let now = now_ms();
        let inner = self.inner.read();
        let mut subscribed = 0;
        let mut authorized = 0;
        let mut workers = Vec::new();
        for peer in inner.peers.values() {
            if peer.subscribed.load(Ordering::Relaxed) {
                subscribed += 1;
            }
            if peer.authorized.load(Ordering::Relaxed) {
                authorized += 1;
                workers.push(WorkerSnapshot {
                    id: peer.id,
                    name: peer.worker(),
                    remote: peer.remote.clone(),
                    connected_at: peer.connected_at,
                    session_sec: now.saturating_sub(peer.connected_at) / 1000,
                    accepted_shares: peer.accepted_shares.load(Ordering::Relaxed),
                    rejected_shares: peer.rejected_shares.load(Ordering::Relaxed),
                    difficulty: peer.difficulty(),
                    last_share_at: peer.last_share_at.load(Ordering::Relaxed),
                    avg_share_interval_ms: peer.avg_share_interval_ms.load(Ordering::Relaxed),
                    user_agent: peer.user_agent.lock().clone(),
                });
            }
        }
        workers.sort_by_key(|w| w.id);
        RegistrySnapshot {
            connected: inner.peers.len(),
            subscribed,
            authorized,
            workers,
        }
    }
}

pub struct StratumServer {
    config: Arc<Config>,
    manager: Arc<JobManager>,
    stats: Arc<PoolStats>,
    registry: Arc<Registry>,
    rescue: Arc<dyn RescueStrategy>,
    extranonce_counter: AtomicU64,
}

impl StratumServer {
    pub fn new(
        config: Arc<Config>,
        manager: Arc<JobManager>,
        stats: Arc<PoolStats>,
        registry: Arc<Registry>,
        rescue: Arc<dyn RescueStrategy>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            manager,
            stats,
            registry,
            rescue,
            extranonce_counter: AtomicU64::new(0),
        })
    }

    /// Accept loop. Admission failures drop the socket before a session is
    /// ever spawned.
    pub async fn run(
        self: Arc<Self>,
        tracker: TaskTracker,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let listener = TcpListener::bind((
            self.config.stratum.host.as_str(),
            self.config.stratum.port,
        ))
        .await?;
        info!(
            host = %self.config.stratum.host,
            port = self.config.stratum.port,
            max_clients = self.config.stratum.max_clients,
            max_clients_per_ip = self.config.stratum.max_clients_per_ip,
            rate_limit_per_min = self.config.stratum.connection_rate_limit_per_min,
            "Stratum listening"
        );

        let mut sweep = tokio::time::interval(std::time::Duration::from_secs(60));
        sweep.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sweep.tick() => self.registry.sweep_attempts(),
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => self.spawn_session(stream, addr, &tracker, &shutdown),
                        Err(e) => warn!(error = %e, "Accept failed"),
                    }
                }
            }
        }
        info!("Stratum listener stopped.");
        Ok(())
    }

    fn spawn_session(
        self: &Arc<Self>,
        stream: tokio::net::TcpStream,
        addr: std::net::SocketAddr,
        tracker: &TaskTracker,
        shutdown: &CancellationToken,
    ) {
        let ip = canonical_ip(&addr);
        let remote = addr.to_string();

        let peer = match self.registry.try_admit(&ip, &remote) {
            Ok(peer) => peer,
            Err(denied) => {
                warn!(ip = %ip, reason = denied.as_str(), "Connection rejected");
                return;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "set_nodelay failed");
        }

        self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
        info!(
            client_id = peer.id,
            remote = %peer.remote,
            connected_clients = self.registry.connected(),
            clients_from_ip = self.registry.clients_from_ip(&ip),
            "Miner connected"
        );

        let server = self.clone();
        let shutdown = shutdown.clone();
        tracker.spawn(async move {
            let session = Session::new(
                server.config.clone(),
                server.manager.clone(),
                server.stats.clone(),
                server.rescue.clone(),
                peer.clone(),
                server.allocate_extranonce1(),
            );
            let mut transport = TcpTransport::new(stream);
            if let Err(e) = session.run(&mut transport, shutdown).await {
                debug!(client_id = peer.id, error = %e, "Session ended with error");
            }
            server.registry.remove(&peer);
            info!(
                client_id = peer.id,
                remote = %peer.remote,
                worker = %peer.worker(),
                accepted_shares = peer.accepted_shares.load(Ordering::Relaxed),
                rejected_shares = peer.rejected_shares.load(Ordering::Relaxed),
                session_sec = now_ms().saturating_sub(peer.connected_at) / 1000,
                connected_clients = server.registry.connected(),
                "Miner disconnected"
            );
        });
    }

    /// Sequential extranonce1, big-endian in `extranonce1_size` bytes, so
    /// every connection searches a disjoint coinbase space.
    fn allocate_extranonce1(&self) -> String {
        let counter = self.extranonce_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let size = self.config.stratum.extranonce1_size;
        let mut bytes = vec![0u8; size];
        let mut x = counter;
        for slot in bytes.iter_mut().rev() {
            *slot = (x & 0xff) as u8;
            x >>= 8;
            if x == 0 {
                break;
            }
        }
        hex::encode(bytes)
    }
}

/// Strip the IPv4-mapped prefix so limits see one bucket per host.
fn canonical_ip(addr: &std::net::SocketAddr) -> String {
    match addr.ip() {
        std::net::IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => v6.to_string(),
        },
        ip => ip.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(max_clients: usize, per_ip: usize, rate: usize) -> Registry {
        let mut config = Config::default();
        config.stratum.max_clients = max_clients;
        config.stratum.max_clients_per_ip = per_ip;
        config.stratum.connection_rate_limit_per_min = rate;
        Registry::new(&config)
    }

    #[test]
    fn per_ip_limit_enforced() {
        let registry = registry(100, 2, 100);
        let a = registry.try_admit("10.0.0.1", "10.0.0.1:1").unwrap();
        let _b = registry.try_admit("10.0.0.1", "10.0.0.1:2").unwrap();
        assert_eq!(
            registry.try_admit("10.0.0.1", "10.0.0.1:3").unwrap_err(),
            AdmissionDenied::MaxClientsPerIp
        );
        // A different IP is unaffected.
        assert!(registry.try_admit("10.0.0.2", "10.0.0.2:1").is_ok());

        registry.remove(&a);
        assert!(registry.try_admit("10.0.0.1", "10.0.0.1:4").is_ok());
    }

    #[test]
    fn total_limit_enforced() {
        let registry = registry(2, 10, 100);
        registry.try_admit("10.0.0.1", "10.0.0.1:1").unwrap();
        registry.try_admit("10.0.0.2", "10.0.0.2:1").unwrap();
        assert_eq!(
            registry.try_admit("10.0.0.3", "10.0.0.3:1").unwrap_err(),
            AdmissionDenied::MaxClients
        );
    }

    #[test]
    fn rate_limit_counts_attempts_not_connections() {
        let registry = registry(100, 100, 3);
        for i in 0..3 {
            let peer = registry
                .try_admit("10.0.0.1", &format!("10.0.0.1:{i}"))
                .unwrap();
            // Disconnecting does not refund the attempt budget.
            registry.remove(&peer);
        }
        assert_eq!(
            registry.try_admit("10.0.0.1", "10.0.0.1:9").unwrap_err(),
            AdmissionDenied::RateLimited
        );
    }

    #[test]
    fn snapshot_lists_authorized_workers_only() {
        let registry = registry(100, 10, 100);
        let a = registry.try_admit("10.0.0.1", "10.0.0.1:1").unwrap();
        let b = registry.try_admit("10.0.0.1", "10.0.0.1:2").unwrap();
        a.subscribed.store(true, Ordering::Relaxed);
        a.authorized.store(true, Ordering::Relaxed);
        a.set_worker("bitaxe1");
        b.subscribed.store(true, Ordering::Relaxed);

        let snap = registry.snapshot();
        assert_eq!(snap.connected, 2);
        assert_eq!(snap.subscribed, 2);
        assert_eq!(snap.authorized, 1);
        assert_eq!(snap.workers.len(), 1);
        assert_eq!(snap.workers[0].name, "bitaxe1");
    }

    #[test]
    fn peer_difficulty_round_trips_through_bits() {
        let peer = PeerInfo::new(1, "ip".into(), "ip:1".into());
        peer.set_difficulty(16384.0);
        assert_eq!(peer.difficulty(), 16384.0);
        peer.set_difficulty(0.25);
        assert_eq!(peer.difficulty(), 0.25);
    }
}
