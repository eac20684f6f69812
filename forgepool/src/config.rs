//! Pool configuration.
//!
//! Loaded from a TOML file (path from the command line or the
//! `FORGEPOOL_CONFIG` environment variable), with the node RPC credentials
//! overridable through `FORGEPOOL_NODE_RPC_USER` / `FORGEPOOL_NODE_RPC_PASS`
//! so secrets can stay out of the file. Every section validates the same
//! bounds after load.

use std::path::Path;

use serde::Deserialize;

use crate::encoding::PrevhashMode;
use crate::error::{Error, Result};
use crate::target::Difficulty;
use crate::template::FingerprintMode;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub node: NodeConfig,
    pub stratum: StratumConfig,
    pub pool: PoolConfig,
    pub vardiff: VardiffSettings,
    pub jobs: JobsConfig,
    pub api: ApiConfig,
    pub compat: CompatConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeConfig {
    pub rpc_host: String,
    pub rpc_port: u16,
    pub rpc_user: String,
    pub rpc_pass: String,
    pub rpc_tls: bool,
    pub rpc_timeout_ms: u64,
    pub rpc_longpoll_timeout_ms: u64,
    pub allow_pow_algo_mismatch: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            rpc_host: "127.0.0.1".into(),
            rpc_port: 14022,
            rpc_user: String::new(),
            rpc_pass: String::new(),
            rpc_tls: false,
            rpc_timeout_ms: 5000,
            rpc_longpoll_timeout_ms: 90_000,
            allow_pow_algo_mismatch: false,
        }
    }
}

impl NodeConfig {
    pub fn rpc_url(&self) -> String {
        let scheme = if self.rpc_tls { "https" } else { "http" };
        format!("{scheme}://{}:{}/", self.rpc_host, self.rpc_port)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StratumConfig {
    pub host: String,
    pub port: u16,
    pub prevhash_mode: PrevhashMode,
    pub idle_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub max_clients: usize,
    pub max_clients_per_ip: usize,
    pub connection_rate_limit_per_min: usize,
    pub extranonce1_size: usize,
    pub extranonce2_size: usize,
}

impl Default for StratumConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 3333,
            prevhash_mode: PrevhashMode::Stratum,
            idle_timeout_ms: 300_000,
            write_timeout_ms: 5000,
            max_clients: 1000,
            max_clients_per_ip: 10,
            connection_rate_limit_per_min: 60,
            extranonce1_size: 4,
            extranonce2_size: 8,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    pub payout_address: String,
    pub payout_script_hex: String,
    pub tag: String,
    pub pow_algo: String,
    pub base_difficulty: String,
    pub min_difficulty: String,
    pub allow_any_user: bool,
    pub miner_auth_token: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            payout_address: String::new(),
            payout_script_hex: String::new(),
            tag: "/forgepool/".into(),
            pow_algo: "sha256d".into(),
            base_difficulty: "16384".into(),
            min_difficulty: "1".into(),
            allow_any_user: true,
            miner_auth_token: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VardiffSettings {
    pub enabled: bool,
    pub target_share_time_ms: u64,
    pub retarget_every_shares: u64,
    /// Defaults to `pool.base_difficulty` when unset.
    pub max_difficulty: Option<String>,
}

impl Default for VardiffSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            target_share_time_ms: 15_000,
            retarget_every_shares: 4,
            max_difficulty: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JobsConfig {
    pub enable_longpoll: bool,
    pub template_poll_ms: u64,
    pub template_poll_ms_longpoll_healthy: u64,
    pub longpoll_healthy_grace_ms: u64,
    pub fingerprint_mode: FingerprintMode,
    pub keep_old_jobs: usize,
    pub max_submissions_tracked: usize,
    pub gbt_rules: Vec<String>,
    pub enable_near_candidate_prewarm: bool,
    pub near_candidate_prewarm_factor: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            enable_longpoll: true,
            template_poll_ms: 1000,
            template_poll_ms_longpoll_healthy: 5000,
            longpoll_healthy_grace_ms: 120_000,
            fingerprint_mode: FingerprintMode::Fast,
            keep_old_jobs: 8,
            max_submissions_tracked: 50_000,
            gbt_rules: vec!["segwit".into()],
            enable_near_candidate_prewarm: true,
            near_candidate_prewarm_factor: 256,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ApiConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "0.0.0.0".into(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CompatConfig {
    /// Rotate a stuck miner's prevhash display mode after persistent
    /// low-difficulty rejects.
    pub rotate_prevhash_mode: bool,
    pub debug_share_validation: bool,
}

impl Default for CompatConfig {
    fn default() -> Self {
        Self {
            rotate_prevhash_mode: true,
            debug_share_validation: false,
        }
    }
}

impl Config {
    /// Load from a TOML file, apply environment overrides, and validate.
    pub fn load(path: &Path) -> Result<Config> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let mut config: Config = toml::from_str(&raw)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(user) = std::env::var("FORGEPOOL_NODE_RPC_USER") {
            self.node.rpc_user = user;
        }
        if let Ok(pass) = std::env::var("FORGEPOOL_NODE_RPC_PASS") {
            self.node.rpc_pass = pass;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(Error::Config(msg.to_string()));

        if self.node.rpc_user.is_empty() || self.node.rpc_pass.is_empty() {
            return fail("node.rpc_user and node.rpc_pass are required");
        }
        if self.pool.payout_address.is_empty() && self.pool.payout_script_hex.is_empty() {
            return fail("pool.payout_address or pool.payout_script_hex is required");
        }
        if !(2..=16).contains(&self.stratum.extranonce1_size) {
            return fail("stratum.extranonce1_size must be between 2 and 16");
        }
        if !(2..=16).contains(&self.stratum.extranonce2_size) {
            return fail("stratum.extranonce2_size must be between 2 and 16");
        }
        if self.vardiff.target_share_time_ms < 1000 {
            return fail("vardiff.target_share_time_ms must be >= 1000");
        }
        if self.vardiff.retarget_every_shares < 1 {
            return fail("vardiff.retarget_every_shares must be >= 1");
        }
        if self.jobs.near_candidate_prewarm_factor < 2 {
            return fail("jobs.near_candidate_prewarm_factor must be >= 2");
        }
        if self.jobs.max_submissions_tracked < 1000 {
            return fail("jobs.max_submissions_tracked must be >= 1000");
        }
        if self.jobs.template_poll_ms_longpoll_healthy < 250 {
            return fail("jobs.template_poll_ms_longpoll_healthy must be >= 250");
        }
        if self.jobs.longpoll_healthy_grace_ms < 1000 {
            return fail("jobs.longpoll_healthy_grace_ms must be >= 1000");
        }
        if self.pool.pow_algo != "sha256d" {
            return fail("only pool.pow_algo = \"sha256d\" is currently supported");
        }

        Difficulty::parse(&self.pool.base_difficulty)
            .map_err(|e| Error::Config(format!("pool.base_difficulty: {e}")))?;
        Difficulty::parse(&self.pool.min_difficulty)
            .map_err(|e| Error::Config(format!("pool.min_difficulty: {e}")))?;
        if let Some(max) = &self.vardiff.max_difficulty {
            Difficulty::parse(max)
                .map_err(|e| Error::Config(format!("vardiff.max_difficulty: {e}")))?;
        }
        Ok(())
    }

    pub fn base_difficulty(&self) -> Difficulty {
        Difficulty::parse(&self.pool.base_difficulty)
            .unwrap_or_else(|_| Difficulty::from_int(16384))
    }

    pub fn min_difficulty_value(&self) -> f64 {
        self.pool.min_difficulty.parse::<f64>().unwrap_or(1.0).max(1.0)
    }

    pub fn max_difficulty_value(&self) -> f64 {
        let text = self
            .vardiff
            .max_difficulty
            .as_deref()
            .unwrap_or(&self.pool.base_difficulty);
        let max: f64 = text.parse().unwrap_or(16384.0);
        max.max(self.min_difficulty_value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.node.rpc_user = "user".into();
        config.node.rpc_pass = "pass".into();
        config.pool.payout_script_hex = "51".into();
        config
    }

    #[test]
    fn defaults_validate_once_secrets_and_payout_are_set() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn missing_credentials_fail() {
        let mut config = valid_config();
        config.node.rpc_pass.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_payout_fails() {
        let mut config = valid_config();
        config.pool.payout_script_hex.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn extranonce_bounds_enforced() {
        let mut config = valid_config();
        config.stratum.extranonce2_size = 1;
        assert!(config.validate().is_err());
        config.stratum.extranonce2_size = 17;
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_base_difficulty_fails() {
        let mut config = valid_config();
        config.pool.base_difficulty = "0".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_toml_sections() {
        let toml = r#"
            [node]
            rpc_user = "u"
            rpc_pass = "p"

            [pool]
            payout_address = "addr"
            base_difficulty = "4096"

            [stratum]
            port = 3334
            prevhash_mode = "stratum_wordrev"

            [jobs]
            fingerprint_mode = "full"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.stratum.port, 3334);
        assert_eq!(
            config.stratum.prevhash_mode,
            crate::encoding::PrevhashMode::StratumWordrev
        );
        assert_eq!(
            config.jobs.fingerprint_mode,
            crate::template::FingerprintMode::Full
        );
        assert_eq!(config.pool.base_difficulty, "4096");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn max_difficulty_defaults_to_base() {
        let config = valid_config();
        assert_eq!(config.max_difficulty_value(), 16384.0);
    }
}
