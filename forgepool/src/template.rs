//! Block template model and change-detection fingerprints.

use serde::Deserialize;

use crate::target::{self, TargetError};
use ruint::aliases::U256;

/// One non-coinbase transaction from `getblocktemplate`.
#[derive(Debug, Clone, Deserialize)]
pub struct TemplateTransaction {
    /// Raw transaction hex, as it goes into a submitted block.
    pub data: String,
    #[serde(default)]
    pub txid: Option<String>,
    #[serde(default)]
    pub hash: Option<String>,
}

impl TemplateTransaction {
    /// The identifier used for merkle leaves and fingerprints. Older nodes
    /// only populate `hash`.
    pub fn id_hex(&self) -> Option<&str> {
        self.txid.as_deref().or(self.hash.as_deref())
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CoinbaseAux {
    #[serde(default)]
    pub flags: Option<String>,
}

/// The `getblocktemplate` fields this pool consumes.
#[derive(Debug, Clone, Deserialize)]
pub struct BlockTemplate {
    pub version: u32,
    pub previousblockhash: String,
    #[serde(default)]
    pub height: u64,
    pub bits: String,
    #[serde(default)]
    pub target: Option<String>,
    pub curtime: u64,
    #[serde(default)]
    pub mintime: Option<u64>,
    #[serde(default)]
    pub maxtime: Option<u64>,
    pub coinbasevalue: u64,
    #[serde(default)]
    pub transactions: Vec<TemplateTransaction>,
    #[serde(default)]
    pub default_witness_commitment: Option<String>,
    #[serde(default)]
    pub longpollid: Option<String>,
    #[serde(default)]
    pub workid: Option<String>,
    #[serde(default)]
    pub coinbaseaux: Option<CoinbaseAux>,
    // Multi-algo nodes disagree on the field name.
    #[serde(default)]
    pub algo: Option<String>,
    #[serde(default)]
    pub pow_algo: Option<String>,
    #[serde(default)]
    pub powalgo: Option<String>,
    #[serde(default)]
    pub algorithm: Option<String>,
}

/// How aggressively template changes are detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FingerprintMode {
    /// Chain tip only: prevhash, height, version, bits.
    Prevhash,
    /// Adds tx count plus the first and last few txids. The default.
    Fast,
    /// Every txid. Exact but costs a full join per template.
    Full,
}

impl BlockTemplate {
    /// The proof-of-work algorithm the template declares, if any.
    pub fn pow_algo_name(&self) -> Option<&str> {
        [&self.algo, &self.pow_algo, &self.powalgo, &self.algorithm]
            .into_iter()
            .find_map(|f| f.as_deref().filter(|s| !s.is_empty()))
    }

    /// The network target: the explicit `target` field when present,
    /// otherwise expanded from compact bits.
    pub fn network_target(&self) -> Result<U256, TargetError> {
        if let Some(hex) = self.target.as_deref().filter(|s| !s.is_empty()) {
            let normalized = crate::encoding::normalize_hex(hex)
                .map_err(|_| TargetError::BadBits(hex.to_string()))?;
            return U256::from_str_radix(&normalized, 16)
                .map_err(|_| TargetError::BadBits(hex.to_string()));
        }
        target::compact_bits_to_target(&self.bits)
    }

    /// A change-detection key for this template. Time fields are excluded
    /// on purpose: many nodes advance curtime every second, which would
    /// churn jobs for no benefit.
    pub fn fingerprint(&self, mode: FingerprintMode) -> String {
        if mode == FingerprintMode::Prevhash {
            return format!(
                "{}:{}:{}:{}",
                self.previousblockhash, self.height, self.version, self.bits
            );
        }

        let tx_component = match mode {
            FingerprintMode::Full => self
                .transactions
                .iter()
                .map(|tx| tx.id_hex().unwrap_or(""))
                .collect::<Vec<_>>()
                .join(","),
            _ => {
                let count = self.transactions.len();
                if count == 0 {
                    "0".to_string()
                } else {
                    let head_count = count.min(4);
                    let tail_count = (count - head_count).min(4);
                    let head = self.transactions[..head_count]
                        .iter()
                        .map(|tx| tx.id_hex().unwrap_or(""))
                        .collect::<Vec<_>>()
                        .join(",");
                    let tail = self.transactions[count - tail_count..]
                        .iter()
                        .map(|tx| tx.id_hex().unwrap_or(""))
                        .collect::<Vec<_>>()
                        .join(",");
                    format!("{count}|{head}|{tail}")
                }
            }
        };

        format!(
            "{}:{}:{}:{}:{}:{}:{}",
            self.previousblockhash,
            self.height,
            self.version,
            self.bits,
            self.coinbasevalue,
            self.default_witness_commitment.as_deref().unwrap_or(""),
            tx_component
        )
    }
}
