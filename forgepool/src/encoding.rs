//! Byte-level encoding primitives for block and transaction construction.
//!
//! Everything that touches consensus serialization lives here: hex
//! normalization, byte reversal, the 32-bit word swap used by Stratum
//! prevhash formatting, Bitcoin varints, BIP34 height pushes, and
//! double-SHA256.

use bitcoin::hashes::{sha256d, Hash};
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum EncodingError {
    #[error("invalid hex: {0:?}")]
    InvalidHex(String),

    #[error("swap32 requires byte length multiple of 4, got {0}")]
    Swap32Length(usize),

    #[error("unexpected BIP34 height size")]
    Bip34HeightSize,
}

/// Normalize a hex string: trim, lowercase, strip an optional `0x` prefix,
/// and left-pad to an even number of digits.
pub fn normalize_hex(hex: &str) -> Result<String, EncodingError> {
    let mut value = hex.trim().to_ascii_lowercase();
    if let Some(stripped) = value.strip_prefix("0x") {
        value = stripped.to_string();
    }
    if value.len() % 2 != 0 {
        value.insert(0, '0');
    }
    if !value.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(EncodingError::InvalidHex(hex.to_string()));
    }
    Ok(value)
}

pub fn hex_to_bytes(hex: &str) -> Result<Vec<u8>, EncodingError> {
    let normalized = normalize_hex(hex)?;
    hex::decode(&normalized).map_err(|_| EncodingError::InvalidHex(hex.to_string()))
}

/// Reverse the byte order of a hex string (RPC order <-> header order).
pub fn reverse_hex(hex: &str) -> Result<String, EncodingError> {
    let mut bytes = hex_to_bytes(hex)?;
    bytes.reverse();
    Ok(hex::encode(bytes))
}

/// Swap byte order within each 32-bit word of a hex string.
pub fn swap32_hex(hex: &str) -> Result<String, EncodingError> {
    let mut bytes = hex_to_bytes(hex)?;
    if bytes.len() % 4 != 0 {
        return Err(EncodingError::Swap32Length(bytes.len()));
    }
    for word in bytes.chunks_mut(4) {
        word.swap(0, 3);
        word.swap(1, 2);
    }
    Ok(hex::encode(bytes))
}

/// Bitcoin variable-length integer.
pub fn varint(value: u64) -> Vec<u8> {
    if value < 0xfd {
        vec![value as u8]
    } else if value <= 0xffff {
        let mut out = vec![0xfd];
        out.extend_from_slice(&(value as u16).to_le_bytes());
        out
    } else if value <= 0xffff_ffff {
        let mut out = vec![0xfe];
        out.extend_from_slice(&(value as u32).to_le_bytes());
        out
    } else {
        let mut out = vec![0xff];
        out.extend_from_slice(&value.to_le_bytes());
        out
    }
}

/// Minimal little-endian script number encoding (CScriptNum).
pub fn script_num_le(value: i64) -> Vec<u8> {
    if value == 0 {
        return Vec::new();
    }
    let negative = value < 0;
    let mut n = value.unsigned_abs();

    let mut bytes = Vec::new();
    while n > 0 {
        bytes.push((n & 0xff) as u8);
        n >>= 8;
    }

    // The most significant byte carries the sign bit.
    let last = bytes.len() - 1;
    if bytes[last] & 0x80 != 0 {
        bytes.push(if negative { 0x80 } else { 0x00 });
    } else if negative {
        bytes[last] |= 0x80;
    }
    bytes
}

/// BIP34 height push for the coinbase scriptSig: a direct push of the
/// script-number encoding of the block height.
pub fn bip34_height_push(height: u64) -> Result<Vec<u8>, EncodingError> {
    let num = script_num_le(height as i64);
    if num.len() > 75 {
        return Err(EncodingError::Bip34HeightSize);
    }
    let mut out = Vec::with_capacity(1 + num.len());
    out.push(num.len() as u8);
    out.extend_from_slice(&num);
    Ok(out)
}

pub fn double_sha256(data: &[u8]) -> [u8; 32] {
    sha256d::Hash::hash(data).to_byte_array()
}

/// Fixed-width 8-digit hex rendering of a u32.
pub fn fixed_hex_u32(value: u32) -> String {
    format!("{value:08x}")
}

/// How the previous block hash is rendered in `mining.notify`.
///
/// `Stratum` is the standard convention (32-bit word swap of the RPC-order
/// hash). The other modes exist because some firmware expects one of the
/// legacy renderings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrevhashMode {
    Stratum,
    StratumWordrev,
    Header,
    Rpc,
}

impl PrevhashMode {
    pub const ALL: [PrevhashMode; 4] = [
        PrevhashMode::Stratum,
        PrevhashMode::StratumWordrev,
        PrevhashMode::Header,
        PrevhashMode::Rpc,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PrevhashMode::Stratum => "stratum",
            PrevhashMode::StratumWordrev => "stratum_wordrev",
            PrevhashMode::Header => "header",
            PrevhashMode::Rpc => "rpc",
        }
    }

    pub fn index(self) -> usize {
        match self {
            PrevhashMode::Stratum => 0,
            PrevhashMode::StratumWordrev => 1,
            PrevhashMode::Header => 2,
            PrevhashMode::Rpc => 3,
        }
    }

    /// The mode tried after this one when rotating.
    pub fn next(self) -> PrevhashMode {
        Self::ALL[(self.index() + 1) % Self::ALL.len()]
    }
}

/// Render an RPC-order previous block hash for `mining.notify`.
pub fn format_prevhash(rpc_order_hex: &str, mode: PrevhashMode) -> Result<String, EncodingError> {
    let rpc_order = normalize_hex(rpc_order_hex)?;
    match mode {
        PrevhashMode::Stratum => swap32_hex(&rpc_order),
        PrevhashMode::StratumWordrev => swap32_hex(&reverse_hex(&rpc_order)?),
        PrevhashMode::Header => reverse_hex(&rpc_order),
        PrevhashMode::Rpc => Ok(rpc_order),
    }
}
