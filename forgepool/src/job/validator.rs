//! Share validation: rebuild the exact 80-byte header a miner hashed and
//! compare it against the share and network targets.

use ruint::aliases::U256;

use crate::encoding::{self, double_sha256, fixed_hex_u32};
use crate::job::Job;
use crate::target::{self, share_difficulty};

/// Stratum reject classification, with the wire error code and message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectCode {
    Invalid,
    Stale,
    Duplicate,
    LowDiff,
    Unauthorized,
    NotSubscribed,
}

impl RejectCode {
    pub fn stratum_error(self) -> (i64, &'static str) {
        match self {
            RejectCode::Invalid => (20, "Invalid share"),
            RejectCode::Stale => (21, "Stale share"),
            RejectCode::Duplicate => (22, "Duplicate share"),
            RejectCode::LowDiff => (23, "Low difficulty share"),
            RejectCode::Unauthorized => (24, "Unauthorized worker"),
            RejectCode::NotSubscribed => (25, "Not subscribed"),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RejectCode::Invalid => "invalid",
            RejectCode::Stale => "stale",
            RejectCode::Duplicate => "duplicate",
            RejectCode::LowDiff => "lowdiff",
            RejectCode::Unauthorized => "unauthorized",
            RejectCode::NotSubscribed => "notsubscribed",
        }
    }
}

/// A rejected share, with enough context for logging and vardiff.
#[derive(Debug)]
pub struct ShareReject {
    pub code: RejectCode,
    pub message: String,
    pub share_difficulty: Option<f64>,
    pub share_hash_hex: Option<String>,
}

impl ShareReject {
    pub fn new(code: RejectCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            share_difficulty: None,
            share_hash_hex: None,
        }
    }

    pub fn stale(message: impl Into<String>) -> Self {
        Self::new(RejectCode::Stale, message)
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(RejectCode::Invalid, message)
    }
}

/// An accepted share.
#[derive(Debug)]
pub struct AcceptedShare {
    /// Whether the hash also meets the network target.
    pub is_block_candidate: bool,
    /// Display (big-endian) hash of the share header.
    pub share_hash_hex: String,
    pub header_hash_int: U256,
    pub share_difficulty: f64,
    pub version_hex: String,
    pub version_bits_hex: Option<String>,
    pub header: [u8; 80],
    pub extranonce2_hex: String,
    pub ntime_hex: String,
    pub nonce_hex: String,
}

/// One `mining.submit`, plus the connection state validation needs.
pub struct ShareSubmission<'a> {
    pub extranonce1: &'a [u8],
    pub extranonce1_hex: &'a str,
    pub extranonce2_hex: &'a str,
    pub ntime_hex: &'a str,
    pub nonce_hex: &'a str,
    pub version_bits_hex: Option<&'a str>,
    pub version_rolling_enabled: bool,
    pub version_rolling_mask_hex: &'a str,
}

/// Validate one submission against a resolved job.
///
/// `current_epoch` is the prevhash epoch of the pool's newest job; shares
/// against jobs from older epochs are stale no matter what they hash to.
pub fn validate_share(
    job: &Job,
    current_epoch: u64,
    share_target: U256,
    extranonce2_size: usize,
    submission: &ShareSubmission<'_>,
) -> Result<AcceptedShare, ShareReject> {
    if job.prevhash_epoch < current_epoch {
        return Err(ShareReject::stale("Job superseded by clean job"));
    }

    let extranonce2_hex = encoding::normalize_hex(submission.extranonce2_hex)
        .map_err(|_| ShareReject::invalid("Bad extranonce2 hex"))?;
    let extranonce2 = encoding::hex_to_bytes(&extranonce2_hex)
        .map_err(|_| ShareReject::invalid("Bad extranonce2 hex"))?;
    if extranonce2.len() != extranonce2_size {
        return Err(ShareReject::invalid(format!(
            "Bad extranonce2 size (expected {extranonce2_size} bytes)"
        )));
    }

    let ntime_hex = pad8(submission.ntime_hex)?;
    let nonce_hex = pad8(submission.nonce_hex)?;

    let ntime = u64::from_str_radix(&ntime_hex, 16)
        .map_err(|_| ShareReject::invalid("ntime and nonce must be 4-byte hex"))?;
    if ntime < job.min_time || ntime > job.max_time + 7200 {
        return Err(ShareReject::stale("ntime out of range"));
    }

    let (version_hex, version_bits_hex) = resolve_share_version(
        &job.version_hex,
        submission.version_bits_hex,
        submission.version_rolling_enabled,
        submission.version_rolling_mask_hex,
    )
    .map_err(ShareReject::invalid)?;

    let dedupe_key = format!(
        "{}:{}:{}:{}:{}:{}",
        submission.extranonce1_hex, job.job_id, extranonce2_hex, ntime_hex, nonce_hex, version_hex
    );
    if !job.remember_submission(&dedupe_key) {
        return Err(ShareReject::new(RejectCode::Duplicate, "Duplicate share"));
    }

    let mut coinbase = Vec::with_capacity(
        job.coinbase1.len() + submission.extranonce1.len() + extranonce2.len() + job.coinbase2.len(),
    );
    coinbase.extend_from_slice(&job.coinbase1);
    coinbase.extend_from_slice(submission.extranonce1);
    coinbase.extend_from_slice(&extranonce2);
    coinbase.extend_from_slice(&job.coinbase2);

    let coinbase_hash = double_sha256(&coinbase);
    let merkle_root = crate::merkle::root_from_branches(coinbase_hash, &job.merkle_branches);

    let header = build_header(
        &version_hex,
        &job.prevhash_header,
        &merkle_root,
        &ntime_hex,
        &job.bits_hex,
        &nonce_hex,
    )
    .map_err(ShareReject::invalid)?;

    let header_hash = double_sha256(&header);
    let header_hash_int = target::hash_to_le_int(&header_hash);
    let difficulty = share_difficulty(header_hash_int);
    let share_hash_hex = {
        let mut display = header_hash;
        display.reverse();
        hex::encode(display)
    };

    if header_hash_int > share_target {
        return Err(ShareReject {
            code: RejectCode::LowDiff,
            message: "Low difficulty share".into(),
            share_difficulty: Some(difficulty),
            share_hash_hex: Some(share_hash_hex),
        });
    }

    Ok(AcceptedShare {
        is_block_candidate: header_hash_int <= job.network_target,
        share_hash_hex,
        header_hash_int,
        share_difficulty: difficulty,
        version_hex,
        version_bits_hex,
        header,
        extranonce2_hex,
        ntime_hex,
        nonce_hex,
    })
}

fn pad8(hex: &str) -> Result<String, ShareReject> {
    let normalized = encoding::normalize_hex(hex)
        .map_err(|_| ShareReject::invalid("ntime and nonce must be 4-byte hex"))?;
    let padded = format!("{normalized:0>8}");
    if padded.len() != 8 {
        return Err(ShareReject::invalid("ntime and nonce must be 4-byte hex"));
    }
    Ok(padded)
}

/// Resolve the effective header version under BIP310 version rolling.
pub fn resolve_share_version(
    base_version_hex: &str,
    version_bits_hex: Option<&str>,
    rolling_enabled: bool,
    rolling_mask_hex: &str,
) -> Result<(String, Option<String>), String> {
    let base_hex = encoding::normalize_hex(base_version_hex)
        .map(|h| format!("{h:0>8}"))
        .map_err(|_| "Invalid job version".to_string())?;
    if base_hex.len() != 8 {
        return Err("Invalid job version".into());
    }

    if !rolling_enabled {
        return Ok((base_hex, None));
    }

    let mask_hex = encoding::normalize_hex(rolling_mask_hex)
        .map(|h| format!("{h:0>8}"))
        .map_err(|_| "Invalid version rolling mask".to_string())?;
    if mask_hex.len() != 8 {
        return Err("Invalid version rolling mask".into());
    }

    let bits_raw = match version_bits_hex {
        Some(b) if !b.is_empty() => b,
        _ => return Err("Missing version rolling bits in submit".into()),
    };
    let bits_hex = encoding::normalize_hex(bits_raw)
        .map(|h| format!("{h:0>8}"))
        .map_err(|_| "version rolling bits must be 4-byte hex".to_string())?;
    if bits_hex.len() != 8 {
        return Err("version rolling bits must be 4-byte hex".into());
    }

    let base = u32::from_str_radix(&base_hex, 16).map_err(|_| "Invalid job version".to_string())?;
    let mask = u32::from_str_radix(&mask_hex, 16)
        .map_err(|_| "Invalid version rolling mask".to_string())?;
    let bits = u32::from_str_radix(&bits_hex, 16)
        .map_err(|_| "version rolling bits must be 4-byte hex".to_string())?;

    if bits & !mask != 0 {
        return Err("version rolling bits outside negotiated mask".into());
    }

    let version = (base & !mask) | (bits & mask);
    Ok((fixed_hex_u32(version), Some(bits_hex)))
}

/// Assemble the 80-byte block header: version LE, prevhash (header order),
/// merkle root, time LE, bits reversed, nonce reversed.
pub fn build_header(
    version_hex: &str,
    prevhash_header: &[u8; 32],
    merkle_root: &[u8; 32],
    ntime_hex: &str,
    bits_hex: &str,
    nonce_hex: &str,
) -> Result<[u8; 80], String> {
    let version =
        u32::from_str_radix(version_hex, 16).map_err(|_| "bad version hex".to_string())?;
    let ntime = u32::from_str_radix(ntime_hex, 16).map_err(|_| "bad ntime hex".to_string())?;

    let mut bits = encoding::hex_to_bytes(bits_hex).map_err(|e| e.to_string())?;
    let mut nonce = encoding::hex_to_bytes(nonce_hex).map_err(|e| e.to_string())?;
    if bits.len() != 4 || nonce.len() != 4 {
        return Err("bits and nonce must be 4 bytes".into());
    }
    bits.reverse();
    nonce.reverse();

    let mut header = [0u8; 80];
    header[0..4].copy_from_slice(&version.to_le_bytes());
    header[4..36].copy_from_slice(prevhash_header);
    header[36..68].copy_from_slice(merkle_root);
    header[68..72].copy_from_slice(&ntime.to_le_bytes());
    header[72..76].copy_from_slice(&bits);
    header[76..80].copy_from_slice(&nonce);
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::test_support::{params, template};
    use crate::job::Job;
    use crate::target::DIFF1_TARGET;

    const E1: [u8; 4] = [0, 0, 0, 1];

    fn submission<'a>(e2: &'a str, ntime: &'a str, nonce: &'a str) -> ShareSubmission<'a> {
        ShareSubmission {
            extranonce1: &E1,
            extranonce1_hex: "00000001",
            extranonce2_hex: e2,
            ntime_hex: ntime,
            nonce_hex: nonce,
            version_bits_hex: None,
            version_rolling_enabled: false,
            version_rolling_mask_hex: "00000000",
        }
    }

    #[test]
    fn accepts_and_classifies_against_both_targets() {
        let job = Job::build(&template(100, 1), params()).unwrap();
        let sub = submission("0000000000000000", "6553f100", "00000001");

        // Permissive share target: everything passes the share check.
        let share = validate_share(&job, 1, U256::MAX, 8, &sub).unwrap();
        assert_eq!(share.version_hex, "20000000");
        assert_eq!(share.share_hash_hex.len(), 64);
        // An unground nonce is effectively never a diff-1 block.
        assert!(!share.is_block_candidate);
        assert!(share.header_hash_int > DIFF1_TARGET);
    }

    #[test]
    fn candidate_flag_straddles_network_target() {
        let job = Job::build(&template(100, 1), params()).unwrap();
        let sub = submission("0000000000000001", "6553f100", "00000002");
        let share = validate_share(&job, 1, U256::MAX, 8, &sub).unwrap();

        // Rebuild the same job with a network target just at/above the
        // observed hash: the same bytes become a block candidate.
        let mut tpl = template(100, 1);
        tpl.target = Some(format!("{:064x}", share.header_hash_int));
        let generous = Job::build(&tpl, params()).unwrap();
        let share2 = validate_share(
            &generous,
            1,
            U256::MAX,
            8,
            &submission("0000000000000001", "6553f100", "00000002"),
        )
        .unwrap();
        assert_eq!(share2.header_hash_int, share.header_hash_int);
        assert!(share2.is_block_candidate);
    }

    #[test]
    fn second_identical_submission_is_duplicate() {
        let job = Job::build(&template(100, 0), params()).unwrap();
        let sub = submission("0000000000000000", "6553f100", "deadbeef");
        assert!(validate_share(&job, 1, U256::MAX, 8, &sub).is_ok());
        let err = validate_share(&job, 1, U256::MAX, 8, &sub).unwrap_err();
        assert_eq!(err.code, RejectCode::Duplicate);
    }

    #[test]
    fn old_epoch_is_stale() {
        let job = Job::build(&template(100, 0), params()).unwrap();
        let sub = submission("0000000000000000", "6553f100", "00000000");
        let err = validate_share(&job, 2, U256::MAX, 8, &sub).unwrap_err();
        assert_eq!(err.code, RejectCode::Stale);
    }

    #[test]
    fn wrong_extranonce2_size_is_invalid() {
        let job = Job::build(&template(100, 0), params()).unwrap();
        let sub = submission("0000", "6553f100", "00000000");
        let err = validate_share(&job, 1, U256::MAX, 8, &sub).unwrap_err();
        assert_eq!(err.code, RejectCode::Invalid);
    }

    #[test]
    fn ntime_outside_window_is_stale() {
        let job = Job::build(&template(100, 0), params()).unwrap();
        // Template curtime is 1_700_000_000; below mintime.
        let early = format!("{:08x}", 1_600_000_000u32);
        let err =
            validate_share(&job, 1, U256::MAX, 8, &submission("0000000000000000", &early, "00000000"))
                .unwrap_err();
        assert_eq!(err.code, RejectCode::Stale);

        // Above maxtime + 7200.
        let late = format!("{:08x}", 1_700_000_000u32 + 600 + 7201);
        let err =
            validate_share(&job, 1, U256::MAX, 8, &submission("0000000000000000", &late, "00000001"))
                .unwrap_err();
        assert_eq!(err.code, RejectCode::Stale);

        // Inside the grace window is fine.
        let grace = format!("{:08x}", 1_700_000_000u32 + 600 + 7200);
        assert!(validate_share(
            &job,
            1,
            U256::MAX,
            8,
            &submission("0000000000000000", &grace, "00000002")
        )
        .is_ok());
    }

    #[test]
    fn low_difficulty_share_is_rejected_with_observed_difficulty() {
        let job = Job::build(&template(100, 0), params()).unwrap();
        let sub = submission("0000000000000000", "6553f100", "00000003");
        // Impossible share target: everything is lowdiff.
        let err = validate_share(&job, 1, U256::ZERO, 8, &sub).unwrap_err();
        assert_eq!(err.code, RejectCode::LowDiff);
        assert!(err.share_difficulty.unwrap() > 0.0);
        assert_eq!(err.share_hash_hex.unwrap().len(), 64);
    }

    #[test]
    fn version_rolling_resolution() {
        // Disabled: base version passes through, bits ignored.
        let (v, bits) = resolve_share_version("20000000", Some("1fffe000"), false, "00000000").unwrap();
        assert_eq!(v, "20000000");
        assert!(bits.is_none());

        // Enabled with bits inside the mask.
        let (v, bits) =
            resolve_share_version("20000000", Some("00002000"), true, "1fffe000").unwrap();
        assert_eq!(v, "20002000");
        assert_eq!(bits.as_deref(), Some("00002000"));

        // Bits outside the mask are rejected.
        assert!(resolve_share_version("20000000", Some("20000000"), true, "1fffe000").is_err());

        // Missing bits while rolling is enabled are rejected.
        assert!(resolve_share_version("20000000", None, true, "1fffe000").is_err());
    }

    #[test]
    fn header_layout_is_exact() {
        let prevhash = [0x11u8; 32];
        let root = [0x22u8; 32];
        let header =
            build_header("20000000", &prevhash, &root, "6553f100", "1d00ffff", "000000ff").unwrap();
        assert_eq!(&header[0..4], &0x2000_0000u32.to_le_bytes());
        assert_eq!(&header[4..36], &prevhash);
        assert_eq!(&header[36..68], &root);
        assert_eq!(&header[68..72], &0x6553_f100u32.to_le_bytes());
        assert_eq!(&header[72..76], &[0xff, 0x00, 0x00, 0x1d]);
        assert_eq!(&header[76..80], &[0xff, 0x00, 0x00, 0x00]);
    }
}
