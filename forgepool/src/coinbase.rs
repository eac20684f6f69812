//! Coinbase transaction construction.
//!
//! The coinbase is built in two halves so miners can splice their
//! extranonce between them. Two serializations are produced: the legacy
//! (non-witness) form the merkle root is computed over, and the block form
//! that carries the segwit marker/flag and witness stack when the template
//! includes a witness commitment.

use crate::encoding::{bip34_height_push, varint};
use crate::error::{Error, Result};

/// Maximum coinbase scriptSig length, per consensus.
const MAX_SCRIPT_SIG_LEN: usize = 100;

/// Inputs to coinbase construction, extracted from the template and config.
pub struct CoinbaseInputs<'a> {
    pub height: u64,
    pub aux_flags: &'a [u8],
    pub pool_tag: &'a str,
    pub extranonce1_size: usize,
    pub extranonce2_size: usize,
    pub payout_script: &'a [u8],
    pub coinbase_value: u64,
    pub witness_commitment_script: Option<&'a [u8]>,
}

/// The two halves of the coinbase, in both serializations.
///
/// `merkle_*` is the legacy form whose double hash feeds the merkle root;
/// `block_*` is the form embedded in a submitted block. They differ only
/// when a witness commitment is present.
#[derive(Debug)]
pub struct CoinbasePieces {
    pub merkle_coinbase1: Vec<u8>,
    pub merkle_coinbase2: Vec<u8>,
    pub block_coinbase1: Vec<u8>,
    pub block_coinbase2: Vec<u8>,
}

pub fn build_coinbase_pieces(inputs: &CoinbaseInputs<'_>) -> Result<CoinbasePieces> {
    let height_push = bip34_height_push(inputs.height)?;

    let mut script_prefix =
        Vec::with_capacity(height_push.len() + inputs.aux_flags.len() + inputs.pool_tag.len());
    script_prefix.extend_from_slice(&height_push);
    script_prefix.extend_from_slice(inputs.aux_flags);
    script_prefix.extend_from_slice(inputs.pool_tag.as_bytes());

    let total_script_len =
        script_prefix.len() + inputs.extranonce1_size + inputs.extranonce2_size;
    if total_script_len > MAX_SCRIPT_SIG_LEN {
        return Err(Error::Job(format!(
            "coinbase scriptSig too large ({total_script_len} > {MAX_SCRIPT_SIG_LEN})"
        )));
    }

    // version | [marker+flag] | input count | null prevout | scriptLen | prefix
    let mut input_prefix = Vec::new();
    input_prefix.push(0x01); // one input
    input_prefix.extend_from_slice(&[0u8; 32]); // null prevout hash
    input_prefix.extend_from_slice(&[0xff, 0xff, 0xff, 0xff]); // prevout index
    input_prefix.extend_from_slice(&varint(total_script_len as u64));
    input_prefix.extend_from_slice(&script_prefix);

    let mut outputs_blob = Vec::new();
    let output_count = if inputs.witness_commitment_script.is_some() {
        2
    } else {
        1
    };
    outputs_blob.extend_from_slice(&varint(output_count));
    outputs_blob.extend_from_slice(&inputs.coinbase_value.to_le_bytes());
    outputs_blob.extend_from_slice(&varint(inputs.payout_script.len() as u64));
    outputs_blob.extend_from_slice(inputs.payout_script);
    if let Some(commitment) = inputs.witness_commitment_script {
        outputs_blob.extend_from_slice(&0u64.to_le_bytes());
        outputs_blob.extend_from_slice(&varint(commitment.len() as u64));
        outputs_blob.extend_from_slice(commitment);
    }

    let version: [u8; 4] = [0x01, 0x00, 0x00, 0x00];
    let sequence: [u8; 4] = [0xff, 0xff, 0xff, 0xff];
    let locktime: [u8; 4] = [0x00, 0x00, 0x00, 0x00];

    let mut merkle_coinbase1 = Vec::with_capacity(4 + input_prefix.len());
    merkle_coinbase1.extend_from_slice(&version);
    merkle_coinbase1.extend_from_slice(&input_prefix);

    let mut merkle_coinbase2 =
        Vec::with_capacity(sequence.len() + outputs_blob.len() + locktime.len());
    merkle_coinbase2.extend_from_slice(&sequence);
    merkle_coinbase2.extend_from_slice(&outputs_blob);
    merkle_coinbase2.extend_from_slice(&locktime);

    let (block_coinbase1, block_coinbase2) = match inputs.witness_commitment_script {
        None => (merkle_coinbase1.clone(), merkle_coinbase2.clone()),
        Some(_) => {
            let mut cb1 = Vec::with_capacity(6 + input_prefix.len());
            cb1.extend_from_slice(&version);
            cb1.extend_from_slice(&[0x00, 0x01]); // segwit marker + flag
            cb1.extend_from_slice(&input_prefix);

            // One witness item: the 32-byte zero commitment nonce.
            let mut cb2 = Vec::with_capacity(merkle_coinbase2.len() + 34);
            cb2.extend_from_slice(&sequence);
            cb2.extend_from_slice(&outputs_blob);
            cb2.extend_from_slice(&[0x01, 0x20]);
            cb2.extend_from_slice(&[0u8; 32]);
            cb2.extend_from_slice(&locktime);
            (cb1, cb2)
        }
    };

    Ok(CoinbasePieces {
        merkle_coinbase1,
        merkle_coinbase2,
        block_coinbase1,
        block_coinbase2,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs<'a>(witness: Option<&'a [u8]>, payout: &'a [u8]) -> CoinbaseInputs<'a> {
        CoinbaseInputs {
            height: 100,
            aux_flags: &[],
            pool_tag: "/forgepool/",
            extranonce1_size: 4,
            extranonce2_size: 8,
            payout_script: payout,
            coinbase_value: 5_000_000_000,
            witness_commitment_script: witness,
        }
    }

    #[test]
    fn legacy_layout_is_byte_exact() {
        let payout = [0x51u8]; // OP_TRUE
        let pieces = build_coinbase_pieces(&inputs(None, &payout)).unwrap();

        let cb1 = &pieces.merkle_coinbase1;
        assert_eq!(&cb1[..4], &[0x01, 0x00, 0x00, 0x00]); // tx version
        assert_eq!(cb1[4], 0x01); // input count
        assert!(cb1[5..37].iter().all(|&b| b == 0)); // null prevout
        assert_eq!(&cb1[37..41], &[0xff; 4]); // prevout index
        let script_len = cb1[41] as usize;
        // height push (2) + tag (11) + extranonces (12)
        assert_eq!(script_len, 2 + 11 + 4 + 8);
        assert_eq!(&cb1[42..44], &[0x01, 0x64]); // BIP34 push of 100
        assert_eq!(&cb1[44..55], b"/forgepool/");
        assert_eq!(cb1.len(), 55); // halves split right after the prefix

        let cb2 = &pieces.merkle_coinbase2;
        assert_eq!(&cb2[..4], &[0xff; 4]); // sequence
        assert_eq!(cb2[4], 0x01); // output count
        assert_eq!(&cb2[5..13], &5_000_000_000u64.to_le_bytes());
        assert_eq!(cb2[13], 0x01); // payout script length
        assert_eq!(cb2[14], 0x51);
        assert_eq!(&cb2[15..], &[0, 0, 0, 0]); // locktime

        // Without a witness commitment the block form is identical.
        assert_eq!(pieces.block_coinbase1, pieces.merkle_coinbase1);
        assert_eq!(pieces.block_coinbase2, pieces.merkle_coinbase2);
    }

    #[test]
    fn segwit_form_carries_marker_and_witness() {
        let payout = [0x51u8];
        let commitment = [0x6au8, 0x24]; // truncated OP_RETURN script for shape
        let pieces = build_coinbase_pieces(&inputs(Some(&commitment), &payout)).unwrap();

        assert_eq!(&pieces.block_coinbase1[..6], &[0x01, 0, 0, 0, 0x00, 0x01]);
        // Merkle form never sees the marker.
        assert_eq!(&pieces.merkle_coinbase1[..5], &[0x01, 0, 0, 0, 0x01]);

        // Two outputs, the second zero-valued with the commitment script.
        assert_eq!(pieces.merkle_coinbase2[4], 0x02);

        // Witness stack sits between outputs and locktime in the block form.
        let cb2 = &pieces.block_coinbase2;
        let witness_at = cb2.len() - 4 - 34;
        assert_eq!(&cb2[witness_at..witness_at + 2], &[0x01, 0x20]);
        assert!(cb2[witness_at + 2..witness_at + 34].iter().all(|&b| b == 0));
        assert_eq!(
            pieces.block_coinbase2.len(),
            pieces.merkle_coinbase2.len() + 34
        );
    }

    #[test]
    fn oversized_script_sig_is_rejected() {
        let payout = [0x51u8];
        let mut big = inputs(None, &payout);
        big.pool_tag = "this tag is far far far far far far far far far far far \
                        far far far far too long to fit in a coinbase script";
        let err = build_coinbase_pieces(&big).unwrap_err();
        assert!(matches!(err, Error::Job(_)));
    }
}
