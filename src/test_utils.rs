//! Shared test fixtures: deterministic headers, scripts, and transactions.

use dashcore::hashes::Hash;
use dashcore::{
    block::Version, BlockHash, CompactTarget, Header as BlockHeader, OutPoint, ScriptBuf,
    Transaction, TxIn, TxMerkleNode, TxOut, Witness,
};

use crate::chain::HeaderChain;

/// Near-maximal target: every hash meets it, contributing work 1 per header.
pub const EASY_BITS: u32 = 0x2100ffff;

/// Half the hash space: still trivially mineable, contributing work 2 per
/// header, so tails built with it out-work same-length `EASY_BITS` tails.
pub const HARDER_BITS: u32 = 0x207fffff;

/// Deterministically "mine" a header: scan nonces from `seed * 1000` until
/// the block hash meets the target.
pub fn test_header(prev: BlockHash, seed: u32, bits: u32) -> BlockHeader {
    let mut nonce = seed.wrapping_mul(1000);
    loop {
        let header = BlockHeader {
            version: Version::from_consensus(1),
            prev_blockhash: prev,
            merkle_root: TxMerkleNode::all_zeros(),
            time: 1_700_000_000 + seed,
            bits: CompactTarget::from_consensus(bits),
            nonce,
        };
        if header.target().is_met_by(header.block_hash()) {
            return header;
        }
        nonce = nonce.wrapping_add(1);
    }
}

/// A synthetic genesis header for chain tests.
pub fn test_genesis() -> BlockHeader {
    test_header(BlockHash::all_zeros(), 0, EASY_BITS)
}

/// A chain of `n` easy headers appended on top of the test genesis, returned
/// with the appended headers in height order (heights 1..=n).
pub fn test_chain(n: usize) -> (HeaderChain, Vec<BlockHeader>) {
    let mut chain = HeaderChain::new(test_genesis());
    let mut headers = Vec::with_capacity(n);
    let mut prev = chain.tip().hash;
    for i in 0..n {
        let header = test_header(prev, i as u32 + 1, EASY_BITS);
        prev = header.block_hash();
        chain.try_append(header).expect("test header must append");
        headers.push(header);
    }
    (chain, headers)
}

/// A P2PKH script with a hash derived from `seed`.
pub fn p2pkh_script(seed: u8) -> ScriptBuf {
    let mut bytes = Vec::with_capacity(25);
    bytes.extend_from_slice(&[0x76, 0xa9, 0x14]); // OP_DUP OP_HASH160 push-20
    bytes.extend_from_slice(&[seed; 20]);
    bytes.extend_from_slice(&[0x88, 0xac]); // OP_EQUALVERIFY OP_CHECKSIG
    ScriptBuf::from(bytes)
}

/// A minimal transaction paying the given scripts, spending the given outpoints.
pub fn test_tx(pay_to: &[ScriptBuf], spend: &[OutPoint]) -> Transaction {
    let input = if spend.is_empty() {
        vec![TxIn {
            previous_output: OutPoint::new(dashcore::Txid::all_zeros(), u32::MAX),
            script_sig: ScriptBuf::new(),
            sequence: 0xffffffff,
            witness: Witness::new(),
        }]
    } else {
        spend
            .iter()
            .map(|outpoint| TxIn {
                previous_output: *outpoint,
                script_sig: ScriptBuf::new(),
                sequence: 0xffffffff,
                witness: Witness::new(),
            })
            .collect()
    };

    Transaction {
        version: 1,
        lock_time: 0,
        input,
        output: pay_to
            .iter()
            .map(|script| TxOut {
                value: 50_000,
                script_pubkey: script.clone(),
            })
            .collect(),
        special_transaction_payload: None,
    }
}
