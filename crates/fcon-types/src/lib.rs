// This file is part of the FCon finality layer.

//! Shared data model: addresses, hashes, headers, and the minimal block
//! container shapes FCon/FBM read and write. Execution, wire encoding of the
//! A-chain's own block/receipt types, and address-format conversions are
//! collaborator responsibilities; this crate only fixes the field layout the
//! core needs to agree on.

use ethereum_types::{H160, H256, U256};
use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};
use rlp_derive::{RlpDecodable, RlpEncodable};

/// 20-byte account identifier.
pub type Address = H160;

/// 32-byte cryptographic digest.
pub type Hash = H256;

/// Uncle list hash of a block with no uncles, the same constant every
/// Ethereum-family client embeds.
pub fn empty_uncle_hash() -> Hash {
    keccak_hash::keccak(rlp::encode_list::<Header, Header>(&[]))
}

/// A header produced by the A-chain or the F-chain. Over-the-wire encoding
/// of the *A-chain's own* container type is out of scope; this struct is
/// what FCon/FBM read and write by field.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Header {
    pub parent_hash: Hash,
    pub uncle_hash: Hash,
    pub coinbase: Address,
    pub state_root: Hash,
    pub transactions_root: Hash,
    pub receipts_root: Hash,
    pub log_bloom: Vec<u8>,
    pub difficulty: U256,
    pub number: u64,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub timestamp: u64,
    pub extra: Vec<u8>,
    pub mix_digest: Hash,
    pub nonce: [u8; 8],
}

impl Header {
    /// Keccak-256 of this header's RLP encoding, i.e. its canonical block
    /// hash. This is distinct from `seal_hash` (fcon-consensus), which
    /// hashes a copy with the seal signature cleared.
    pub fn hash(&self) -> Hash {
        keccak_hash::keccak(rlp::encode(self))
    }
}

impl Encodable for Header {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(15);
        s.append(&self.parent_hash);
        s.append(&self.uncle_hash);
        s.append(&self.coinbase);
        s.append(&self.state_root);
        s.append(&self.transactions_root);
        s.append(&self.receipts_root);
        s.append(&self.log_bloom);
        s.append(&self.difficulty);
        s.append(&self.number);
        s.append(&self.gas_limit);
        s.append(&self.gas_used);
        s.append(&self.timestamp);
        s.append(&self.extra);
        s.append(&self.mix_digest);
        s.append(&&self.nonce[..]);
    }
}

impl Decodable for Header {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        if rlp.item_count()? != 15 {
            return Err(DecoderError::RlpIncorrectListLen);
        }
        let nonce_bytes: Vec<u8> = rlp.val_at(14)?;
        if nonce_bytes.len() != 8 {
            return Err(DecoderError::RlpInvalidLength);
        }
        let mut nonce = [0u8; 8];
        nonce.copy_from_slice(&nonce_bytes);
        Ok(Header {
            parent_hash: rlp.val_at(0)?,
            uncle_hash: rlp.val_at(1)?,
            coinbase: rlp.val_at(2)?,
            state_root: rlp.val_at(3)?,
            transactions_root: rlp.val_at(4)?,
            receipts_root: rlp.val_at(5)?,
            log_bloom: rlp.val_at(6)?,
            difficulty: rlp.val_at(7)?,
            number: rlp.val_at(8)?,
            gas_limit: rlp.val_at(9)?,
            gas_used: rlp.val_at(10)?,
            timestamp: rlp.val_at(11)?,
            extra: rlp.val_at(12)?,
            mix_digest: rlp.val_at(13)?,
            nonce,
        })
    }
}

/// A log entry, rewritten in place by FBM once the F-chain block that packs
/// it has been sealed (spec §4.5 step 7).
#[derive(Debug, Clone, PartialEq, Eq, Default, RlpEncodable, RlpDecodable)]
pub struct Log {
    pub address: Address,
    pub topics: Vec<Hash>,
    pub data: Vec<u8>,
    pub block_hash: Hash,
}

/// Minimal receipt shape: only the fields FBM rewrites once a block seals.
/// The A-chain's own receipt encoding (status, cumulative gas, bloom, ...)
/// is the execution collaborator's concern.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Receipt {
    pub gas_used: u64,
    pub logs: Vec<Log>,
    pub block_hash: Hash,
    pub block_number: u64,
    pub transaction_index: u64,
}

impl Receipt {
    /// Stamp this receipt (and its logs) with the identity of the block
    /// that ended up packing it.
    pub fn rewrite_for_block(&mut self, block_hash: Hash, block_number: u64, transaction_index: u64) {
        self.block_hash = block_hash;
        self.block_number = block_number;
        self.transaction_index = transaction_index;
        for log in &mut self.logs {
            log.block_hash = block_hash;
        }
    }
}

/// A fully assembled block: header plus the transactions/receipts FBM
/// accumulated while replaying the packed A-chain range. `Tx` is left
/// generic because the transaction container is the execution
/// collaborator's type, not ours.
#[derive(Debug, Clone)]
pub struct Block<Tx> {
    pub header: Header,
    pub transactions: Vec<Tx>,
    pub receipts: Vec<Receipt>,
}

impl<Tx> Block<Tx> {
    pub fn new(header: Header, transactions: Vec<Tx>, receipts: Vec<Receipt>) -> Self {
        Block {
            header,
            transactions,
            receipts,
        }
    }
}
