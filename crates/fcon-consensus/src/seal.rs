// This file is part of the FCon finality layer.

//! C2: the seal hasher and author-recovery cache. Hashing mirrors the
//! teacher's real `clique::sig_hash` (keccak over the header with its seal
//! field blanked); recovery mirrors `clique::recover`, using the same
//! `parity-crypto` publickey feature OpenEthereum ships for secp256k1
//! ecrecover.

use fcon_types::{Address, Hash, Header};
use lru_cache::LruCache;
use parity_crypto::publickey::{recover, Signature};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::extra;

/// Computes the canonical seal hash: the header's RLP encoding with the
/// seal signature cleared (but the field still present — an empty byte
/// string, not omitted).
pub fn seal_hash(header: &Header, vanity_len: usize) -> Result<Hash> {
    let mut payload = extra::extract(header, vanity_len)?;
    payload.seal = Vec::new();
    let mut reduced = header.clone();
    reduced.extra = extra::encode(&header.extra[..vanity_len], vanity_len, &payload);
    Ok(keccak_hash::keccak(rlp::encode(&reduced)))
}

fn recover_author_uncached(header: &Header, vanity_len: usize) -> Result<Address> {
    let payload = extra::extract(header, vanity_len)?;
    if payload.seal.len() != 65 {
        return Err(Error::InvalidSignature);
    }
    let mut sig_bytes = [0u8; 65];
    sig_bytes.copy_from_slice(&payload.seal);
    let signature = Signature::from(sig_bytes);
    let digest = seal_hash(header, vanity_len)?;
    let public = recover(&signature, &digest).map_err(|_| Error::InvalidSignature)?;
    let hash = keccak_hash::keccak(public.as_bytes());
    Ok(Address::from_slice(&hash.as_bytes()[12..]))
}

/// LRU-caches recovered authors keyed by the header's own hash. Capacity is
/// fixed at construction time (spec default: 4096).
pub struct AuthorCache {
    cache: Mutex<LruCache<Hash, Address>>,
}

impl AuthorCache {
    pub fn new(capacity: usize) -> Self {
        AuthorCache {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Recover the signer address from `(seal_hash(header), header.seal)`,
    /// consulting (and populating) the cache by `header.hash()`.
    pub fn recover_author(&self, header: &Header, vanity_len: usize) -> Result<Address> {
        let key = header.hash();
        if let Some(address) = self.cache.lock().get_mut(&key) {
            return Ok(*address);
        }
        let address = recover_author_uncached(header, vanity_len)?;
        self.cache.lock().insert(key, address);
        Ok(address)
    }
}
