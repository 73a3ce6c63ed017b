// This file is part of the FCon finality layer.

//! C3: the immutable signer-set/voting snapshot. Modeled on the teacher's
//! `engines::validator_set::SimpleList` (a bare `Vec<Address>` wrapper) but
//! generalized with the rolling recent-signer window and vote tallying the
//! snapshot machine needs; persistence follows the JSON-blob-per-key shape
//! spec §4.3/§6 spell out.

use std::collections::{BTreeMap, BTreeSet};

use fcon_types::{Address, Header};
use log::{debug, trace};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::seal::AuthorCache;
use crate::storage::KeyValueStore;

const STORAGE_KEY_PREFIX: &[u8] = b"fconse-";

/// A recorded vote: `signer` proposed adding (`authorize = true`) or
/// dropping (`authorize = false`) `target`, cast at `block_height`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub signer: Address,
    pub target: Address,
    pub authorize: bool,
    pub block_height: u64,
}

/// Running tally for one candidate address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub authorize: bool,
    pub count: u64,
}

/// Immutable voting-state snapshot as of a particular header. `apply`
/// never mutates `self`; it returns a new snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub number: u64,
    pub block_hash: fcon_types::Hash,
    pub signers: BTreeSet<Address>,
    pub recents: BTreeMap<u64, Address>,
    pub votes: Vec<Vote>,
    pub tallies: BTreeMap<Address, Tally>,
}

impl Snapshot {
    /// Bootstrap a snapshot directly from an explicit roster (genesis, or
    /// an epoch checkpoint walked back to).
    pub fn new(number: u64, block_hash: fcon_types::Hash, signers: Vec<Address>) -> Self {
        Snapshot {
            number,
            block_hash,
            signers: signers.into_iter().collect(),
            recents: BTreeMap::new(),
            votes: Vec::new(),
            tallies: BTreeMap::new(),
        }
    }

    pub(crate) fn limit(&self) -> usize {
        self.signers.len() / 2
    }

    /// Byte-lex ascending sort of the signer set.
    pub fn sorted_signers(&self) -> Vec<Address> {
        self.signers.iter().cloned().collect()
    }

    /// `true` iff it is `signer`'s turn at `number`, by index in the sorted
    /// roster. Retained for rule-compatibility; this core's difficulty is a
    /// fixed constant rather than turn-derived.
    pub fn in_turn(&self, number: u64, signer: &Address) -> bool {
        let sorted = self.sorted_signers();
        if sorted.is_empty() {
            return false;
        }
        match sorted.iter().position(|a| a == signer) {
            Some(index) => (number as usize % sorted.len()) == index,
            None => false,
        }
    }

    /// True iff `(addr is a signer) XOR authorize` — i.e. proposing to add a
    /// non-signer, or to drop an existing signer.
    pub fn valid_vote(&self, addr: &Address, authorize: bool) -> bool {
        let is_signer = self.signers.contains(addr);
        is_signer != authorize
    }

    fn cast(&mut self, candidate: Address, authorize: bool) {
        match self.tallies.get_mut(&candidate) {
            Some(tally) if tally.authorize == authorize => tally.count += 1,
            Some(_) => {
                // Mismatched-authorize existing tally: the vote is ignored,
                // per the open question resolved in DESIGN.md.
            }
            None => {
                self.tallies.insert(candidate, Tally { authorize, count: 1 });
            }
        }
    }

    fn uncast(&mut self, candidate: Address, authorize: bool) {
        if let Some(tally) = self.tallies.get_mut(&candidate) {
            if tally.authorize == authorize {
                if tally.count <= 1 {
                    self.tallies.remove(&candidate);
                } else {
                    tally.count -= 1;
                }
            }
        }
    }

    fn discard_votes_by(&mut self, signer: &Address) {
        let stale: Vec<(Address, bool)> = self
            .votes
            .iter()
            .filter(|v| &v.signer == signer)
            .map(|v| (v.target, v.authorize))
            .collect();
        self.votes.retain(|v| &v.signer != signer);
        for (target, authorize) in stale {
            self.uncast(target, authorize);
        }
    }

    fn discard_votes_targeting(&mut self, target: &Address) {
        self.votes.retain(|v| &v.target != target);
        self.tallies.remove(target);
    }

    /// Advance this snapshot by a contiguous run of headers, returning a
    /// new snapshot. `headers` must be non-empty (if empty, `self` is
    /// returned unchanged), strictly contiguous by number, and start at
    /// `self.number + 1`.
    pub fn apply(
        &self,
        headers: &[Header],
        config: &Config,
        authors: &AuthorCache,
    ) -> Result<Snapshot> {
        if headers.is_empty() {
            return Ok(self.clone());
        }
        for pair in headers.windows(2) {
            if pair[1].number != pair[0].number + 1 {
                return Err(Error::InvalidVotingChain);
            }
        }
        if headers[0].number != self.number + 1 {
            return Err(Error::InvalidVotingChain);
        }

        let mut snap = self.clone();

        for header in headers {
            if config.epoch != 0 && header.number % config.epoch == 0 {
                snap.votes.clear();
                snap.tallies.clear();
            }

            let limit = snap.limit() as u64;
            if header.number >= limit + 1 {
                snap.recents.remove(&(header.number - (limit + 1)));
            }

            let signer = authors.recover_author(header, config.extra_vanity)?;
            if !snap.signers.contains(&signer) {
                return Err(Error::UnauthorizedSigner);
            }
            if snap.recents.values().any(|a| a == &signer) {
                return Err(Error::RecentlySigned);
            }
            snap.recents.insert(header.number, signer);

            if let Some(prior) = snap
                .votes
                .iter()
                .find(|v| v.signer == signer && v.target == header.coinbase)
                .cloned()
            {
                snap.uncast(prior.target, prior.authorize);
                snap.votes.retain(|v| !(v.signer == signer && v.target == prior.target));
            }

            if header.coinbase.is_zero() {
                continue;
            }

            let authorize = if header.nonce == [0xffu8; 8] {
                true
            } else if header.nonce == [0u8; 8] {
                false
            } else {
                return Err(Error::InvalidVote);
            };

            if snap.valid_vote(&header.coinbase, authorize) {
                snap.votes.push(Vote {
                    signer,
                    target: header.coinbase,
                    authorize,
                    block_height: header.number,
                });
                snap.cast(header.coinbase, authorize);
            }

            let passed = snap
                .tallies
                .get(&header.coinbase)
                .map(|t| t.count > snap.limit() as u64)
                .unwrap_or(false);
            if passed {
                let authorize = snap.tallies[&header.coinbase].authorize;
                if authorize {
                    snap.signers.insert(header.coinbase);
                } else {
                    snap.signers.remove(&header.coinbase);
                    let new_limit = snap.limit() as u64;
                    if new_limit < limit {
                        if let Some(oldest) = snap
                            .recents
                            .keys()
                            .cloned()
                            .min()
                        {
                            snap.recents.remove(&oldest);
                        }
                    }
                    snap.discard_votes_by(&header.coinbase);
                }
                snap.discard_votes_targeting(&header.coinbase);
                trace!(target: "fcon", "vote passed for {:?} (authorize={})", header.coinbase, authorize);
            }
        }

        snap.number = self.number + headers.len() as u64;
        snap.block_hash = headers.last().expect("non-empty, checked above").hash();
        Ok(snap)
    }

    fn storage_key(hash: &fcon_types::Hash) -> Vec<u8> {
        let mut key = STORAGE_KEY_PREFIX.to_vec();
        key.extend_from_slice(hash.as_bytes());
        key
    }

    /// Persist this snapshot under `"fconse-" || block_hash`.
    pub fn store(&self, kv: &dyn KeyValueStore) -> Result<()> {
        let encoded = serde_json::to_vec(self).expect("Snapshot serialization is infallible");
        kv.put(&Self::storage_key(&self.block_hash), &encoded)
            .map_err(Error::StorageError)?;
        debug!(target: "fcon", "persisted snapshot at #{} ({:?})", self.number, self.block_hash);
        Ok(())
    }

    /// Load a previously persisted snapshot by block hash.
    pub fn load(kv: &dyn KeyValueStore, hash: &fcon_types::Hash) -> Result<Option<Snapshot>> {
        match kv.get(&Self::storage_key(hash)).map_err(Error::StorageError)? {
            Some(bytes) => {
                let snap = serde_json::from_slice(&bytes).map_err(|_| Error::InvalidExtra)?;
                Ok(Some(snap))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fcon_types::{empty_uncle_hash, Hash};
    use kvdb::KeyValueDB;
    use parity_crypto::publickey::{sign, KeyPair, Secret};

    struct Signer {
        keypair: KeyPair,
    }

    impl Signer {
        fn new(seed: u8) -> Self {
            let secret = Secret::from_slice(&[seed; 32]).unwrap();
            Signer {
                keypair: KeyPair::from_secret(secret).unwrap(),
            }
        }

        fn address(&self) -> Address {
            self.keypair.address()
        }

        fn seal(&self, mut header: Header, config: &Config) -> Header {
            let payload = crate::extra::ExtraPayload {
                seal: Vec::new(),
                current_block: Hash::zero(),
                current_height: 0,
                evil_header: None,
                signers: Vec::new(),
            };
            header.extra = crate::extra::encode(&[0u8; 32], config.extra_vanity, &payload);
            let digest = crate::seal::seal_hash(&header, config.extra_vanity).unwrap();
            let signature = sign(self.keypair.secret(), &digest).unwrap();
            let mut signed_payload = payload;
            signed_payload.seal = signature.to_vec();
            header.extra = crate::extra::encode(&[0u8; 32], config.extra_vanity, &signed_payload);
            header
        }
    }

    fn header(number: u64, coinbase: Address, nonce: [u8; 8]) -> Header {
        Header {
            number,
            coinbase,
            nonce,
            uncle_hash: empty_uncle_hash(),
            difficulty: 2.into(),
            ..Default::default()
        }
    }

    const AUTH: [u8; 8] = [0xff; 8];
    const DROP: [u8; 8] = [0x00; 8];

    #[test]
    fn apply_advances_number_and_hash() {
        let config = Config::default();
        let authors = AuthorCache::new(16);
        let a = Signer::new(1);
        let b = Signer::new(2);
        let snap = Snapshot::new(0, Hash::zero(), vec![a.address(), b.address()]);

        let h1 = a.seal(header(1, Address::zero(), DROP), &config);
        let next = snap.apply(&[h1.clone()], &config, &authors).unwrap();
        assert_eq!(next.number, 1);
        assert_eq!(next.block_hash, h1.hash());
        assert!(next.recents.values().any(|s| s == &a.address()));
    }

    #[test]
    fn recently_signed_is_rejected() {
        let config = Config::default();
        let authors = AuthorCache::new(16);
        let a = Signer::new(1);
        let b = Signer::new(2);
        let c = Signer::new(3);
        let snap = Snapshot::new(0, Hash::zero(), vec![a.address(), b.address(), c.address()]);

        let h1 = a.seal(header(1, Address::zero(), DROP), &config);
        let snap = snap.apply(&[h1], &config, &authors).unwrap();

        let h2 = a.seal(header(2, Address::zero(), DROP), &config);
        let err = snap.apply(&[h2], &config, &authors).unwrap_err();
        assert_eq!(err, Error::RecentlySigned);
    }

    #[test]
    fn add_signer_vote_passes_after_majority() {
        let config = Config::default();
        let authors = AuthorCache::new(16);
        let a = Signer::new(1);
        let b = Signer::new(2);
        let c = Signer::new(3);
        let d = Signer::new(4);
        let mut snap = Snapshot::new(0, Hash::zero(), vec![a.address(), b.address(), c.address()]);

        let h1 = a.seal(header(1, d.address(), AUTH), &config);
        snap = snap.apply(&[h1], &config, &authors).unwrap();
        assert!(!snap.signers.contains(&d.address()));

        let h2 = b.seal(header(2, d.address(), AUTH), &config);
        snap = snap.apply(&[h2], &config, &authors).unwrap();

        assert!(snap.signers.contains(&d.address()));
        assert!(!snap.tallies.contains_key(&d.address()));
    }

    #[test]
    fn drop_signer_vote_shrinks_recent_window_and_uncasts() {
        let _ = env_logger::try_init();
        let config = Config::default();
        let authors = AuthorCache::new(16);
        let a = Signer::new(1);
        let b = Signer::new(2);
        let c = Signer::new(3);
        let d = Signer::new(4);
        let mut snap = Snapshot::new(
            0,
            Hash::zero(),
            vec![a.address(), b.address(), c.address(), d.address()],
        );

        let h1 = a.seal(header(1, d.address(), DROP), &config);
        snap = snap.apply(&[h1], &config, &authors).unwrap();
        let before_limit = snap.limit();

        let h2 = b.seal(header(2, d.address(), DROP), &config);
        snap = snap.apply(&[h2], &config, &authors).unwrap();

        assert!(!snap.signers.contains(&d.address()));
        assert!(snap.limit() < before_limit);
        assert!(snap.votes.iter().all(|v| v.signer != d.address()));
    }

    #[test]
    fn tally_count_matches_recorded_votes_before_majority() {
        let config = Config::default();
        let authors = AuthorCache::new(16);
        let a = Signer::new(1);
        let b = Signer::new(2);
        let c = Signer::new(3);
        let target = Address::from_low_u64_be(0xdead);
        let snap = Snapshot::new(0, Hash::zero(), vec![a.address(), b.address(), c.address()]);

        let h1 = a.seal(header(1, target, AUTH), &config);
        let snap = snap.apply(&[h1], &config, &authors).unwrap();

        let tally = snap.tallies[&target];
        let matching = snap
            .votes
            .iter()
            .filter(|v| v.target == target && v.authorize == tally.authorize)
            .count() as u64;
        assert_eq!(tally.count, matching);
        assert_eq!(tally.count, 1);
    }

    #[test]
    fn valid_vote_is_xor_of_membership_and_authorize() {
        let a = Address::from_low_u64_be(1);
        let b = Address::from_low_u64_be(2);
        let snap = Snapshot::new(0, Hash::zero(), vec![a]);
        assert!(!snap.valid_vote(&a, true)); // already a signer, proposing add
        assert!(snap.valid_vote(&a, false)); // already a signer, proposing drop
        assert!(snap.valid_vote(&b, true)); // not a signer, proposing add
        assert!(!snap.valid_vote(&b, false)); // not a signer, proposing drop
    }

    #[test]
    fn store_and_load_round_trip() {
        let snap = Snapshot::new(3, Hash::from_low_u64_be(99), vec![Address::from_low_u64_be(1)]);
        let kv = kvdb_memorydb::create(1);
        struct Adapter(kvdb_memorydb::InMemory);
        impl KeyValueStore for Adapter {
            fn get(&self, key: &[u8]) -> std::result::Result<Option<Vec<u8>>, String> {
                self.0.get(0, key).map_err(|e| e.to_string())
            }
            fn put(&self, key: &[u8], value: &[u8]) -> std::result::Result<(), String> {
                let mut tx = self.0.transaction();
                tx.put(0, key, value);
                self.0.write(tx).map_err(|e| e.to_string())
            }
        }
        let adapter = Adapter(kv);
        snap.store(&adapter).unwrap();
        let loaded = Snapshot::load(&adapter, &snap.block_hash).unwrap().unwrap();
        assert_eq!(loaded, snap);
    }
}
