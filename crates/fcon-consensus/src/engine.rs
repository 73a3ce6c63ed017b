// This file is part of the FCon finality layer.

//! C4: the FCon engine. The verification/preparation/sealing contract is
//! modeled directly on the teacher's `engines::Engine<M>` trait and its
//! `Clique`/`AuthorityRound` implementors — one struct owning a signer
//! identity behind a `parking_lot::RwLock`, a snapshot LRU, and a
//! seal-publication task that races a stop channel, the same shape as the
//! teacher's `IoService`/`StepService` background-thread pattern.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use fcon_types::{Address, Block, Hash, Header};
use log::{debug, trace, warn};
use lru_cache::LruCache;
use parking_lot::{Mutex, RwLock};
use rand::seq::IteratorRandom;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::extra::{self, ExtraPayload};
use crate::seal::{self, AuthorCache};
use crate::snapshot::Snapshot;
use crate::storage::KeyValueStore;

/// The per-header context the engine resolves a parent/snapshot through,
/// without owning the chain itself. Mirrors the teacher's `EngineClient`
/// seam.
pub trait ChainReader: Send + Sync {
    fn header_by_hash(&self, hash: &Hash) -> Option<Header>;
}

/// A signing callback: `sign(signer, mimetype, digest) -> signature`. The
/// secp256k1 device itself is an out-of-scope collaborator; this is the
/// narrow closure the engine calls through.
pub type SignFn = Arc<dyn Fn(Address, &str, &[u8]) -> std::result::Result<[u8; 65], String> + Send + Sync>;

/// The FCon engine: owns one signer identity, one local vote-proposal map,
/// and the snapshot/signature caches.
pub struct FCon {
    config: Config,
    kv: Arc<dyn KeyValueStore>,
    authors: AuthorCache,
    snapshot_cache: Mutex<LruCache<Hash, Arc<Snapshot>>>,
    identity: RwLock<Option<(Address, SignFn)>>,
    proposals: RwLock<BTreeMap<Address, bool>>,
}

fn find_header(chain: &dyn ChainReader, parents: &[Header], hash: &Hash) -> Result<Header> {
    if let Some(header) = parents.iter().rev().find(|h| &h.hash() == hash) {
        return Ok(header.clone());
    }
    chain.header_by_hash(hash).ok_or(Error::UnknownAncestor)
}

impl FCon {
    pub fn new(config: Config, kv: Arc<dyn KeyValueStore>) -> Self {
        let signature_cache_capacity = config.signature_cache_capacity;
        let snapshot_cache_capacity = config.snapshot_cache_capacity;
        FCon {
            config,
            kv,
            authors: AuthorCache::new(signature_cache_capacity),
            snapshot_cache: Mutex::new(LruCache::new(snapshot_cache_capacity)),
            identity: RwLock::new(None),
            proposals: RwLock::new(BTreeMap::new()),
        }
    }

    /// Set the local signing identity. A later call fully replaces the
    /// prior one; there is exactly one identity at a time.
    pub fn authorize(&self, signer: Address, sign_fn: SignFn) {
        *self.identity.write() = Some((signer, sign_fn));
    }

    /// Record or clear an administrative proposal; consumed by `prepare`.
    pub fn propose(&self, candidate: Address, authorize: bool) {
        self.proposals.write().insert(candidate, authorize);
    }

    pub fn drop_proposal(&self, candidate: &Address) {
        self.proposals.write().remove(candidate);
    }

    /// Delegates to C2.
    pub fn author(&self, header: &Header) -> Result<Address> {
        self.authors.recover_author(header, self.config.extra_vanity)
    }

    /// Resolve (memoized, checkpoint-loaded, or reconstructed) the snapshot
    /// valid for the header at `(number, hash)`.
    pub fn snapshot(
        &self,
        chain: &dyn ChainReader,
        number: u64,
        hash: Hash,
        parents: &[Header],
    ) -> Result<Arc<Snapshot>> {
        if let Some(cached) = self.snapshot_cache.lock().get_mut(&hash) {
            return Ok(cached.clone());
        }

        let mut walked: Vec<Header> = Vec::new();
        let mut cur_number = number;
        let mut cur_hash = hash;
        let base: Snapshot;

        loop {
            if let Some(cached) = self.snapshot_cache.lock().get_mut(&cur_hash) {
                base = (**cached).clone();
                break;
            }
            if cur_number % self.config.checkpoint_interval == 0 {
                if let Some(stored) = Snapshot::load(&*self.kv, &cur_hash)? {
                    base = stored;
                    break;
                }
            }
            if cur_number == 0 {
                let header = find_header(chain, parents, &cur_hash)?;
                let signer = extra::genesis_signer(&header.extra, self.config.extra_vanity)?;
                base = Snapshot::new(0, cur_hash, vec![signer]);
                break;
            }
            if cur_number % self.config.epoch == 0 {
                let header = find_header(chain, parents, &cur_hash)?;
                let payload = extra::extract(&header, self.config.extra_vanity)?;
                base = Snapshot::new(cur_number, cur_hash, payload.signers);
                base.store(&*self.kv)?;
                break;
            }
            let header = find_header(chain, parents, &cur_hash)?;
            let parent_hash = header.parent_hash;
            walked.push(header);
            cur_hash = parent_hash;
            cur_number -= 1;
        }

        walked.reverse();
        // Apply one header at a time rather than the whole walked run at
        // once, so every checkpoint-interval boundary crossed along the way
        // gets persisted, not just the final `(number, hash)` target.
        let mut current = base;
        for header in &walked {
            current = current.apply(std::slice::from_ref(header), &self.config, &self.authors)?;
            if current.number % self.config.checkpoint_interval == 0 {
                current.store(&*self.kv)?;
            }
        }
        let result = Arc::new(current);
        self.snapshot_cache.lock().insert(hash, result.clone());
        Ok(result)
    }

    fn is_checkpoint(&self, number: u64) -> bool {
        self.config.epoch != 0 && number % self.config.epoch == 0
    }

    /// Sequential header-shape and cascading checks; first failure wins.
    pub fn verify_header(
        &self,
        chain: &dyn ChainReader,
        header: &Header,
        parents: &[Header],
    ) -> Result<()> {
        // `header.number` is always populated on this concrete type; kept
        // as an explicit no-op step to preserve spec's check ordering.

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        if header.timestamp > now {
            return Err(Error::FutureBlock);
        }

        let checkpoint = self.is_checkpoint(header.number);
        if checkpoint && !header.coinbase.is_zero() {
            return Err(Error::InvalidCheckpointBeneficiary);
        }

        if header.nonce != [0xffu8; 8] && header.nonce != [0u8; 8] {
            return Err(Error::InvalidVote);
        }
        if checkpoint && header.nonce != [0u8; 8] {
            return Err(Error::InvalidCheckpointVote);
        }

        if header.extra.len() < self.config.extra_vanity {
            return Err(Error::MissingVanity);
        }
        if !header.mix_digest.is_zero() {
            return Err(Error::InvalidMixDigest);
        }
        if header.uncle_hash != fcon_types::empty_uncle_hash() {
            return Err(Error::InvalidUncleHash);
        }
        if header.number > 0 && header.difficulty != self.config.block_difficulty.into() {
            return Err(Error::InvalidDifficulty);
        }

        // Cascading checks: resolve the parent, rebuild the snapshot valid
        // at the parent, and verify epoch roster / seal against it.
        let parent = find_header(chain, parents, &header.parent_hash)
            .map_err(|_| Error::UnknownAncestor)?;
        if parent.number + 1 != header.number {
            return Err(Error::UnknownAncestor);
        }

        let snapshot = self.snapshot(chain, parent.number, header.parent_hash, parents)?;

        if checkpoint {
            let payload = extra::extract(header, self.config.extra_vanity)?;
            let expected = snapshot.sorted_signers();
            if payload.signers.len() != expected.len() {
                return Err(Error::SignersNumberWrong);
            }
            if payload.signers != expected {
                return Err(Error::MismatchingCheckpointSigners);
            }
        }

        let signer = self.authors.recover_author(header, self.config.extra_vanity)?;
        if !snapshot.signers.contains(&signer) {
            return Err(Error::UnauthorizedSigner);
        }
        let limit = snapshot.limit() as u64;
        if snapshot
            .recents
            .iter()
            .any(|(height, addr)| addr == &signer && header.number < height + limit + 1)
        {
            return Err(Error::RecentlySigned);
        }

        Ok(())
    }

    /// Verify a run of headers in order, short-circuiting on abort.
    /// Returns the abort `Sender` and the per-header results `Receiver`.
    pub fn verify_headers(
        self: &Arc<Self>,
        chain: Arc<dyn ChainReader>,
        headers: Vec<Header>,
    ) -> (Sender<()>, Receiver<Result<()>>) {
        let (abort_tx, abort_rx) = crossbeam_channel::bounded(1);
        let (result_tx, result_rx) = crossbeam_channel::unbounded();
        let engine = self.clone();
        std::thread::spawn(move || {
            for header in headers {
                if abort_rx.try_recv() != Err(TryRecvError::Empty) {
                    break;
                }
                let outcome = engine.verify_header(&*chain, &header, &[]);
                if result_tx.send(outcome).is_err() {
                    break;
                }
            }
        });
        (abort_tx, result_rx)
    }

    /// Zero the coinbase/nonce, resolve the parent snapshot, optionally
    /// select one proposal to vote on, and stamp the extra payload.
    pub fn prepare(&self, chain: &dyn ChainReader, header: &mut Header, parents: &[Header]) -> Result<()> {
        header.coinbase = Address::zero();
        header.nonce = [0u8; 8];

        let parent_number = header.number.checked_sub(1).ok_or(Error::UnknownBlock)?;
        let snapshot = self.snapshot(chain, parent_number, header.parent_hash, parents)?;
        let checkpoint = self.is_checkpoint(header.number);

        if !checkpoint {
            let proposals = self.proposals.read();
            let mut rng = rand::thread_rng();
            let choice = proposals
                .iter()
                .filter(|(candidate, authorize)| snapshot.valid_vote(candidate, **authorize))
                .choose(&mut rng);
            if let Some((candidate, authorize)) = choice {
                header.coinbase = *candidate;
                header.nonce = if *authorize { [0xffu8; 8] } else { [0u8; 8] };
            }
        }

        header.difficulty = self.config.block_difficulty.into();

        if header.extra.len() < self.config.extra_vanity {
            header.extra.resize(self.config.extra_vanity, 0);
        }
        let vanity = header.extra[..self.config.extra_vanity].to_vec();

        let payload = ExtraPayload {
            seal: Vec::new(),
            current_block: Hash::zero(),
            current_height: 0,
            evil_header: None,
            signers: if checkpoint { snapshot.sorted_signers() } else { Vec::new() },
        };
        header.extra = extra::encode(&vanity, self.config.extra_vanity, &payload);
        Ok(())
    }

    /// Set the intermediate state root and the empty-uncles hash.
    pub fn finalize(&self, header: &mut Header, state_root: Hash) {
        header.state_root = state_root;
        header.uncle_hash = fcon_types::empty_uncle_hash();
    }

    /// Fixed-constant difficulty.
    pub fn calc_difficulty(&self) -> u64 {
        self.config.block_difficulty
    }

    /// Attempt to seal `block`. Returns `Err` if the local signer is
    /// unauthorized; `Ok(None)` if the signer must wait out the recent
    /// window (not an error); `Ok(Some(receiver))` with a spawned signing
    /// task racing `stop` otherwise.
    pub fn seal<Tx: Send + 'static>(
        &self,
        chain: &dyn ChainReader,
        block: Block<Tx>,
        parents: &[Header],
        stop: Receiver<()>,
    ) -> Result<Option<Receiver<Block<Tx>>>> {
        let (address, sign_fn) = self
            .identity
            .read()
            .clone()
            .ok_or(Error::UnauthorizedSigner)?;

        let parent_number = block.header.number.checked_sub(1).ok_or(Error::UnknownBlock)?;
        let snapshot = self.snapshot(chain, parent_number, block.header.parent_hash, parents)?;
        if !snapshot.signers.contains(&address) {
            return Err(Error::UnauthorizedSigner);
        }

        let limit = snapshot.limit() as u64;
        let must_wait = snapshot
            .recents
            .iter()
            .any(|(height, addr)| addr == &address && block.header.number < height + limit + 1);
        if must_wait {
            debug!(target: "fcon", "signer {:?} must wait out the recent window", address);
            return Ok(None);
        }

        let vanity_len = self.config.extra_vanity;
        let digest = seal::seal_hash(&block.header, vanity_len)?;
        let mimetype = self.config.signing_mimetype.clone();
        let (result_tx, result_rx) = crossbeam_channel::bounded(1);
        let mut block = block;

        std::thread::spawn(move || {
            match stop.try_recv() {
                Ok(()) => return,
                Err(TryRecvError::Disconnected) => return,
                Err(TryRecvError::Empty) => {}
            }
            let signature = match sign_fn(address, &mimetype, digest.as_bytes()) {
                Ok(sig) => sig,
                Err(err) => {
                    warn!(target: "fcon", "seal signing failed: {}", err);
                    return;
                }
            };
            let payload = match extra::extract(&block.header, vanity_len) {
                Ok(mut payload) => {
                    payload.seal = signature.to_vec();
                    payload
                }
                Err(err) => {
                    warn!(target: "fcon", "seal extraction failed: {}", err);
                    return;
                }
            };
            let vanity = block.header.extra[..vanity_len].to_vec();
            block.header.extra = extra::encode(&vanity, vanity_len, &payload);

            match stop.try_recv() {
                Ok(()) => return,
                Err(TryRecvError::Disconnected) => return,
                Err(TryRecvError::Empty) => {}
            }
            if result_tx.try_send(block).is_err() {
                warn!(target: "fcon", "sealed block dropped: no reader");
            }
        });

        Ok(Some(result_rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fcon_types::empty_uncle_hash;
    use parity_crypto::publickey::{sign, KeyPair, Secret};
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    struct MemoryKv(StdMutex<HashMap<Vec<u8>, Vec<u8>>>);
    impl MemoryKv {
        fn new() -> Self {
            MemoryKv(StdMutex::new(HashMap::new()))
        }
    }
    impl KeyValueStore for MemoryKv {
        fn get(&self, key: &[u8]) -> std::result::Result<Option<Vec<u8>>, String> {
            Ok(self.0.lock().unwrap().get(key).cloned())
        }
        fn put(&self, key: &[u8], value: &[u8]) -> std::result::Result<(), String> {
            self.0.lock().unwrap().insert(key.to_vec(), value.to_vec());
            Ok(())
        }
    }

    struct MapChain(HashMap<Hash, Header>);
    impl ChainReader for MapChain {
        fn header_by_hash(&self, hash: &Hash) -> Option<Header> {
            self.0.get(hash).cloned()
        }
    }

    fn signer(seed: u8) -> KeyPair {
        KeyPair::from_secret(Secret::from_slice(&[seed; 32]).unwrap()).unwrap()
    }

    fn seal_with(keypair: &KeyPair, mut header: Header, config: &Config, signers: Vec<Address>) -> Header {
        let checkpoint = config.epoch != 0 && header.number % config.epoch == 0;
        let payload = ExtraPayload {
            seal: Vec::new(),
            current_block: Hash::zero(),
            current_height: 0,
            evil_header: None,
            signers: if checkpoint { signers } else { Vec::new() },
        };
        header.extra = extra::encode(&[0u8; 32], config.extra_vanity, &payload);
        let digest = seal::seal_hash(&header, config.extra_vanity).unwrap();
        let signature = sign(keypair.secret(), &digest).unwrap();
        let mut signed = extra::extract(&header, config.extra_vanity).unwrap();
        signed.seal = signature.to_vec();
        header.extra = extra::encode(&[0u8; 32], config.extra_vanity, &signed);
        header
    }

    fn base_header(number: u64, parent_hash: Hash) -> Header {
        Header {
            number,
            parent_hash,
            uncle_hash: empty_uncle_hash(),
            difficulty: 2.into(),
            ..Default::default()
        }
    }

    #[test]
    fn genesis_bootstrap_then_verify_next_header() {
        let _ = env_logger::try_init();
        let config = Config::default();
        let a = signer(1);
        let genesis_payload_extra = {
            let mut extra = vec![0u8; 32];
            extra.extend_from_slice(a.address().as_bytes());
            extra.extend_from_slice(&[0u8; 65]);
            extra
        };
        let genesis = Header {
            number: 0,
            uncle_hash: empty_uncle_hash(),
            extra: genesis_payload_extra,
            ..Default::default()
        };
        let genesis_hash = genesis.hash();

        let h1 = seal_with(&a, base_header(1, genesis_hash), &config, vec![]);

        let mut chain_map = HashMap::new();
        chain_map.insert(genesis_hash, genesis.clone());
        let chain = MapChain(chain_map);

        let engine = FCon::new(config, Arc::new(MemoryKv::new()));
        engine.verify_header(&chain, &h1, &[]).unwrap();
    }

    #[test]
    fn seal_declines_when_not_authorized() {
        let config = Config::default();
        let a = signer(1);
        let genesis_extra = {
            let mut extra = vec![0u8; 32];
            extra.extend_from_slice(a.address().as_bytes());
            extra.extend_from_slice(&[0u8; 65]);
            extra
        };
        let genesis = Header {
            number: 0,
            uncle_hash: empty_uncle_hash(),
            extra: genesis_extra,
            ..Default::default()
        };
        let genesis_hash = genesis.hash();
        let mut chain_map = HashMap::new();
        chain_map.insert(genesis_hash, genesis);
        let chain = MapChain(chain_map);

        let engine = FCon::new(config, Arc::new(MemoryKv::new()));
        let block = Block::new(base_header(1, genesis_hash), Vec::<()>::new(), Vec::new());
        let (_stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let err = engine.seal(&chain, block, &[], stop_rx).unwrap_err();
        assert_eq!(err, Error::UnauthorizedSigner);
    }

    #[test]
    fn seal_honors_stop_signal_sent_before_dispatch() {
        let config = Config::default();
        let a = signer(1);
        let genesis_extra = {
            let mut extra = vec![0u8; 32];
            extra.extend_from_slice(a.address().as_bytes());
            extra.extend_from_slice(&[0u8; 65]);
            extra
        };
        let genesis = Header {
            number: 0,
            uncle_hash: empty_uncle_hash(),
            extra: genesis_extra,
            ..Default::default()
        };
        let genesis_hash = genesis.hash();
        let mut chain_map = HashMap::new();
        chain_map.insert(genesis_hash, genesis);
        let chain = MapChain(chain_map);

        let engine = FCon::new(config, Arc::new(MemoryKv::new()));
        let a_address = a.address();
        engine.authorize(
            a_address,
            Arc::new(move |_addr, _mimetype, digest: &[u8]| {
                let secret = Secret::from_slice(&[1u8; 32]).unwrap();
                let digest = Hash::from_slice(digest);
                let signature = sign(&secret, &digest).map_err(|e| e.to_string())?;
                let mut out = [0u8; 65];
                out.copy_from_slice(&signature.to_vec());
                Ok(out)
            }),
        );
        let block = Block::new(base_header(1, genesis_hash), Vec::<()>::new(), Vec::new());
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        stop_tx.send(()).unwrap();
        let result_rx = engine.seal(&chain, block, &[], stop_rx).unwrap().unwrap();
        assert!(result_rx
            .recv_timeout(std::time::Duration::from_millis(200))
            .is_err());
    }
}
