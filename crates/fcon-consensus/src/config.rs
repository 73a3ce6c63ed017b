// This file is part of the FCon finality layer.

//! Epoch length, windowing constants, and cache sizes (C6). Modeled on the
//! teacher's `spec::CommonParams`: a plain, serde-deserializable struct of
//! chain parameters with the production defaults baked in via `Default`.

use serde::{Deserialize, Serialize};

/// Configuration shared by the FCon engine and FBM. All fields are
/// configurable; the values here are spec §6's production defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Number of blocks between signer-roster checkpoints.
    pub epoch: u64,
    /// Snapshots are persisted to the key-value store every this-many blocks.
    pub checkpoint_interval: u64,
    /// Capacity of the in-memory snapshot LRU.
    pub snapshot_cache_capacity: usize,
    /// Capacity of the recovered-author LRU.
    pub signature_cache_capacity: usize,
    /// Length, in bytes, of the vanity prefix of `extra`.
    pub extra_vanity: usize,
    /// Length, in bytes, of the seal signature suffix.
    pub extra_seal: usize,
    /// Fixed block difficulty this core always seals with.
    pub block_difficulty: u64,
    /// Mimetype string passed opaquely to the signer.
    pub signing_mimetype: String,
    /// FBM minimum packing-window size.
    pub m: u64,
    /// FBM required A-chain confirmation depth.
    pub k: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            epoch: 30_000,
            checkpoint_interval: 1_024,
            snapshot_cache_capacity: 128,
            signature_cache_capacity: 4_096,
            extra_vanity: 32,
            extra_seal: 65,
            block_difficulty: 2,
            signing_mimetype: "application/x-clique-header".to_string(),
            m: 2,
            k: 2,
        }
    }
}
