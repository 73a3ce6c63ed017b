// This file is part of the FCon finality layer.

use std::{error, fmt};

/// Flat error taxonomy for the extra-data codec, seal hasher, snapshot, and
/// engine. One enum covering every kind named in the voting/verification
/// design, written by hand rather than via a derive macro — the same shape
/// as the teacher's own `engines::EngineError`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The header's `extra` field is shorter than the vanity prefix, or the
    /// bytes after it fail to decode as a structured extra payload.
    InvalidExtra,
    /// `extra` is shorter than the 32-byte vanity prefix.
    MissingVanity,
    /// `mix_digest` is non-zero.
    InvalidMixDigest,
    /// `uncle_hash` does not match the empty-uncles constant.
    InvalidUncleHash,
    /// Block difficulty is not the fixed constant for a non-genesis block.
    InvalidDifficulty,
    /// Reported for completeness with spec's error taxonomy; no check in
    /// this core currently produces it (difficulty is a fixed constant, not
    /// derived from turn-ness), but downstream in-turn-aware verifiers may.
    WrongDifficulty,
    /// Header `nonce` is neither the all-zero nor the all-one vote marker.
    InvalidVote,
    /// A checkpoint header's nonce is not the all-zero marker.
    InvalidCheckpointVote,
    /// A checkpoint header's coinbase is non-zero.
    InvalidCheckpointBeneficiary,
    /// The header run handed to `Snapshot::apply` is empty, non-contiguous,
    /// or does not start at `self.number + 1`.
    InvalidVotingChain,
    /// The checkpoint's embedded signer list has the wrong length.
    SignersNumberWrong,
    /// The checkpoint's embedded signer list doesn't match the snapshot's.
    MismatchingCheckpointSigners,
    /// Recovered signer is not a member of the active signer set.
    UnauthorizedSigner,
    /// Recovered signer is still within the recent-signers window.
    RecentlySigned,
    /// Header number could not be resolved against the chain.
    UnknownBlock,
    /// Parent header could not be resolved.
    UnknownAncestor,
    /// Header timestamp lies in the future relative to local wall-clock.
    FutureBlock,
    /// secp256k1 signature recovery failed.
    InvalidSignature,
    /// Snapshot persistence failed.
    StorageError(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use Error::*;
        let msg = match self {
            InvalidExtra => "header extra data is malformed".to_string(),
            MissingVanity => "header extra data is missing the vanity prefix".to_string(),
            InvalidMixDigest => "header mix digest must be zero".to_string(),
            InvalidUncleHash => "header uncle hash must be the empty-uncles constant".to_string(),
            InvalidDifficulty => "header difficulty must be the fixed constant".to_string(),
            WrongDifficulty => "header difficulty does not match turn-ness".to_string(),
            InvalidVote => "header nonce is not a valid vote marker".to_string(),
            InvalidCheckpointVote => "checkpoint header nonce must be the drop marker".to_string(),
            InvalidCheckpointBeneficiary => "checkpoint header coinbase must be zero".to_string(),
            InvalidVotingChain => "header run is empty, non-contiguous, or misaligned".to_string(),
            SignersNumberWrong => "checkpoint signer list has the wrong length".to_string(),
            MismatchingCheckpointSigners => {
                "checkpoint signer list does not match the snapshot".to_string()
            }
            UnauthorizedSigner => "recovered signer is not an authorized signer".to_string(),
            RecentlySigned => "recovered signer signed too recently".to_string(),
            UnknownBlock => "header number could not be resolved".to_string(),
            UnknownAncestor => "parent header could not be resolved".to_string(),
            FutureBlock => "header timestamp is in the future".to_string(),
            InvalidSignature => "seal signature recovery failed".to_string(),
            StorageError(reason) => format!("snapshot storage failure: {}", reason),
        };
        f.write_fmt(format_args!("fcon error: {}", msg))
    }
}

impl error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;
