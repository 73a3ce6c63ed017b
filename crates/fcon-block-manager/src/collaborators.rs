// This file is part of the FCon finality layer.

//! Narrow collaborator seams FBM calls through: the transaction executor,
//! the evolving state it mutates, the A-chain reader, and the F-chain
//! reader/writer. None of these are owned by this crate — the execution
//! engine, state backend, and chain storage are all out-of-scope per the
//! design's §1. Mirrors the teacher's own `Call`/`SystemCall` closure seams
//! and `EngineClient` trait.

use fcon_types::{Block, Hash, Header, Receipt};

/// The evolving state a drafted F-chain header is executed against.
pub trait ChainState: Send {
    fn intermediate_root(&mut self, include_empty: bool) -> Hash;
}

/// Builds a `ChainState` rooted at a given state root.
pub trait StateFactory: Send + Sync {
    fn state_at(&self, state_root: Hash) -> std::result::Result<Box<dyn ChainState>, String>;
}

/// Replays one transaction against the draft header and the evolving
/// state, accumulating `gas_used`.
pub trait Executor<Tx>: Send + Sync {
    fn apply_transaction(
        &self,
        header: &Header,
        state: &mut dyn ChainState,
        tx: &Tx,
        gas_used: &mut u64,
    ) -> std::result::Result<Receipt, String>;
}

/// One A-chain block: its header plus the transactions FBM must replay.
#[derive(Debug, Clone)]
pub struct PackedBlock<Tx> {
    pub header: Header,
    pub transactions: Vec<Tx>,
}

/// Read access to the A-chain, by block height.
pub trait AChainReader<Tx>: Send + Sync {
    fn block(&self, height: u64) -> Option<PackedBlock<Tx>>;
}

/// Read/write access to the F-chain: FBM's own output chain.
pub trait FChain<Tx>: fcon_consensus::ChainReader + Send + Sync {
    /// The current F-chain tip header.
    fn tip_header(&self) -> Header;
    /// Insert a sealed block. Durability/ordering is this collaborator's
    /// concern; FBM treats it as atomic.
    fn insert_block(&self, block: Block<Tx>) -> std::result::Result<(), String>;
    /// Publish a "new mined block" event, flagged as belonging to the
    /// finality chain.
    fn publish_new_block(&self, hash: Hash, is_final_chain: bool);
}
