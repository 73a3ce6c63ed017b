// This file is part of the FCon finality layer.

//! The durable key-value store is an out-of-scope collaborator (spec §1);
//! this trait is the narrow seam the snapshot persistence layer calls
//! through, mirroring the teacher's own `kvdb::KeyValueDB` trait shape.

/// A durable, blob-atomic-per-key store. Writes must be durable before
/// `put` returns.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, String>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), String>;
}
