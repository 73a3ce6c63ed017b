// This file is part of the FCon finality layer.

//! FCon: the signer-set voting/sealing consensus engine for the finality
//! overlay chain. See `config`, `extra`, `seal`, `snapshot`, and `engine`
//! for the individual components (C1-C4, C6 of the design).

pub mod config;
pub mod engine;
pub mod error;
pub mod extra;
pub mod seal;
pub mod snapshot;
pub mod storage;

pub use config::Config;
pub use engine::{ChainReader, FCon, SignFn};
pub use error::{Error, Result};
pub use extra::ExtraPayload;
pub use seal::AuthorCache;
pub use snapshot::{Snapshot, Tally, Vote};
pub use storage::KeyValueStore;
