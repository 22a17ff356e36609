//! Mining module for block creation and transaction pooling

pub mod mempool;
pub mod miner;

pub use mempool::{Mempool, MempoolEntry, MempoolStats};
pub use miner::{assemble_candidate, search, Candidate, Miner, MinerState, MiningStats, SearchOutcome};
