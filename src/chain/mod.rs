//! Block tree storage and best-chain selection

pub mod orphans;
pub mod store;

pub use orphans::{OrphanBlock, OrphanPool};
pub use store::{
    BlockEntry, BlockStatus, ChainError, ChainState, ChainTip, InsertOutcome, TipChange,
};
