//! UTXO ledger
//!
//! - `UtxoSet`: the authoritative unspent output map with undo support
//! - `UtxoView` / `UtxoOverlay`: read-only views used during validation

pub mod utxo_set;
pub mod view;

pub use utxo_set::{BlockUndo, LedgerError, TxUndo, UtxoEntry, UtxoSet};
pub use view::{UtxoOverlay, UtxoView};
