//! Block store persistence layer
//!
//! Two files live in the data directory:
//! - `blocks.jsonl`: every accepted block as one JSON line, in acceptance
//!   order, so a parent always precedes its children
//! - `utxo_snapshot.json`: the tip ledger, written atomically on shutdown and
//!   only ever used to cross-check a replay

use crate::chain::{ChainError, ChainState};
use crate::core::block::{Block, BlockHash};
use crate::core::transaction::OutPoint;
use crate::crypto::Hash256;
use crate::ledger::{UtxoEntry, UtxoSet};
use chrono::Utc;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const BLOCKS_FILE: &str = "blocks.jsonl";
pub const SNAPSHOT_FILE: &str = "utxo_snapshot.json";

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Ledger state written on shutdown
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UtxoSnapshot {
    pub tip: BlockHash,
    pub height: u64,
    pub digest: Hash256,
    pub utxos: Vec<(OutPoint, UtxoEntry)>,
}

impl UtxoSnapshot {
    pub fn capture(chain: &ChainState) -> Self {
        let tip = chain.tip();
        Self {
            tip: tip.hash,
            height: tip.height,
            digest: chain.ledger_digest(),
            utxos: chain.utxos().snapshot(),
        }
    }

    /// The recorded digest matches the recorded outputs
    pub fn is_self_consistent(&self) -> bool {
        UtxoSet::from_snapshot(self.utxos.clone()).digest() == self.digest
    }
}

/// What a replay found
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayReport {
    pub blocks_read: usize,
    pub blocks_rejected: usize,
    pub height: u64,
    pub digest: Hash256,
    /// `None` when no snapshot was present
    pub snapshot_matches: Option<bool>,
}

/// Make sure the block file ends on a line boundary before appending.
///
/// A complete block missing only its newline gets the newline; a torn
/// fragment is cut off so the next block starts on a fresh line.
fn repair_tail(file: &mut fs::File) -> Result<(), StorageError> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(());
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last)?;
    if last[0] == b'\n' {
        return Ok(());
    }

    let mut contents = Vec::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_end(&mut contents)?;
    let line_start = contents
        .iter()
        .rposition(|&b| b == b'\n')
        .map_or(0, |i| i + 1);
    let tail = &contents[line_start..];

    if serde_json::from_slice::<Block>(tail).is_ok() {
        debug!("Terminating final block line in {}", BLOCKS_FILE);
        file.write_all(b"\n")?;
    } else {
        warn!(
            "Truncating {} torn bytes at the end of {}",
            tail.len(),
            BLOCKS_FILE
        );
        file.set_len(line_start as u64)?;
    }
    file.sync_data()?;
    Ok(())
}

/// Block store in a data directory
#[derive(Debug, Clone)]
pub struct Storage {
    data_dir: PathBuf,
}

impl Storage {
    /// Open (creating if needed) a data directory
    pub fn open(data_dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)?;
        Ok(Self { data_dir })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn blocks_path(&self) -> PathBuf {
        self.data_dir.join(BLOCKS_FILE)
    }

    fn snapshot_path(&self) -> PathBuf {
        self.data_dir.join(SNAPSHOT_FILE)
    }

    /// Append accepted blocks and flush them to disk
    pub fn append_blocks(&self, blocks: &[Block]) -> Result<(), StorageError> {
        if blocks.is_empty() {
            return Ok(());
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(self.blocks_path())?;
        repair_tail(&mut file)?;
        let mut writer = BufWriter::new(file);
        for block in blocks {
            serde_json::to_writer(&mut writer, block)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        writer.get_ref().sync_data()?;
        Ok(())
    }

    /// Read every stored block. A torn final line (crash mid-append) is
    /// ignored; corruption anywhere else is an error.
    pub fn load_blocks(&self) -> Result<Vec<Block>, StorageError> {
        let path = self.blocks_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(fs::File::open(&path)?);
        let lines: Vec<String> = reader.lines().collect::<Result<_, _>>()?;
        let last = lines.len().saturating_sub(1);

        let mut blocks = Vec::with_capacity(lines.len());
        for (number, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Block>(line) {
                Ok(block) => blocks.push(block),
                Err(e) if number == last => {
                    warn!("Ignoring torn final line in {}: {}", BLOCKS_FILE, e);
                }
                Err(e) => {
                    return Err(StorageError::InvalidData(format!(
                        "{} line {}: {}",
                        BLOCKS_FILE,
                        number + 1,
                        e
                    )))
                }
            }
        }
        Ok(blocks)
    }

    /// Write the snapshot atomically (temp file + rename)
    pub fn save_snapshot(&self, snapshot: &UtxoSnapshot) -> Result<(), StorageError> {
        let temp_path = self.data_dir.join(format!("{}.tmp", SNAPSHOT_FILE));
        let file = fs::File::create(&temp_path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, snapshot)?;
        writer.flush()?;
        writer.get_ref().sync_data()?;
        fs::rename(&temp_path, self.snapshot_path())?;
        Ok(())
    }

    pub fn load_snapshot(&self) -> Result<Option<UtxoSnapshot>, StorageError> {
        let path = self.snapshot_path();
        if !path.exists() {
            return Ok(None);
        }
        let reader = BufReader::new(fs::File::open(path)?);
        Ok(Some(serde_json::from_reader(reader)?))
    }

    pub fn remove_snapshot(&self) -> Result<(), StorageError> {
        let path = self.snapshot_path();
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Rebuild `chain` from the block file, then compare the result with the
    /// snapshot. A mismatching snapshot is discarded.
    pub fn replay(&self, chain: &mut ChainState) -> Result<ReplayReport, StorageError> {
        let blocks = self.load_blocks()?;
        let blocks_read = blocks.len();
        let mut blocks_rejected = 0;

        for block in blocks {
            let hash = block.hash();
            match chain.insert(block, Utc::now()) {
                Ok(_) | Err(ChainError::Duplicate(_)) => {}
                Err(e) => {
                    warn!("Stored block {} rejected on replay: {}", hash.short(), e);
                    blocks_rejected += 1;
                }
            }
        }

        let tip = chain.tip();
        let digest = chain.ledger_digest();
        let snapshot_matches = match self.load_snapshot() {
            Ok(Some(snapshot)) => {
                let matches = snapshot.is_self_consistent()
                    && snapshot.digest == digest
                    && snapshot.tip == tip.hash;
                if matches {
                    debug!("Snapshot matches replayed ledger at height {}", tip.height);
                } else {
                    warn!(
                        "Snapshot at height {} does not match replayed ledger at height {}; discarding",
                        snapshot.height, tip.height
                    );
                    self.remove_snapshot()?;
                }
                Some(matches)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Unreadable snapshot discarded: {}", e);
                self.remove_snapshot()?;
                Some(false)
            }
        };

        info!(
            "Replayed {} stored blocks to height {} (ledger {})",
            blocks_read,
            tip.height,
            digest.short()
        );
        Ok(ReplayReport {
            blocks_read,
            blocks_rejected,
            height: tip.height,
            digest,
            snapshot_matches,
        })
    }
}
