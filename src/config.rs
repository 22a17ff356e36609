//! Node and consensus configuration
//!
//! Every tunable of the ledger lives here rather than in constants scattered
//! through the code. Both structs load from JSON; missing fields take their
//! defaults so a config file only needs to name what it changes.

use crate::core::target::CompactTarget;
use crate::crypto::OwnerKey;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// =============================================================================
// Consensus parameters
// =============================================================================

/// Rules every node on the chain must agree on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusParams {
    /// Newly minted value per block, in minor units
    pub block_subsidy: u64,
    /// Desired seconds between blocks
    pub target_spacing_secs: u64,
    /// Blocks per difficulty window
    pub retarget_interval: u64,
    /// Maximum factor the target may move per retarget
    pub max_adjust_factor: u64,
    /// Easiest target allowed
    pub pow_limit: CompactTarget,
    /// Target of the first window after genesis
    pub initial_target: CompactTarget,
    /// Blocks used for the median-time-past rule
    pub median_time_span: usize,
    /// How far ahead of local time a block timestamp may be
    pub max_future_drift_secs: i64,
    pub max_block_txs: usize,
    pub max_block_bytes: usize,
    pub max_tx_bytes: usize,
    pub max_tx_inputs: usize,
    pub max_tx_outputs: usize,
    /// Lifetime of Instruction and Proof rights after issue
    pub rights_window_secs: i64,
}

impl Default for ConsensusParams {
    fn default() -> Self {
        Self {
            block_subsidy: 50,
            target_spacing_secs: 60,
            retarget_interval: 10,
            max_adjust_factor: 4,
            pow_limit: CompactTarget::POW_LIMIT,
            initial_target: CompactTarget(0x1f00_ffff),
            median_time_span: 11,
            max_future_drift_secs: 7200,
            max_block_txs: 2_000,
            max_block_bytes: 1_000_000,
            max_tx_bytes: 100_000,
            max_tx_inputs: 256,
            max_tx_outputs: 256,
            rights_window_secs: 90 * 24 * 3600,
        }
    }
}

impl ConsensusParams {
    /// Trivial difficulty and no retargeting, for tests and local demos
    pub fn for_testing() -> Self {
        Self {
            initial_target: CompactTarget::POW_LIMIT,
            retarget_interval: 1_000_000,
            ..Self::default()
        }
    }

    pub fn rights_window(&self) -> Duration {
        Duration::seconds(self.rights_window_secs)
    }

    pub fn max_future_drift(&self) -> Duration {
        Duration::seconds(self.max_future_drift_secs)
    }

    /// Expected seconds across one retarget window
    pub fn expected_timespan(&self) -> u64 {
        self.retarget_interval
            .saturating_sub(1)
            .saturating_mul(self.target_spacing_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retarget_interval < 2 {
            return invalid("retarget_interval must be at least 2");
        }
        if self.target_spacing_secs == 0 {
            return invalid("target_spacing_secs must be positive");
        }
        if self.max_adjust_factor == 0 {
            return invalid("max_adjust_factor must be at least 1");
        }
        if !self.pow_limit.is_valid() || !self.initial_target.is_valid() {
            return invalid("targets must be positive compact values");
        }
        if self.initial_target.work() < self.pow_limit.work() {
            return invalid("initial_target is easier than pow_limit");
        }
        if self.median_time_span == 0 {
            return invalid("median_time_span must be positive");
        }
        if self.max_block_txs == 0 || self.max_block_bytes == 0 || self.max_tx_bytes == 0 {
            return invalid("size limits must be positive");
        }
        if self.max_tx_inputs == 0 || self.max_tx_outputs == 0 {
            return invalid("transaction input/output limits must be positive");
        }
        if self.rights_window_secs <= 0 {
            return invalid("rights_window_secs must be positive");
        }
        Ok(())
    }
}

// =============================================================================
// Genesis
// =============================================================================

/// Value assigned in the genesis block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisAllocation {
    pub owner: OwnerKey,
    pub value: u64,
}

/// Contents of the genesis block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenesisConfig {
    pub timestamp: DateTime<Utc>,
    pub allocations: Vec<GenesisAllocation>,
}

impl Default for GenesisConfig {
    fn default() -> Self {
        Self {
            timestamp: DateTime::from_timestamp(1_700_000_000, 0).unwrap_or_default(),
            allocations: Vec::new(),
        }
    }
}

impl GenesisConfig {
    pub fn allocations(&self) -> Vec<(OwnerKey, u64)> {
        self.allocations
            .iter()
            .map(|a| (a.owner.clone(), a.value))
            .collect()
    }
}

// =============================================================================
// Node configuration
// =============================================================================

/// Local node settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Data directory for the block store; `None` keeps everything in memory
    pub data_dir: Option<PathBuf>,
    /// Maximum mempool entries
    pub mempool_capacity: usize,
    /// Minimum fee per 1000 encoded bytes accepted into the mempool
    pub min_fee_per_kb: u64,
    /// Maximum orphan blocks held while waiting for their parent
    pub max_orphans: usize,
    /// Seconds an orphan block is retained
    pub orphan_expiry_secs: u64,
    /// Nonce attempts between miner staleness checks
    pub stale_check_interval: u64,
    pub genesis: GenesisConfig,
    pub consensus: ConsensusParams,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: Some(PathBuf::from(".rights_ledger")),
            mempool_capacity: 5_000,
            min_fee_per_kb: 0,
            max_orphans: 100,
            orphan_expiry_secs: 3600,
            stale_check_interval: 10_000,
            genesis: GenesisConfig::default(),
            consensus: ConsensusParams::default(),
        }
    }
}

impl NodeConfig {
    /// In-memory node with test consensus parameters
    pub fn for_testing() -> Self {
        Self {
            data_dir: None,
            stale_check_interval: 64,
            consensus: ConsensusParams::for_testing(),
            ..Self::default()
        }
    }

    /// Load a configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        let config: NodeConfig = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Write this configuration as pretty JSON
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.consensus.validate()?;
        if self.mempool_capacity == 0 {
            return invalid("mempool_capacity must be positive");
        }
        if self.stale_check_interval == 0 {
            return invalid("stale_check_interval must be positive");
        }
        let total = self
            .genesis
            .allocations
            .iter()
            .try_fold(0u64, |acc, a| acc.checked_add(a.value));
        if total.is_none() {
            return invalid("genesis allocations overflow");
        }
        Ok(())
    }
}

fn invalid<T>(msg: &str) -> Result<T, ConfigError> {
    Err(ConfigError::Invalid(msg.to_string()))
}
