//! CLI commands for the ledger node
//!
//! Implements all command handlers for the CLI interface.

use crate::config::NodeConfig;
use crate::core::block::Block;
use crate::crypto::{Hash256, KeyPair, OwnerKey};
use crate::node::Node;
use std::path::{Path, PathBuf};

/// Result type for CLI operations
pub type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Load the config file (or defaults) and apply command-line overrides
pub fn load_config(path: Option<&Path>, data_dir: Option<PathBuf>) -> CliResult<NodeConfig> {
    let mut config = match path {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };
    if let Some(dir) = data_dir {
        config.data_dir = Some(dir);
    }
    config.validate()?;
    Ok(config)
}

/// Write a default configuration file
pub fn cmd_init(path: &Path, allocations: &[(OwnerKey, u64)]) -> CliResult<()> {
    if path.exists() {
        println!("⚠️  Config already exists at {:?}", path);
        return Ok(());
    }
    let mut config = NodeConfig::default();
    config.genesis.allocations = allocations
        .iter()
        .map(|(owner, value)| crate::config::GenesisAllocation {
            owner: owner.clone(),
            value: *value,
        })
        .collect();
    config.validate()?;
    config.save(path)?;

    println!("✅ Config written to {:?}", path);
    println!("   Genesis allocations: {}", config.genesis.allocations.len());
    println!(
        "   Initial target: {}",
        config.consensus.initial_target
    );
    Ok(())
}

/// Run the node until Ctrl-C, optionally mining
pub async fn cmd_run(config: NodeConfig, mine: Option<OwnerKey>) -> CliResult<()> {
    let node = Node::open(config).await?;
    let tip = node.chain_tip().await;
    println!("🚀 Node running at height {} ({})", tip.height, tip.hash);

    if let Some(reward) = mine {
        println!("⛏️  Mining for {}", reward);
        node.start_mining(reward).await?;
    }

    tokio::signal::ctrl_c().await?;
    println!("\n📴 Shutting down node...");
    node.shutdown().await?;

    let tip = node.chain_tip().await;
    println!("   Final height: {}", tip.height);
    Ok(())
}

/// Replay the block store and check the ledger
pub async fn cmd_verify(config: NodeConfig) -> CliResult<()> {
    println!("🔍 Replaying block store...");
    let (node, report) = Node::open_with_report(config).await?;

    if let Some(report) = report {
        println!("   Blocks read: {}", report.blocks_read);
        println!("   Blocks rejected: {}", report.blocks_rejected);
        println!("   Ledger digest: {}", report.digest);
        match report.snapshot_matches {
            Some(true) => println!("   Snapshot: matches"),
            Some(false) => println!("   Snapshot: MISMATCH (discarded)"),
            None => println!("   Snapshot: none"),
        }
    }

    let consistent = node.chain.read().await.verify_ledger()?;
    if consistent {
        println!("✅ Ledger matches a full replay of the canonical chain");
    } else {
        println!("❌ Ledger does NOT match a full replay of the canonical chain");
    }
    Ok(())
}

/// Show the canonical tip
pub async fn cmd_tip(config: NodeConfig) -> CliResult<()> {
    let node = Node::open(config).await?;
    let tip = node.chain_tip().await;
    println!("{}", serde_json::to_string_pretty(&tip)?);
    Ok(())
}

/// Show a block by hash or canonical height
pub async fn cmd_block(config: NodeConfig, id: &str) -> CliResult<()> {
    let node = Node::open(config).await?;
    let block: Option<Block> = match id.parse::<u64>() {
        Ok(height) => node.block_at_height(height).await,
        Err(_) => node.block(&Hash256::from_hex(id)?).await,
    };
    match block {
        Some(block) => println!("{}", serde_json::to_string_pretty(&block)?),
        None => println!("❌ Block {} not found", id),
    }
    Ok(())
}

/// Show the balance and outputs of an owner key
pub async fn cmd_balance(config: NodeConfig, owner: &str) -> CliResult<()> {
    let node = Node::open(config).await?;
    let (owner, balance) = balance_of(&node, owner).await?;
    let outputs = node.outputs_of(&owner).await;

    println!("💰 Balance for {}", owner);
    println!("   Total: {}", balance);
    println!("   Outputs: {}", outputs.len());
    for (outpoint, entry) in outputs.iter().take(10) {
        match &entry.output.rights {
            Some(rights) => println!(
                "   └─ {} : {} ({:?} rights on \"{}\")",
                outpoint, entry.output.value, rights.stage, rights.title
            ),
            None => println!("   └─ {} : {}", outpoint, entry.output.value),
        }
    }
    if outputs.len() > 10 {
        println!("   ... and {} more", outputs.len() - 10);
    }
    Ok(())
}

/// Normalize an owner key argument and look up its balance
async fn balance_of(node: &Node, owner: &str) -> CliResult<(OwnerKey, u64)> {
    let owner = OwnerKey::parse(owner)?;
    let balance = node.balance(&owner).await;
    Ok((owner, balance))
}

/// Print a fresh key pair
pub fn cmd_keygen() -> CliResult<()> {
    let keypair = KeyPair::generate();
    let owner = keypair.owner();
    println!("🔐 New key pair");
    println!("   Owner key:   {}", owner);
    if let Some(address) = owner.address() {
        println!("   Address:     {}", address);
    }
    println!("   Private key: {}", keypair.private_key_hex());
    println!("\n   ⚠️  Store the private key safely; it is not saved anywhere.");
    Ok(())
}

/// Parse an `owner:value` genesis allocation
pub fn parse_allocation(arg: &str) -> Result<(OwnerKey, u64), String> {
    let (owner, value) = arg
        .rsplit_once(':')
        .ok_or_else(|| format!("expected <owner>:<value>, got {}", arg))?;
    let value = value
        .parse::<u64>()
        .map_err(|e| format!("bad value in {}: {}", arg, e))?;
    let owner = OwnerKey::parse(owner).map_err(|e| e.to_string())?;
    Ok((owner, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_allocation() {
        let owner = KeyPair::generate().owner();
        let (parsed, value) = parse_allocation(&format!("{}:1000", owner)).unwrap();
        assert_eq!(parsed, owner);
        assert_eq!(value, 1000);

        assert!(parse_allocation("missing-value").is_err());
        assert!(parse_allocation(&format!("{}:lots", owner)).is_err());
        assert!(parse_allocation("nothex:5").is_err());
    }

    #[test]
    fn test_load_config_override() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("node.json");
        cmd_init(&path, &[]).unwrap();

        let config = load_config(Some(&path), Some(temp_dir.path().join("data"))).unwrap();
        assert_eq!(config.data_dir, Some(temp_dir.path().join("data")));
        assert_eq!(config.mempool_capacity, NodeConfig::default().mempool_capacity);
    }

    #[tokio::test]
    async fn test_balance_accepts_any_hex_case() {
        let owner = KeyPair::generate().owner();
        let mut config = NodeConfig::for_testing();
        config.genesis.allocations = vec![crate::config::GenesisAllocation {
            owner: owner.clone(),
            value: 700,
        }];
        let node = Node::open(config).await.unwrap();

        let upper = owner.as_str().to_uppercase();
        let (parsed, balance) = balance_of(&node, &upper).await.unwrap();
        assert_eq!(parsed, owner);
        assert_eq!(balance, 700);
        assert!(balance_of(&node, "not-a-key").await.is_err());
    }
}
