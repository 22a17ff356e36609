//! Rights Ledger node
//!
//! A command-line interface for running and inspecting the ledger.

use clap::{Parser, Subcommand};
use rights_ledger::cli::{self, CliResult};
use rights_ledger::crypto::OwnerKey;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rights-node")]
#[command(author = "Darshan")]
#[command(version = "0.1.0")]
#[command(about = "Proof-of-work ledger for copyright ownership tokens", long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Data directory for the block store (overrides the config file)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Where to write the config
        #[arg(default_value = "rights-node.json")]
        output: PathBuf,

        /// Genesis allocation as <owner-key>:<value> (repeatable)
        #[arg(short, long, value_parser = cli::parse_allocation)]
        allocate: Vec<(OwnerKey, u64)>,
    },

    /// Run the node until Ctrl-C
    Run {
        /// Mine blocks paying rewards to this owner key
        #[arg(short, long)]
        mine: Option<String>,
    },

    /// Replay the block store and self-check the ledger
    Verify,

    /// Show the canonical tip
    Tip,

    /// Show a block by hash or height
    Block {
        /// Block hash (hex) or canonical height
        id: String,
    },

    /// Show the balance of an owner key
    Balance {
        /// Owner key
        owner: String,
    },

    /// Generate a new key pair
    Keygen,
}

fn main() -> CliResult<()> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    // Commands that need no node
    match &cli.command {
        Commands::Init { output, allocate } => return cli::cmd_init(output, allocate),
        Commands::Keygen => return cli::cmd_keygen(),
        _ => {}
    }

    let config = cli::load_config(cli.config.as_deref(), cli.data_dir.clone())?;
    let reward = match &cli.command {
        Commands::Run { mine: Some(owner) } => Some(OwnerKey::parse(owner)?),
        _ => None,
    };
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async {
        match cli.command {
            Commands::Init { .. } | Commands::Keygen => Ok(()),
            Commands::Run { .. } => cli::cmd_run(config, reward).await,
            Commands::Verify => cli::cmd_verify(config).await,
            Commands::Tip => cli::cmd_tip(config).await,
            Commands::Block { id } => cli::cmd_block(config, &id).await,
            Commands::Balance { owner } => cli::cmd_balance(config, &owner).await,
        }
    })
}
