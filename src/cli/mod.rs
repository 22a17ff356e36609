//! Command-line front end for the `rights-node` binary

pub mod commands;

pub use commands::{
    cmd_balance, cmd_block, cmd_init, cmd_keygen, cmd_run, cmd_tip, cmd_verify, load_config,
    parse_allocation, CliResult,
};
