//! CLI subcommands for the soak harness.
//!
//! ## Usage
//!
//! ```bash
//! relay-soak run --config soak.toml   # Run the soak loop (default)
//! relay-soak ports --json             # List adapters and resolved roles
//! relay-soak relay off                # Release the relay
//! relay-soak config show              # Print the effective configuration
//! ```

pub mod config_cmd;
pub mod ports_cmd;
pub mod relay_cmd;

use std::path::PathBuf;

use thiserror::Error;

pub use ports_cmd::{PortsReport, run_list};
pub use relay_cmd::RelayAction;

/// Flags shared by every subcommand, plus the remaining positionals.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CommonArgs {
    pub config: Option<PathBuf>,
    pub json: bool,
    pub positional: Vec<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArgError {
    #[error("missing value for {0}")]
    MissingValue(String),
    #[error("unknown option: {0}")]
    UnknownOption(String),
}

/// Parse everything after the subcommand name.
pub fn parse_args(args: &[String]) -> Result<CommonArgs, ArgError> {
    let mut parsed = CommonArgs::default();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                let value = args.get(i + 1).ok_or_else(|| ArgError::MissingValue(args[i].clone()))?;
                parsed.config = Some(PathBuf::from(value));
                i += 2;
            }
            "--json" => {
                parsed.json = true;
                i += 1;
            }
            flag if flag.starts_with('-') => return Err(ArgError::UnknownOption(flag.to_string())),
            value => {
                parsed.positional.push(value.to_string());
                i += 1;
            }
        }
    }
    Ok(parsed)
}
