// Miner configuration
//
// Read from the environment; a `.env` file is loaded first by the binary.
//
// - POWLEDGER_DATA_DIR: sled database directory (default data/powledger)
// - POWLEDGER_MINER_ADDRESS: hex public key receiving block rewards
// - POWLEDGER_MAX_BLOCKS: stop after mining this many blocks

use thiserror::Error;

use std::env;
use std::path::PathBuf;

use crate::blockchain::crypto::Address;

pub const DATA_DIR_VAR: &str = "POWLEDGER_DATA_DIR";
pub const MINER_ADDRESS_VAR: &str = "POWLEDGER_MINER_ADDRESS";
pub const MAX_BLOCKS_VAR: &str = "POWLEDGER_MAX_BLOCKS";

pub const DEFAULT_DATA_DIR: &str = "data/powledger";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {reason}")]
    InvalidValue { name: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinerConfig {
    pub data_dir: PathBuf,

    /// `None` means a fresh key pair is generated at startup
    pub miner_address: Option<Address>,

    /// `None` mines until interrupted
    pub max_blocks: Option<u64>,
}

impl Default for MinerConfig {
    fn default() -> Self {
        MinerConfig {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            miner_address: None,
            max_blocks: None,
        }
    }
}

impl MinerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds the configuration from any variable source. Empty values count
    /// as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let mut config = MinerConfig::default();

        if let Some(dir) = get(DATA_DIR_VAR) {
            config.data_dir = PathBuf::from(dir);
        }

        if let Some(value) = get(MINER_ADDRESS_VAR) {
            let address: Address = value.trim().parse().map_err(|e| ConfigError::InvalidValue {
                name: MINER_ADDRESS_VAR,
                reason: format!("{}", e),
            })?;
            if address.is_stake_sink() {
                return Err(ConfigError::InvalidValue {
                    name: MINER_ADDRESS_VAR,
                    reason: "rewards cannot be paid to a stake sink".to_string(),
                });
            }
            config.miner_address = Some(address);
        }

        if let Some(value) = get(MAX_BLOCKS_VAR) {
            let max = value.trim().parse::<u64>().map_err(|e| ConfigError::InvalidValue {
                name: MAX_BLOCKS_VAR,
                reason: e.to_string(),
            })?;
            config.max_blocks = Some(max);
        }

        Ok(config)
    }
}
