use anyhow::Context;
use log::{info, warn};

use std::sync::Arc;

use powledger::blockchain::chain::{BlockStore, TransactionStore};
use powledger::blockchain::pow::PrefixStats;
use powledger::blockchain::storage::open_database;
use powledger::blockchain::{Address, Block, Chain, KeyPair, Miner, SledStore, Transaction};
use powledger::config::MinerConfig;

// Use the configured reward address, or create a key pair for this run
fn reward_address(config: &MinerConfig) -> Address {
    if let Some(address) = &config.miner_address {
        return address.clone();
    }

    let keys = KeyPair::generate();
    info!("Created miner key pair with address: {}", keys.address());

    // Export the private key so the rewards can be spent later
    let private_key_hex = hex::encode(keys.export_secret_key());
    warn!("Miner private key (not stored anywhere): {}", private_key_hex);

    keys.address().clone()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Environment first, then logger, so RUST_LOG can come from .env
    let _ = dotenvy::dotenv();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = MinerConfig::from_env()?;

    std::fs::create_dir_all(&config.data_dir).with_context(|| {
        format!("Failed to create data directory {}", config.data_dir.display())
    })?;

    let db = open_database(&config.data_dir)?;
    let blocks: BlockStore = Arc::new(SledStore::<u64, Block>::new(&db, "blocks")?);
    let transactions: TransactionStore =
        Arc::new(SledStore::<String, Transaction>::new(&db, "transactions")?);

    let chain = Arc::new(Chain::open(blocks, transactions).await?);
    let head = chain.latest_block().await?;
    info!(
        "Loaded chain from {} with head {} ({})",
        config.data_dir.display(),
        head.index,
        head.hash
    );

    let stats = Arc::new(PrefixStats::new());
    let miner = Miner::new(chain.clone(), reward_address(&config)).with_stats(stats.clone());

    let shutdown = miner.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, stopping miner");
            shutdown.cancel();
        }
    });

    let mined = miner.run(config.max_blocks).await?;

    let balance = chain.balance(miner.address()).await?;
    info!("Mined {} blocks, {} holds {}", mined, miner.address(), balance);
    info!("Tried {} nonces this run", stats.total());

    db.flush_async().await?;
    Ok(())
}
