use chrono::Utc;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::task::JoinError;

use std::sync::Arc;

use super::block::{Block, BLOCK_SIZE_MAX, BLOCK_TRANSACTION_MAX};
use super::chain::{Chain, ChainError};
use super::crypto::Address;
use super::pow::{CancelToken, CheckPow, MiningControl, MiningError, PrefixStats, Recording};
use super::storage::StorageError;
use super::transaction::{Transaction, TransactionType};

/// Bytes kept free for the block fields around the transactions
const BLOCK_OVERHEAD: usize = 1_024;

/// Errors that can occur while mining
#[derive(Debug, Error)]
pub enum MinerError {
    #[error("Chain error: {0}")]
    ChainError(#[from] ChainError),

    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),

    #[error("Mining error: {0}")]
    MiningError(#[from] MiningError),

    #[error("Mining worker failed: {0}")]
    WorkerError(#[from] JoinError),
}

/// Mines blocks on top of a chain, paying rewards to one address
pub struct Miner {
    chain: Arc<Chain>,
    address: Address,
    shutdown: CancelToken,
    stats: Option<Arc<PrefixStats>>,
}

impl Miner {
    pub fn new(chain: Arc<Chain>, address: Address) -> Self {
        Miner {
            chain,
            address,
            shutdown: CancelToken::new(),
            stats: None,
        }
    }

    /// Records the prefix of every digest tried while mining into `stats`
    pub fn with_stats(mut self, stats: Arc<PrefixStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Cancelling this token stops [`Miner::run`] and any block in progress
    pub fn shutdown_token(&self) -> CancelToken {
        self.shutdown.clone()
    }

    /// Picks the pending transactions that are valid on top of the current
    /// chain, in pool order.
    ///
    /// A block carries exactly one minting transaction: the first valid
    /// pending interest transaction if there is one, otherwise this miner's
    /// reward. Pending reward transactions are never included.
    pub async fn assemble(&self) -> Result<Vec<Transaction>, StorageError> {
        let mut ledger = self.chain.ledger().await?;
        let now = Utc::now().timestamp();
        let mut selected = Vec::new();
        let mut size = BLOCK_OVERHEAD;
        let mut has_interest = false;

        for transaction in self.chain.pending_transactions().await? {
            if selected.len() + 1 >= BLOCK_TRANSACTION_MAX {
                break;
            }
            match transaction.kind {
                TransactionType::Reward => continue,
                TransactionType::Interest if has_interest => continue,
                _ => {}
            }

            let encoded = serde_json::to_string(&transaction)
                .map_err(|e| StorageError::SerializationError(e.to_string()))?;
            if size + encoded.len() > BLOCK_SIZE_MAX {
                debug!("Block full, leaving {} for a later block", transaction.id);
                continue;
            }

            match ledger.check_transaction(&transaction, now) {
                Ok(()) => {
                    ledger.apply_transaction(&transaction, now);
                    size += encoded.len();
                    has_interest |= transaction.kind == TransactionType::Interest;
                    selected.push(transaction);
                }
                Err(err) => debug!("Skipping pending transaction {}: {}", transaction.id, err),
            }
        }

        if !has_interest {
            selected.push(Transaction::reward(&self.address, None));
        }
        Ok(selected)
    }

    /// Assembles, mines and appends one block. Mining runs on a blocking
    /// worker and stops when `round` or the shutdown token is cancelled.
    pub async fn mine_next(&self, round: &CancelToken) -> Result<Block, MinerError> {
        let head = self.chain.latest_block().await?;
        let transactions = self.assemble().await?;
        let count = transactions.len();

        let mut block = Block::new(Some(&head), transactions);
        let previous_pow = head.pow;
        let control = MiningControl::unbounded()
            .with_token(self.shutdown.clone())
            .with_token(round.clone());

        let stats = self.stats.clone();

        debug!("Mining block {} with {} transactions", block.index, count);
        let (block, attempts) = tokio::task::spawn_blocking(move || {
            let mined = match &stats {
                Some(stats) => {
                    let predicate = Recording::new(CheckPow, stats);
                    block.mine_with(previous_pow, &predicate, false, &control)
                }
                None => block.mine_with(previous_pow, &CheckPow, false, &control),
            };
            mined.map(|attempts| (block, attempts))
        })
        .await??;

        self.chain.add_block(block.clone(), true).await?;
        info!(
            "Mined block {} ({}) after {} attempts",
            block.index, block.hash, attempts
        );

        Ok(block)
    }

    /// Mines until shutdown, or until `max_blocks` blocks were added.
    /// Any chain event restarts the current round on the new head.
    /// Returns the number of blocks mined.
    pub async fn run(&self, max_blocks: Option<u64>) -> Result<u64, MinerError> {
        let mut mined = 0;
        info!("Miner started, rewards go to {}", self.address);

        while max_blocks.map_or(true, |max| mined < max) {
            if self.shutdown.is_cancelled() {
                break;
            }

            let round = CancelToken::new();
            let mut events = self.chain.subscribe();
            let watcher = {
                let round = round.clone();
                tokio::spawn(async move {
                    let _ = events.recv().await;
                    round.cancel();
                })
            };

            let result = self.mine_next(&round).await;
            watcher.abort();

            match result {
                Ok(_) => mined += 1,
                Err(MinerError::MiningError(MiningError::Cancelled(attempts))) => {
                    if self.shutdown.is_cancelled() {
                        break;
                    }
                    debug!("Chain changed after {} attempts, restarting round", attempts);
                }
                Err(MinerError::ChainError(err)) if !err.is_fatal() => {
                    warn!("Mined block was rejected: {}", err);
                }
                Err(err) => return Err(err),
            }
        }

        info!("Miner stopped after {} blocks", mined);
        Ok(mined)
    }
}
