use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::broadcast;

use std::sync::Arc;

use super::block::Block;
use super::crypto::Address;
use super::ledger::Ledger;
use super::pow::CheckPow;
use super::storage::{MemoryStore, StorageError, Store};
use super::transaction::{Transaction, TransactionError, TransactionType, POW_REWARD};

/// Blocks keyed by index
pub type BlockStore = Arc<dyn Store<u64, Block>>;

/// Pending transactions keyed by id
pub type TransactionStore = Arc<dyn Store<String, Transaction>>;

const EVENT_CAPACITY: usize = 64;

/// Reasons a block or candidate chain is rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Invalid index: expected {expected}, got {got}")]
    InvalidIndex { expected: u64, got: u64 },

    #[error("Invalid parent hash: expected {expected}, got {got}")]
    InvalidParent { expected: String, got: String },

    #[error("Invalid hash: expected {expected}, got {got}")]
    InvalidHash { expected: String, got: String },

    #[error("Invalid proof of work for block {0}")]
    InvalidProofOfWork(u64),

    #[error("Block {0} exceeds the transaction count or size limit")]
    OversizedBlock(u64),

    #[error("Invalid transaction {id}: {reason}")]
    InvalidTransaction { id: String, reason: String },

    #[error("Invalid block balance: inputs {inputs} plus reward {reward} below outputs {outputs}")]
    InvalidBalance { inputs: u64, outputs: u64, reward: u64 },

    #[error("Invalid reward count: {rewards} reward and {interests} interest transactions")]
    InvalidRewardCount { rewards: usize, interests: usize },

    #[error("Genesis blocks aren't the same")]
    GenesisMismatch,

    #[error("Transaction {0} is already in the chain")]
    DuplicateTransaction(String),

    #[error("Output {index} of transaction {transaction_id} is already spent")]
    TransactionAlreadySpent { transaction_id: String, index: u32 },
}

/// Errors that can occur during chain operations
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("Rejected: {0}")]
    Invalid(#[from] ValidationError),

    #[error("Transaction error: {0}")]
    TransactionError(#[from] TransactionError),

    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),
}

impl ChainError {
    /// Storage failures are the only errors that say nothing about the data
    pub fn is_fatal(&self) -> bool {
        matches!(self, ChainError::StorageError(_))
    }
}

/// Notifications emitted when the chain grows
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    BlockAdded(Block),
    BlockchainReplaced(Vec<Block>),
}

/// The append-only ledger of blocks plus the pool of pending transactions
///
/// `Chain` does no locking of its own: callers must not run `add_block` or
/// `replace_chain` concurrently on the same chain.
pub struct Chain {
    blocks: BlockStore,
    transactions: TransactionStore,
    events: broadcast::Sender<ChainEvent>,
}

impl Chain {
    /// Opens a chain over the given stores
    ///
    /// Writes the genesis block into an empty block store and drops pending
    /// transactions that are already confirmed.
    ///
    /// # Arguments
    ///
    /// * `blocks` - Store of blocks keyed by index
    /// * `transactions` - Store of pending transactions keyed by id
    pub async fn open(
        blocks: BlockStore,
        transactions: TransactionStore,
    ) -> Result<Self, StorageError> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let chain = Chain {
            blocks,
            transactions,
            events,
        };

        if chain.blocks.size().await? == 0 {
            info!("No existing blocks found, writing genesis block");
            chain.blocks.put(0, Block::genesis()).await?;
        }

        let removed = chain.unqueue_confirmed().await?;
        if removed > 0 {
            info!("Removed {} confirmed transactions from the pending pool", removed);
        }

        Ok(chain)
    }

    /// A chain backed by in-memory stores
    pub async fn in_memory() -> Result<Self, StorageError> {
        Self::open(Arc::new(MemoryStore::new()), Arc::new(MemoryStore::new())).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChainEvent> {
        self.events.subscribe()
    }

    /// Number of blocks, genesis included
    pub async fn size(&self) -> Result<usize, StorageError> {
        self.blocks.size().await
    }

    pub async fn block(&self, index: u64) -> Result<Option<Block>, StorageError> {
        self.blocks.get(&index).await
    }

    pub async fn blocks(&self) -> Result<Vec<Block>, StorageError> {
        self.blocks.list().await
    }

    pub async fn latest_block(&self) -> Result<Block, StorageError> {
        let size = self.size().await?;
        let index = size.saturating_sub(1) as u64;
        self.blocks
            .get(&index)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("Block {} not found", index)))
    }

    pub async fn pending_transactions(&self) -> Result<Vec<Transaction>, StorageError> {
        self.transactions.list().await
    }

    /// Adds a transaction to the pending pool after checking its structure
    /// and signatures
    pub async fn queue_transaction(&self, transaction: Transaction) -> Result<(), ChainError> {
        transaction.validate()?;
        if !transaction.verify() {
            return Err(ValidationError::InvalidTransaction {
                id: transaction.id,
                reason: "signature verification failed".to_string(),
            }
            .into());
        }

        if self.transactions.get(&transaction.id).await?.is_some()
            || self.is_confirmed(&transaction).await?
        {
            return Err(ValidationError::DuplicateTransaction(transaction.id).into());
        }

        debug!("Queued {} transaction {}", transaction.kind, transaction.id);
        self.transactions
            .put(transaction.id.clone(), transaction)
            .await?;
        Ok(())
    }

    /// Replays every stored block into a spend index
    pub async fn ledger(&self) -> Result<Ledger, StorageError> {
        Ok(Ledger::from_blocks(&self.blocks().await?))
    }

    /// Unspent value held by `address`
    pub async fn balance(&self, address: &Address) -> Result<u64, StorageError> {
        Ok(self.ledger().await?.balance(address))
    }

    /// Validates `new_block` as the successor of `previous_block`
    ///
    /// Checks run in order and stop at the first failure: index, parent
    /// link, hash, proof of work, content limits, transactions, reward
    /// count, balance.
    pub fn check_block(new_block: &Block, previous_block: &Block) -> Result<(), ValidationError> {
        let expected_index = previous_block.index + 1;
        if new_block.index != expected_index {
            return Err(ValidationError::InvalidIndex {
                expected: expected_index,
                got: new_block.index,
            });
        }

        if previous_block.hash != new_block.parent_hash {
            return Err(ValidationError::InvalidParent {
                expected: previous_block.hash.clone(),
                got: new_block.parent_hash.clone(),
            });
        }

        let hash = new_block.to_hash();
        if hash != new_block.hash {
            return Err(ValidationError::InvalidHash {
                expected: hash,
                got: new_block.hash.clone(),
            });
        }

        if !Block::validate_proof(
            &CheckPow,
            previous_block.pow,
            new_block.pow,
            &new_block.hash,
            new_block.timestamp,
        ) {
            return Err(ValidationError::InvalidProofOfWork(new_block.index));
        }

        if !new_block.valid_content() {
            return Err(ValidationError::OversizedBlock(new_block.index));
        }

        for transaction in &new_block.transactions {
            if let Err(err) = transaction.validate() {
                return Err(ValidationError::InvalidTransaction {
                    id: transaction.id.clone(),
                    reason: err.to_string(),
                });
            }
            if !transaction.verify() {
                return Err(ValidationError::InvalidTransaction {
                    id: transaction.id.clone(),
                    reason: "signature verification failed".to_string(),
                });
            }
        }

        check_reward_count(new_block)?;
        check_balance(new_block)
    }

    /// Validates a whole candidate chain from genesis, including spends
    /// across its blocks
    pub fn check_chain(candidate: &[Block]) -> Result<(), ValidationError> {
        let genesis = match candidate.first() {
            Some(first) if first.canonical_json() == Block::genesis().canonical_json() => first,
            _ => return Err(ValidationError::GenesisMismatch),
        };

        let mut ledger = Ledger::new();
        ledger.apply_block(genesis);

        for pair in candidate.windows(2) {
            Self::check_block(&pair[1], &pair[0])?;
            ledger.apply_checked(&pair[1])?;
        }

        Ok(())
    }

    /// Validates `block` against the current head and the stored ledger,
    /// then persists it and drops its transactions from the pending pool.
    /// A rejected block leaves the stores untouched.
    ///
    /// # Arguments
    ///
    /// * `block` - The block to append on top of the current head
    /// * `emit` - Whether subscribers get a `BlockAdded` event
    ///
    /// # Returns
    ///
    /// Ok(()) if the block was stored, `ChainError::Invalid` if it was rejected
    pub async fn add_block(&self, block: Block, emit: bool) -> Result<(), ChainError> {
        let head = self.latest_block().await?;

        if let Err(err) = Self::check_block(&block, &head) {
            warn!("Rejected block {}: {}", block.index, err);
            return Err(err.into());
        }

        let mut ledger = self.ledger().await?;
        if let Err(err) = ledger.apply_checked(&block) {
            warn!("Rejected block {}: {}", block.index, err);
            return Err(err.into());
        }

        self.blocks.put(block.index, block.clone()).await?;

        for transaction in &block.transactions {
            self.transactions.remove(&transaction.id).await?;
        }

        info!("Block added: {} ({})", block.index, block.hash);
        debug!("Block added: {}", block.canonical_json());

        if emit {
            let _ = self.events.send(ChainEvent::BlockAdded(block));
        }

        Ok(())
    }

    /// Adopts `candidate` if it is longer than the local chain, valid, and
    /// extends the local tip
    ///
    /// # Arguments
    ///
    /// * `candidate` - A full chain, genesis first
    ///
    /// # Returns
    ///
    /// Whether any block was appended. Only storage failures are errors.
    pub async fn replace_chain(&self, candidate: Vec<Block>) -> Result<bool, StorageError> {
        let current_size = self.size().await?;
        if candidate.len() <= current_size {
            debug!(
                "Ignoring candidate chain of {} blocks, local chain has {}",
                candidate.len(),
                current_size
            );
            return Ok(false);
        }

        if let Err(err) = Self::check_chain(&candidate) {
            warn!("Rejected candidate chain: {}", err);
            return Ok(false);
        }

        let tip = current_size.saturating_sub(1) as u64;
        let shared = self.find_shared_parent(&candidate).await?;
        if shared != Some(tip) {
            warn!(
                "Candidate chain diverges from the local chain (shared parent {:?}, tip {})",
                shared, tip
            );
            return Ok(false);
        }

        let new_blocks = candidate[current_size..].to_vec();
        for block in &new_blocks {
            match self.add_block(block.clone(), false).await {
                Ok(()) => {}
                Err(ChainError::StorageError(err)) => return Err(err),
                Err(err) => {
                    warn!("Stopped replacing chain at block {}: {}", block.index, err);
                    return Ok(false);
                }
            }
        }

        info!("Chain replaced, {} new blocks", new_blocks.len());
        let _ = self
            .events
            .send(ChainEvent::BlockchainReplaced(new_blocks));

        Ok(true)
    }

    /// Index of the last block the candidate shares with the local chain,
    /// scanning from genesis and stopping at the first difference
    pub async fn find_shared_parent(&self, candidate: &[Block]) -> Result<Option<u64>, StorageError> {
        let mut shared = None;

        for index in self.blocks.ids().await? {
            let Some(theirs) = candidate.get(index as usize) else {
                break;
            };
            match self.blocks.get(&index).await? {
                Some(ours) if ours.hash == theirs.hash => shared = Some(index),
                _ => break,
            }
        }

        Ok(shared)
    }

    /// Drops every pending transaction that already sits in a block.
    /// Returns how many were removed.
    pub async fn unqueue_confirmed(&self) -> Result<usize, StorageError> {
        let mut removed = 0;

        for id in self.transactions.ids().await? {
            let Some(transaction) = self.transactions.get(&id).await? else {
                continue;
            };
            if self.is_confirmed(&transaction).await? {
                self.transactions.remove(&id).await?;
                removed += 1;
            }
        }

        Ok(removed)
    }

    /// Whether any stored block contains `transaction`, scanning from genesis
    pub async fn is_confirmed(&self, transaction: &Transaction) -> Result<bool, StorageError> {
        for index in self.blocks.ids().await? {
            if let Some(block) = self.blocks.get(&index).await? {
                if block.has(transaction) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}

/// Exactly one reward or one interest transaction per block
fn check_reward_count(block: &Block) -> Result<(), ValidationError> {
    let rewards = block.count_of(TransactionType::Reward);
    let interests = block.count_of(TransactionType::Interest);

    match (rewards, interests) {
        (1, 0) | (0, 1) => Ok(()),
        _ => Err(ValidationError::InvalidRewardCount { rewards, interests }),
    }
}

/// Outputs may exceed inputs by at most the block reward
fn check_balance(block: &Block) -> Result<(), ValidationError> {
    let inputs = block.in_balance();
    let outputs = block.out_balance();

    if outputs > inputs.saturating_add(POW_REWARD) {
        return Err(ValidationError::InvalidBalance {
            inputs,
            outputs,
            reward: POW_REWARD,
        });
    }
    Ok(())
}
