// Blockchain module
//
// This module contains the core ledger implementation including:
// - Block structure and hashing
// - Transaction types and signing
// - Proof of work puzzle
// - Spend index across blocks
// - Block and transaction stores
// - Chain validation and fork handling
// - Mining loop

pub mod block;
pub mod chain;
pub mod crypto;
pub mod ledger;
pub mod miner;
pub mod pow;
pub mod storage;
pub mod transaction;

// Re-export main components for easier access
pub use block::Block;
pub use chain::{Chain, ChainError, ChainEvent, ValidationError};
pub use crypto::{Address, DigitalSignature, KeyPair};
pub use ledger::Ledger;
pub use miner::{Miner, MinerError};
pub use pow::{CancelToken, CheckPow, MiningControl, MiningError};
pub use storage::{MemoryStore, SledStore, StorageError, Store};
pub use transaction::{Transaction, TransactionError, TransactionType};
