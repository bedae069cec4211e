use chrono::Utc;
use log::debug;
use serde::{Deserialize, Serialize};

use std::time::Instant;

use super::crypto;
use super::pow::{MiningControl, MiningError, ProofPredicate};
use super::transaction::{Transaction, TransactionType};

/// Most transactions a block may carry
pub const BLOCK_TRANSACTION_MAX: usize = 100;

/// Largest serialized block, in bytes
pub const BLOCK_SIZE_MAX: usize = 1_000_000;

// Genesis is matched by value in `Chain::check_chain` and never re-checked
// against the puzzle.
pub const GENESIS_TIMESTAMP: i64 = 1_465_900_260;
pub const GENESIS_POW: u64 = 262_048;
pub const GENESIS_HASH: &str = "blyAmtm8HW9u5eqPKGTZyAeRP6GtBT7d5sBg5i4bpB8=";

/// Represents a block in the chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Position in the chain, genesis is 0
    pub index: u64,

    /// Hash of the previous block
    #[serde(rename = "parent")]
    pub parent_hash: String,

    /// Unix seconds, refreshed on every mining attempt
    pub timestamp: i64,

    /// Proof of work (nonce)
    pub pow: u64,

    pub transactions: Vec<Transaction>,

    pub hash: String,
}

/// Everything the block hash commits to
#[derive(Serialize)]
struct BlockContent<'a> {
    index: u64,
    parent: &'a str,
    timestamp: i64,
    pow: u64,
    transactions: &'a [Transaction],
}

impl Block {
    /// Creates an unmined block on top of `parent`, or a root block when
    /// there is none
    pub fn new(parent: Option<&Block>, transactions: Vec<Transaction>) -> Self {
        let mut block = Block {
            index: parent.map(|p| p.index + 1).unwrap_or(0),
            parent_hash: parent
                .map(|p| p.hash.clone())
                .unwrap_or_else(|| "0".to_string()),
            timestamp: Utc::now().timestamp(),
            pow: 0,
            transactions,
            hash: String::new(),
        };
        block.hash = block.to_hash();
        block
    }

    /// The fixed first block every valid chain starts with
    pub fn genesis() -> Self {
        Block {
            index: 0,
            parent_hash: "0".to_string(),
            timestamp: GENESIS_TIMESTAMP,
            pow: GENESIS_POW,
            transactions: Vec::new(),
            hash: GENESIS_HASH.to_string(),
        }
    }

    /// Reads a block from its JSON form. Transactions are checked as they load.
    pub fn load(json: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(json)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("block serializes to JSON")
    }

    /// Canonical JSON text, including the hash field
    pub fn canonical_json(&self) -> String {
        serde_json::to_string(self).expect("block serializes to JSON")
    }

    /// HMAC-SHA256 over the block content, keyed by the block index. The
    /// `hash` field itself is not part of the input.
    pub fn to_hash(&self) -> String {
        let content = BlockContent {
            index: self.index,
            parent: &self.parent_hash,
            timestamp: self.timestamp,
            pow: self.pow,
            transactions: &self.transactions,
        };
        let content = serde_json::to_string(&content).expect("block content serializes to JSON");
        crypto::keyed_hash(&self.index.to_string(), &content)
    }

    /// Checks a proof without needing a block: the predicate is fed
    /// `SHA3(previous_pow ‖ pow ‖ hash ‖ timestamp)`
    pub fn validate_proof<P: ProofPredicate + ?Sized>(
        predicate: &P,
        previous_pow: u64,
        pow: u64,
        hash: &str,
        timestamp: i64,
    ) -> bool {
        let digest = crypto::puzzle_hash(&format!("{}{}{}{}", previous_pow, pow, hash, timestamp));
        predicate.accepts(&digest, pow, previous_pow)
    }

    pub fn valid_proof<P: ProofPredicate + ?Sized>(&self, previous_pow: u64, predicate: &P) -> bool {
        Self::validate_proof(predicate, previous_pow, self.pow, &self.hash, self.timestamp)
    }

    /// Mines until the predicate accepts. Returns the number of attempts.
    ///
    /// `genesis` keeps the preassigned timestamp instead of refreshing it.
    pub fn mine<P: ProofPredicate + ?Sized>(
        &mut self,
        previous_pow: u64,
        predicate: &P,
        genesis: bool,
    ) -> u64 {
        match self.mine_with(previous_pow, predicate, genesis, &MiningControl::unbounded()) {
            Ok(attempts) => attempts,
            Err(err) => unreachable!("unbounded mining stopped: {}", err),
        }
    }

    /// Mines until the predicate accepts or `control` stops the loop
    pub fn mine_with<P: ProofPredicate + ?Sized>(
        &mut self,
        previous_pow: u64,
        predicate: &P,
        genesis: bool,
        control: &MiningControl,
    ) -> Result<u64, MiningError> {
        let start = Instant::now();
        let mut attempts = 0u64;

        loop {
            control.check(attempts)?;

            if !genesis {
                self.timestamp = Utc::now().timestamp();
            }
            self.pow += 1;
            self.hash = self.to_hash();
            attempts += 1;

            if self.valid_proof(previous_pow, predicate) {
                debug!(
                    "Mined block {} with pow {} after {} attempts in {:?}",
                    self.index,
                    self.pow,
                    attempts,
                    start.elapsed()
                );
                return Ok(attempts);
            }
        }
    }

    /// Membership by id and hash, so a reused id with different content
    /// does not match
    pub fn has(&self, transaction: &Transaction) -> bool {
        let hash = transaction.hash();
        self.transactions
            .iter()
            .any(|t| t.id == transaction.id && t.hash() == hash)
    }

    /// Transaction count and serialized size limits
    pub fn valid_content(&self) -> bool {
        self.transactions.len() <= BLOCK_TRANSACTION_MAX
            && self.canonical_json().len() <= BLOCK_SIZE_MAX
    }

    pub fn in_balance(&self) -> u64 {
        self.transactions
            .iter()
            .fold(0u64, |acc, t| acc.saturating_add(t.in_balance()))
    }

    pub fn out_balance(&self) -> u64 {
        self.transactions
            .iter()
            .fold(0u64, |acc, t| acc.saturating_add(t.out_balance()))
    }

    /// Value minted by reward and interest transactions
    pub fn rewards(&self) -> u64 {
        self.transactions
            .iter()
            .filter(|t| t.kind.mints_value())
            .fold(0u64, |acc, t| acc.saturating_add(t.out_balance()))
    }

    pub fn count_of(&self, kind: TransactionType) -> usize {
        self.transactions.iter().filter(|t| t.kind == kind).count()
    }
}
