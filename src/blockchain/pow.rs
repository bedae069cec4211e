// Proof-of-work puzzle
//
// The puzzle links each block to the nonce of its predecessor: the digest of
// a candidate must start with the first decimal digit of the previous nonce
// repeated four times, and the candidate nonce must be even.

use dashmap::DashMap;
use thiserror::Error;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Number of leading digest characters compared by [`CheckPow`].
pub const PUZZLE_WIDTH: usize = 4;

/// Decides whether a puzzle digest, nonce and previous nonce are hard enough
pub trait ProofPredicate: Sync {
    fn accepts(&self, digest: &str, pow: u64, previous_pow: u64) -> bool;
}

impl<F> ProofPredicate for F
where
    F: Fn(&str, u64, u64) -> bool + Sync,
{
    fn accepts(&self, digest: &str, pow: u64, previous_pow: u64) -> bool {
        self(digest, pow, previous_pow)
    }
}

/// The consensus predicate
#[derive(Debug, Clone, Copy, Default)]
pub struct CheckPow;

impl CheckPow {
    /// Prefix a digest must start with after a block mined with `previous_pow`
    pub fn target(previous_pow: u64) -> String {
        let first = previous_pow
            .to_string()
            .chars()
            .next()
            .unwrap_or('0');
        std::iter::repeat(first).take(PUZZLE_WIDTH).collect()
    }
}

impl ProofPredicate for CheckPow {
    fn accepts(&self, digest: &str, pow: u64, previous_pow: u64) -> bool {
        digest.starts_with(&Self::target(previous_pow)) && pow % 2 == 0
    }
}

/// Caller-owned tally of digest prefixes seen while checking proofs
#[derive(Debug, Default)]
pub struct PrefixStats {
    hits: DashMap<String, u64>,
}

impl PrefixStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, digest: &str) {
        let prefix: String = digest.chars().take(PUZZLE_WIDTH).collect();
        *self.hits.entry(prefix).or_insert(0) += 1;
    }

    pub fn count(&self, prefix: &str) -> u64 {
        self.hits.get(prefix).map(|c| *c).unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.hits.iter().map(|entry| *entry.value()).sum()
    }
}

/// Wraps a predicate and records every digest it is asked about
pub struct Recording<'a, P> {
    inner: P,
    stats: &'a PrefixStats,
}

impl<'a, P: ProofPredicate> Recording<'a, P> {
    pub fn new(inner: P, stats: &'a PrefixStats) -> Self {
        Recording { inner, stats }
    }
}

impl<P: ProofPredicate> ProofPredicate for Recording<'_, P> {
    fn accepts(&self, digest: &str, pow: u64, previous_pow: u64) -> bool {
        self.stats.record(digest);
        self.inner.accepts(digest, pow, previous_pow)
    }
}

/// Shared flag used to stop a running mining loop
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Errors that stop a mining loop before a proof is found
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MiningError {
    #[error("Mining cancelled after {0} attempts")]
    Cancelled(u64),

    #[error("Mining budget of {0} attempts exhausted")]
    BudgetExhausted(u64),
}

/// Limits on a mining run: any number of cancel tokens and an optional
/// attempt budget
#[derive(Debug, Clone, Default)]
pub struct MiningControl {
    tokens: Vec<CancelToken>,
    budget: Option<u64>,
}

impl MiningControl {
    /// No limits; mining runs until a proof is found
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: CancelToken) -> Self {
        self.tokens.push(token);
        self
    }

    pub fn with_budget(mut self, attempts: u64) -> Self {
        self.budget = Some(attempts);
        self
    }

    /// Checked before every attempt
    pub fn check(&self, attempts: u64) -> Result<(), MiningError> {
        if self.tokens.iter().any(CancelToken::is_cancelled) {
            return Err(MiningError::Cancelled(attempts));
        }
        match self.budget {
            Some(budget) if attempts >= budget => Err(MiningError::BudgetExhausted(budget)),
            _ => Ok(()),
        }
    }
}
