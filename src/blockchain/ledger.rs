// Spend index over accepted blocks
//
// Block validation on its own only checks that a block is internally
// consistent. The ledger adds the cross-block rules: transaction ids are
// unique, inputs point at real outputs, nothing is spent twice, and interest
// is only paid on matured stakes, once per stake output.
//
// Stake age counts from the block that confirmed the stake. A transaction's
// own timestamp is not covered by its hash or signatures.

use std::collections::{HashMap, HashSet};

use super::block::Block;
use super::chain::ValidationError;
use super::crypto::Address;
use super::transaction::{Input, Output, Transaction, TransactionType, MIN_POS_AGE};

/// Reference to an output: the transaction holding it and its position
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OutPoint {
    pub transaction_id: String,
    pub index: u32,
}

impl From<&Input> for OutPoint {
    fn from(input: &Input) -> Self {
        OutPoint {
            transaction_id: input.transaction_id.clone(),
            index: input.index,
        }
    }
}

#[derive(Debug, Clone)]
struct LedgerEntry {
    output: Output,
    kind: TransactionType,
    /// Timestamp of the block holding the output
    confirmed_at: i64,
}

#[derive(Debug, Clone, Default)]
pub struct Ledger {
    outputs: HashMap<OutPoint, LedgerEntry>,
    spent: HashSet<OutPoint>,
    /// Stake outputs that already paid interest
    claimed: HashSet<OutPoint>,
    transactions: HashSet<String>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replays already accepted blocks without checking them
    pub fn from_blocks<'a>(blocks: impl IntoIterator<Item = &'a Block>) -> Self {
        let mut ledger = Self::new();
        for block in blocks {
            ledger.apply_block(block);
        }
        ledger
    }

    pub fn contains(&self, transaction_id: &str) -> bool {
        self.transactions.contains(transaction_id)
    }

    pub fn is_spent(&self, outpoint: &OutPoint) -> bool {
        self.spent.contains(outpoint)
    }

    /// Sum of unspent outputs paying `address`
    pub fn balance(&self, address: &Address) -> u64 {
        self.outputs
            .iter()
            .filter(|(outpoint, entry)| {
                &entry.output.address == address && !self.spent.contains(*outpoint)
            })
            .fold(0u64, |acc, (_, entry)| acc.saturating_add(entry.output.amount))
    }

    /// Checks `transaction` against the ledger as if it were included in a
    /// block stamped `at`
    pub fn check_transaction(
        &self,
        transaction: &Transaction,
        at: i64,
    ) -> Result<(), ValidationError> {
        if self.transactions.contains(&transaction.id) {
            return Err(ValidationError::DuplicateTransaction(transaction.id.clone()));
        }

        let mut referenced = HashSet::new();
        for input in &transaction.inputs {
            let outpoint = OutPoint::from(input);
            let entry = self.resolve(transaction, input, &outpoint)?;

            if self.spent.contains(&outpoint) || !referenced.insert(outpoint.clone()) {
                return Err(already_spent(outpoint));
            }

            if transaction.kind == TransactionType::Interest {
                if entry.kind != TransactionType::Stake {
                    return Err(invalid(transaction, "interest must reference stake outputs"));
                }
                if self.claimed.contains(&outpoint) {
                    return Err(already_spent(outpoint));
                }
                if entry.confirmed_at.saturating_add(MIN_POS_AGE) > at {
                    return Err(invalid(
                        transaction,
                        format!(
                            "stake {} has not matured",
                            outpoint.transaction_id
                        ),
                    ));
                }
            }
        }

        Ok(())
    }

    fn resolve(
        &self,
        transaction: &Transaction,
        input: &Input,
        outpoint: &OutPoint,
    ) -> Result<&LedgerEntry, ValidationError> {
        let Some(entry) = self.outputs.get(outpoint) else {
            return Err(invalid(
                transaction,
                format!(
                    "unknown output {}:{}",
                    outpoint.transaction_id, outpoint.index
                ),
            ));
        };
        if entry.output != input.output {
            return Err(invalid(
                transaction,
                format!(
                    "input does not match output {}:{}",
                    outpoint.transaction_id, outpoint.index
                ),
            ));
        }
        Ok(entry)
    }

    /// Records the effects of `transaction`
    ///
    /// # Arguments
    ///
    /// * `transaction` - The transaction to record, already checked
    /// * `confirmed_at` - Timestamp of the block that includes it
    pub fn apply_transaction(&mut self, transaction: &Transaction, confirmed_at: i64) {
        self.transactions.insert(transaction.id.clone());

        for input in &transaction.inputs {
            let outpoint = OutPoint::from(input);
            match transaction.kind {
                // interest leaves the stake locked in the sink
                TransactionType::Interest => self.claimed.insert(outpoint),
                _ => self.spent.insert(outpoint),
            };
        }

        for (index, output) in transaction.outputs.iter().enumerate() {
            self.outputs.insert(
                OutPoint {
                    transaction_id: transaction.id.clone(),
                    index: index as u32,
                },
                LedgerEntry {
                    output: output.clone(),
                    kind: transaction.kind,
                    confirmed_at,
                },
            );
        }
    }

    pub fn apply_block(&mut self, block: &Block) {
        for transaction in &block.transactions {
            self.apply_transaction(transaction, block.timestamp);
        }
    }

    /// Checks and applies every transaction of `block` in order, so later
    /// transactions may spend outputs created earlier in the same block.
    ///
    /// On error the ledger is left partially updated and should be dropped.
    pub fn apply_checked(&mut self, block: &Block) -> Result<(), ValidationError> {
        for transaction in &block.transactions {
            self.check_transaction(transaction, block.timestamp)?;
            self.apply_transaction(transaction, block.timestamp);
        }
        Ok(())
    }
}

fn invalid(transaction: &Transaction, reason: impl Into<String>) -> ValidationError {
    ValidationError::InvalidTransaction {
        id: transaction.id.clone(),
        reason: reason.into(),
    }
}

fn already_spent(outpoint: OutPoint) -> ValidationError {
    ValidationError::TransactionAlreadySpent {
        transaction_id: outpoint.transaction_id,
        index: outpoint.index,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::crypto::KeyPair;

    fn block_with(transactions: Vec<Transaction>, timestamp: i64) -> Block {
        let mut block = Block::new(Some(&Block::genesis()), transactions);
        block.timestamp = timestamp;
        block
    }

    #[test]
    fn test_balance_follows_spends() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let reward = Transaction::reward(a.address(), None);

        let mut ledger = Ledger::new();
        ledger.apply_checked(&block_with(vec![reward.clone()], 10)).unwrap();
        assert_eq!(ledger.balance(a.address()), 100);
        assert!(ledger.contains(&reward.id));

        let transfer =
            Transaction::transfer(30, a.address(), b.address(), Some(&a), &[reward.clone()]).unwrap();
        ledger.apply_checked(&block_with(vec![transfer], 20)).unwrap();

        assert_eq!(ledger.balance(a.address()), 70);
        assert_eq!(ledger.balance(b.address()), 30);
        assert!(ledger.is_spent(&OutPoint {
            transaction_id: reward.id,
            index: 0
        }));
    }

    #[test]
    fn test_double_spend_is_rejected() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let reward = Transaction::reward(a.address(), None);
        let mut ledger = Ledger::from_blocks(&[block_with(vec![reward.clone()], 10)]);

        let first =
            Transaction::transfer(30, a.address(), b.address(), Some(&a), &[reward.clone()]).unwrap();
        let second =
            Transaction::transfer(40, a.address(), b.address(), Some(&a), &[reward.clone()]).unwrap();

        let err = ledger
            .apply_checked(&block_with(vec![first, second], 20))
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::TransactionAlreadySpent {
                transaction_id: reward.id,
                index: 0
            }
        );
    }

    #[test]
    fn test_duplicate_transaction_is_rejected() {
        let a = KeyPair::generate();
        let reward = Transaction::reward(a.address(), None);
        let ledger = Ledger::from_blocks(&[block_with(vec![reward.clone()], 10)]);

        assert_eq!(
            ledger.check_transaction(&reward, 20),
            Err(ValidationError::DuplicateTransaction(reward.id.clone()))
        );
    }

    #[test]
    fn test_inputs_must_match_known_outputs() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let reward = Transaction::reward(a.address(), None);
        let ledger = Ledger::from_blocks(&[block_with(vec![reward.clone()], 10)]);

        let unknown = Transaction::reward(a.address(), None);
        let orphan =
            Transaction::transfer(10, a.address(), b.address(), Some(&a), &[unknown]).unwrap();
        assert!(matches!(
            ledger.check_transaction(&orphan, 20),
            Err(ValidationError::InvalidTransaction { .. })
        ));

        let mut inflated_source = reward.clone();
        inflated_source.outputs[0].amount = 1_000;
        let inflated =
            Transaction::transfer(900, a.address(), b.address(), Some(&a), &[inflated_source])
                .unwrap();
        assert!(matches!(
            ledger.check_transaction(&inflated, 20),
            Err(ValidationError::InvalidTransaction { .. })
        ));
    }

    #[test]
    fn test_outputs_created_earlier_in_a_block_can_be_spent() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let reward = Transaction::reward(a.address(), None);
        let transfer =
            Transaction::transfer(100, a.address(), b.address(), Some(&a), &[reward.clone()]).unwrap();

        let mut ledger = Ledger::new();
        ledger
            .apply_checked(&block_with(vec![reward, transfer], 10))
            .unwrap();
        assert_eq!(ledger.balance(b.address()), 100);
        assert_eq!(ledger.balance(a.address()), 0);
    }

    #[test]
    fn test_interest_needs_matured_unclaimed_stake() {
        let a = KeyPair::generate();
        let reward = Transaction::reward(a.address(), None);
        let mut stake = Transaction::stake(100, a.address(), Some(&a), &[reward.clone()]).unwrap();
        stake.timestamp = 1_000;

        let mut ledger = Ledger::new();
        ledger.apply_checked(&block_with(vec![reward], 500)).unwrap();
        ledger.apply_checked(&block_with(vec![stake.clone()], 1_000)).unwrap();
        assert_eq!(ledger.balance(&a.address().stake_sink()), 100);

        let matured_at = 1_000 + MIN_POS_AGE;
        let early = Transaction::interest_at(a.address(), &[stake.clone()], &a, matured_at);
        assert!(matches!(
            ledger.check_transaction(&early, matured_at - 1),
            Err(ValidationError::InvalidTransaction { .. })
        ));

        let interest = Transaction::interest_at(a.address(), &[stake.clone()], &a, matured_at);
        ledger
            .apply_checked(&block_with(vec![interest], matured_at))
            .unwrap();
        assert_eq!(ledger.balance(a.address()), 10);
        assert_eq!(ledger.balance(&a.address().stake_sink()), 100);

        let again = Transaction::interest_at(a.address(), &[stake.clone()], &a, matured_at + 1);
        assert!(matches!(
            ledger.check_transaction(&again, matured_at + 1),
            Err(ValidationError::TransactionAlreadySpent { .. })
        ));

        let withdrawal = Transaction::withdrawal(a.address(), &[stake], &a).unwrap();
        ledger
            .apply_checked(&block_with(vec![withdrawal], matured_at + 2))
            .unwrap();
        assert_eq!(ledger.balance(a.address()), 110);
        assert_eq!(ledger.balance(&a.address().stake_sink()), 0);
    }

    #[test]
    fn test_stake_age_counts_from_confirming_block() {
        let a = KeyPair::generate();
        let reward = Transaction::reward(a.address(), None);
        let mut backdated = Transaction::stake(100, a.address(), Some(&a), &[reward.clone()]).unwrap();
        backdated.timestamp = 0;

        let confirmed = 5 * MIN_POS_AGE;
        let mut ledger = Ledger::new();
        ledger.apply_checked(&block_with(vec![reward], confirmed - 1)).unwrap();
        ledger
            .apply_checked(&block_with(vec![backdated.clone()], confirmed))
            .unwrap();

        // the constructor trusts the stake's own timestamp
        let interest = Transaction::interest_at(a.address(), &[backdated], &a, confirmed + 2);
        assert_eq!(interest.inputs.len(), 1);

        assert!(matches!(
            ledger.apply_checked(&block_with(vec![interest.clone()], confirmed + 2)),
            Err(ValidationError::InvalidTransaction { .. })
        ));
        assert_eq!(
            ledger.check_transaction(&interest, confirmed + MIN_POS_AGE),
            Ok(())
        );
    }

    #[test]
    fn test_interest_cannot_reference_plain_outputs() {
        let a = KeyPair::generate();
        let reward = Transaction::reward(a.address(), None);
        let to_sink = Transaction::transfer(
            100,
            a.address(),
            &a.address().stake_sink(),
            Some(&a),
            &[reward.clone()],
        )
        .unwrap();
        let ledger = Ledger::from_blocks(&[block_with(vec![reward, to_sink.clone()], 10)]);

        let mut disguised = to_sink;
        disguised.kind = TransactionType::Stake;
        disguised.timestamp = 0;
        let interest = Transaction::interest_at(a.address(), &[disguised], &a, MIN_POS_AGE);
        assert_eq!(interest.inputs.len(), 1);

        assert!(matches!(
            ledger.check_transaction(&interest, MIN_POS_AGE),
            Err(ValidationError::InvalidTransaction { .. })
        ));
    }
}
