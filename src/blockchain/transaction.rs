use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::fmt;

use super::crypto::{self, Address, CryptoError, DigitalSignature, KeyPair};

/// Fixed amount paid by a proof-of-work reward transaction.
pub const POW_REWARD: u64 = 100;

/// Interest rate on matured stakes, expressed as a divisor (0.1 == 1/10).
pub const POS_REWARD_DIVISOR: u64 = 10;

/// Largest amount a single stake transaction may lock.
pub const MAX_POS: u64 = 1_000_000;

/// Minimum age, in seconds, before a stake earns interest (seven days).
pub const MIN_POS_AGE: i64 = 7 * 24 * 60 * 60;

/// Errors that can occur while building or loading transactions
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: u64, available: u64 },

    #[error("Stake of {amount} exceeds the limit of {limit}")]
    StakeLimitExceeded { amount: u64, limit: u64 },

    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),
}

fn invalid<T>(reason: impl Into<String>) -> Result<T, TransactionError> {
    Err(TransactionError::InvalidTransaction(reason.into()))
}

/// Interest paid on a matured stake balance: `ceil(balance * POS_REWARD)`.
pub fn interest_on(stake_balance: u64) -> u64 {
    stake_balance.div_ceil(POS_REWARD_DIVISOR)
}

fn total<'a>(amounts: impl Iterator<Item = &'a u64>) -> u64 {
    amounts.fold(0u64, |acc, amount| acc.saturating_add(*amount))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Reward,
    Interest,
    Transfer,
    Stake,
    #[serde(alias = "withdrawl")]
    Withdrawal,
    #[serde(alias = "penality")]
    Penalty,
}

impl TransactionType {
    /// Reward and interest transactions mint value and count towards the
    /// one-per-block limit.
    pub fn mints_value(&self) -> bool {
        matches!(self, TransactionType::Reward | TransactionType::Interest)
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionType::Reward => "reward",
            TransactionType::Interest => "interest",
            TransactionType::Transfer => "transfer",
            TransactionType::Stake => "stake",
            TransactionType::Withdrawal => "withdrawal",
            TransactionType::Penalty => "penalty",
        };
        f.write_str(name)
    }
}

/// A claim of value payable to an address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    pub address: Address,
    pub amount: u64,
}

impl Output {
    pub fn new(address: Address, amount: u64) -> Self {
        Output { address, amount }
    }
}

/// Spending of a specific prior output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "InputJson", into = "InputJson")]
pub struct Input {
    /// The output being spent, as it appeared in its transaction
    pub output: Output,

    /// Id of the transaction holding the output
    pub transaction_id: String,

    /// Position of the output inside that transaction
    pub index: u32,

    pub signature: Option<DigitalSignature>,
}

#[derive(Serialize, Deserialize)]
struct InputJson {
    index: u32,
    transaction: String,
    address: Address,
    amount: u64,
    signature: Option<DigitalSignature>,
}

impl From<InputJson> for Input {
    fn from(json: InputJson) -> Self {
        Input {
            output: Output::new(json.address, json.amount),
            transaction_id: json.transaction,
            index: json.index,
            signature: json.signature,
        }
    }
}

impl From<Input> for InputJson {
    fn from(input: Input) -> Self {
        InputJson {
            index: input.index,
            transaction: input.transaction_id,
            address: input.output.address,
            amount: input.output.amount,
            signature: input.signature,
        }
    }
}

impl Input {
    /// Builds an input spending `output`, signed with `key` when one is given
    pub fn generate(
        output: Output,
        transaction_id: &str,
        index: u32,
        key: Option<&KeyPair>,
    ) -> Self {
        let mut input = Input {
            output,
            transaction_id: transaction_id.to_string(),
            index,
            signature: None,
        };
        if let Some(key) = key {
            input.signature = Some(key.sign(input.message().as_bytes()));
        }
        input
    }

    pub fn address(&self) -> &Address {
        &self.output.address
    }

    pub fn amount(&self) -> u64 {
        self.output.amount
    }

    /// Canonical signed message: `transaction ‖ address ‖ index ‖ amount`
    pub fn message(&self) -> String {
        format!(
            "{}{}{}{}",
            self.transaction_id, self.output.address, self.index, self.output.amount
        )
    }

    /// Checks the signature against the key behind the input's address.
    /// Unsigned inputs never verify.
    pub fn verify(&self) -> bool {
        let Some(signature) = &self.signature else {
            return false;
        };
        let Ok(public_key) = self.output.address.to_public_key() else {
            return false;
        };
        crypto::verify_signature(self.message().as_bytes(), signature, &public_key)
            .unwrap_or(false)
    }
}

/// The `data` member of the transaction JSON form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionData {
    pub inputs: Vec<Input>,
    pub outputs: Vec<Output>,
}

#[derive(Serialize)]
struct TransactionDataRef<'a> {
    inputs: &'a [Input],
    outputs: &'a [Output],
}

/// Wire form of a transaction, carrying its content hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionJson {
    pub id: String,

    #[serde(rename = "type")]
    pub kind: TransactionType,

    pub timestamp: i64,

    pub data: TransactionData,

    pub hash: String,
}

/// A typed, signed transfer of value
///
/// Serializes to [`TransactionJson`]; deserializing always goes through
/// [`Transaction::load`], so hashes and per-type rules are rechecked on
/// every read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "TransactionJson", into = "TransactionJson")]
pub struct Transaction {
    pub id: String,
    pub kind: TransactionType,

    /// Creation time, unix seconds
    pub timestamp: i64,

    pub inputs: Vec<Input>,
    pub outputs: Vec<Output>,
}

impl From<Transaction> for TransactionJson {
    fn from(tx: Transaction) -> Self {
        let hash = tx.hash();
        TransactionJson {
            id: tx.id,
            kind: tx.kind,
            timestamp: tx.timestamp,
            data: TransactionData {
                inputs: tx.inputs,
                outputs: tx.outputs,
            },
            hash,
        }
    }
}

impl TryFrom<TransactionJson> for Transaction {
    type Error = TransactionError;

    fn try_from(json: TransactionJson) -> Result<Self, Self::Error> {
        Transaction::load(json)
    }
}

impl Transaction {
    /// Starts an empty transaction with a fresh id and the current time
    pub fn generate(kind: TransactionType) -> Self {
        Transaction {
            id: crypto::random_id(),
            kind,
            timestamp: Utc::now().timestamp(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// Miner reward. `amount` defaults to [`POW_REWARD`]; other amounts only
    /// make sense for building fixtures and will not load.
    pub fn reward(address: &Address, amount: Option<u64>) -> Self {
        let mut tx = Self::generate(TransactionType::Reward);
        tx.outputs
            .push(Output::new(address.clone(), amount.unwrap_or(POW_REWARD)));
        tx
    }

    /// Builds a transaction spending every output addressed to `sender` in
    /// `unspent`.
    ///
    /// With a `recipient`, pays it `amount` (or the whole balance) and returns
    /// the remainder to `sender` as change. Without one, the whole balance is
    /// consumed and no outputs are created.
    pub fn regular(
        kind: TransactionType,
        amount: Option<u64>,
        sender: &Address,
        recipient: Option<&Address>,
        key: Option<&KeyPair>,
        unspent: &[Transaction],
    ) -> Result<Self, TransactionError> {
        let mut tx = Self::generate(kind);

        let inputs_balance = total(
            unspent
                .iter()
                .flat_map(|t| t.outputs.iter())
                .filter(|o| &o.address == sender)
                .map(|o| &o.amount),
        );

        let amount = match amount {
            Some(required) if required > inputs_balance => {
                return Err(TransactionError::InsufficientFunds {
                    required,
                    available: inputs_balance,
                });
            }
            Some(amount) => amount,
            None => inputs_balance,
        };

        tx.inputs = unspent
            .iter()
            .flat_map(|t| {
                t.outputs
                    .iter()
                    .enumerate()
                    .filter(|(_, o)| &o.address == sender)
                    .map(move |(index, o)| Input::generate(o.clone(), &t.id, index as u32, key))
            })
            .collect();

        if let Some(recipient) = recipient {
            tx.outputs.push(Output::new(recipient.clone(), amount));
            if inputs_balance > amount {
                tx.outputs
                    .push(Output::new(sender.clone(), inputs_balance - amount));
            }
        }

        Ok(tx)
    }

    pub fn transfer(
        amount: u64,
        sender: &Address,
        recipient: &Address,
        key: Option<&KeyPair>,
        unspent: &[Transaction],
    ) -> Result<Self, TransactionError> {
        Self::regular(
            TransactionType::Transfer,
            Some(amount),
            sender,
            Some(recipient),
            key,
            unspent,
        )
    }

    /// Locks `amount` in the sender's stake sink
    pub fn stake(
        amount: u64,
        sender: &Address,
        key: Option<&KeyPair>,
        unspent: &[Transaction],
    ) -> Result<Self, TransactionError> {
        if amount > MAX_POS {
            return Err(TransactionError::StakeLimitExceeded {
                amount,
                limit: MAX_POS,
            });
        }
        Self::regular(
            TransactionType::Stake,
            Some(amount),
            sender,
            Some(&sender.stake_sink()),
            key,
            unspent,
        )
    }

    /// Returns everything held in the recipient's stake sink
    pub fn withdrawal(
        recipient: &Address,
        stakes: &[Transaction],
        key: &KeyPair,
    ) -> Result<Self, TransactionError> {
        Self::regular(
            TransactionType::Withdrawal,
            None,
            &recipient.stake_sink(),
            Some(recipient),
            Some(key),
            stakes,
        )
    }

    /// Burns everything held in the recipient's stake sink
    pub fn penalty(recipient: &Address, stakes: &[Transaction]) -> Result<Self, TransactionError> {
        Self::regular(
            TransactionType::Penalty,
            None,
            &recipient.stake_sink(),
            None,
            None,
            stakes,
        )
    }

    /// Interest on the recipient's stakes that are at least [`MIN_POS_AGE`] old
    pub fn interest(recipient: &Address, staking: &[Transaction], key: &KeyPair) -> Self {
        Self::interest_at(recipient, staking, key, Utc::now().timestamp())
    }

    /// Same as [`Transaction::interest`], aging stakes against `now`
    pub fn interest_at(
        recipient: &Address,
        staking: &[Transaction],
        key: &KeyPair,
        now: i64,
    ) -> Self {
        let mut tx = Self::generate(TransactionType::Interest);
        let sink = recipient.stake_sink();

        let matured: Vec<&Transaction> = staking
            .iter()
            .filter(|t| t.kind == TransactionType::Stake && now - MIN_POS_AGE >= t.timestamp)
            .collect();

        let stake_balance = total(
            matured
                .iter()
                .flat_map(|t| t.outputs.iter())
                .filter(|o| o.address == sink)
                .map(|o| &o.amount),
        );

        tx.inputs = matured
            .iter()
            .flat_map(|t| {
                t.outputs
                    .iter()
                    .enumerate()
                    .filter(|(_, o)| o.address == sink)
                    .map(move |(index, o)| {
                        Input::generate(o.clone(), &t.id, index as u32, Some(key))
                    })
            })
            .collect();

        tx.outputs
            .push(Output::new(recipient.clone(), interest_on(stake_balance)));
        tx
    }

    /// Reconstructs a transaction from its wire form, checking the hash and
    /// every rule for its type
    pub fn load(json: TransactionJson) -> Result<Self, TransactionError> {
        let tx = Transaction {
            id: json.id,
            kind: json.kind,
            timestamp: json.timestamp,
            inputs: json.data.inputs,
            outputs: json.data.outputs,
        };

        if tx.hash() != json.hash {
            return invalid(format!("hash mismatch for transaction {}", tx.id));
        }

        tx.validate()?;
        Ok(tx)
    }

    /// Per-type structural rules
    pub fn validate(&self) -> Result<(), TransactionError> {
        let out_balance = self.out_balance();
        let in_balance = self.in_balance();

        if self.kind != TransactionType::Penalty && out_balance < 1 {
            return invalid("empty transaction");
        }

        match self.kind {
            TransactionType::Reward => {
                if !self.inputs.is_empty() {
                    return invalid("reward transactions take no inputs");
                }
                if self.outputs.len() != 1 {
                    return invalid("reward transactions have exactly one output");
                }
                if out_balance != POW_REWARD {
                    return invalid(format!(
                        "reward must pay {}, got {}",
                        POW_REWARD, out_balance
                    ));
                }
            }
            TransactionType::Transfer => {
                self.require_plain_inputs()?;
                if out_balance > in_balance {
                    return invalid(format!(
                        "outputs {} exceed inputs {}",
                        out_balance, in_balance
                    ));
                }
            }
            TransactionType::Stake => {
                self.require_plain_inputs()?;
                if out_balance > in_balance {
                    return invalid(format!(
                        "outputs {} exceed inputs {}",
                        out_balance, in_balance
                    ));
                }
                let sender = self.inputs[0].address();
                if self.inputs.iter().any(|i| i.address() != sender) {
                    return invalid("stake inputs must come from a single sender");
                }
                let sink = sender.stake_sink();
                if self
                    .outputs
                    .iter()
                    .any(|o| o.address != sink && &o.address != sender)
                {
                    return invalid("stake outputs may only pay the sink or the sender");
                }
                let staked = total(
                    self.outputs
                        .iter()
                        .filter(|o| o.address == sink)
                        .map(|o| &o.amount),
                );
                if staked == 0 {
                    return invalid("stake pays nothing into the sink");
                }
                if staked > MAX_POS {
                    return invalid(format!("stake of {} exceeds {}", staked, MAX_POS));
                }
            }
            TransactionType::Interest => {
                let sink = self.single_sink()?;
                if self.outputs.len() != 1 || self.outputs[0].address != sink.owner() {
                    return invalid("interest pays exactly one output to the stake owner");
                }
                let expected = interest_on(in_balance);
                if out_balance != expected {
                    return invalid(format!(
                        "interest must pay {}, got {}",
                        expected, out_balance
                    ));
                }
            }
            TransactionType::Withdrawal => {
                let sink = self.single_sink()?;
                let owner = sink.owner();
                if self.outputs.iter().any(|o| o.address != owner) {
                    return invalid("withdrawals only pay the stake owner");
                }
                if out_balance > in_balance {
                    return invalid(format!(
                        "outputs {} exceed inputs {}",
                        out_balance, in_balance
                    ));
                }
            }
            TransactionType::Penalty => {
                if !self.outputs.is_empty() {
                    return invalid("penalties burn their inputs and have no outputs");
                }
                if in_balance < 1 {
                    return invalid("penalty burns nothing");
                }
                self.single_sink()?;
            }
        }

        Ok(())
    }

    fn require_plain_inputs(&self) -> Result<(), TransactionError> {
        if self.inputs.iter().any(|i| i.address().is_stake_sink()) {
            return invalid(format!("{} transactions cannot spend staked funds", self.kind));
        }
        Ok(())
    }

    fn single_sink(&self) -> Result<Address, TransactionError> {
        let Some(first) = self.inputs.first() else {
            return invalid(format!("{} transactions need stake inputs", self.kind));
        };
        let sink = first.address().clone();
        if !sink.is_stake_sink() || self.inputs.iter().any(|i| i.address() != &sink) {
            return invalid(format!(
                "{} inputs must all come from one stake sink",
                self.kind
            ));
        }
        Ok(sink)
    }

    /// True when every input carries a valid signature
    pub fn verify(&self) -> bool {
        self.inputs.iter().all(Input::verify)
    }

    pub fn in_balance(&self) -> u64 {
        total(self.inputs.iter().map(|i| &i.output.amount))
    }

    pub fn out_balance(&self) -> u64 {
        total(self.outputs.iter().map(|o| &o.amount))
    }

    /// `SHA256(id ‖ JSON(data))`
    pub fn hash(&self) -> String {
        let data = TransactionDataRef {
            inputs: &self.inputs,
            outputs: &self.outputs,
        };
        let data = serde_json::to_string(&data).expect("transaction data serializes to JSON");
        crypto::hash(&format!("{}{}", self.id, data))
    }

    pub fn to_json(&self) -> TransactionJson {
        self.clone().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> (KeyPair, Address) {
        let keys = KeyPair::generate();
        let address = keys.address().clone();
        (keys, address)
    }

    fn reload(tx: &Transaction) -> Result<Transaction, TransactionError> {
        Transaction::load(tx.to_json())
    }

    #[test]
    fn test_input_signature() {
        let (key_a, a) = keys();
        let (key_b, _) = keys();
        let output = Output::new(a.clone(), 10);

        let input = Input::generate(output.clone(), "t-1", 3, Some(&key_a));
        assert!(input.verify());

        let forged = Input::generate(output.clone(), "t-1", 3, Some(&key_b));
        assert!(!forged.verify());

        let unsigned = Input::generate(output, "t-1", 3, None);
        assert!(!unsigned.verify());
    }

    #[test]
    fn test_reward() {
        let (_, a) = keys();
        let tx = Transaction::reward(&a, None);
        let json = tx.to_json();
        assert_eq!(json.data.outputs[0].amount, POW_REWARD);

        let loaded = Transaction::load(json.clone()).unwrap();
        assert_eq!(loaded.kind, TransactionType::Reward);
        assert!(loaded.inputs.is_empty());
        assert_eq!(loaded.outputs, vec![Output::new(a.clone(), 100)]);
        assert!(loaded.verify());

        let mut tampered = json;
        tampered.hash = "any other hash".to_string();
        assert!(Transaction::load(tampered).is_err());

        let mut too_big = Transaction::reward(&a, None);
        too_big.outputs[0].amount = 200;
        assert!(matches!(
            reload(&too_big),
            Err(TransactionError::InvalidTransaction(_))
        ));
    }

    #[test]
    fn test_transfer() {
        let (key_a, a) = keys();
        let (_, b) = keys();
        let source1 = Transaction::reward(&a, Some(50));
        let source2 = Transaction::reward(&a, Some(75));

        let err = Transaction::transfer(100, &a, &b, Some(&key_a), &[source1.clone()]).unwrap_err();
        assert!(matches!(
            err,
            TransactionError::InsufficientFunds { required: 100, available: 50 }
        ));

        let err = Transaction::transfer(200, &a, &b, Some(&key_a), &[source1.clone(), source2.clone()])
            .unwrap_err();
        assert!(matches!(
            err,
            TransactionError::InsufficientFunds { required: 200, available: 125 }
        ));

        let small = Transaction::transfer(1, &a, &b, Some(&key_a), &[source1.clone()]).unwrap();
        assert!(small.verify());

        let tx = Transaction::transfer(100, &a, &b, Some(&key_a), &[source1.clone(), source2.clone()])
            .unwrap();
        let json = tx.to_json();

        assert_eq!(json.id, tx.id);
        assert_ne!(json.id, source1.id);
        assert_eq!(json.kind, TransactionType::Transfer);
        assert_eq!(json.timestamp, tx.timestamp);
        assert_eq!(json.data.inputs.len(), 2);
        assert_eq!(json.data.inputs[0].output, Output::new(a.clone(), 50));
        assert_eq!(json.data.inputs[0].transaction_id, source1.id);
        assert_eq!(json.data.inputs[1].output, Output::new(a.clone(), 75));
        assert_eq!(json.data.inputs[1].transaction_id, source2.id);
        assert_eq!(
            json.data.outputs,
            vec![Output::new(b, 100), Output::new(a, 25)]
        );

        let loaded = Transaction::load(json).unwrap();
        assert_eq!(loaded, tx);
        assert!(loaded.verify());
    }

    #[test]
    fn test_type_accepts_legacy_spellings() {
        let withdrawal: TransactionType = serde_json::from_str("\"withdrawl\"").unwrap();
        let penalty: TransactionType = serde_json::from_str("\"penality\"").unwrap();
        assert_eq!(withdrawal, TransactionType::Withdrawal);
        assert_eq!(penalty, TransactionType::Penalty);

        assert_eq!(serde_json::to_string(&withdrawal).unwrap(), "\"withdrawal\"");
        assert_eq!(serde_json::to_string(&penalty).unwrap(), "\"penalty\"");
    }

    #[test]
    fn test_transfer_exact_amount_has_no_change() {
        let (key_a, a) = keys();
        let (_, b) = keys();
        let source = Transaction::reward(&a, Some(40));

        let tx = Transaction::transfer(40, &a, &b, Some(&key_a), &[source]).unwrap();
        assert_eq!(tx.outputs, vec![Output::new(b, 40)]);
    }

    #[test]
    fn test_input_index_points_at_output_position() {
        let (key_a, a) = keys();
        let (_, b) = keys();
        let mut source = Transaction::reward(&b, Some(5));
        source.outputs.push(Output::new(a.clone(), 30));

        let tx = Transaction::transfer(10, &a, &b, Some(&key_a), &[source.clone()]).unwrap();
        assert_eq!(tx.inputs.len(), 1);
        assert_eq!(tx.inputs[0].index, 1);
        assert_eq!(tx.inputs[0].transaction_id, source.id);
    }

    #[test]
    fn test_stake() {
        let (key_a, a) = keys();
        let source1 = Transaction::reward(&a, Some(50));
        let source2 = Transaction::reward(&a, Some(MAX_POS));

        assert!(matches!(
            Transaction::stake(100, &a, Some(&key_a), &[source1.clone()]),
            Err(TransactionError::InsufficientFunds { .. })
        ));

        assert!(matches!(
            Transaction::stake(MAX_POS + 1, &a, Some(&key_a), &[source1.clone(), source2.clone()]),
            Err(TransactionError::StakeLimitExceeded { amount, limit: MAX_POS }) if amount == MAX_POS + 1
        ));

        let at_limit =
            Transaction::stake(MAX_POS, &a, Some(&key_a), &[source1.clone(), source2.clone()])
                .unwrap();
        assert!(reload(&at_limit).is_ok());

        let tx = Transaction::stake(100, &a, Some(&key_a), &[source1, source2]).unwrap();
        let json = tx.to_json();
        assert_eq!(json.kind, TransactionType::Stake);
        assert_eq!(json.data.inputs.len(), 2);
        assert_eq!(json.data.inputs[1].amount(), 1_000_000);
        assert_eq!(
            json.data.outputs,
            vec![Output::new(a.stake_sink(), 100), Output::new(a, 999_950)]
        );

        let loaded = Transaction::load(json).unwrap();
        assert!(loaded.verify());
    }

    #[test]
    fn test_withdrawal() {
        let (key_a, a) = keys();
        let source = Transaction::reward(&a, Some(50));
        let stake = Transaction::stake(1, &a, Some(&key_a), &[source]).unwrap();

        let tx = Transaction::withdrawal(&a, &[stake.clone()], &key_a).unwrap();
        let json = tx.to_json();

        assert_eq!(json.kind, TransactionType::Withdrawal);
        assert_eq!(json.data.inputs.len(), 1);
        assert_eq!(json.data.inputs[0].output, Output::new(a.stake_sink(), 1));
        assert_eq!(json.data.inputs[0].transaction_id, stake.id);
        assert_eq!(json.data.outputs, vec![Output::new(a, 1)]);

        let loaded = Transaction::load(json).unwrap();
        assert!(loaded.verify());
    }

    #[test]
    fn test_interest() {
        let (key_a, a) = keys();
        let source = Transaction::reward(&a, Some(100));
        let mut stake = Transaction::stake(100, &a, Some(&key_a), &[source]).unwrap();

        let premature = Transaction::interest(&a, &[stake.clone()], &key_a);
        assert_eq!(premature.out_balance(), 0);
        assert_eq!(premature.in_balance(), 0);
        assert!(reload(&premature).is_err());

        stake.timestamp = 0;
        let valid = Transaction::interest(&a, &[stake], &key_a);
        assert_eq!(valid.out_balance(), 10);
        assert_eq!(valid.in_balance(), 100);

        let loaded = reload(&valid).unwrap();
        assert_eq!(loaded.kind, TransactionType::Interest);
        assert_eq!(loaded.inputs.len(), 1);
        assert_eq!(loaded.inputs[0].output, Output::new(a.stake_sink(), 100));
        assert_eq!(loaded.outputs, vec![Output::new(a, 10)]);
        assert!(loaded.verify());
    }

    #[test]
    fn test_interest_rounds_up() {
        assert_eq!(interest_on(0), 0);
        assert_eq!(interest_on(1), 1);
        assert_eq!(interest_on(100), 10);
        assert_eq!(interest_on(101), 11);
    }

    #[test]
    fn test_interest_respects_age_boundary() {
        let (key_a, a) = keys();
        let source = Transaction::reward(&a, Some(100));
        let mut stake = Transaction::stake(50, &a, Some(&key_a), &[source]).unwrap();
        stake.timestamp = 1_000;

        let just_matured = Transaction::interest_at(&a, &[stake.clone()], &key_a, 1_000 + MIN_POS_AGE);
        assert_eq!(just_matured.out_balance(), 5);

        let too_early = Transaction::interest_at(&a, &[stake], &key_a, 999 + MIN_POS_AGE);
        assert_eq!(too_early.out_balance(), 0);
    }

    #[test]
    fn test_penalty() {
        let (key_a, a) = keys();
        let source = Transaction::reward(&a, Some(100));
        let stake = Transaction::stake(100, &a, Some(&key_a), &[source]).unwrap();

        let tx = Transaction::penalty(&a, &[stake]).unwrap();
        assert_eq!(tx.out_balance(), 0);
        assert_eq!(tx.in_balance(), 100);

        let loaded = reload(&tx).unwrap();
        assert_eq!(loaded.kind, TransactionType::Penalty);
        assert!(loaded.outputs.is_empty());
        assert_eq!(loaded.inputs[0].output, Output::new(a.stake_sink(), 100));
        // penalties are unsigned burns
        assert!(!loaded.verify());
    }

    #[test]
    fn test_transfer_cannot_spend_stake_sink() {
        let (key_a, a) = keys();
        let (_, b) = keys();
        let source = Transaction::reward(&a, Some(100));
        let stake = Transaction::stake(100, &a, Some(&key_a), &[source]).unwrap();

        let tx = Transaction::transfer(50, &a.stake_sink(), &b, Some(&key_a), &[stake]).unwrap();
        assert!(reload(&tx).is_err());
    }

    #[test]
    fn test_verify_fails_on_tampered_amount() {
        let (key_a, a) = keys();
        let (_, b) = keys();
        let source = Transaction::reward(&a, Some(50));
        let mut tx = Transaction::transfer(10, &a, &b, Some(&key_a), &[source]).unwrap();
        assert!(tx.verify());

        tx.inputs[0].output.amount = 500;
        assert!(!tx.verify());
    }

    #[test]
    fn test_serde_goes_through_load() {
        let (_, a) = keys();
        let tx = Transaction::reward(&a, None);

        let text = serde_json::to_string(&tx).unwrap();
        assert!(text.contains("\"type\":\"reward\""));
        assert!(text.contains(&format!("\"hash\":\"{}\"", tx.hash())));
        let back: Transaction = serde_json::from_str(&text).unwrap();
        assert_eq!(back, tx);

        let forged = text.replace("\"amount\":100", "\"amount\":101");
        assert!(serde_json::from_str::<Transaction>(&forged).is_err());
    }

    #[test]
    fn test_hash_is_deterministic() {
        let (_, a) = keys();
        let tx = Transaction::reward(&a, None);
        assert_eq!(tx.hash(), tx.clone().hash());

        let mut other = tx.clone();
        other.id = "different".to_string();
        assert_ne!(tx.hash(), other.hash());
    }
}
