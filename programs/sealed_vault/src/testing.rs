//! Test-only engine, signers and an in-memory vault harness

use std::collections::HashMap;

use anchor_lang::prelude::*;
use ed25519_dalek::{Signature, Signer as _, SigningKey, VerifyingKey};
use sha2::{Digest, Sha256};

use crate::attestation::{
    decryption_message, input_message, parse_ed25519_instruction, AttesterSet, VerifiedSignature,
};
use crate::errors::VaultError;
use crate::guard::{guarded, CallGuard, GuardedState};
use crate::ledger::{self, UserLedger, Vault};
use crate::registry::{
    self, derive_withdrawal_address, FinalizeOutcome, Payout, PendingWithdrawal, RequestId,
};
use crate::sealed::{
    CoprocessorEngine, ExternalSealed, Handle, SealedBool, SealedEngine, SealedValue,
};

pub fn vault_err(code: VaultError) -> anchor_lang::error::Error {
    code.into()
}

/// Coprocessor stand-in that evaluates every operation in the clear
///
/// Handles it did not produce are a bug in the test, not a program error.
pub struct PlaintextEngine {
    inner: CoprocessorEngine,
    values: HashMap<Handle, u64>,
    flags: HashMap<Handle, bool>,
    inputs: HashMap<Handle, u64>,
    input_counter: u64,
}

impl Default for PlaintextEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaintextEngine {
    pub fn new() -> Self {
        Self {
            inner: CoprocessorEngine::new(Pubkey::new_unique(), 0),
            values: HashMap::new(),
            flags: HashMap::new(),
            inputs: HashMap::new(),
            input_counter: 0,
        }
    }

    /// Client-side encryption of a withdrawal amount
    pub fn encrypt_input(&mut self, amount: u64) -> ExternalSealed {
        let mut hasher = Sha256::new();
        hasher.update(b"test_input");
        hasher.update(self.input_counter.to_le_bytes());
        self.input_counter += 1;

        let mut handle = [0u8; 32];
        handle.copy_from_slice(&hasher.finalize());
        self.inputs.insert(handle, amount);
        ExternalSealed { handle }
    }

    /// Decryption on behalf of `who`, honouring the access list
    pub fn decrypt_for(&self, value: &SealedValue, who: &Pubkey) -> Option<u64> {
        if !value.can_decrypt(who) {
            return None;
        }
        self.values.get(&value.handle).copied()
    }

    pub fn public_decrypt(&self, value: &SealedValue) -> Option<u64> {
        if !value.is_public() {
            return None;
        }
        self.values.get(&value.handle).copied()
    }

    fn value(&self, value: &SealedValue) -> u64 {
        *self
            .values
            .get(&value.handle)
            .expect("handle produced by this engine")
    }

    fn record(&mut self, result: SealedValue, plaintext: u64) -> SealedValue {
        self.values.insert(result.handle, plaintext);
        result
    }
}

impl SealedEngine for PlaintextEngine {
    fn seal(&mut self, plaintext: u64) -> Result<SealedValue> {
        let result = self.inner.seal(plaintext)?;
        Ok(self.record(result, plaintext))
    }

    fn admit(&mut self, input: &ExternalSealed) -> Result<SealedValue> {
        let plaintext = *self
            .inputs
            .get(&input.handle)
            .expect("input encrypted by this engine");
        let result = self.inner.admit(input)?;
        Ok(self.record(result, plaintext))
    }

    fn add(&mut self, lhs: &SealedValue, rhs: &SealedValue) -> Result<SealedValue> {
        let sum = self.value(lhs).wrapping_add(self.value(rhs));
        let result = self.inner.add(lhs, rhs)?;
        Ok(self.record(result, sum))
    }

    fn sub(&mut self, lhs: &SealedValue, rhs: &SealedValue) -> Result<SealedValue> {
        let difference = self.value(lhs).wrapping_sub(self.value(rhs));
        let result = self.inner.sub(lhs, rhs)?;
        Ok(self.record(result, difference))
    }

    fn le(&mut self, lhs: &SealedValue, rhs: &SealedValue) -> Result<SealedBool> {
        let flag = self.value(lhs) <= self.value(rhs);
        let result = self.inner.le(lhs, rhs)?;
        self.flags.insert(result.handle, flag);
        Ok(result)
    }

    fn select(
        &mut self,
        cond: &SealedBool,
        if_true: &SealedValue,
        if_false: &SealedValue,
    ) -> Result<SealedValue> {
        let flag = *self
            .flags
            .get(&cond.handle)
            .expect("condition produced by this engine");
        let chosen = if flag {
            self.value(if_true)
        } else {
            self.value(if_false)
        };
        let result = self.inner.select(cond, if_true, if_false)?;
        Ok(self.record(result, chosen))
    }
}

/// One Ed25519 signature as carried by a native program instruction
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SignedDigest {
    pub signer: [u8; 32],
    pub signature: [u8; 64],
    pub message: [u8; 32],
}

/// Ed25519 attester or input verifier
pub struct TestSigner {
    key: SigningKey,
}

impl TestSigner {
    pub fn from_seed(seed: u8) -> Self {
        Self {
            key: SigningKey::from_bytes(&[seed; 32]),
        }
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.key.verifying_key().to_bytes()
    }

    pub fn sign(&self, message: &[u8; 32]) -> SignedDigest {
        SignedDigest {
            signer: self.public_key(),
            signature: self.key.sign(message).to_bytes(),
            message: *message,
        }
    }

    /// What the program reads back once the native program accepted `sign`
    pub fn verified(&self, message: &[u8; 32]) -> VerifiedSignature {
        VerifiedSignature {
            signer: self.public_key(),
            message: *message,
        }
    }
}

/// Ed25519 native program instruction data with every field inline
pub fn ed25519_instruction_data(entries: &[SignedDigest]) -> Vec<u8> {
    const INLINE: u16 = u16::MAX;
    let header = 2 + entries.len() * 14;

    let mut data = vec![entries.len() as u8, 0];
    let mut body = Vec::new();
    for entry in entries {
        let pubkey_offset = header + body.len();
        body.extend_from_slice(&entry.signer);
        let signature_offset = header + body.len();
        body.extend_from_slice(&entry.signature);
        let message_offset = header + body.len();
        body.extend_from_slice(&entry.message);

        for field in [
            signature_offset as u16,
            INLINE,
            pubkey_offset as u16,
            INLINE,
            message_offset as u16,
            entry.message.len() as u16,
            INLINE,
        ] {
            data.extend_from_slice(&field.to_le_bytes());
        }
    }
    data.extend_from_slice(&body);
    data
}

/// Run `entries` through the native program, then read them back
///
/// The runtime drops the whole transaction on a bad signature, so a test
/// building one is broken.
pub fn precompile(entries: &[SignedDigest]) -> Vec<VerifiedSignature> {
    for entry in entries {
        let key = VerifyingKey::from_bytes(&entry.signer).expect("valid public key");
        key.verify_strict(&entry.message, &Signature::from_bytes(&entry.signature))
            .expect("native program accepts the signature");
    }
    parse_ed25519_instruction(&ed25519_instruction_data(entries)).expect("well-formed instruction")
}

/// Payout that moves lamports between harness counters
pub struct TestPayout {
    recipient: Pubkey,
    liquidity: u64,
    paid: u64,
    fail: bool,
}

impl Payout for TestPayout {
    fn recipient(&self) -> Pubkey {
        self.recipient
    }

    fn liquidity(&self) -> u64 {
        self.liquidity
    }

    fn pay(&mut self, amount: u64) -> Result<()> {
        require!(!self.fail, VaultError::TransferFailed);
        self.liquidity = self
            .liquidity
            .checked_sub(amount)
            .ok_or(VaultError::TransferFailed)?;
        self.paid += amount;
        Ok(())
    }
}

/// The harness vault is its own storage
impl GuardedState for Vault {
    fn guard(&mut self) -> &mut CallGuard {
        &mut self.guard
    }

    fn persist(&mut self) -> Result<()> {
        Ok(())
    }
}

pub const ATTESTER_THRESHOLD: u8 = 2;

/// State rolled back when an entry point fails, as the runtime does
struct Snapshot {
    vault: Vault,
    ledgers: HashMap<Pubkey, UserLedger>,
    withdrawals: HashMap<Pubkey, PendingWithdrawal>,
    addresses: HashMap<RequestId, Pubkey>,
    liquidity: u64,
    received: HashMap<Pubkey, u64>,
}

/// Vault, ledgers and withdrawal PDAs driven through the core entry points
pub struct TestVault {
    pub engine: PlaintextEngine,
    pub vault: Vault,
    pub ledgers: HashMap<Pubkey, UserLedger>,
    /// Withdrawal PDAs by address
    pub withdrawals: HashMap<Pubkey, PendingWithdrawal>,
    /// Request id to PDA address, as a client would track it
    addresses: HashMap<RequestId, Pubkey>,
    pub attesters: Vec<TestSigner>,
    pub input_verifier: TestSigner,
    /// Lamports the vault can release
    pub liquidity: u64,
    pub received: HashMap<Pubkey, u64>,
    pub now: i64,
    pub fail_transfers: bool,
}

impl TestVault {
    pub fn new() -> Self {
        let mut engine = PlaintextEngine::new();
        let attesters: Vec<TestSigner> = (1..=3).map(TestSigner::from_seed).collect();
        let input_verifier = TestSigner::from_seed(42);

        let attester_set = AttesterSet::new(
            attesters.iter().map(|a| a.public_key()).collect(),
            ATTESTER_THRESHOLD,
        )
        .unwrap();
        let input_set = AttesterSet::new(vec![input_verifier.public_key()], 1).unwrap();

        let mut vault = Vault::default();
        vault
            .initialize(
                &mut engine,
                Pubkey::new_unique(),
                Pubkey::new_unique(),
                attester_set,
                input_set,
                255,
            )
            .unwrap();

        Self {
            engine,
            vault,
            ledgers: HashMap::new(),
            withdrawals: HashMap::new(),
            addresses: HashMap::new(),
            attesters,
            input_verifier,
            liquidity: 0,
            received: HashMap::new(),
            now: 1_700_000_000,
            fail_transfers: false,
        }
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            vault: self.vault.clone(),
            ledgers: self.ledgers.clone(),
            withdrawals: self.withdrawals.clone(),
            addresses: self.addresses.clone(),
            liquidity: self.liquidity,
            received: self.received.clone(),
        }
    }

    fn atomic<T>(&mut self, body: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let snapshot = self.snapshot();
        let result = body(self);
        if result.is_err() {
            self.vault = snapshot.vault;
            self.ledgers = snapshot.ledgers;
            self.withdrawals = snapshot.withdrawals;
            self.addresses = snapshot.addresses;
            self.liquidity = snapshot.liquidity;
            self.received = snapshot.received;
        }
        result
    }

    pub fn advance(&mut self, seconds: i64) {
        self.now += seconds;
    }

    pub fn deposit(&mut self, who: Pubkey, amount: u64) -> Result<()> {
        self.atomic(|t| {
            let account = t.ledgers.entry(who).or_default();
            guarded(&mut t.vault, |vault| {
                ledger::deposit(&mut t.engine, vault, account, who, amount)
            })?;
            t.liquidity += amount;
            Ok(())
        })
    }

    pub fn input_proof(&self, input: &ExternalSealed, owner: &Pubkey) -> Vec<SignedDigest> {
        let message = input_message(&self.vault.address, &input.handle, owner);
        vec![self.input_verifier.sign(&message)]
    }

    pub fn request(&mut self, who: Pubkey, recipient: Pubkey, amount: u64) -> Result<RequestId> {
        let input = self.engine.encrypt_input(amount);
        let proof = self.input_proof(&input, &who);
        self.request_with(who, recipient, &input, &proof)
            .map(|record| record.request_id)
    }

    /// Request into a fresh PDA at the requester's next nonce
    pub fn request_with(
        &mut self,
        who: Pubkey,
        recipient: Pubkey,
        input: &ExternalSealed,
        proof: &[SignedDigest],
    ) -> Result<PendingWithdrawal> {
        let now = self.now;
        let signatures = precompile(proof);
        self.atomic(|t| {
            let account = t.ledgers.entry(who).or_default();
            let (address, bump) = derive_withdrawal_address(&who, account.request_nonce, &crate::ID);
            assert!(
                !t.withdrawals.contains_key(&address),
                "withdrawal PDA initialized twice"
            );

            let mut record = PendingWithdrawal {
                bump,
                ..Default::default()
            };
            let request_id = guarded(&mut t.vault, |vault| {
                registry::request_withdrawal(
                    &mut t.engine,
                    vault,
                    account,
                    &mut record,
                    who,
                    recipient,
                    input,
                    &signatures,
                    now,
                )
            })?;

            t.withdrawals.insert(address, record.clone());
            t.addresses.insert(request_id, address);
            Ok(record)
        })
    }

    /// Withdrawal PDA of `request_id`, settled or not
    pub fn record(&self, request_id: &RequestId) -> Option<&PendingWithdrawal> {
        self.addresses
            .get(request_id)
            .and_then(|address| self.withdrawals.get(address))
    }

    /// Threshold attestation that `commitment` decrypts to `clear_amount`
    pub fn attest_commitment(&self, commitment: &Handle, clear_amount: u64) -> Vec<SignedDigest> {
        let message = decryption_message(&self.vault.address, commitment, clear_amount);
        self.attesters
            .iter()
            .take(ATTESTER_THRESHOLD as usize)
            .map(|signer| signer.sign(&message))
            .collect()
    }

    pub fn attest(&self, request_id: &RequestId, clear_amount: u64) -> Vec<SignedDigest> {
        let commitment = self
            .record(request_id)
            .map(|record| record.commitment)
            .unwrap_or_default();
        self.attest_commitment(&commitment, clear_amount)
    }

    /// What the off-chain oracle reads from the commitment
    pub fn oracle_decrypt(&self, request_id: &RequestId) -> Option<u64> {
        let record = self.record(request_id)?;
        self.engine.public_decrypt(&record.locked_amount)
    }

    pub fn oracle_finalize(&mut self, request_id: RequestId) -> Result<FinalizeOutcome> {
        let clear_amount = self.oracle_decrypt(&request_id).unwrap_or_default();
        self.finalize(request_id, clear_amount)
    }

    pub fn finalize(&mut self, request_id: RequestId, clear_amount: u64) -> Result<FinalizeOutcome> {
        let attestation = self.attest(&request_id, clear_amount);
        self.finalize_with(request_id, clear_amount, &attestation)
    }

    pub fn finalize_with(
        &mut self,
        request_id: RequestId,
        clear_amount: u64,
        attestation: &[SignedDigest],
    ) -> Result<FinalizeOutcome> {
        let (requester, recipient) = self
            .record(&request_id)
            .map(|record| (record.requester, record.recipient))
            .unwrap_or_default();
        self.finalize_as(request_id, requester, recipient, clear_amount, attestation)
    }

    /// Finalize passing explicit ledger and recipient accounts
    ///
    /// An unknown id is served a blank account, as if the client passed an
    /// address that holds no request.
    pub fn finalize_as(
        &mut self,
        request_id: RequestId,
        ledger_owner: Pubkey,
        recipient: Pubkey,
        clear_amount: u64,
        attestation: &[SignedDigest],
    ) -> Result<FinalizeOutcome> {
        let signatures = precompile(attestation);
        self.atomic(|t| {
            let account = t.ledgers.entry(ledger_owner).or_default();
            let mut blank = PendingWithdrawal::default();
            let record = match t.addresses.get(&request_id) {
                Some(address) => t.withdrawals.get_mut(address).expect("indexed PDA exists"),
                None => &mut blank,
            };
            let mut payout = TestPayout {
                recipient,
                liquidity: t.liquidity,
                paid: 0,
                fail: t.fail_transfers,
            };
            let outcome = guarded(&mut t.vault, |vault| {
                registry::finalize_withdrawal(
                    vault,
                    account,
                    record,
                    &mut payout,
                    &request_id,
                    clear_amount,
                    &signatures,
                )
            })?;
            t.liquidity -= payout.paid;
            *t.received.entry(recipient).or_default() += payout.paid;
            Ok(outcome)
        })
    }

    pub fn cancel(&mut self, caller: Pubkey, request_id: RequestId) -> Result<PendingWithdrawal> {
        let now = self.now;
        self.atomic(|t| {
            let account = t.ledgers.entry(caller).or_default();
            let mut blank = PendingWithdrawal::default();
            let record = match t.addresses.get(&request_id) {
                Some(address) => t.withdrawals.get_mut(address).expect("indexed PDA exists"),
                None => &mut blank,
            };
            guarded(&mut t.vault, |vault| {
                registry::cancel_timed_out_withdrawal(
                    &mut t.engine,
                    vault,
                    account,
                    record,
                    caller,
                    &request_id,
                    now,
                )
            })?;
            Ok(record.clone())
        })
    }

    pub fn can_cancel(&self, request_id: &RequestId) -> bool {
        self.record(request_id)
            .is_some_and(|record| record.can_cancel(self.now))
    }

    /// Balance as decrypted by its owner
    pub fn balance_of(&self, who: &Pubkey) -> u64 {
        self.ledgers
            .get(who)
            .and_then(|account| self.engine.decrypt_for(&account.balance, who))
            .unwrap_or_default()
    }

    pub fn aggregate(&self) -> u64 {
        self.engine
            .public_decrypt(&self.vault.aggregate)
            .expect("aggregate is publicly decryptable")
    }

    /// Sum of every balance, read with the vault's own grant
    pub fn sum_of_balances(&self) -> u64 {
        self.ledgers
            .values()
            .filter(|account| account.initialized)
            .map(|account| {
                self.engine
                    .decrypt_for(&account.balance, &self.vault.address)
                    .expect("vault can read every balance")
            })
            .fold(0u64, |sum, balance| sum.wrapping_add(balance))
    }

    pub fn active_count(&self, who: &Pubkey) -> usize {
        self.ledgers
            .get(who)
            .map(|account| account.active.len())
            .unwrap_or_default()
    }

    pub fn received_by(&self, who: &Pubkey) -> u64 {
        self.received.get(who).copied().unwrap_or_default()
    }
}
