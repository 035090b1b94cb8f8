//! Withdrawal requests
//!
//! Two-phase confidential withdrawal:
//!
//! ```text
//!             request_withdrawal
//!                    │  (clamp, lock, publish commitment)
//!                    ▼
//!               Requested ──── finalize(clear > 0) ───▶ Finalized     (payout)
//!                    │   ───── finalize(clear == 0) ──▶ RejectedZero  (no payout)
//!                    └──────── cancel after timeout ──▶ Cancelled     (restore)
//! ```
//!
//! Each request lives in its own PDA, seeded by the requester and the
//! requester's request nonce, so one account's traffic never takes capacity
//! from another. A terminal transition flips `processed`, clears the locked
//! amount and removes the id from the requester's active index. The account
//! itself stays behind as the settled marker for its id.

use anchor_lang::prelude::*;
use sha2::{Digest, Sha256};

use crate::attestation::VerifiedSignature;
use crate::errors::VaultError;
use crate::ledger::{self, UserLedger, Vault};
use crate::sealed::{ExternalSealed, Handle, SealedEngine, SealedValue};

pub const WITHDRAWAL_SEED: &[u8] = b"withdrawal";

/// Per-account bound on open requests
pub const MAX_ACTIVE_REQUESTS: usize = 10;

/// Six hours
pub const WITHDRAWAL_TIMEOUT_SECS: i64 = 6 * 60 * 60;

pub type RequestId = [u8; 32];

/// RequestId = SHA-256(tag, requester, timestamp, nonce)
pub fn derive_request_id(requester: &Pubkey, timestamp: i64, nonce: u64) -> RequestId {
    let mut hasher = Sha256::new();
    hasher.update(b"sealed_vault/request/v1");
    hasher.update(requester.as_ref());
    hasher.update(timestamp.to_le_bytes());
    hasher.update(nonce.to_le_bytes());

    let mut id = [0u8; 32];
    id.copy_from_slice(&hasher.finalize());
    id
}

pub fn derive_withdrawal_address(requester: &Pubkey, nonce: u64, program_id: &Pubkey) -> (Pubkey, u8) {
    Pubkey::find_program_address(
        &[WITHDRAWAL_SEED, requester.as_ref(), &nonce.to_le_bytes()],
        program_id,
    )
}

/// Unordered set of an account's open request ids
#[derive(AnchorSerialize, AnchorDeserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ActiveRequestIndex {
    pub ids: Vec<RequestId>,
}

impl ActiveRequestIndex {
    pub const LEN: usize = 4 + (32 * MAX_ACTIVE_REQUESTS);

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Bounded by `MAX_ACTIVE_REQUESTS`
    pub fn count(&self) -> Result<u8> {
        u8::try_from(self.ids.len()).map_err(|_| error!(VaultError::ArithmeticOverflow))
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.ids.len() >= MAX_ACTIVE_REQUESTS
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.ids.contains(id)
    }

    pub fn insert(&mut self, id: RequestId) -> Result<()> {
        require!(!self.is_full(), VaultError::TooManyActiveRequests);
        self.ids.push(id);
        Ok(())
    }

    /// Swap-with-last removal, order is not preserved
    pub fn remove(&mut self, id: &RequestId) -> bool {
        match self.ids.iter().position(|candidate| candidate == id) {
            Some(position) => {
                self.ids.swap_remove(position);
                true
            }
            None => false,
        }
    }
}

/// Withdrawal request PDA
///
/// Seeds: [b"withdrawal", requester, nonce (LE)]
#[account]
#[derive(Default, Debug)]
pub struct PendingWithdrawal {
    pub request_id: RequestId,
    pub recipient: Pubkey,
    pub requester: Pubkey,

    /// Requester's request nonce, part of the PDA seeds
    pub nonce: u64,

    pub processed: bool,
    pub created_at: i64,

    /// Clamped amount locked out of the requester's balance
    pub locked_amount: SealedValue,

    /// Published so the attesters can decrypt `locked_amount`
    pub commitment: Handle,

    pub bump: u8,
}

impl PendingWithdrawal {
    pub const LEN: usize = 8 +  // discriminator
        32 +  // request_id
        32 +  // recipient
        32 +  // requester
        8 +   // nonce
        1 +   // processed
        8 +   // created_at
        SealedValue::LEN +  // locked_amount
        32 +  // commitment
        1;    // bump

    pub fn timeout_at(&self) -> i64 {
        self.created_at.saturating_add(WITHDRAWAL_TIMEOUT_SECS)
    }

    pub fn is_timed_out(&self, now: i64) -> bool {
        now >= self.timeout_at()
    }

    /// Timeout eligibility: open and at least six hours old
    pub fn can_cancel(&self, now: i64) -> bool {
        !self.processed && self.is_timed_out(now)
    }

    /// This record is request `id` and has not been settled
    fn ensure_open(&self, id: &RequestId) -> Result<()> {
        require!(
            self.requester != Pubkey::default() && &self.request_id == id,
            VaultError::RequestNotFound
        );
        require!(!self.processed, VaultError::RequestAlreadyProcessed);
        Ok(())
    }

    /// Terminal transition, the record keeps only its identity
    fn settle(&mut self) {
        self.processed = true;
        self.locked_amount = SealedValue::default();
    }
}

/// Moves lamports out of the vault for a settled withdrawal
pub trait Payout {
    /// Account that will receive the payout
    fn recipient(&self) -> Pubkey;

    /// Lamports the vault can actually release
    fn liquidity(&self) -> u64;

    fn pay(&mut self, amount: u64) -> Result<()>;
}

/// Terminal state reached by `finalize_withdrawal`
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FinalizeOutcome {
    Withdrawn {
        request_id: RequestId,
        requester: Pubkey,
        recipient: Pubkey,
        amount: u64,
    },
    RejectedZero {
        request_id: RequestId,
        requester: Pubkey,
    },
}

/// Open a withdrawal request for `requester` into the fresh `record`
///
/// Checks run before any effect. The requested ciphertext is admitted only
/// after its input proof verifies, then clamped against the balance.
#[allow(clippy::too_many_arguments)]
pub fn request_withdrawal<E: SealedEngine>(
    engine: &mut E,
    vault: &mut Vault,
    account: &mut UserLedger,
    record: &mut PendingWithdrawal,
    requester: Pubkey,
    recipient: Pubkey,
    encrypted_amount: &ExternalSealed,
    input_proof: &[VerifiedSignature],
    now: i64,
) -> Result<RequestId> {
    require_keys_neq!(recipient, Pubkey::default(), VaultError::InvalidRecipient);
    require!(!account.active.is_full(), VaultError::TooManyActiveRequests);
    vault
        .input_verifiers
        .verify_input(&vault.address, encrypted_amount, &requester, input_proof)?;

    account.open(engine, requester, vault.address)?;

    let requested = engine.admit(encrypted_amount)?;
    let locked_amount = ledger::clamp_withdraw(engine, vault, account, &requested)?;

    let nonce = account.next_request_nonce()?;
    let request_id = derive_request_id(&requester, now, nonce);

    record.request_id = request_id;
    record.recipient = recipient;
    record.requester = requester;
    record.nonce = nonce;
    record.processed = false;
    record.created_at = now;
    record.commitment = locked_amount.commitment_handle();
    record.locked_amount = locked_amount;

    account.active.insert(request_id)?;

    Ok(request_id)
}

/// Settle a request with the attested cleartext of its commitment
///
/// A zero cleartext is the visible result of an overdraft clamped at request
/// time: the request is closed with no payout. Otherwise the payout is the
/// last effect of the call.
pub fn finalize_withdrawal<P: Payout>(
    vault: &mut Vault,
    account: &mut UserLedger,
    record: &mut PendingWithdrawal,
    payout: &mut P,
    request_id: &RequestId,
    clear_amount: u64,
    attestation: &[VerifiedSignature],
) -> Result<FinalizeOutcome> {
    record.ensure_open(request_id)?;
    require_keys_eq!(account.owner, record.requester, VaultError::AccountMismatch);

    vault.attesters.verify_decryption(
        &vault.address,
        &record.commitment,
        clear_amount,
        attestation,
    )?;

    if clear_amount > 0 {
        require_keys_eq!(payout.recipient(), record.recipient, VaultError::AccountMismatch);
        require!(
            payout.liquidity() >= clear_amount,
            VaultError::InsufficientVaultBalance
        );
    }

    record.settle();
    account.active.remove(request_id);

    if clear_amount == 0 {
        return Ok(FinalizeOutcome::RejectedZero {
            request_id: record.request_id,
            requester: record.requester,
        });
    }

    vault.record_withdrawal(clear_amount)?;
    payout.pay(clear_amount)?;

    Ok(FinalizeOutcome::Withdrawn {
        request_id: record.request_id,
        requester: record.requester,
        recipient: record.recipient,
        amount: clear_amount,
    })
}

/// Give up on the attesters and restore the locked amount
pub fn cancel_timed_out_withdrawal<E: SealedEngine>(
    engine: &mut E,
    vault: &mut Vault,
    account: &mut UserLedger,
    record: &mut PendingWithdrawal,
    caller: Pubkey,
    request_id: &RequestId,
    now: i64,
) -> Result<()> {
    record.ensure_open(request_id)?;
    require_keys_eq!(caller, record.requester, VaultError::NotRequestOwner);
    require_keys_eq!(account.owner, record.requester, VaultError::AccountMismatch);
    require!(record.is_timed_out(now), VaultError::WithdrawalNotTimedOut);

    ledger::restore(engine, vault, account, &record.locked_amount)?;

    record.settle();
    account.active.remove(request_id);
    Ok(())
}
