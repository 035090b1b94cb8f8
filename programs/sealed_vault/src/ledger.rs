//! Balance ledger
//!
//! Each account owns a sealed balance in its `UserLedger` PDA. The vault keeps
//! a sealed aggregate that moves in lockstep with every balance mutation and
//! is always publicly decryptable: aggregate liabilities are public even
//! though individual balances are not.
//!
//! Balances are mutated only by:
//! 1. `deposit` (plaintext lamports in, sealed and added)
//! 2. `clamp_withdraw` (sealed amount locked for a withdrawal request)
//! 3. `restore` (locked amount returned after a timeout)

use anchor_lang::prelude::*;

use crate::attestation::AttesterSet;
use crate::errors::VaultError;
use crate::guard::{CallGuard, GuardedState};
use crate::registry::ActiveRequestIndex;
use crate::sealed::{Handle, SealedEngine, SealedValue};

pub const VAULT_SEED: &[u8] = b"sealed_vault";
pub const LEDGER_SEED: &[u8] = b"ledger";

/// Vault PDA: holds the deposited lamports and the protocol state
///
/// Seeds: [b"sealed_vault"]
#[account]
#[derive(Default)]
pub struct Vault {
    /// May rotate the decryption attester set
    pub authority: Pubkey,

    /// Vault PDA address, the ledger's own identity in access lists
    pub address: Pubkey,

    /// Sealed sum of every account balance
    pub aggregate: SealedValue,

    /// Lamports ever deposited (public)
    pub total_deposited: u64,

    /// Lamports ever paid out (public)
    pub total_withdrawn: u64,

    /// Feeds sealed handle derivation
    pub handle_nonce: u64,

    /// Threshold set attesting decryptions of commitments
    pub attesters: AttesterSet,

    /// Threshold set attesting well-formed client ciphertexts
    pub input_verifiers: AttesterSet,

    pub guard: CallGuard,

    pub bump: u8,
}

impl Vault {
    pub const LEN: usize = 8 +  // discriminator
        32 +  // authority
        32 +  // address
        SealedValue::LEN +  // aggregate
        8 +   // total_deposited
        8 +   // total_withdrawn
        8 +   // handle_nonce
        AttesterSet::LEN +  // attesters
        AttesterSet::LEN +  // input_verifiers
        CallGuard::LEN +  // guard
        1;    // bump

    pub fn initialize<E: SealedEngine>(
        &mut self,
        engine: &mut E,
        address: Pubkey,
        authority: Pubkey,
        attesters: AttesterSet,
        input_verifiers: AttesterSet,
        bump: u8,
    ) -> Result<()> {
        self.authority = authority;
        self.address = address;
        self.aggregate = engine.seal(0)?;
        self.aggregate.make_publicly_decryptable();
        self.total_deposited = 0;
        self.total_withdrawn = 0;
        self.attesters = attesters;
        self.input_verifiers = input_verifiers;
        self.guard = CallGuard::default();
        self.bump = bump;
        Ok(())
    }

    /// Lamports owed to accounts or locked in pending requests
    pub fn outstanding(&self) -> u64 {
        self.total_deposited.saturating_sub(self.total_withdrawn)
    }

    pub fn aggregate_handle(&self) -> Handle {
        self.aggregate.handle
    }

    pub fn record_withdrawal(&mut self, amount: u64) -> Result<()> {
        self.total_withdrawn = self
            .total_withdrawn
            .checked_add(amount)
            .ok_or(VaultError::ArithmeticOverflow)?;
        Ok(())
    }

    fn regrant_aggregate(&mut self) {
        self.aggregate.make_publicly_decryptable();
    }
}

impl GuardedState for Account<'_, Vault> {
    fn guard(&mut self) -> &mut CallGuard {
        &mut self.guard
    }

    /// Write the vault back to its account data now, not at instruction exit
    fn persist(&mut self) -> Result<()> {
        AccountsExit::exit(self, &crate::ID)
    }
}

/// Per-account ledger PDA
///
/// Seeds: [b"ledger", owner.key().as_ref()]
#[account]
#[derive(Default)]
pub struct UserLedger {
    pub owner: Pubkey,

    /// Readable by the owner and the vault only
    pub balance: SealedValue,

    /// Open withdrawal requests of this account
    pub active: ActiveRequestIndex,

    /// Seeds the next withdrawal PDA, never reused
    pub request_nonce: u64,

    /// Set once the balance has been sealed to zero
    pub initialized: bool,

    pub bump: u8,
}

impl UserLedger {
    pub const LEN: usize = 8 +  // discriminator
        32 +  // owner
        SealedValue::LEN +  // balance
        ActiveRequestIndex::LEN +  // active
        8 +   // request_nonce
        1 +   // initialized
        1;    // bump

    /// Seal a zero balance on first use, no-op afterwards
    pub fn open<E: SealedEngine>(
        &mut self,
        engine: &mut E,
        owner: Pubkey,
        ledger: Pubkey,
    ) -> Result<()> {
        if self.initialized {
            return Ok(());
        }

        self.owner = owner;
        self.balance = engine.seal(0)?;
        self.active = ActiveRequestIndex::default();
        self.initialized = true;
        self.regrant_balance(ledger)
    }

    pub fn balance_handle(&self) -> Handle {
        self.balance.handle
    }

    /// Allocate the nonce of the next withdrawal request
    pub fn next_request_nonce(&mut self) -> Result<u64> {
        let nonce = self.request_nonce;
        self.request_nonce = nonce
            .checked_add(1)
            .ok_or(VaultError::ArithmeticOverflow)?;
        Ok(nonce)
    }

    fn regrant_balance(&mut self, ledger: Pubkey) -> Result<()> {
        let owner = self.owner;
        self.balance.grant_decrypt(owner)?;
        self.balance.grant_decrypt(ledger)
    }
}

/// Credit `amount` lamports to `account`'s sealed balance
pub fn deposit<E: SealedEngine>(
    engine: &mut E,
    vault: &mut Vault,
    account: &mut UserLedger,
    owner: Pubkey,
    amount: u64,
) -> Result<()> {
    require!(amount > 0, VaultError::InvalidDepositAmount);
    require!(
        amount <= u64::MAX - vault.outstanding(),
        VaultError::DepositTooLarge
    );

    account.open(engine, owner, vault.address)?;

    let sealed_amount = engine.seal(amount)?;
    account.balance = engine.add(&account.balance, &sealed_amount)?;
    vault.aggregate = engine.add(&vault.aggregate, &sealed_amount)?;

    account.regrant_balance(vault.address)?;
    vault.regrant_aggregate();

    vault.total_deposited = vault
        .total_deposited
        .checked_add(amount)
        .ok_or(VaultError::ArithmeticOverflow)?;

    Ok(())
}

/// Lock `requested` out of `account`'s balance, or zero if it would overdraw
///
/// Never fails on overdraft: failing would reveal whether the hidden balance
/// covers the amount. The returned value is publicly decryptable so the
/// attesters can later certify what was actually locked.
pub fn clamp_withdraw<E: SealedEngine>(
    engine: &mut E,
    vault: &mut Vault,
    account: &mut UserLedger,
    requested: &SealedValue,
) -> Result<SealedValue> {
    let valid = engine.le(requested, &account.balance)?;
    let zero = engine.seal(0)?;
    let mut locked = engine.select(&valid, requested, &zero)?;

    account.balance = engine.sub(&account.balance, &locked)?;
    vault.aggregate = engine.sub(&vault.aggregate, &locked)?;

    account.regrant_balance(vault.address)?;
    vault.regrant_aggregate();

    locked.grant_decrypt(vault.address)?;
    locked.make_publicly_decryptable();

    Ok(locked)
}

/// Return a previously locked amount to `account`
pub fn restore<E: SealedEngine>(
    engine: &mut E,
    vault: &mut Vault,
    account: &mut UserLedger,
    locked: &SealedValue,
) -> Result<()> {
    account.balance = engine.add(&account.balance, locked)?;
    vault.aggregate = engine.add(&vault.aggregate, locked)?;

    account.regrant_balance(vault.address)?;
    vault.regrant_aggregate();
    Ok(())
}

pub fn derive_vault_address(program_id: &Pubkey) -> (Pubkey, u8) {
    Pubkey::find_program_address(&[VAULT_SEED], program_id)
}

pub fn derive_ledger_address(owner: &Pubkey, program_id: &Pubkey) -> (Pubkey, u8) {
    Pubkey::find_program_address(&[LEDGER_SEED, owner.as_ref()], program_id)
}
