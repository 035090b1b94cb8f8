use anchor_lang::prelude::*;
use anchor_lang::system_program;

// Encrypted scalars and the coprocessor engine
pub mod sealed;
use sealed::{CoprocessorEngine, ExternalSealed};

// Sealed balances and the public aggregate
pub mod ledger;
use ledger::{UserLedger, Vault, LEDGER_SEED, VAULT_SEED};

// Two-phase withdrawal state machine
pub mod registry;
use registry::{FinalizeOutcome, Payout, PendingWithdrawal, RequestId, WITHDRAWAL_SEED};

// Threshold attestations and input proofs
pub mod attestation;
use attestation::{load_verified_signatures, AttesterSet};

// Persisted call guard
pub mod guard;
use guard::guarded;

pub mod errors;
use errors::VaultError;

pub mod events;
use events::*;

#[cfg(test)]
mod testing;


pub const PROTOCOL_VERSION: &str = "sealed-vault/1.0.0";

declare_id!("Hh6UqJETxKfEoiKy4mMQj3D8dN5FxiXZmm5Yqg1dPPMq");

#[program]
pub mod sealed_vault {
    use super::*;

    /// Create the vault
    pub fn initialize(
        ctx: Context<Initialize>,
        attesters: Vec<[u8; 32]>,
        threshold: u8,
        input_verifiers: Vec<[u8; 32]>,
        input_threshold: u8,
    ) -> Result<()> {
        let attester_set = AttesterSet::new(attesters, threshold)?;
        let input_set = AttesterSet::new(input_verifiers, input_threshold)?;

        let address = ctx.accounts.vault.key();
        let vault = &mut ctx.accounts.vault;
        let mut engine = CoprocessorEngine::new(address, 0);
        vault.initialize(
            &mut engine,
            address,
            ctx.accounts.authority.key(),
            attester_set,
            input_set,
            ctx.bumps.vault,
        )?;
        publish_journal(vault, engine);

        msg!(
            "Sealed vault initialized: {}-of-{} attesters",
            threshold,
            vault.attesters.members.len()
        );
        Ok(())
    }

    /// Replace the decryption attester set
    pub fn rotate_attesters(
        ctx: Context<RotateAttesters>,
        attesters: Vec<[u8; 32]>,
        threshold: u8,
    ) -> Result<()> {
        let vault = &mut ctx.accounts.vault;
        vault.attesters = AttesterSet::new(attesters, threshold)?;

        emit!(AttestersRotated {
            threshold,
            members: vault.attesters.size()?,
            timestamp: Clock::get()?.unix_timestamp,
        });

        msg!("Attesters rotated by {}", ctx.accounts.authority.key());
        Ok(())
    }

    /// Deposit lamports, credited to the depositor's sealed balance
    pub fn deposit(ctx: Context<Deposit>, amount: u64) -> Result<()> {
        let owner = ctx.accounts.depositor.key();
        let ledger_bump = ctx.bumps.user_ledger;
        let Deposit {
            depositor,
            vault,
            user_ledger,
            system_program: system,
        } = &mut *ctx.accounts;

        let (balance_handle, aggregate_handle) = guarded(vault, |vault| {
            let mut engine = CoprocessorEngine::new(vault.address, vault.handle_nonce);
            ledger::deposit(&mut engine, vault, user_ledger, owner, amount)?;
            user_ledger.bump = ledger_bump;
            publish_journal(vault, engine);

            system_program::transfer(
                CpiContext::new(
                    system.to_account_info(),
                    system_program::Transfer {
                        from: depositor.to_account_info(),
                        to: vault.to_account_info(),
                    },
                ),
                amount,
            )?;

            Ok((user_ledger.balance_handle(), vault.aggregate_handle()))
        })?;

        emit!(DepositEvent {
            account: owner,
            amount,
            balance_handle,
            aggregate_handle,
            timestamp: Clock::get()?.unix_timestamp,
        });

        msg!("Deposited {} lamports for {}", amount, owner);
        Ok(())
    }

    /// Open a withdrawal of an encrypted amount to `recipient`
    ///
    /// `request_nonce` must be the requester ledger's next nonce, it seeds
    /// the request PDA. The input proof travels as Ed25519 program
    /// instructions earlier in the transaction.
    pub fn request_withdraw(
        ctx: Context<RequestWithdraw>,
        request_nonce: u64,
        recipient: Pubkey,
        encrypted_amount: ExternalSealed,
    ) -> Result<RequestId> {
        let requester = ctx.accounts.requester.key();
        let now = Clock::get()?.unix_timestamp;
        let ledger_bump = ctx.bumps.user_ledger;
        let withdrawal_bump = ctx.bumps.withdrawal;
        let RequestWithdraw {
            vault,
            user_ledger,
            withdrawal,
            instructions_sysvar,
            ..
        } = &mut *ctx.accounts;

        require!(
            user_ledger.request_nonce == request_nonce,
            VaultError::AccountMismatch
        );
        let input_proof = load_verified_signatures(instructions_sysvar)?;

        let request_id = guarded(vault, |vault| {
            let mut engine = CoprocessorEngine::new(vault.address, vault.handle_nonce);
            let request_id = registry::request_withdrawal(
                &mut engine,
                vault,
                user_ledger,
                withdrawal,
                requester,
                recipient,
                &encrypted_amount,
                &input_proof,
                now,
            )?;
            user_ledger.bump = ledger_bump;
            withdrawal.bump = withdrawal_bump;
            publish_journal(vault, engine);
            Ok(request_id)
        })?;

        emit!(WithdrawalRequested {
            request_id,
            requester,
            recipient,
            commitment: withdrawal.commitment,
            created_at: now,
        });

        msg!(
            "Withdrawal requested: {} (commitment {})",
            bs58::encode(request_id).into_string(),
            bs58::encode(withdrawal.commitment).into_string()
        );
        Ok(request_id)
    }

    /// Settle a request with the attested cleartext of its commitment
    ///
    /// Permissionless: anyone holding a valid attestation may relay it, as
    /// Ed25519 program instructions earlier in the transaction.
    pub fn finalize_withdrawal(
        ctx: Context<FinalizeWithdrawal>,
        request_id: RequestId,
        clear_amount: u64,
    ) -> Result<()> {
        let attestation = load_verified_signatures(&ctx.accounts.instructions_sysvar)?;
        let mut payout = LamportPayout {
            vault: ctx.accounts.vault.to_account_info(),
            recipient: ctx.accounts.recipient.to_account_info(),
            rent_floor: Rent::get()?.minimum_balance(Vault::LEN),
        };
        let FinalizeWithdrawal {
            vault,
            user_ledger,
            withdrawal,
            ..
        } = &mut *ctx.accounts;

        let outcome = guarded(vault, |vault| {
            registry::finalize_withdrawal(
                vault,
                user_ledger,
                withdrawal,
                &mut payout,
                &request_id,
                clear_amount,
                &attestation,
            )
        })?;

        let timestamp = Clock::get()?.unix_timestamp;
        match outcome {
            FinalizeOutcome::Withdrawn {
                request_id,
                requester,
                recipient,
                amount,
            } => {
                emit!(Withdrawn {
                    request_id,
                    requester,
                    recipient,
                    amount,
                    timestamp,
                });
                msg!(
                    "Withdrawal {} paid {} lamports to {}",
                    bs58::encode(request_id).into_string(),
                    amount,
                    recipient
                );
            }
            FinalizeOutcome::RejectedZero {
                request_id,
                requester,
            } => {
                emit!(WithdrawalRejectedZero {
                    request_id,
                    requester,
                    timestamp,
                });
                msg!(
                    "Withdrawal {} rejected: zero amount",
                    bs58::encode(request_id).into_string()
                );
            }
        }
        Ok(())
    }

    /// Reclaim the amount locked by a request the attesters never settled
    pub fn cancel_timed_out_withdrawal(
        ctx: Context<CancelTimedOut>,
        request_id: RequestId,
    ) -> Result<()> {
        let caller = ctx.accounts.requester.key();
        let now = Clock::get()?.unix_timestamp;
        let CancelTimedOut {
            vault,
            user_ledger,
            withdrawal,
            ..
        } = &mut *ctx.accounts;

        guarded(vault, |vault| {
            let mut engine = CoprocessorEngine::new(vault.address, vault.handle_nonce);
            registry::cancel_timed_out_withdrawal(
                &mut engine,
                vault,
                user_ledger,
                withdrawal,
                caller,
                &request_id,
                now,
            )?;
            publish_journal(vault, engine);
            Ok(())
        })?;

        emit!(WithdrawalCancelled {
            request_id,
            requester: withdrawal.requester,
            reason: CancelReason::Timeout,
            timestamp: now,
        });

        msg!(
            "Withdrawal {} cancelled after timeout",
            bs58::encode(request_id).into_string()
        );
        Ok(())
    }

    // Views

    pub fn balance_handle(ctx: Context<ReadLedger>) -> Result<[u8; 32]> {
        Ok(ctx.accounts.user_ledger.balance_handle())
    }

    pub fn aggregate_handle(ctx: Context<ReadVault>) -> Result<[u8; 32]> {
        Ok(ctx.accounts.vault.aggregate_handle())
    }

    /// Lamports the vault can pay out
    pub fn liquid_reserve(ctx: Context<ReadVault>) -> Result<u64> {
        let rent_floor = Rent::get()?.minimum_balance(Vault::LEN);
        Ok(ctx
            .accounts
            .vault
            .to_account_info()
            .lamports()
            .saturating_sub(rent_floor))
    }

    pub fn active_requests(ctx: Context<ReadLedger>) -> Result<Vec<RequestId>> {
        Ok(ctx.accounts.user_ledger.active.ids.clone())
    }

    pub fn active_request_count(ctx: Context<ReadLedger>) -> Result<u8> {
        ctx.accounts.user_ledger.active.count()
    }

    /// Nonce the next `request_withdraw` of this ledger must pass
    pub fn next_request_nonce(ctx: Context<ReadLedger>) -> Result<u64> {
        Ok(ctx.accounts.user_ledger.request_nonce)
    }

    pub fn pending_withdrawal(
        ctx: Context<ReadWithdrawal>,
        request_id: RequestId,
    ) -> Result<PendingWithdrawal> {
        let record = &ctx.accounts.withdrawal;
        require!(record.request_id == request_id, VaultError::RequestNotFound);
        Ok(PendingWithdrawal::clone(record))
    }

    pub fn can_cancel(ctx: Context<ReadWithdrawal>, request_id: RequestId) -> Result<bool> {
        let now = Clock::get()?.unix_timestamp;
        let record = &ctx.accounts.withdrawal;
        Ok(record.request_id == request_id && record.can_cancel(now))
    }

    pub fn protocol_version(_ctx: Context<ReadVersion>) -> Result<String> {
        Ok(PROTOCOL_VERSION.to_string())
    }
}

/// Write back the handle nonce and hand the journal to the coprocessor
fn publish_journal(vault: &mut Vault, engine: CoprocessorEngine) {
    vault.handle_nonce = engine.nonce();
    let ops = engine.into_journal();
    if !ops.is_empty() {
        emit!(SealedComputation { ops });
    }
}

/// Pays out of the vault PDA by moving lamports directly
///
/// The vault is owned by this program, so no system transfer is needed.
struct LamportPayout<'info> {
    vault: AccountInfo<'info>,
    recipient: AccountInfo<'info>,
    rent_floor: u64,
}

impl Payout for LamportPayout<'_> {
    fn recipient(&self) -> Pubkey {
        self.recipient.key()
    }

    fn liquidity(&self) -> u64 {
        self.vault.lamports().saturating_sub(self.rent_floor)
    }

    fn pay(&mut self, amount: u64) -> Result<()> {
        let vault_lamports = self
            .vault
            .lamports()
            .checked_sub(amount)
            .ok_or(VaultError::TransferFailed)?;
        let recipient_lamports = self
            .recipient
            .lamports()
            .checked_add(amount)
            .ok_or(VaultError::TransferFailed)?;

        **self
            .vault
            .try_borrow_mut_lamports()
            .map_err(|_| error!(VaultError::TransferFailed))? = vault_lamports;
        **self
            .recipient
            .try_borrow_mut_lamports()
            .map_err(|_| error!(VaultError::TransferFailed))? = recipient_lamports;
        Ok(())
    }
}

// ===================================
// ACCOUNTS
// ===================================

#[derive(Accounts)]
pub struct Initialize<'info> {
    #[account(mut)]
    pub authority: Signer<'info>,

    #[account(
        init,
        payer = authority,
        space = Vault::LEN,
        seeds = [VAULT_SEED],
        bump
    )]
    pub vault: Account<'info, Vault>,

    pub system_program: Program<'info, System>,
}

#[derive(Accounts)]
pub struct RotateAttesters<'info> {
    pub authority: Signer<'info>,

    #[account(
        mut,
        seeds = [VAULT_SEED],
        bump = vault.bump,
        has_one = authority @ VaultError::Unauthorized
    )]
    pub vault: Account<'info, Vault>,
}

#[derive(Accounts)]
pub struct Deposit<'info> {
    #[account(mut)]
    pub depositor: Signer<'info>,

    #[account(
        mut,
        seeds = [VAULT_SEED],
        bump = vault.bump
    )]
    pub vault: Account<'info, Vault>,

    #[account(
        init_if_needed,
        payer = depositor,
        space = UserLedger::LEN,
        seeds = [LEDGER_SEED, depositor.key().as_ref()],
        bump
    )]
    pub user_ledger: Account<'info, UserLedger>,

    pub system_program: Program<'info, System>,
}

#[derive(Accounts)]
#[instruction(request_nonce: u64)]
pub struct RequestWithdraw<'info> {
    #[account(mut)]
    pub requester: Signer<'info>,

    #[account(
        mut,
        seeds = [VAULT_SEED],
        bump = vault.bump
    )]
    pub vault: Account<'info, Vault>,

    #[account(
        init_if_needed,
        payer = requester,
        space = UserLedger::LEN,
        seeds = [LEDGER_SEED, requester.key().as_ref()],
        bump
    )]
    pub user_ledger: Account<'info, UserLedger>,

    #[account(
        init,
        payer = requester,
        space = PendingWithdrawal::LEN,
        seeds = [WITHDRAWAL_SEED, requester.key().as_ref(), &request_nonce.to_le_bytes()],
        bump
    )]
    pub withdrawal: Account<'info, PendingWithdrawal>,

    #[account(address = ::anchor_lang::solana_program::sysvar::instructions::ID)]
    /// CHECK: instructions_sysvar, checked by the account constraint
    pub instructions_sysvar: AccountInfo<'info>,

    pub system_program: Program<'info, System>,
}

#[derive(Accounts)]
pub struct FinalizeWithdrawal<'info> {
    /// Whoever relays the attestation
    pub relayer: Signer<'info>,

    #[account(
        mut,
        seeds = [VAULT_SEED],
        bump = vault.bump
    )]
    pub vault: Account<'info, Vault>,

    /// Requester's ledger, matched against the request
    #[account(
        mut,
        seeds = [LEDGER_SEED, user_ledger.owner.as_ref()],
        bump = user_ledger.bump
    )]
    pub user_ledger: Account<'info, UserLedger>,

    #[account(
        mut,
        seeds = [WITHDRAWAL_SEED, withdrawal.requester.as_ref(), &withdrawal.nonce.to_le_bytes()],
        bump = withdrawal.bump
    )]
    pub withdrawal: Account<'info, PendingWithdrawal>,

    /// CHECK: matched against the request's recipient before any payout
    #[account(mut)]
    pub recipient: UncheckedAccount<'info>,

    #[account(address = ::anchor_lang::solana_program::sysvar::instructions::ID)]
    /// CHECK: instructions_sysvar, checked by the account constraint
    pub instructions_sysvar: AccountInfo<'info>,
}

#[derive(Accounts)]
pub struct CancelTimedOut<'info> {
    pub requester: Signer<'info>,

    #[account(
        mut,
        seeds = [VAULT_SEED],
        bump = vault.bump
    )]
    pub vault: Account<'info, Vault>,

    #[account(
        mut,
        seeds = [LEDGER_SEED, user_ledger.owner.as_ref()],
        bump = user_ledger.bump
    )]
    pub user_ledger: Account<'info, UserLedger>,

    #[account(
        mut,
        seeds = [WITHDRAWAL_SEED, withdrawal.requester.as_ref(), &withdrawal.nonce.to_le_bytes()],
        bump = withdrawal.bump
    )]
    pub withdrawal: Account<'info, PendingWithdrawal>,
}

#[derive(Accounts)]
pub struct ReadVault<'info> {
    #[account(seeds = [VAULT_SEED], bump = vault.bump)]
    pub vault: Account<'info, Vault>,
}

#[derive(Accounts)]
pub struct ReadLedger<'info> {
    #[account(
        seeds = [LEDGER_SEED, user_ledger.owner.as_ref()],
        bump = user_ledger.bump
    )]
    pub user_ledger: Account<'info, UserLedger>,
}

#[derive(Accounts)]
pub struct ReadWithdrawal<'info> {
    #[account(
        seeds = [WITHDRAWAL_SEED, withdrawal.requester.as_ref(), &withdrawal.nonce.to_le_bytes()],
        bump = withdrawal.bump
    )]
    pub withdrawal: Account<'info, PendingWithdrawal>,
}

#[derive(Accounts)]
pub struct ReadVersion {}
