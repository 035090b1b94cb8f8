use anchor_lang::prelude::*;

#[error_code]
pub enum VaultError {
    #[msg("Deposit amount must be greater than zero")]
    InvalidDepositAmount,
    #[msg("Deposit exceeds the sealed value width")]
    DepositTooLarge,
    #[msg("Recipient cannot be the null address")]
    InvalidRecipient,
    #[msg("Account already has the maximum number of active withdrawal requests")]
    TooManyActiveRequests,
    #[msg("Withdrawal request not found")]
    RequestNotFound,
    #[msg("Withdrawal request already processed")]
    RequestAlreadyProcessed,
    #[msg("Caller is not the requester of this withdrawal")]
    NotRequestOwner,
    #[msg("Withdrawal has not timed out yet")]
    WithdrawalNotTimedOut,
    #[msg("Vault does not hold enough liquidity for this withdrawal")]
    InsufficientVaultBalance,
    #[msg("Lamport transfer to the recipient failed")]
    TransferFailed,
    #[msg("Decryption attestation did not verify")]
    InvalidAttestation,
    #[msg("Input proof for the encrypted amount did not verify")]
    InvalidInputProof,
    #[msg("Re-entrant call into a guarded entry point")]
    ReentrantCall,
    #[msg("Account does not belong to this withdrawal request")]
    AccountMismatch,
    #[msg("Invalid attester set")]
    InvalidAttesterSet,
    #[msg("Signer is not the vault authority")]
    Unauthorized,
    #[msg("Sealed value already has the maximum number of decrypt grants")]
    TooManyGrants,
    #[msg("Arithmetic overflow")]
    ArithmeticOverflow,
}
