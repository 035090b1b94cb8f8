use anchor_lang::prelude::*;

use crate::registry::RequestId;
use crate::sealed::{Handle, SealedOp};

/// Emitted after a deposit is credited
#[event]
pub struct DepositEvent {
    pub account: Pubkey,
    /// Deposits are public, only balances are sealed
    pub amount: u64,
    pub balance_handle: Handle,
    pub aggregate_handle: Handle,
    pub timestamp: i64,
}

/// Emitted when a withdrawal request is opened
///
/// `commitment` is what the attesters decrypt and sign over.
#[event]
pub struct WithdrawalRequested {
    pub request_id: RequestId,
    pub requester: Pubkey,
    pub recipient: Pubkey,
    pub commitment: Handle,
    pub created_at: i64,
}

#[event]
pub struct Withdrawn {
    pub request_id: RequestId,
    pub requester: Pubkey,
    pub recipient: Pubkey,
    pub amount: u64,
    pub timestamp: i64,
}

/// The clamped amount decrypted to zero, no payout
#[event]
pub struct WithdrawalRejectedZero {
    pub request_id: RequestId,
    pub requester: Pubkey,
    pub timestamp: i64,
}

#[derive(AnchorSerialize, AnchorDeserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelReason {
    Timeout,
}

#[event]
pub struct WithdrawalCancelled {
    pub request_id: RequestId,
    pub requester: Pubkey,
    pub reason: CancelReason,
    pub timestamp: i64,
}

/// Homomorphic operations the coprocessor must evaluate, in order
#[event]
pub struct SealedComputation {
    pub ops: Vec<SealedOp>,
}

#[event]
pub struct AttestersRotated {
    pub threshold: u8,
    pub members: u8,
    pub timestamp: i64,
}
