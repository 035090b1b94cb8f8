//! Sealed values - opaque encrypted scalars
//!
//! A sealed value is a 32-byte handle to a 64-bit ciphertext held by the
//! encryption coprocessor, plus the access list of parties allowed to ask
//! for its decryption. The program never sees ciphertexts: it derives result
//! handles for every homomorphic operation and journals the operation so the
//! coprocessor can evaluate it off-chain.
//!
//! ## Access control
//!
//! Every derived value starts with an empty access list. Callers must grant
//! decryption again after each operation whose result has to stay readable,
//! otherwise the value is opaque to everyone, forever.
//!
//! ## Branching
//!
//! There is no branching on sealed data. `select` is the only conditional.

use anchor_lang::prelude::*;
use sha2::{Digest, Sha256};

use crate::errors::VaultError;

/// Opaque fixed-size reference to a ciphertext
pub type Handle = [u8; 32];

/// Named decrypt holders plus the public flag
#[derive(AnchorSerialize, AnchorDeserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct AccessList {
    pub holders: Vec<Pubkey>,
    pub public: bool,
}

impl AccessList {
    /// Owner and ledger
    pub const MAX_HOLDERS: usize = 2;

    pub const LEN: usize = 4 + (32 * Self::MAX_HOLDERS) + 1;

    pub fn allows(&self, who: &Pubkey) -> bool {
        self.public || self.holders.contains(who)
    }
}

/// Encrypted 64-bit scalar
#[derive(AnchorSerialize, AnchorDeserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct SealedValue {
    pub handle: Handle,
    pub access: AccessList,
}

impl SealedValue {
    pub const LEN: usize = 32 + AccessList::LEN;

    /// Fresh result of an operation, readable by nobody
    pub fn derived(handle: Handle) -> Self {
        Self {
            handle,
            access: AccessList::default(),
        }
    }

    /// Allow `holder` to request decryption of this value
    pub fn grant_decrypt(&mut self, holder: Pubkey) -> Result<()> {
        if self.access.holders.contains(&holder) {
            return Ok(());
        }
        require!(
            self.access.holders.len() < AccessList::MAX_HOLDERS,
            VaultError::TooManyGrants
        );
        self.access.holders.push(holder);
        Ok(())
    }

    pub fn make_publicly_decryptable(&mut self) {
        self.access.public = true;
    }

    pub fn commitment_handle(&self) -> Handle {
        self.handle
    }

    pub fn can_decrypt(&self, who: &Pubkey) -> bool {
        self.access.allows(who)
    }

    pub fn is_public(&self) -> bool {
        self.access.public
    }
}

/// Encrypted boolean, only ever consumed by `select`
#[derive(AnchorSerialize, AnchorDeserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct SealedBool {
    pub handle: Handle,
}

/// Client-encrypted amount submitted with an instruction
#[derive(AnchorSerialize, AnchorDeserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExternalSealed {
    pub handle: Handle,
}

/// One homomorphic step, replayed by the coprocessor
#[derive(AnchorSerialize, AnchorDeserialize, Clone, Debug, PartialEq, Eq)]
pub enum SealedOp {
    Seal {
        result: Handle,
        plaintext: u64,
    },
    Admit {
        result: Handle,
        input: Handle,
    },
    Add {
        result: Handle,
        lhs: Handle,
        rhs: Handle,
    },
    Sub {
        result: Handle,
        lhs: Handle,
        rhs: Handle,
    },
    Le {
        result: Handle,
        lhs: Handle,
        rhs: Handle,
    },
    Select {
        result: Handle,
        cond: Handle,
        if_true: Handle,
        if_false: Handle,
    },
}

/// Homomorphic capability used by the ledger
pub trait SealedEngine {
    fn seal(&mut self, plaintext: u64) -> Result<SealedValue>;

    /// Turn a verified client input into a sealed value
    fn admit(&mut self, input: &ExternalSealed) -> Result<SealedValue>;

    fn add(&mut self, lhs: &SealedValue, rhs: &SealedValue) -> Result<SealedValue>;

    fn sub(&mut self, lhs: &SealedValue, rhs: &SealedValue) -> Result<SealedValue>;

    /// `lhs <= rhs`
    fn le(&mut self, lhs: &SealedValue, rhs: &SealedValue) -> Result<SealedBool>;

    fn select(
        &mut self,
        cond: &SealedBool,
        if_true: &SealedValue,
        if_false: &SealedValue,
    ) -> Result<SealedValue>;
}

const OP_SEAL: u8 = 0;
const OP_ADMIT: u8 = 1;
const OP_ADD: u8 = 2;
const OP_SUB: u8 = 3;
const OP_LE: u8 = 4;
const OP_SELECT: u8 = 5;

/// Symbolic engine used on-chain
///
/// Result handles are `SHA-256(tag, domain, op, operands, nonce)`, so two
/// operations never share a handle even over identical operands.
pub struct CoprocessorEngine {
    domain: Pubkey,
    nonce: u64,
    journal: Vec<SealedOp>,
}

impl CoprocessorEngine {
    pub fn new(domain: Pubkey, nonce: u64) -> Self {
        Self {
            domain,
            nonce,
            journal: Vec::new(),
        }
    }

    /// Next unused handle nonce, to be persisted by the caller
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn journal(&self) -> &[SealedOp] {
        &self.journal
    }

    pub fn into_journal(self) -> Vec<SealedOp> {
        self.journal
    }

    fn next_handle(&mut self, op: u8, operands: &[&Handle]) -> Result<Handle> {
        let mut hasher = Sha256::new();
        hasher.update(b"sealed_vault/handle/v1");
        hasher.update(self.domain.as_ref());
        hasher.update([op]);
        for operand in operands {
            hasher.update(operand);
        }
        hasher.update(self.nonce.to_le_bytes());

        self.nonce = self
            .nonce
            .checked_add(1)
            .ok_or(VaultError::ArithmeticOverflow)?;

        let mut handle = [0u8; 32];
        handle.copy_from_slice(&hasher.finalize());
        Ok(handle)
    }
}

impl SealedEngine for CoprocessorEngine {
    fn seal(&mut self, plaintext: u64) -> Result<SealedValue> {
        let result = self.next_handle(OP_SEAL, &[&plaintext_operand(plaintext)])?;
        self.journal.push(SealedOp::Seal { result, plaintext });
        Ok(SealedValue::derived(result))
    }

    fn admit(&mut self, input: &ExternalSealed) -> Result<SealedValue> {
        let result = self.next_handle(OP_ADMIT, &[&input.handle])?;
        self.journal.push(SealedOp::Admit {
            result,
            input: input.handle,
        });
        Ok(SealedValue::derived(result))
    }

    fn add(&mut self, lhs: &SealedValue, rhs: &SealedValue) -> Result<SealedValue> {
        let result = self.next_handle(OP_ADD, &[&lhs.handle, &rhs.handle])?;
        self.journal.push(SealedOp::Add {
            result,
            lhs: lhs.handle,
            rhs: rhs.handle,
        });
        Ok(SealedValue::derived(result))
    }

    fn sub(&mut self, lhs: &SealedValue, rhs: &SealedValue) -> Result<SealedValue> {
        let result = self.next_handle(OP_SUB, &[&lhs.handle, &rhs.handle])?;
        self.journal.push(SealedOp::Sub {
            result,
            lhs: lhs.handle,
            rhs: rhs.handle,
        });
        Ok(SealedValue::derived(result))
    }

    fn le(&mut self, lhs: &SealedValue, rhs: &SealedValue) -> Result<SealedBool> {
        let result = self.next_handle(OP_LE, &[&lhs.handle, &rhs.handle])?;
        self.journal.push(SealedOp::Le {
            result,
            lhs: lhs.handle,
            rhs: rhs.handle,
        });
        Ok(SealedBool { handle: result })
    }

    fn select(
        &mut self,
        cond: &SealedBool,
        if_true: &SealedValue,
        if_false: &SealedValue,
    ) -> Result<SealedValue> {
        let result = self.next_handle(
            OP_SELECT,
            &[&cond.handle, &if_true.handle, &if_false.handle],
        )?;
        self.journal.push(SealedOp::Select {
            result,
            cond: cond.handle,
            if_true: if_true.handle,
            if_false: if_false.handle,
        });
        Ok(SealedValue::derived(result))
    }
}

fn plaintext_operand(plaintext: u64) -> Handle {
    let mut operand = [0u8; 32];
    operand[..8].copy_from_slice(&plaintext.to_le_bytes());
    operand
}
