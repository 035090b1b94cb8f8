//! Threshold attestations
//!
//! Two trust roots sit outside the program:
//!
//! - the **decryption attesters**, who hold the key material of the
//!   coprocessor and sign `(commitment handle, cleartext)` pairs once they
//!   have decrypted a publicly-decryptable value;
//! - the **input verifiers**, who check the zero-knowledge proof of correct
//!   encryption attached to a client ciphertext and sign
//!   `(input handle, owner)`.
//!
//! Both sign plain Ed25519 over a 32-byte digest. The signatures travel in
//! Ed25519 native program instructions placed ahead of ours in the same
//! transaction: the runtime rejects the whole transaction if any of them is
//! invalid, so here we only read them back through the instructions sysvar
//! and count distinct members over the expected digest.

use anchor_lang::prelude::*;
#[allow(deprecated)]
use anchor_lang::solana_program::sysvar::instructions::{
    load_current_index_checked, load_instruction_at_checked,
};
use sha2::{Digest, Sha256};

use crate::errors::VaultError;
use crate::sealed::{ExternalSealed, Handle};

pub const MAX_ATTESTERS: usize = 7;

/// Ed25519 signature verification native program
pub const ED25519_PROGRAM_ID: Pubkey = pubkey!("Ed25519SigVerify111111111111111111111111111");

/// Native program offsets header: count and padding
const SIGNATURE_OFFSETS_START: usize = 2;
/// Seven little-endian u16 fields per signature
const SIGNATURE_OFFSETS_SERIALIZED_SIZE: usize = 14;
const PUBKEY_SIZE: usize = 32;
const SIGNATURE_SIZE: usize = 64;
const DIGEST_SIZE: usize = 32;
/// Instruction index meaning "data lives in this same instruction"
const CURRENT_INSTRUCTION: u16 = u16::MAX;

/// A `(signer, digest)` pair the Ed25519 program has already checked
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VerifiedSignature {
    pub signer: [u8; 32],
    pub message: [u8; 32],
}

/// Ed25519 public keys and signing threshold
#[derive(AnchorSerialize, AnchorDeserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct AttesterSet {
    pub members: Vec<[u8; 32]>,
    pub threshold: u8,
}

impl AttesterSet {
    pub const LEN: usize = 4 + (32 * MAX_ATTESTERS) + 1;

    pub fn new(members: Vec<[u8; 32]>, threshold: u8) -> Result<Self> {
        require!(
            !members.is_empty() && members.len() <= MAX_ATTESTERS,
            VaultError::InvalidAttesterSet
        );
        require!(
            threshold > 0 && threshold as usize <= members.len(),
            VaultError::InvalidAttesterSet
        );
        for (i, member) in members.iter().enumerate() {
            require!(*member != [0u8; 32], VaultError::InvalidAttesterSet);
            require!(
                !members[..i].contains(member),
                VaultError::InvalidAttesterSet
            );
        }

        Ok(Self { members, threshold })
    }

    /// Members of this set, bounded by `MAX_ATTESTERS`
    pub fn size(&self) -> Result<u8> {
        u8::try_from(self.members.len()).map_err(|_| error!(VaultError::ArithmeticOverflow))
    }

    /// True when at least `threshold` distinct members signed `message`
    ///
    /// Signatures over other digests or from outsiders are ignored, so one
    /// transaction can carry an input proof and unrelated signatures.
    pub fn verify(&self, message: &[u8; 32], signatures: &[VerifiedSignature]) -> bool {
        if self.threshold == 0 {
            return false;
        }

        let mut seen = [false; MAX_ATTESTERS];
        let mut count = 0usize;
        for signature in signatures.iter().filter(|s| &s.message == message) {
            let Some(index) = self.members.iter().position(|m| m == &signature.signer) else {
                continue;
            };
            if !seen[index] {
                seen[index] = true;
                count += 1;
            }
        }

        count >= self.threshold as usize
    }

    /// Authenticate that `commitment` decrypts to `clear_amount`
    pub fn verify_decryption(
        &self,
        vault: &Pubkey,
        commitment: &Handle,
        clear_amount: u64,
        signatures: &[VerifiedSignature],
    ) -> Result<()> {
        let message = decryption_message(vault, commitment, clear_amount);
        require!(
            self.verify(&message, signatures),
            VaultError::InvalidAttestation
        );
        Ok(())
    }

    /// Authenticate that `input` is a well-formed ciphertext bound to `owner`
    pub fn verify_input(
        &self,
        vault: &Pubkey,
        input: &ExternalSealed,
        owner: &Pubkey,
        signatures: &[VerifiedSignature],
    ) -> Result<()> {
        let message = input_message(vault, &input.handle, owner);
        require!(
            self.verify(&message, signatures),
            VaultError::InvalidInputProof
        );
        Ok(())
    }
}

pub fn decryption_message(vault: &Pubkey, commitment: &Handle, clear_amount: u64) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"sealed_vault/decryption/v1");
    hasher.update(vault.as_ref());
    hasher.update(commitment);
    hasher.update(clear_amount.to_le_bytes());

    let mut message = [0u8; 32];
    message.copy_from_slice(&hasher.finalize());
    message
}

pub fn input_message(vault: &Pubkey, input: &Handle, owner: &Pubkey) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"sealed_vault/input/v1");
    hasher.update(vault.as_ref());
    hasher.update(input);
    hasher.update(owner.as_ref());

    let mut message = [0u8; 32];
    message.copy_from_slice(&hasher.finalize());
    message
}

fn read_u16(data: &[u8], at: usize) -> Option<u16> {
    let bytes = data.get(at..at + 2)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn read_array<const N: usize>(data: &[u8], offset: u16) -> Option<[u8; N]> {
    let start = offset as usize;
    let bytes = data.get(start..start.checked_add(N)?)?;
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    Some(out)
}

/// Signatures of one Ed25519 program instruction over 32-byte digests
///
/// Only entries whose key, signature and message all sit inside this
/// instruction are returned. Entries pointing at other instructions or
/// signing a message of another size never count as attestations.
pub fn parse_ed25519_instruction(data: &[u8]) -> Result<Vec<VerifiedSignature>> {
    let count = *data.first().ok_or(VaultError::InvalidAttestation)? as usize;
    let mut verified = Vec::with_capacity(count);

    for i in 0..count {
        let at = SIGNATURE_OFFSETS_START + i * SIGNATURE_OFFSETS_SERIALIZED_SIZE;
        let field = |n: usize| read_u16(data, at + 2 * n).ok_or(VaultError::InvalidAttestation);

        let signature_offset = field(0)?;
        let signature_ix = field(1)?;
        let pubkey_offset = field(2)?;
        let pubkey_ix = field(3)?;
        let message_offset = field(4)?;
        let message_size = field(5)?;
        let message_ix = field(6)?;

        let inline = [signature_ix, pubkey_ix, message_ix]
            .iter()
            .all(|ix| *ix == CURRENT_INSTRUCTION);
        if !inline || message_size as usize != DIGEST_SIZE {
            continue;
        }

        // The native program checked the signature, it only has to be in bounds
        read_array::<SIGNATURE_SIZE>(data, signature_offset)
            .ok_or(VaultError::InvalidAttestation)?;
        let signer = read_array::<PUBKEY_SIZE>(data, pubkey_offset)
            .ok_or(VaultError::InvalidAttestation)?;
        let message = read_array::<DIGEST_SIZE>(data, message_offset)
            .ok_or(VaultError::InvalidAttestation)?;

        verified.push(VerifiedSignature { signer, message });
    }

    Ok(verified)
}

/// Every Ed25519 signature checked earlier in the current transaction
#[allow(deprecated)]
pub fn load_verified_signatures(instructions_sysvar: &AccountInfo) -> Result<Vec<VerifiedSignature>> {
    let current = load_current_index_checked(instructions_sysvar)?;

    let mut verified = Vec::new();
    for index in 0..current {
        let instruction = load_instruction_at_checked(index as usize, instructions_sysvar)?;
        if instruction.program_id == ED25519_PROGRAM_ID {
            verified.extend(parse_ed25519_instruction(&instruction.data)?);
        }
    }
    Ok(verified)
}
