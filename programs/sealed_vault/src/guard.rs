use anchor_lang::prelude::*;

use crate::errors::VaultError;

/// Call-depth guard persisted in the vault
///
/// Held for the whole body of every state-mutating entry point, including
/// the deposit CPI and the lamport payout of a finalize, so no guarded entry
/// point can run while another one is still executing against the same vault.
#[derive(AnchorSerialize, AnchorDeserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CallGuard {
    depth: u8,
}

impl CallGuard {
    pub const LEN: usize = 1;

    pub fn enter(&mut self) -> Result<()> {
        require!(self.depth == 0, VaultError::ReentrantCall);
        self.depth = 1;
        Ok(())
    }

    pub fn exit(&mut self) {
        self.depth = 0;
    }

    pub fn is_held(&self) -> bool {
        self.depth != 0
    }
}

/// State that carries a `CallGuard` and can write it back to storage
///
/// A re-entrant call reads the stored account, not our in-memory copy, so
/// the held guard has to be written out before the body runs.
pub trait GuardedState {
    fn guard(&mut self) -> &mut CallGuard;

    fn persist(&mut self) -> Result<()>;
}

/// Run `body` with the guard held and stored
///
/// The release is stored on both success and error. A failed instruction is
/// rolled back by the runtime anyway, so the error path only matters to
/// callers that keep going after an `Err`.
pub fn guarded<S, T, F>(state: &mut S, body: F) -> Result<T>
where
    S: GuardedState,
    F: FnOnce(&mut S) -> Result<T>,
{
    state.guard().enter()?;
    state.persist()?;

    let result = body(state);

    state.guard().exit();
    state.persist()?;
    result
}
