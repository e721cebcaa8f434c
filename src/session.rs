// VaultCore: firmware core for a hardware cryptocurrency wallet
//
// This software is distributed without any warranty.

//! The volatile `SessionState` (`spec.md` §3 "Volatile entities"): the
//! unwrapped storage key, cached PIN flag, cached passphrase, cached BIP-39
//! seed, and the flag recording whether that seed was derived with or
//! without a passphrase.
//!
//! Owned by the dispatcher, never touched by interrupt handlers (`spec.md`
//! §5 "Shared resources"). Every confidential field is zeroized by
//! [`SessionState::session_clear`], mirroring `original_source`'s
//! `session_clear`/`memzero` pattern.

use crate::secret::{Passphrase, Seed, StorageKey};

/// Volatile, per-boot session cache (`spec.md` §3 `SessionState`).
pub struct SessionState {
    storage_key: Option<StorageKey>,
    pin_cached: bool,
    passphrase: Passphrase,
    passphrase_cached: bool,
    seed: Seed,
    seed_cached: bool,
    seed_uses_passphrase: bool,
}

impl Default for SessionState {
    fn default() -> Self {
        SessionState::new()
    }
}

impl SessionState {
    pub fn new() -> Self {
        SessionState {
            storage_key: None,
            pin_cached: false,
            passphrase: Passphrase::empty(),
            passphrase_cached: false,
            seed: Seed::zero(),
            seed_cached: false,
            seed_uses_passphrase: false,
        }
    }

    /// Clears the session (`spec.md` §3 "Cleared when: `session_clear`
    /// (keeps PIN cache optionally)"). `keep_pin` is `true` for the
    /// `Initialize` unwind path and `false` for `ClearSession`/wipe.
    pub fn session_clear(&mut self, keep_pin: bool) {
        self.passphrase = Passphrase::empty();
        self.passphrase_cached = false;
        self.seed = Seed::zero();
        self.seed_cached = false;
        self.seed_uses_passphrase = false;
        if !keep_pin {
            self.storage_key = None;
            self.pin_cached = false;
        }
    }

    pub fn cache_storage_key(&mut self, key: StorageKey) {
        self.storage_key = Some(key);
        self.pin_cached = true;
    }

    pub fn storage_key(&self) -> Option<&StorageKey> {
        self.storage_key.as_ref()
    }

    pub fn is_pin_cached(&self) -> bool {
        self.pin_cached
    }

    pub fn cache_passphrase(&mut self, passphrase: Passphrase) {
        self.passphrase = passphrase;
        self.passphrase_cached = true;
    }

    pub fn is_passphrase_cached(&self) -> bool {
        self.passphrase_cached
    }

    pub fn passphrase(&self) -> &Passphrase {
        &self.passphrase
    }

    /// Caches a freshly derived BIP-39 seed, tagged with whether it used a
    /// passphrase. `get_root_node` re-derives whenever `use_passphrase`
    /// disagrees with this flag (`spec.md` §4.1: "cache invalidates when
    /// curve or passphrase presence changes").
    pub fn cache_seed(&mut self, seed: Seed, uses_passphrase: bool) {
        self.seed = seed;
        self.seed_cached = true;
        self.seed_uses_passphrase = uses_passphrase;
    }

    pub fn cached_seed(&self) -> Option<(&Seed, bool)> {
        if self.seed_cached {
            Some((&self.seed, self.seed_uses_passphrase))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_session_has_nothing_cached() {
        let session = SessionState::new();
        assert!(!session.is_pin_cached());
        assert!(!session.is_passphrase_cached());
        assert!(session.cached_seed().is_none());
    }

    #[test]
    fn session_clear_keep_pin_preserves_storage_key() {
        let mut session = SessionState::new();
        session.cache_storage_key(StorageKey::zero());
        session.cache_passphrase(Passphrase::try_from_str("x").unwrap());
        session.cache_seed(Seed::zero(), true);

        session.session_clear(true);
        assert!(session.is_pin_cached());
        assert!(!session.is_passphrase_cached());
        assert!(session.cached_seed().is_none());
    }

    #[test]
    fn session_clear_without_keep_pin_drops_storage_key() {
        let mut session = SessionState::new();
        session.cache_storage_key(StorageKey::zero());
        session.session_clear(false);
        assert!(!session.is_pin_cached());
        assert!(session.storage_key().is_none());
    }
}
