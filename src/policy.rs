// VaultCore: firmware core for a hardware cryptocurrency wallet
//
// This software is distributed without any warranty.

//! The device policy table (`spec.md` §4.1 `get_policy`/`set_policy`/
//! `is_policy_enabled`). Grounded in the original firmware's single
//! named policy gate (`policy.c`: `storage_isPolicyEnabled("ShapeShift")`),
//! generalized into a small closed enum the way the teacher crate models
//! its own `PolicyType` (`src/model/policy.rs`).

use serde::{Deserialize, Serialize};

#[derive(
    Clone, Copy, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Display, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum PolicyId {
    /// Gates the exchange policy hook (`spec.md` §4.9): an `EXCHANGE`
    /// output is only honored when this policy is enabled.
    #[display("exchange")]
    Exchange,

    /// Enables advanced-mode confirmation screens (full derivation paths,
    /// raw script hex) rather than the simplified defaults.
    #[display("advanced-mode")]
    AdvancedMode,

    /// Disables the "no backup" warning banner shown on the home screen
    /// after `ResetDevice(no_backup=true)`.
    #[display("suppress-no-backup-warning")]
    SuppressNoBackupWarning,
}

pub const ALL_POLICIES: [PolicyId; 3] =
    [PolicyId::Exchange, PolicyId::AdvancedMode, PolicyId::SuppressNoBackupWarning];

/// A fixed-size table of policy enablement flags, persisted verbatim inside
/// `PublicConfig` (`spec.md` §3, "policy table").
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct PolicyTable {
    enabled: [bool; ALL_POLICIES.len()],
}

impl Default for PolicyTable {
    fn default() -> Self {
        PolicyTable { enabled: [false; ALL_POLICIES.len()] }
    }
}

impl PolicyTable {
    fn index(id: PolicyId) -> usize {
        ALL_POLICIES.iter().position(|&p| p == id).expect("PolicyId always in ALL_POLICIES")
    }

    pub fn is_enabled(&self, id: PolicyId) -> bool {
        self.enabled[Self::index(id)]
    }

    pub fn set(&mut self, id: PolicyId, enabled: bool) {
        self.enabled[Self::index(id)] = enabled;
    }

    pub fn iter(&self) -> impl Iterator<Item = (PolicyId, bool)> + '_ {
        ALL_POLICIES.iter().map(move |&id| (id, self.is_enabled(id)))
    }

    pub fn encode(&self) -> [u8; ALL_POLICIES.len()] {
        let mut out = [0u8; ALL_POLICIES.len()];
        for (i, &enabled) in self.enabled.iter().enumerate() {
            out[i] = enabled as u8;
        }
        out
    }

    pub fn decode(bytes: &[u8; ALL_POLICIES.len()]) -> PolicyTable {
        let mut enabled = [false; ALL_POLICIES.len()];
        for (i, &b) in bytes.iter().enumerate() {
            enabled[i] = b != 0;
        }
        PolicyTable { enabled }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_all_disabled() {
        let table = PolicyTable::default();
        assert!(!table.is_enabled(PolicyId::Exchange));
    }

    #[test]
    fn set_then_get_roundtrips() {
        let mut table = PolicyTable::default();
        table.set(PolicyId::Exchange, true);
        assert!(table.is_enabled(PolicyId::Exchange));
        assert!(!table.is_enabled(PolicyId::AdvancedMode));
    }

    #[test]
    fn encode_decode_roundtrips() {
        let mut table = PolicyTable::default();
        table.set(PolicyId::AdvancedMode, true);
        let decoded = PolicyTable::decode(&table.encode());
        assert_eq!(decoded, table);
    }
}
