// VaultCore: firmware core for a hardware cryptocurrency wallet
//
// This software is distributed without any warranty.

//! The public (unencrypted but integrity-checked) configuration block
//! (`spec.md` §3 `PublicConfig`). Everything here is readable without a PIN;
//! nothing confidential is stored in the clear -- the key material fields
//! hold only the *wrapped* (still-encrypted) keys and their fingerprints.

use crate::policy::PolicyTable;
use crate::storage::encrypted_sec::HdNodeRaw;
use crate::storage::layout::{
    HARDWARE_ENTROPY_LEN, HD_NODE_LEN, LABEL_LEN, LANGUAGE_LEN, POLICY_TABLE_LEN, PUBLIC_CONFIG_LEN,
};

/// Bit flags packed into `PublicConfig.flags` (`spec.md` §3 "flag bits:
/// has_pin, has_label, has_language, imported, passphrase_protected,
/// no_backup, has_node, has_mnemonic, has_u2froot, has_wipe_code,
/// sca_hardened, v15_16_trans, has_sec_fingerprint").
#[derive(Clone, Copy, Eq, PartialEq, Debug, Default)]
pub struct ConfigFlags {
    pub initialized: bool,
    pub passphrase_protection: bool,
    pub imported: bool,
    pub has_pin: bool,
    pub has_wipe_code: bool,
    pub has_node: bool,
    pub has_mnemonic: bool,
    pub has_u2f_root: bool,
    pub has_sec_fingerprint: bool,
    pub no_backup: bool,
    /// Set once a device has been wrapped under the current (post-v16)
    /// SCA-hardened scheme (`wrap::WrapScheme::ScaHardened`).
    pub sca_hardened: bool,
    /// Set once a device has passed through the v15->v16 transitional
    /// wrapping scheme (`wrap::WrapScheme::LegacyPbkdf2`); unset on a
    /// device old enough to only have ever seen plain `SHA-512(pin)`
    /// wrapping (`wrap::WrapScheme::LegacySha512`).
    pub v15_16_trans: bool,
}

impl ConfigFlags {
    const INITIALIZED: u16 = 1 << 0;
    const PASSPHRASE_PROTECTION: u16 = 1 << 1;
    const IMPORTED: u16 = 1 << 2;
    const HAS_PIN: u16 = 1 << 3;
    const HAS_WIPE_CODE: u16 = 1 << 4;
    const HAS_NODE: u16 = 1 << 5;
    const HAS_MNEMONIC: u16 = 1 << 6;
    const HAS_U2F_ROOT: u16 = 1 << 7;
    const HAS_SEC_FINGERPRINT: u16 = 1 << 8;
    const NO_BACKUP: u16 = 1 << 9;
    const SCA_HARDENED: u16 = 1 << 10;
    const V15_16_TRANS: u16 = 1 << 11;

    pub fn encode(self) -> u16 {
        let mut bits = 0u16;
        if self.initialized {
            bits |= Self::INITIALIZED;
        }
        if self.passphrase_protection {
            bits |= Self::PASSPHRASE_PROTECTION;
        }
        if self.imported {
            bits |= Self::IMPORTED;
        }
        if self.has_pin {
            bits |= Self::HAS_PIN;
        }
        if self.has_wipe_code {
            bits |= Self::HAS_WIPE_CODE;
        }
        if self.has_node {
            bits |= Self::HAS_NODE;
        }
        if self.has_mnemonic {
            bits |= Self::HAS_MNEMONIC;
        }
        if self.has_u2f_root {
            bits |= Self::HAS_U2F_ROOT;
        }
        if self.has_sec_fingerprint {
            bits |= Self::HAS_SEC_FINGERPRINT;
        }
        if self.no_backup {
            bits |= Self::NO_BACKUP;
        }
        if self.sca_hardened {
            bits |= Self::SCA_HARDENED;
        }
        if self.v15_16_trans {
            bits |= Self::V15_16_TRANS;
        }
        bits
    }

    pub fn decode(bits: u16) -> ConfigFlags {
        ConfigFlags {
            initialized: bits & Self::INITIALIZED != 0,
            passphrase_protection: bits & Self::PASSPHRASE_PROTECTION != 0,
            imported: bits & Self::IMPORTED != 0,
            has_pin: bits & Self::HAS_PIN != 0,
            has_wipe_code: bits & Self::HAS_WIPE_CODE != 0,
            has_node: bits & Self::HAS_NODE != 0,
            has_mnemonic: bits & Self::HAS_MNEMONIC != 0,
            has_u2f_root: bits & Self::HAS_U2F_ROOT != 0,
            has_sec_fingerprint: bits & Self::HAS_SEC_FINGERPRINT != 0,
            no_backup: bits & Self::NO_BACKUP != 0,
            sca_hardened: bits & Self::SCA_HARDENED != 0,
            v15_16_trans: bits & Self::V15_16_TRANS != 0,
        }
    }

    /// The wrap scheme an unwrap attempt must use, per `spec.md` §9's Open
    /// Question resolution.
    pub fn wrap_scheme(self) -> crate::crypto::wrap::WrapScheme {
        crate::crypto::wrap::WrapScheme::for_unwrap(self.sca_hardened, self.v15_16_trans)
    }
}

/// The public configuration block, holding everything about a device that
/// doesn't require the PIN to read (`spec.md` §3 `PublicConfig`).
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct PublicConfig {
    pub schema_version: u16,
    pub flags: ConfigFlags,
    pub pin_failed_attempts: u32,
    pub auto_lock_delay_ms: u32,
    pub language: String,
    pub label: String,
    pub wrapped_storage_key: [u8; 64],
    pub storage_key_fingerprint: [u8; 32],
    pub wrapped_wipe_code_key: [u8; 64],
    pub wipe_code_key_fingerprint: [u8; 32],
    pub u2f_root: HdNodeRaw,
    pub u2f_counter: u32,
    pub random_salt: [u8; 32],
    /// Stable per-device wrapping-key salt half (`spec.md` §4.1 "Key
    /// wrapping"). Generated once, on first use, and never redrawn -- see
    /// `storage::layout::HARDWARE_ENTROPY_LEN`.
    pub hardware_entropy: [u8; HARDWARE_ENTROPY_LEN],
    pub policy: PolicyTable,
    pub sec_fingerprint: [u8; 32],
    pub encrypted_sec_version: u16,
}

impl Default for PublicConfig {
    fn default() -> Self {
        PublicConfig {
            schema_version: 0,
            flags: ConfigFlags::default(),
            pin_failed_attempts: 0,
            auto_lock_delay_ms: 10 * 60 * 1000,
            language: "english".to_string(),
            label: String::new(),
            wrapped_storage_key: [0u8; 64],
            storage_key_fingerprint: [0u8; 32],
            wrapped_wipe_code_key: [0u8; 64],
            wipe_code_key_fingerprint: [0u8; 32],
            u2f_root: HdNodeRaw::default(),
            u2f_counter: 0,
            random_salt: [0u8; 32],
            hardware_entropy: [0u8; HARDWARE_ENTROPY_LEN],
            policy: PolicyTable::default(),
            sec_fingerprint: [0u8; 32],
            encrypted_sec_version: 0,
        }
    }
}

impl PublicConfig {
    /// Whether the device has completed `load_device`/`reset_device`
    /// (`spec.md` §4.1: "`initialized` flag gates almost every other
    /// operation").
    pub fn is_initialized(&self) -> bool {
        self.flags.initialized
    }

    /// Truncates `s` into the fixed-width on-flash `language` field
    /// (`spec.md` §3: "language, ≤16 B").
    pub fn set_language(&mut self, s: &str) {
        self.language = truncate_str(s, 16);
    }

    /// Truncates `s` into the fixed-width on-flash `label` field
    /// (`spec.md` §3: "label, ≤48 B").
    pub fn set_label(&mut self, s: &str) {
        self.label = truncate_str(s, 48);
    }

    /// Serializes to the fixed [`crate::storage::layout::PUBLIC_CONFIG_LEN`]-byte
    /// on-flash form, the same fixed-offset style `encrypted_sec.rs` uses for
    /// the secret region.
    pub fn encode(&self) -> [u8; PUBLIC_CONFIG_LEN] {
        let mut buf = [0u8; PUBLIC_CONFIG_LEN];
        let mut off = 0;

        buf[off..off + 2].copy_from_slice(&self.schema_version.to_be_bytes());
        off += 2;
        buf[off..off + 2].copy_from_slice(&self.flags.encode().to_be_bytes());
        off += 2;
        buf[off..off + 4].copy_from_slice(&self.pin_failed_attempts.to_be_bytes());
        off += 4;
        buf[off..off + 4].copy_from_slice(&self.auto_lock_delay_ms.to_be_bytes());
        off += 4;

        write_padded(&mut buf[off..off + LANGUAGE_LEN], &self.language);
        off += LANGUAGE_LEN;
        write_padded(&mut buf[off..off + LABEL_LEN], &self.label);
        off += LABEL_LEN;

        buf[off..off + 64].copy_from_slice(&self.wrapped_storage_key);
        off += 64;
        buf[off..off + 32].copy_from_slice(&self.storage_key_fingerprint);
        off += 32;
        buf[off..off + 64].copy_from_slice(&self.wrapped_wipe_code_key);
        off += 64;
        buf[off..off + 32].copy_from_slice(&self.wipe_code_key_fingerprint);
        off += 32;
        buf[off..off + HD_NODE_LEN].copy_from_slice(&self.u2f_root.encode());
        off += HD_NODE_LEN;
        buf[off..off + 4].copy_from_slice(&self.u2f_counter.to_be_bytes());
        off += 4;
        buf[off..off + 32].copy_from_slice(&self.random_salt);
        off += 32;
        buf[off..off + HARDWARE_ENTROPY_LEN].copy_from_slice(&self.hardware_entropy);
        off += HARDWARE_ENTROPY_LEN;
        buf[off..off + POLICY_TABLE_LEN].copy_from_slice(&self.policy.encode());
        off += POLICY_TABLE_LEN;
        buf[off..off + 32].copy_from_slice(&self.sec_fingerprint);
        off += 32;
        buf[off..off + 2].copy_from_slice(&self.encrypted_sec_version.to_be_bytes());
        off += 2;

        debug_assert_eq!(off, PUBLIC_CONFIG_LEN);
        buf
    }

    /// Inverse of [`Self::encode`].
    pub fn decode(buf: &[u8; PUBLIC_CONFIG_LEN]) -> PublicConfig {
        let mut off = 0;

        let schema_version = u16::from_be_bytes(buf[off..off + 2].try_into().unwrap());
        off += 2;
        let flags = ConfigFlags::decode(u16::from_be_bytes(buf[off..off + 2].try_into().unwrap()));
        off += 2;
        let pin_failed_attempts = u32::from_be_bytes(buf[off..off + 4].try_into().unwrap());
        off += 4;
        let auto_lock_delay_ms = u32::from_be_bytes(buf[off..off + 4].try_into().unwrap());
        off += 4;

        let language = read_padded(&buf[off..off + LANGUAGE_LEN]);
        off += LANGUAGE_LEN;
        let label = read_padded(&buf[off..off + LABEL_LEN]);
        off += LABEL_LEN;

        let mut wrapped_storage_key = [0u8; 64];
        wrapped_storage_key.copy_from_slice(&buf[off..off + 64]);
        off += 64;
        let mut storage_key_fingerprint = [0u8; 32];
        storage_key_fingerprint.copy_from_slice(&buf[off..off + 32]);
        off += 32;
        let mut wrapped_wipe_code_key = [0u8; 64];
        wrapped_wipe_code_key.copy_from_slice(&buf[off..off + 64]);
        off += 64;
        let mut wipe_code_key_fingerprint = [0u8; 32];
        wipe_code_key_fingerprint.copy_from_slice(&buf[off..off + 32]);
        off += 32;

        let mut node_buf = [0u8; HD_NODE_LEN];
        node_buf.copy_from_slice(&buf[off..off + HD_NODE_LEN]);
        let u2f_root = HdNodeRaw::decode(&node_buf);
        off += HD_NODE_LEN;

        let u2f_counter = u32::from_be_bytes(buf[off..off + 4].try_into().unwrap());
        off += 4;
        let mut random_salt = [0u8; 32];
        random_salt.copy_from_slice(&buf[off..off + 32]);
        off += 32;

        let mut hardware_entropy = [0u8; HARDWARE_ENTROPY_LEN];
        hardware_entropy.copy_from_slice(&buf[off..off + HARDWARE_ENTROPY_LEN]);
        off += HARDWARE_ENTROPY_LEN;

        let mut policy_buf = [0u8; POLICY_TABLE_LEN];
        policy_buf.copy_from_slice(&buf[off..off + POLICY_TABLE_LEN]);
        let policy = PolicyTable::decode(&policy_buf);
        off += POLICY_TABLE_LEN;

        let mut sec_fingerprint = [0u8; 32];
        sec_fingerprint.copy_from_slice(&buf[off..off + 32]);
        off += 32;
        let encrypted_sec_version = u16::from_be_bytes(buf[off..off + 2].try_into().unwrap());
        off += 2;

        debug_assert_eq!(off, PUBLIC_CONFIG_LEN);
        PublicConfig {
            schema_version,
            flags,
            pin_failed_attempts,
            auto_lock_delay_ms,
            language,
            label,
            wrapped_storage_key,
            storage_key_fingerprint,
            wrapped_wipe_code_key,
            wipe_code_key_fingerprint,
            u2f_root,
            u2f_counter,
            random_salt,
            hardware_entropy,
            policy,
            sec_fingerprint,
            encrypted_sec_version,
        }
    }
}

fn write_padded(dest: &mut [u8], s: &str) {
    let bytes = s.as_bytes();
    let len = bytes.len().min(dest.len());
    dest[..len].copy_from_slice(&bytes[..len]);
}

fn read_padded(src: &[u8]) -> String {
    let nul = src.iter().position(|&b| b == 0).unwrap_or(src.len());
    String::from_utf8_lossy(&src[..nul]).into_owned()
}

fn truncate_str(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_encode_decode_roundtrip() {
        let flags = ConfigFlags {
            initialized: true,
            passphrase_protection: false,
            imported: true,
            has_pin: true,
            has_wipe_code: false,
            has_node: true,
            has_mnemonic: false,
            has_u2f_root: true,
            has_sec_fingerprint: true,
            no_backup: false,
            sca_hardened: true,
            v15_16_trans: true,
        };
        assert_eq!(ConfigFlags::decode(flags.encode()), flags);
    }

    #[test]
    fn legacy_flags_select_legacy_wrap_scheme() {
        let flags = ConfigFlags::default();
        assert_eq!(flags.wrap_scheme(), crate::crypto::wrap::WrapScheme::LegacySha512);
    }

    #[test]
    fn public_config_encode_decode_roundtrips() {
        let mut config = PublicConfig::default();
        config.schema_version = 16;
        config.flags.initialized = true;
        config.flags.has_pin = true;
        config.set_label("my wallet");
        config.set_language("english");
        config.wrapped_storage_key = [0x11; 64];
        config.storage_key_fingerprint = [0x22; 32];
        config.policy.set(crate::policy::PolicyId::Exchange, true);
        let decoded = PublicConfig::decode(&config.encode());
        assert_eq!(decoded, config);
    }

    #[test]
    fn default_config_is_uninitialized() {
        assert!(!PublicConfig::default().is_initialized());
    }

    #[test]
    fn label_is_truncated_to_48_bytes() {
        let mut config = PublicConfig::default();
        config.set_label(&"x".repeat(60));
        assert_eq!(config.label.len(), 48);
    }
}
