// VaultCore: firmware core for a hardware cryptocurrency wallet
//
// This software is distributed without any warranty.

//! Fixed byte layout constants for the persisted flash entities
//! (`spec.md` §3 and §6). Kept as named constants, per `SPEC_FULL.md`'s
//! "Expansion -- persisted layout constants", rather than scattered magic
//! numbers.

/// Magic tag identifying an active, parseable sector (`spec.md` §6: "magic
/// "stor" + UUID + UUID string").
pub const MAGIC: [u8; 4] = *b"stor";

/// Size of the hardware-derived UUID (`spec.md` §3, §6 "UUID").
pub const UUID_LEN: usize = 12;

/// Size of the hex-string rendering of the UUID, NUL-padded.
pub const UUID_STR_LEN: usize = 25;

/// Bytes reserved in the metadata header for alignment; not meaningfully
/// assigned by `spec.md`, which only totals the header at 44 bytes.
pub const METADATA_RESERVED: usize = 44 - 4 - UUID_LEN - UUID_STR_LEN;

/// Total size of the metadata header (`spec.md` §6: 44 bytes).
pub const METADATA_LEN: usize = 4 + UUID_LEN + UUID_STR_LEN + METADATA_RESERVED;

/// Size of the fixed AES-CBC ciphertext covering the whole secret region
/// (`spec.md` §3, `EncryptedSec`: "fixed 512 B").
pub const ENCRYPTED_SEC_LEN: usize = 512;

/// Offsets within the 512-byte secret-region plaintext (`spec.md` §4.1
/// "Secret encryption"): the precise byte ranges there (`[0..129)`,
/// `[129..370)`, `[370..445)`, `[445..512)`) are authoritative over the
/// bullet list's rounder "128 B"/"75 B" figures, which is why `HD_NODE_LEN`
/// below is 129, not 128.
pub const HD_NODE_LEN: usize = 129;
pub const MNEMONIC_LEN: usize = 241;
pub const SESSION_CACHE_LEN: usize = 75;
pub const SEC_RESERVED_LEN: usize =
    ENCRYPTED_SEC_LEN - HD_NODE_LEN - MNEMONIC_LEN - SESSION_CACHE_LEN;

pub const HD_NODE_OFFSET: usize = 0;
pub const MNEMONIC_OFFSET: usize = HD_NODE_OFFSET + HD_NODE_LEN;
pub const SESSION_CACHE_OFFSET: usize = MNEMONIC_OFFSET + MNEMONIC_LEN;
pub const SEC_RESERVED_OFFSET: usize = SESSION_CACHE_OFFSET + SESSION_CACHE_LEN;

/// Fixed-width NUL-padded field lengths inside `PublicConfig` (`spec.md`
/// §3: "language ≤16, label ≤48").
pub const LANGUAGE_LEN: usize = 16;
pub const LABEL_LEN: usize = 48;

/// Number of policy-table bytes persisted inline in `PublicConfig`
/// (`crate::policy::ALL_POLICIES.len()`, fixed here to avoid a circular
/// `const` dependency between `storage::layout` and `policy`).
pub const POLICY_TABLE_LEN: usize = 3;

/// Size of the stable per-device hardware-entropy value (`spec.md` §4.1
/// "Key wrapping": `salt = hardware_entropy(32) || public_config.random_salt(32)`).
/// `original_source/lib/firmware/storage.c`'s `flash_readHWEntropy` reads
/// this from a fixed flash region that is written once and never rotates,
/// the same lifecycle as `random_salt`; it is persisted here as a
/// `PublicConfig` field (generated once, on first use, by
/// `StorageEngine::hardware_entropy`) rather than redrawn from the RNG on
/// every PIN check, which would change the derived wrapping key out from
/// under an already-set PIN.
pub const HARDWARE_ENTROPY_LEN: usize = 32;

/// Total encoded size of `PublicConfig` (`spec.md` §3), computed from its
/// fixed-width fields: 2 (schema_version) + 2 (flags) + 4 (pin_failed_attempts)
/// + 4 (auto_lock_delay_ms) + `LANGUAGE_LEN` + `LABEL_LEN` + 64
/// (wrapped_storage_key) + 32 (storage_key_fingerprint) + 64
/// (wrapped_wipe_code_key) + 32 (wipe_code_key_fingerprint) + `HD_NODE_LEN`
/// (u2f_root) + 4 (u2f_counter) + 32 (random_salt) + `HARDWARE_ENTROPY_LEN`
/// + `POLICY_TABLE_LEN` + 32 (sec_fingerprint) + 2 (encrypted_sec_version).
pub const PUBLIC_CONFIG_LEN: usize = 2
    + 2
    + 4
    + 4
    + LANGUAGE_LEN
    + LABEL_LEN
    + 64
    + 32
    + 64
    + 32
    + HD_NODE_LEN
    + 4
    + 32
    + HARDWARE_ENTROPY_LEN
    + POLICY_TABLE_LEN
    + 32
    + 2;

/// Total size of one committed blob: metadata header, `PublicConfig`,
/// `EncryptedSec` ciphertext, back to back (`spec.md` §6: "44 B metadata ...
/// followed by 852+ bytes of `PublicConfig` + `EncryptedSec`").
pub const BLOB_LEN: usize = METADATA_LEN + PUBLIC_CONFIG_LEN + ENCRYPTED_SEC_LEN;

/// Default sector size. Real hardware fixes this to the flash geometry;
/// 4 KiB comfortably fits the 44-byte metadata header plus the
/// `PublicConfig` + `EncryptedSec` region spec.md sizes at "852+ bytes".
pub const DEFAULT_SECTOR_LEN: usize = 4096;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_region_offsets_sum_to_512() {
        assert_eq!(SEC_RESERVED_OFFSET + SEC_RESERVED_LEN, ENCRYPTED_SEC_LEN);
    }

    #[test]
    fn metadata_header_is_44_bytes() {
        assert_eq!(METADATA_LEN, 44);
    }

    #[test]
    fn blob_fits_default_sector() {
        assert!(BLOB_LEN < DEFAULT_SECTOR_LEN);
    }

    #[test]
    fn public_config_is_at_least_852_bytes_combined_with_encrypted_sec() {
        assert!(PUBLIC_CONFIG_LEN + ENCRYPTED_SEC_LEN >= 852);
    }
}
