// VaultCore: firmware core for a hardware cryptocurrency wallet
//
// This software is distributed without any warranty.

//! Fixed-size confidential buffers. `spec.md` §5 budgets zero heap and
//! requires every confidential buffer to be zeroized on every exit path;
//! `zeroize::Zeroizing` plus `#[derive(Zeroize, ZeroizeOnDrop)]` give us that
//! for free on stack/static storage without reaching for a hand-rolled
//! `memzero`.

use zeroize::{Zeroize, ZeroizeOnDrop};

/// The unwrapped 64-byte storage key cached in [`crate::session::SessionState`].
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct StorageKey(pub [u8; 64]);

impl StorageKey {
    pub fn zero() -> Self {
        StorageKey([0u8; 64])
    }
}

/// A BIP-39 passphrase, at most 50 bytes per `spec.md`'s `SessionState`
/// attribute table.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Passphrase {
    bytes: [u8; 50],
    len: usize,
}

impl Passphrase {
    pub fn empty() -> Self {
        Passphrase { bytes: [0u8; 50], len: 0 }
    }

    pub fn try_from_str(s: &str) -> Option<Self> {
        let raw = s.as_bytes();
        if raw.len() > 50 {
            return None;
        }
        let mut bytes = [0u8; 50];
        bytes[..raw.len()].copy_from_slice(raw);
        Some(Passphrase { bytes, len: raw.len() })
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.bytes[..self.len]).unwrap_or("")
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// The 64-byte BIP-39 seed cached in the session.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Seed(pub [u8; 64]);

impl Seed {
    pub fn zero() -> Self {
        Seed([0u8; 64])
    }
}

/// A zero-padded, NUL-terminated mnemonic buffer matching the 241-byte
/// on-flash layout (`spec.md` §3, `EncryptedSec`).
#[derive(Clone, Eq, PartialEq, Zeroize, ZeroizeOnDrop)]
pub struct MnemonicBuf {
    bytes: [u8; 241],
}

impl std::fmt::Debug for MnemonicBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MnemonicBuf").field("bytes", &"<redacted>").finish()
    }
}

impl MnemonicBuf {
    pub const LEN: usize = 241;

    pub fn empty() -> Self {
        MnemonicBuf { bytes: [0u8; Self::LEN] }
    }

    pub fn try_from_str(s: &str) -> Option<Self> {
        let raw = s.as_bytes();
        // Reserve one byte for the NUL terminator.
        if raw.len() >= Self::LEN {
            return None;
        }
        let mut bytes = [0u8; Self::LEN];
        bytes[..raw.len()].copy_from_slice(raw);
        Some(MnemonicBuf { bytes })
    }

    pub fn as_str(&self) -> &str {
        let nul = self.bytes.iter().position(|&b| b == 0).unwrap_or(Self::LEN);
        std::str::from_utf8(&self.bytes[..nul]).unwrap_or("")
    }

    pub fn is_empty(&self) -> bool {
        self.bytes[0] == 0
    }

    pub fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.bytes
    }

    pub fn from_bytes(bytes: [u8; Self::LEN]) -> Self {
        MnemonicBuf { bytes }
    }
}

/// A PIN, at most 9 decimal digits per `spec.md` §4.4 validation rule.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Pin {
    digits: [u8; 9],
    len: usize,
}

impl Pin {
    pub fn try_from_str(s: &str) -> Option<Self> {
        if s.is_empty() || s.len() > 9 || !s.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let mut digits = [0u8; 9];
        digits[..s.len()].copy_from_slice(s.as_bytes());
        Some(Pin { digits, len: s.len() })
    }

    pub fn empty() -> Self {
        Pin { digits: [0u8; 9], len: 0 }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.digits[..self.len]
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
