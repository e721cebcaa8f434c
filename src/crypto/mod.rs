// VaultCore: firmware core for a hardware cryptocurrency wallet
//
// This software is distributed without any warranty.

//! Cryptographic plumbing that the dispatcher and storage engine drive
//! directly. The heavy unit-specific primitives (SHA-2, HMAC, PBKDF2,
//! AES-CBC, ECDSA over secp256k1/nist256p1, ED25519, BIP-32, BIP-39,
//! BASE58/BECH32) are vetted library routines per `spec.md` §1; this module
//! only wires them together the way the storage engine and signer need.

pub mod cipher;
pub mod constant_time;
pub mod kdf;
pub mod wrap;

pub use constant_time::memcmp_s;
