// VaultCore: firmware core for a hardware cryptocurrency wallet
//
// This software is distributed without any warranty.

//! BIP-39 seed derivation (`spec.md` §4.5, testable property 9):
//! `seed = PBKDF2-HMAC-SHA512(mnemonic, "mnemonic" || passphrase, 2048)`.

use hmac::Hmac;
use pbkdf2::pbkdf2;
use sha2::Sha512;

const BIP39_PBKDF2_ROUNDS: u32 = 2048;

/// Derives the 64-byte BIP-39 seed from a mnemonic string and passphrase.
/// `bip39::Mnemonic::to_seed` implements the identical formula; this
/// standalone function exists so the storage engine can derive a seed from
/// a raw mnemonic string without constructing (and checksum-validating) a
/// full `Mnemonic` object, and so the formula is directly testable against
/// `spec.md`'s stated invariant.
pub fn derive_seed(mnemonic: &str, passphrase: &str) -> [u8; 64] {
    let mut salt = String::with_capacity(8 + passphrase.len());
    salt.push_str("mnemonic");
    salt.push_str(passphrase);

    let mut seed = [0u8; 64];
    pbkdf2::<Hmac<Sha512>>(
        mnemonic.as_bytes(),
        salt.as_bytes(),
        BIP39_PBKDF2_ROUNDS,
        &mut seed,
    )
    .expect("64-byte output is always valid for HMAC-SHA512");
    seed
}

#[cfg(test)]
mod tests {
    use super::*;
    use bip39::Mnemonic;
    use std::str::FromStr;

    #[test]
    fn matches_bip39_crate_with_empty_passphrase() {
        let mnemonic = Mnemonic::from_str(
            "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about",
        )
        .unwrap();
        let expected = mnemonic.to_seed("");
        let actual = derive_seed(&mnemonic.to_string(), "");
        assert_eq!(actual, expected);
    }

    #[test]
    fn matches_bip39_crate_with_passphrase() {
        let mnemonic = Mnemonic::from_str(
            "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about",
        )
        .unwrap();
        let expected = mnemonic.to_seed("correct horse battery staple");
        let actual = derive_seed(&mnemonic.to_string(), "correct horse battery staple");
        assert_eq!(actual, expected);
    }

    #[test]
    fn different_passphrases_yield_different_seeds() {
        let mnemonic =
            "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";
        assert_ne!(derive_seed(mnemonic, ""), derive_seed(mnemonic, "x"));
    }
}
