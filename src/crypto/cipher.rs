// VaultCore: firmware core for a hardware cryptocurrency wallet
//
// This software is distributed without any warranty.

//! Secret-region encryption (`spec.md` §4.1 "Secret encryption"):
//! AES-256-CBC over the fixed 512-byte `EncryptedSec` plaintext, keyed by
//! the unwrapped storage key (first 256 bits as key, next 256 bits as IV).

use aes::Aes256;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use sha2::Sha512;

use crate::storage::layout::ENCRYPTED_SEC_LEN;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Encrypts the 512-byte secret-region plaintext in place. `storage_key`'s
/// first 32 bytes are the AES-256 key; the next 32 are the IV. Block-aligned
/// (32 AES blocks), no padding.
pub fn encrypt_secret_region(
    storage_key: &[u8; 64],
    plaintext: &[u8; ENCRYPTED_SEC_LEN],
) -> [u8; ENCRYPTED_SEC_LEN] {
    let key = &storage_key[0..32];
    let iv = &storage_key[32..64];
    let mut buf = *plaintext;
    let mut enc = Aes256CbcEnc::new(key.into(), iv.into());
    for chunk in buf.chunks_exact_mut(16) {
        enc.encrypt_block_mut(chunk.into());
    }
    buf
}

/// Inverse of [`encrypt_secret_region`].
pub fn decrypt_secret_region(
    storage_key: &[u8; 64],
    ciphertext: &[u8; ENCRYPTED_SEC_LEN],
) -> [u8; ENCRYPTED_SEC_LEN] {
    let key = &storage_key[0..32];
    let iv = &storage_key[32..64];
    let mut buf = *ciphertext;
    let mut dec = Aes256CbcDec::new(key.into(), iv.into());
    for chunk in buf.chunks_exact_mut(16) {
        dec.decrypt_block_mut(chunk.into());
    }
    buf
}

/// Derives the 64-byte AES key/IV material for `CipherKeyValue`
/// (`spec.md` §6 message table; `original_source/lib/firmware/fsm.c`'s
/// `fsm_msgCipherKeyValue`): `HMAC-SHA512(node.private_key, key ||
/// "E1"/"E0" || "D1"/"D0")`, the `ask_on_encrypt`/`ask_on_decrypt` flags
/// folded into the HMAC input so a value encrypted under one combination
/// of flags can't be decrypted under another.
pub fn derive_cipher_key_material(
    private_key: &[u8; 32],
    key: &str,
    ask_on_encrypt: bool,
    ask_on_decrypt: bool,
) -> [u8; 64] {
    let mut data = Vec::with_capacity(key.len() + 4);
    data.extend_from_slice(key.as_bytes());
    data.extend_from_slice(if ask_on_encrypt { b"E1" } else { b"E0" });
    data.extend_from_slice(if ask_on_decrypt { b"D1" } else { b"D0" });

    let mut mac = <Hmac<Sha512> as Mac>::new_from_slice(private_key)
        .expect("any length key is valid for HMAC-SHA512");
    mac.update(&data);
    let result = mac.finalize().into_bytes();
    let mut out = [0u8; 64];
    out.copy_from_slice(&result);
    out
}

/// Generic AES-256-CBC over a buffer whose length is a multiple of 16
/// (`spec.md` §6 `CipherKeyValue`/`CipheredKeyValue`), keyed by the first
/// half of `key_material` with the second half as IV unless `iv` overrides
/// it -- the original's `msg->iv.size == 16 ? msg->iv.bytes : data + 32`.
/// Callers must have already checked `value.len() % 16 == 0`.
pub fn cipher_key_value(
    encrypt: bool,
    value: &[u8],
    key_material: &[u8; 64],
    iv: Option<[u8; 16]>,
) -> Vec<u8> {
    let key = &key_material[0..32];
    let iv_bytes: [u8; 16] = iv.unwrap_or_else(|| key_material[32..48].try_into().unwrap());
    let mut buf = value.to_vec();
    if encrypt {
        let mut enc = Aes256CbcEnc::new(key.into(), (&iv_bytes).into());
        for chunk in buf.chunks_exact_mut(16) {
            enc.encrypt_block_mut(chunk.into());
        }
    } else {
        let mut dec = Aes256CbcDec::new(key.into(), (&iv_bytes).into());
        for chunk in buf.chunks_exact_mut(16) {
            dec.decrypt_block_mut(chunk.into());
        }
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips() {
        let key = [0x5Au8; 64];
        let plaintext = [0x11u8; ENCRYPTED_SEC_LEN];
        let ciphertext = encrypt_secret_region(&key, &plaintext);
        assert_ne!(ciphertext[..], plaintext[..]);
        let decrypted = decrypt_secret_region(&key, &ciphertext);
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn cipher_key_value_roundtrips() {
        let private_key = [0x42u8; 32];
        let material = derive_cipher_key_material(&private_key, "myapp", true, false);
        let value = [0xABu8; 32];
        let ciphertext = cipher_key_value(true, &value, &material, None);
        assert_ne!(ciphertext, value);
        let plaintext = cipher_key_value(false, &ciphertext, &material, None);
        assert_eq!(plaintext, value);
    }

    #[test]
    fn cipher_key_value_explicit_iv_overrides_derived_iv() {
        let private_key = [0x42u8; 32];
        let material = derive_cipher_key_material(&private_key, "myapp", true, false);
        let value = [0xABu8; 16];
        let no_iv = cipher_key_value(true, &value, &material, None);
        let with_iv = cipher_key_value(true, &value, &material, Some([0x99; 16]));
        assert_ne!(no_iv, with_iv);
    }

    #[test]
    fn cipher_key_value_flags_change_derived_material() {
        let private_key = [0x42u8; 32];
        let a = derive_cipher_key_material(&private_key, "myapp", true, false);
        let b = derive_cipher_key_material(&private_key, "myapp", false, false);
        assert_ne!(a, b);
    }
}
