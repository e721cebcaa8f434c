// VaultCore: firmware core for a hardware cryptocurrency wallet
//
// This software is distributed without any warranty.

//! The fixed 512-byte secret-region plaintext (`spec.md` §3 `EncryptedSec`,
//! §4.1 "Secret encryption"). Laid out and (de)serialized by hand, the way
//! `original_source/lib/firmware/storage.c`'s `storage_writeHDNode` and
//! `storage_secMigrate` do it with raw pointer arithmetic -- the region is a
//! fixed hardware byte layout, not a general length-prefixed schema, so a
//! generic serialization crate would not fit any better than explicit
//! offsets.

use sha2::{Digest, Sha256};

use crate::secret::MnemonicBuf;
use crate::storage::layout::{
    ENCRYPTED_SEC_LEN, HD_NODE_LEN, HD_NODE_OFFSET, MNEMONIC_LEN, MNEMONIC_OFFSET,
    SEC_RESERVED_LEN, SEC_RESERVED_OFFSET, SESSION_CACHE_LEN, SESSION_CACHE_OFFSET,
};

/// `StorageHDNode` (`spec.md` Glossary: "a tuple `(depth, fingerprint,
/// child_num, chain_code, private_key, public_key)`"), serialized to
/// [`HD_NODE_LEN`] bytes.
#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct HdNodeRaw {
    pub depth: u8,
    pub fingerprint: u32,
    pub child_num: u32,
    pub chain_code: [u8; 32],
    pub private_key: Option<[u8; 32]>,
    pub public_key: Option<[u8; 33]>,
}

impl HdNodeRaw {
    pub fn encode(&self) -> [u8; HD_NODE_LEN] {
        let mut buf = [0u8; HD_NODE_LEN];
        buf[0] = self.depth;
        buf[1..5].copy_from_slice(&self.fingerprint.to_be_bytes());
        buf[5..9].copy_from_slice(&self.child_num.to_be_bytes());
        buf[9..41].copy_from_slice(&self.chain_code);
        if let Some(sk) = &self.private_key {
            buf[41] = 1;
            buf[42..74].copy_from_slice(sk);
        }
        if let Some(pk) = &self.public_key {
            buf[74] = 1;
            buf[75..108].copy_from_slice(pk);
        }
        // buf[108..129] stays reserved/zero.
        buf
    }

    pub fn decode(buf: &[u8; HD_NODE_LEN]) -> HdNodeRaw {
        let mut fingerprint_bytes = [0u8; 4];
        fingerprint_bytes.copy_from_slice(&buf[1..5]);
        let mut child_num_bytes = [0u8; 4];
        child_num_bytes.copy_from_slice(&buf[5..9]);
        let mut chain_code = [0u8; 32];
        chain_code.copy_from_slice(&buf[9..41]);

        let private_key = if buf[41] != 0 {
            let mut sk = [0u8; 32];
            sk.copy_from_slice(&buf[42..74]);
            Some(sk)
        } else {
            None
        };
        let public_key = if buf[74] != 0 {
            let mut pk = [0u8; 33];
            pk.copy_from_slice(&buf[75..108]);
            Some(pk)
        } else {
            None
        };

        HdNodeRaw {
            depth: buf[0],
            fingerprint: u32::from_be_bytes(fingerprint_bytes),
            child_num: u32::from_be_bytes(child_num_bytes),
            chain_code,
            private_key,
            public_key,
        }
    }
}

/// The session-cache copy embedded in the secret region (`spec.md` §3:
/// "root-seed cache status + 64 B seed + 10-char curve name").
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct SessionCacheRaw {
    pub seed_cached: bool,
    pub seed: [u8; 64],
    pub curve_name: [u8; 10],
}

impl Default for SessionCacheRaw {
    fn default() -> Self {
        SessionCacheRaw { seed_cached: false, seed: [0u8; 64], curve_name: [0u8; 10] }
    }
}

impl SessionCacheRaw {
    pub fn encode(&self) -> [u8; SESSION_CACHE_LEN] {
        let mut buf = [0u8; SESSION_CACHE_LEN];
        buf[0] = self.seed_cached as u8;
        buf[1..65].copy_from_slice(&self.seed);
        buf[65..75].copy_from_slice(&self.curve_name);
        buf
    }

    pub fn decode(buf: &[u8; SESSION_CACHE_LEN]) -> SessionCacheRaw {
        let mut seed = [0u8; 64];
        seed.copy_from_slice(&buf[1..65]);
        let mut curve_name = [0u8; 10];
        curve_name.copy_from_slice(&buf[65..75]);
        SessionCacheRaw { seed_cached: buf[0] != 0, seed, curve_name }
    }
}

/// The full 512-byte secret-region plaintext.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct EncryptedSecPlaintext {
    pub node: HdNodeRaw,
    pub mnemonic: MnemonicBuf,
    pub session_cache: SessionCacheRaw,
}

impl Default for EncryptedSecPlaintext {
    fn default() -> Self {
        EncryptedSecPlaintext {
            node: HdNodeRaw::default(),
            mnemonic: MnemonicBuf::empty(),
            session_cache: SessionCacheRaw::default(),
        }
    }
}

impl EncryptedSecPlaintext {
    pub fn encode(&self) -> [u8; ENCRYPTED_SEC_LEN] {
        let mut buf = [0u8; ENCRYPTED_SEC_LEN];
        buf[HD_NODE_OFFSET..HD_NODE_OFFSET + HD_NODE_LEN].copy_from_slice(&self.node.encode());
        buf[MNEMONIC_OFFSET..MNEMONIC_OFFSET + MNEMONIC_LEN]
            .copy_from_slice(self.mnemonic.as_bytes());
        buf[SESSION_CACHE_OFFSET..SESSION_CACHE_OFFSET + SESSION_CACHE_LEN]
            .copy_from_slice(&self.session_cache.encode());
        // buf[SEC_RESERVED_OFFSET..] stays reserved/zero.
        let _ = SEC_RESERVED_LEN;
        buf
    }

    pub fn decode(buf: &[u8; ENCRYPTED_SEC_LEN]) -> EncryptedSecPlaintext {
        let mut node_buf = [0u8; HD_NODE_LEN];
        node_buf.copy_from_slice(&buf[HD_NODE_OFFSET..HD_NODE_OFFSET + HD_NODE_LEN]);

        let mut mnemonic_buf = [0u8; MNEMONIC_LEN];
        mnemonic_buf.copy_from_slice(&buf[MNEMONIC_OFFSET..MNEMONIC_OFFSET + MNEMONIC_LEN]);

        let mut cache_buf = [0u8; SESSION_CACHE_LEN];
        cache_buf.copy_from_slice(
            &buf[SESSION_CACHE_OFFSET..SESSION_CACHE_OFFSET + SESSION_CACHE_LEN],
        );

        EncryptedSecPlaintext {
            node: HdNodeRaw::decode(&node_buf),
            mnemonic: MnemonicBuf::from_bytes(mnemonic_buf),
            session_cache: SessionCacheRaw::decode(&cache_buf),
        }
    }

    /// `SHA-256(plaintext_secret_blob)` (`spec.md` Invariant E).
    pub fn fingerprint(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.encode());
        let digest = hasher.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hd_node_roundtrips() {
        let node = HdNodeRaw {
            depth: 3,
            fingerprint: 0xDEADBEEF,
            child_num: 7,
            chain_code: [0x42; 32],
            private_key: Some([0x11; 32]),
            public_key: Some([0x02; 33]),
        };
        let decoded = HdNodeRaw::decode(&node.encode());
        assert_eq!(decoded, node);
    }

    #[test]
    fn hd_node_without_private_key_roundtrips() {
        let node = HdNodeRaw {
            depth: 0,
            fingerprint: 0,
            child_num: 0,
            chain_code: [0u8; 32],
            private_key: None,
            public_key: Some([0x03; 33]),
        };
        let decoded = HdNodeRaw::decode(&node.encode());
        assert_eq!(decoded, node);
        assert!(decoded.private_key.is_none());
    }

    #[test]
    fn full_secret_region_roundtrips_and_fingerprints_match() {
        let plaintext = EncryptedSecPlaintext {
            node: HdNodeRaw {
                depth: 1,
                fingerprint: 1,
                child_num: 1,
                chain_code: [0x01; 32],
                private_key: Some([0x02; 32]),
                public_key: Some([0x03; 33]),
            },
            mnemonic: MnemonicBuf::try_from_str("abandon abandon abandon").unwrap(),
            session_cache: SessionCacheRaw {
                seed_cached: true,
                seed: [0x09; 64],
                curve_name: *b"secp256k1\0",
            },
        };
        let encoded = plaintext.encode();
        assert_eq!(encoded.len(), ENCRYPTED_SEC_LEN);
        let decoded = EncryptedSecPlaintext::decode(&encoded);
        assert_eq!(decoded, plaintext);
        assert_eq!(decoded.fingerprint(), plaintext.fingerprint());
    }
}
