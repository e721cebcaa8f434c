// VaultCore: firmware core for a hardware cryptocurrency wallet
//
// This software is distributed without any warranty.

//! The metadata header (`spec.md` §3 "Metadata", §6 "UUID"): written once
//! at first boot, never rotates.

use crate::error::Error;
use crate::storage::layout::{MAGIC, METADATA_LEN, METADATA_RESERVED, UUID_LEN, UUID_STR_LEN};

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Metadata {
    pub uuid: [u8; UUID_LEN],
    pub uuid_str: String,
}

impl Metadata {
    /// Derives a fresh `Metadata` from the MCU unique-ID register
    /// (`spec.md` §6: "12 bytes derived from the MCU unique-ID register at
    /// first init; never rotates").
    pub fn from_hardware_id(unique_id: &[u8; UUID_LEN]) -> Metadata {
        let uuid_str = hex_encode(unique_id);
        Metadata { uuid: *unique_id, uuid_str }
    }

    pub fn encode(&self) -> [u8; METADATA_LEN] {
        let mut buf = [0u8; METADATA_LEN];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4..4 + UUID_LEN].copy_from_slice(&self.uuid);
        let str_bytes = self.uuid_str.as_bytes();
        let str_off = 4 + UUID_LEN;
        let copy_len = str_bytes.len().min(UUID_STR_LEN - 1);
        buf[str_off..str_off + copy_len].copy_from_slice(&str_bytes[..copy_len]);
        // Remaining bytes (NUL terminator + METADATA_RESERVED tail) stay zero.
        let _ = METADATA_RESERVED;
        buf
    }

    pub fn decode(buf: &[u8; METADATA_LEN]) -> Result<Metadata, Error> {
        if buf[0..4] != MAGIC {
            return Err(Error::StorageUninitialized);
        }
        let mut uuid = [0u8; UUID_LEN];
        uuid.copy_from_slice(&buf[4..4 + UUID_LEN]);
        let str_off = 4 + UUID_LEN;
        let str_bytes = &buf[str_off..str_off + UUID_STR_LEN];
        let nul = str_bytes.iter().position(|&b| b == 0).unwrap_or(UUID_STR_LEN);
        let uuid_str = String::from_utf8_lossy(&str_bytes[..nul]).into_owned();
        Ok(Metadata { uuid, uuid_str })
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_encode_decode() {
        let meta = Metadata::from_hardware_id(&[0xAB; UUID_LEN]);
        let encoded = meta.encode();
        let decoded = Metadata::decode(&encoded).unwrap();
        assert_eq!(decoded, meta);
    }

    #[test]
    fn decode_rejects_wrong_magic() {
        let mut buf = [0u8; METADATA_LEN];
        buf[0..4].copy_from_slice(b"xxxx");
        assert!(Metadata::decode(&buf).is_err());
    }

    #[test]
    fn uuid_string_is_hex_of_uuid() {
        let meta = Metadata::from_hardware_id(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c]);
        assert_eq!(meta.uuid_str, "0102030405060708090a0b0c");
        assert_eq!(meta.uuid_str.len(), 24);
    }
}
