// VaultCore: firmware core for a hardware cryptocurrency wallet
//
// This software is distributed without any warranty.

//! The Ethereum transaction signer (`spec.md` §4.8). Unlike the
//! Bitcoin-family signer this is single-pass: one legacy RLP transaction,
//! optionally an ERC-20 token transfer, with `data` streamed in over
//! repeated `EthereumTxAck` messages when it exceeds one message's worth
//! of payload.
//!
//! Grounded in `original_source/lib/firmware/ethereum.c`
//! (`ethereum_signing_init`, `ethereum_signing_txack`, `rlp_*` helpers).
//! RLP encoding and Keccak-256 are hand-rolled here the same way the
//! original does not reach for a general RLP crate either; signing keys
//! and the recoverable ECDSA primitive come from the same
//! `bitcoin::secp256k1` dependency the Bitcoin-family signer uses
//! (`spec.md` §1 "assumed available as vetted library routines").

use bitcoin::bip32::{ChildNumber, DerivationPath, Xpriv};
use bitcoin::secp256k1::{Message, Secp256k1};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};

use crate::error::Error;
use crate::hal::TokenParams;

/// Ethereum `chain_id` is valid in `[1, 109]` under the legacy (pre-EIP-155
/// universal) signing scheme this firmware targets (`spec.md` §4.8).
pub const MIN_CHAIN_ID: u32 = 1;
pub const MAX_CHAIN_ID: u32 = 109;

/// `spec.md` §4.8: transaction `data` is capped at 16 MiB.
pub const MAX_DATA_LEN: usize = 16 * 1024 * 1024;

/// How many bytes of `data` one `EthereumSignTx`/`EthereumTxAck` message
/// carries before the dispatcher must request another chunk (`spec.md`
/// §4.8 "Incremental data").
pub const DATA_CHUNK_LEN: usize = 1024;

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct EthereumSignTxWire {
    pub address_n: Vec<u32>,
    pub nonce: Vec<u8>,
    pub gas_price: Vec<u8>,
    pub gas_limit: Vec<u8>,
    pub to: [u8; 20],
    pub value: Vec<u8>,
    /// First chunk of `data`; more may follow via `EthereumTxAck` if
    /// `data_length` exceeds this chunk's length.
    pub data_initial_chunk: Vec<u8>,
    pub data_length: u32,
    pub chain_id: Option<u32>,
    /// Present only for an ERC-20 `transfer(address,uint256)` call built
    /// on the device's behalf (`spec.md` §4.8 "Token transfers").
    pub token_shortcut: Option<String>,
    pub token_to: Option<[u8; 20]>,
    pub token_value: Option<[u8; 32]>,
}

/// RLP-encodes an unsigned integer the big-endian-minimal way Ethereum
/// expects: no leading zero bytes, empty string for zero.
fn trim_leading_zeros(bytes: &[u8]) -> &[u8] {
    let first_nonzero = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
    &bytes[first_nonzero..]
}

fn rlp_encode_length(len: usize, offset: u8) -> Vec<u8> {
    if len < 56 {
        vec![offset + len as u8]
    } else {
        let len_bytes = len.to_be_bytes();
        let len_bytes = trim_leading_zeros(&len_bytes);
        let mut out = vec![offset + 55 + len_bytes.len() as u8];
        out.extend_from_slice(len_bytes);
        out
    }
}

fn rlp_encode_bytes(bytes: &[u8]) -> Vec<u8> {
    let trimmed = trim_leading_zeros(bytes);
    if trimmed.len() == 1 && trimmed[0] < 0x80 {
        vec![trimmed[0]]
    } else {
        let mut out = rlp_encode_length(trimmed.len(), 0x80);
        out.extend_from_slice(trimmed);
        out
    }
}

fn rlp_encode_raw_bytes(bytes: &[u8]) -> Vec<u8> {
    if bytes.len() == 1 && bytes[0] < 0x80 {
        vec![bytes[0]]
    } else {
        let mut out = rlp_encode_length(bytes.len(), 0x80);
        out.extend_from_slice(bytes);
        out
    }
}

fn rlp_encode_list(items: &[Vec<u8>]) -> Vec<u8> {
    let body: Vec<u8> = items.iter().flat_map(|i| i.iter().copied()).collect();
    let mut out = rlp_encode_length(body.len(), 0xc0);
    out.extend_from_slice(&body);
    out
}

/// ERC-20 `transfer(address,uint256)` selector + ABI-encoded args,
/// constructed on-device so the user need only confirm the token amount
/// and recipient, not raw calldata (`spec.md` §4.8 "Token transfers").
/// Interprets a big-endian, minimal-length byte string as a `u64`,
/// saturating to `u64::MAX` if it doesn't fit (used only for the token
/// gas-limit policy check below, never for fee arithmetic).
fn be_bytes_to_u64_saturating(bytes: &[u8]) -> u64 {
    if bytes.len() > 8 {
        return u64::MAX;
    }
    let mut padded = [0u8; 8];
    padded[8 - bytes.len()..].copy_from_slice(bytes);
    u64::from_be_bytes(padded)
}

fn build_token_transfer_data(to: &[u8; 20], value: &[u8; 32]) -> Vec<u8> {
    const TRANSFER_SELECTOR: [u8; 4] = [0xa9, 0x05, 0x9c, 0xbb];
    let mut data = Vec::with_capacity(4 + 32 + 32);
    data.extend_from_slice(&TRANSFER_SELECTOR);
    data.extend_from_slice(&[0u8; 12]);
    data.extend_from_slice(to);
    data.extend_from_slice(value);
    data
}

/// What the dispatcher must do next to keep a signing operation moving.
pub enum EthereumProgress {
    /// More of `data` is needed before the transaction can be signed.
    NeedMoreData { remaining: u32 },
    /// All inputs are present; call [`EthereumSigner::sign`].
    ReadyToSign,
}

/// Single-pass Ethereum signer state (`spec.md` §4.8).
pub struct EthereumSigner {
    address_n: Vec<u32>,
    nonce: Vec<u8>,
    gas_price: Vec<u8>,
    gas_limit: Vec<u8>,
    to: [u8; 20],
    value: Vec<u8>,
    data: Vec<u8>,
    data_length: u32,
    chain_id: Option<u32>,
}

impl EthereumSigner {
    /// Validates and starts a new signing operation (`spec.md` §4.8
    /// invariants: chain_id range, gas overflow, data length, recipient).
    pub fn new(wire: EthereumSignTxWire, token: Option<TokenParams>) -> Result<(Self, EthereumProgress), Error> {
        if let Some(id) = wire.chain_id {
            if id < MIN_CHAIN_ID || id > MAX_CHAIN_ID {
                return Err(Error::EthereumChainIdOutOfRange(id));
            }
        }

        if wire.data_length as usize > MAX_DATA_LEN {
            return Err(Error::EthereumDataTooLarge);
        }

        // `spec.md` §4.8 fee overflow guard: the two size-prefixed big
        // integers together must fit well inside a 32-byte fee product.
        if wire.gas_price.len() + wire.gas_limit.len() > 30 {
            return Err(Error::EthereumFeeOverflow);
        }

        let (to, data_length, data) = if let Some(token_to) = wire.token_to {
            let params = token.ok_or(Error::InvalidTokenTransfer)?;
            let token_value = wire.token_value.ok_or(Error::InvalidTokenTransfer)?;
            let contract = wire.to;
            if contract == [0u8; 20] {
                return Err(Error::InvalidTokenTransfer);
            }
            // `spec.md` §4.8 "the gas limit must not exceed a per-token
            // maximum from the coin table".
            if be_bytes_to_u64_saturating(&wire.gas_limit) > params.max_gas_limit {
                return Err(Error::InvalidTokenTransfer);
            }
            let data = build_token_transfer_data(&token_to, &token_value);
            let len = data.len() as u32;
            (contract, len, data)
        } else {
            if wire.to == [0u8; 20] && wire.data_initial_chunk.is_empty() {
                return Err(Error::InvalidEthereumRecipient);
            }
            (wire.to, wire.data_length, wire.data_initial_chunk.clone())
        };

        let signer = EthereumSigner {
            address_n: wire.address_n,
            nonce: wire.nonce,
            gas_price: wire.gas_price,
            gas_limit: wire.gas_limit,
            to,
            value: wire.value,
            data,
            data_length,
            chain_id: wire.chain_id,
        };

        let progress = if (signer.data.len() as u32) < signer.data_length {
            EthereumProgress::NeedMoreData { remaining: signer.data_length - signer.data.len() as u32 }
        } else {
            EthereumProgress::ReadyToSign
        };

        Ok((signer, progress))
    }

    /// Appends another chunk of streamed `data` (`spec.md` §4.8
    /// "Incremental data"), returning what the dispatcher should do next.
    pub fn feed_data(&mut self, chunk: Vec<u8>) -> Result<EthereumProgress, Error> {
        self.data.extend_from_slice(&chunk);
        if self.data.len() as u32 > self.data_length {
            return Err(Error::DataError(s!("received more data than data_length declared")));
        }
        if (self.data.len() as u32) < self.data_length {
            Ok(EthereumProgress::NeedMoreData { remaining: self.data_length - self.data.len() as u32 })
        } else {
            Ok(EthereumProgress::ReadyToSign)
        }
    }

    fn rlp_items(&self, v: Option<u8>, r: &[u8], s: &[u8]) -> Vec<Vec<u8>> {
        let mut items = vec![
            rlp_encode_bytes(&self.nonce),
            rlp_encode_bytes(&self.gas_price),
            rlp_encode_bytes(&self.gas_limit),
            rlp_encode_raw_bytes(&self.to),
            rlp_encode_bytes(&self.value),
            rlp_encode_bytes(&self.data),
        ];
        match v {
            None => {
                // Unsigned EIP-155 preimage: (chain_id, 0, 0) appended when
                // a chain id was supplied, omitted for pre-EIP-155 legacy.
                if let Some(chain_id) = self.chain_id {
                    items.push(rlp_encode_bytes(&chain_id.to_be_bytes()));
                    items.push(rlp_encode_bytes(&[]));
                    items.push(rlp_encode_bytes(&[]));
                }
            }
            Some(v) => {
                items.push(rlp_encode_bytes(&[v]));
                items.push(rlp_encode_bytes(r));
                items.push(rlp_encode_bytes(s));
            }
        }
        items
    }

    /// Signs the accumulated transaction, returning the recovery id
    /// folded EIP-155 style into `v` when `chain_id` was supplied
    /// (`spec.md` §4.8: "v = recid + (chain_id present ? 2*chain_id + 35
    /// : 27)").
    pub fn sign(&self, root: &Xpriv) -> Result<EthereumSignature, Error> {
        let secp = Secp256k1::new();
        let path = derivation_path(&self.address_n)?;
        let child = root
            .derive_priv(&secp, &path)
            .map_err(|e| Error::Other(format!("child key derivation failed: {e}")))?;

        let unsigned = rlp_encode_list(&self.rlp_items(None, &[], &[]));
        let digest: [u8; 32] = Keccak256::digest(&unsigned).into();
        let message = Message::from_digest(digest);

        let recoverable = secp.sign_ecdsa_recoverable(&message, &child.private_key);
        let (recovery_id, sig_bytes) = recoverable.serialize_compact();
        let recid: i32 = recovery_id.to_i32();
        let r: [u8; 32] = sig_bytes[0..32].try_into().unwrap();
        let s: [u8; 32] = sig_bytes[32..64].try_into().unwrap();

        let v = match self.chain_id {
            Some(chain_id) => (recid as u32) + 2 * chain_id + 35,
            None => (recid as u32) + 27,
        };

        Ok(EthereumSignature { v, r, s })
    }
}

pub struct EthereumSignature {
    pub v: u32,
    pub r: [u8; 32],
    pub s: [u8; 32],
}

fn derivation_path(address_n: &[u32]) -> Result<DerivationPath, Error> {
    let children: Result<Vec<ChildNumber>, _> = address_n
        .iter()
        .map(|&n| {
            ChildNumber::from_normal_idx(n & 0x7fff_ffff)
                .map(|c| if n & 0x8000_0000 != 0 { c.into_hardened().unwrap_or(c) } else { c })
        })
        .collect();
    let children = children.map_err(|e| Error::Other(format!("invalid derivation path: {e}")))?;
    Ok(DerivationPath::from(children))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_wire() -> EthereumSignTxWire {
        EthereumSignTxWire {
            address_n: vec![0x8000_0000 + 44, 0x8000_0000 + 60, 0x8000_0000, 0, 0],
            nonce: vec![0x01],
            gas_price: vec![0x04, 0xa8, 0x17, 0xc8, 0x00],
            gas_limit: vec![0x52, 0x08],
            to: [0x11; 20],
            value: vec![0x0d, 0xe0, 0xb6, 0xb3, 0xa7, 0x64, 0x00, 0x00],
            data_initial_chunk: vec![],
            data_length: 0,
            chain_id: Some(1),
            token_shortcut: None,
            token_to: None,
            token_value: None,
        }
    }

    #[test]
    fn minimal_transfer_is_ready_immediately() {
        let (_, progress) = EthereumSigner::new(base_wire(), None).unwrap();
        assert!(matches!(progress, EthereumProgress::ReadyToSign));
    }

    #[test]
    fn chain_id_out_of_range_is_rejected() {
        let mut wire = base_wire();
        wire.chain_id = Some(200);
        assert!(matches!(
            EthereumSigner::new(wire, None),
            Err(Error::EthereumChainIdOutOfRange(200))
        ));
    }

    #[test]
    fn zero_recipient_without_data_is_rejected() {
        let mut wire = base_wire();
        wire.to = [0u8; 20];
        assert!(matches!(EthereumSigner::new(wire, None), Err(Error::InvalidEthereumRecipient)));
    }

    #[test]
    fn gas_overflow_is_rejected() {
        let mut wire = base_wire();
        wire.gas_price = vec![0xff; 16];
        wire.gas_limit = vec![0xff; 16];
        assert!(matches!(EthereumSigner::new(wire, None), Err(Error::EthereumFeeOverflow)));
    }

    #[test]
    fn data_length_too_large_is_rejected() {
        let mut wire = base_wire();
        wire.data_length = (MAX_DATA_LEN + 1) as u32;
        assert!(matches!(EthereumSigner::new(wire, None), Err(Error::EthereumDataTooLarge)));
    }

    #[test]
    fn streamed_data_reports_remaining_then_ready() {
        let mut wire = base_wire();
        wire.data_initial_chunk = vec![0u8; 10];
        wire.data_length = 25;
        let (mut signer, progress) = EthereumSigner::new(wire, None).unwrap();
        assert!(matches!(progress, EthereumProgress::NeedMoreData { remaining: 15 }));

        let progress = signer.feed_data(vec![0u8; 15]).unwrap();
        assert!(matches!(progress, EthereumProgress::ReadyToSign));
    }

    #[test]
    fn overshooting_declared_data_length_errors() {
        let mut wire = base_wire();
        wire.data_initial_chunk = vec![0u8; 10];
        wire.data_length = 12;
        let (mut signer, _) = EthereumSigner::new(wire, None).unwrap();
        assert!(signer.feed_data(vec![0u8; 10]).is_err());
    }

    #[test]
    fn token_transfer_requires_token_params() {
        let mut wire = base_wire();
        wire.token_to = Some([0x22; 20]);
        wire.token_value = Some([0u8; 32]);
        assert!(matches!(EthereumSigner::new(wire, None), Err(Error::InvalidTokenTransfer)));
    }

    #[test]
    fn token_transfer_over_max_gas_limit_is_rejected() {
        let mut wire = base_wire();
        wire.token_to = Some([0x22; 20]);
        wire.token_value = Some([0u8; 32]);
        wire.gas_limit = vec![0x01, 0x86, 0xa0]; // 100_000
        let token = TokenParams { symbol: "USDC", contract_address: wire.to, max_gas_limit: 90_000 };
        assert!(matches!(EthereumSigner::new(wire, Some(token)), Err(Error::InvalidTokenTransfer)));
    }

    #[test]
    fn token_transfer_builds_transfer_calldata() {
        let mut wire = base_wire();
        wire.token_to = Some([0x22; 20]);
        let mut value = [0u8; 32];
        value[31] = 5;
        wire.token_value = Some(value);
        let token = TokenParams { symbol: "USDC", contract_address: wire.to, max_gas_limit: 100_000 };
        let (signer, progress) = EthereumSigner::new(wire, Some(token)).unwrap();
        assert!(matches!(progress, EthereumProgress::ReadyToSign));
        assert_eq!(&signer.data[0..4], &[0xa9, 0x05, 0x9c, 0xbb]);
    }

    #[test]
    fn rlp_encode_bytes_matches_known_vectors() {
        assert_eq!(rlp_encode_bytes(&[]), vec![0x80]);
        assert_eq!(rlp_encode_bytes(&[0x01]), vec![0x01]);
        assert_eq!(rlp_encode_bytes(&[0x7f]), vec![0x7f]);
        assert_eq!(rlp_encode_bytes(&[0x80]), vec![0x81, 0x80]);
    }
}
