// VaultCore: firmware core for a hardware cryptocurrency wallet
//
// This software is distributed without any warranty.

//! The exchange policy hook (`spec.md` §4.9): when an output carries
//! `address_type == EXCHANGE`, its contract is verified against a known
//! issuer public key before the normal output confirmation runs. Success
//! replaces the outward confirmation with a three-line exchange dialogue
//! (`crate::hal::ConfirmLayout::Exchange`); failure sets a persistent
//! `ExchangeError` and aborts the whole signing operation.
//!
//! Grounded in `original_source/lib/firmware/exchange.c`
//! (`exchange_validate`/the "ShapeShift" contract signature check) and
//! gated by [`crate::policy::PolicyId::Exchange`] the way the original
//! gates it on `storage_isPolicyEnabled("ShapeShift")`.

use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::{Message, PublicKey, Secp256k1};
use sha2::{Digest, Sha256};

use crate::error::Error;

/// The signed contract a counterparty hands the device to authorize
/// routing funds through an exchange output (`spec.md` §4.9).
pub struct ExchangeContract {
    pub counterparty: String,
    pub destination: String,
    pub return_address: String,
    /// DER-encoded ECDSA signature over the contract fields, produced by
    /// the issuer's off-device signing service.
    pub signature: Vec<u8>,
}

impl ExchangeContract {
    fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.counterparty.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.destination.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.return_address.as_bytes());
        hasher.update([0u8]);
        Sha256::digest(hasher.finalize()).into()
    }
}

/// Verifies `contract` against `issuer_pubkey`, the fixed key this
/// firmware build trusts for exchange contracts (`spec.md` §4.9: "verified
/// against a known issuer public key").
///
/// On any failure this returns `Error::ExchangeError`, which the
/// dispatcher persists (`spec.md` §4.9: "Failure at any step sets a
/// persistent `ExchangeError` and aborts").
pub fn verify_contract(contract: &ExchangeContract, issuer_pubkey: &[u8; 33]) -> Result<(), Error> {
    let secp = Secp256k1::verification_only();

    let pubkey = PublicKey::from_slice(issuer_pubkey)
        .map_err(|e| Error::ExchangeError(format!("malformed issuer public key: {e}")))?;
    let signature = Signature::from_der(&contract.signature)
        .map_err(|e| Error::ExchangeError(format!("malformed contract signature: {e}")))?;
    let message = Message::from_digest(contract.digest());

    secp.verify_ecdsa(&message, &signature, &pubkey)
        .map_err(|_| Error::ExchangeError(s!("contract signature does not match issuer key")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::SecretKey;

    fn sign_contract(contract: &ExchangeContract, secret: &SecretKey) -> Vec<u8> {
        let secp = Secp256k1::signing_only();
        let message = Message::from_digest(contract.digest());
        secp.sign_ecdsa(&message, secret).serialize_der().to_vec()
    }

    #[test]
    fn valid_contract_verifies() {
        let secp = Secp256k1::new();
        let secret = SecretKey::from_slice(&[7u8; 32]).unwrap();
        let public = PublicKey::from_secret_key(&secp, &secret);

        let mut contract = ExchangeContract {
            counterparty: "Acme Exchange".into(),
            destination: "bc1qexample".into(),
            return_address: "bc1qreturn".into(),
            signature: Vec::new(),
        };
        contract.signature = sign_contract(&contract, &secret);

        assert!(verify_contract(&contract, &public.serialize()).is_ok());
    }

    #[test]
    fn tampered_contract_is_rejected() {
        let secp = Secp256k1::new();
        let secret = SecretKey::from_slice(&[7u8; 32]).unwrap();
        let public = PublicKey::from_secret_key(&secp, &secret);

        let mut contract = ExchangeContract {
            counterparty: "Acme Exchange".into(),
            destination: "bc1qexample".into(),
            return_address: "bc1qreturn".into(),
            signature: Vec::new(),
        };
        contract.signature = sign_contract(&contract, &secret);
        contract.destination = "bc1qattacker".into();

        assert!(matches!(verify_contract(&contract, &public.serialize()), Err(Error::ExchangeError(_))));
    }

    #[test]
    fn wrong_issuer_key_is_rejected() {
        let secp = Secp256k1::new();
        let secret = SecretKey::from_slice(&[7u8; 32]).unwrap();
        let other_secret = SecretKey::from_slice(&[9u8; 32]).unwrap();
        let other_public = PublicKey::from_secret_key(&secp, &other_secret);

        let mut contract = ExchangeContract {
            counterparty: "Acme Exchange".into(),
            destination: "bc1qexample".into(),
            return_address: "bc1qreturn".into(),
            signature: Vec::new(),
        };
        contract.signature = sign_contract(&contract, &secret);

        assert!(matches!(verify_contract(&contract, &other_public.serialize()), Err(Error::ExchangeError(_))));
    }
}
