// VaultCore: firmware core for a hardware cryptocurrency wallet
//
// This software is distributed without any warranty.

//! The streaming transaction signer (`spec.md` §4.7 Bitcoin-family,
//! §4.8 Ethereum, §4.9 exchange hook). Grounded in
//! `original_source/lib/firmware/signing.c`/`transaction.c` (Bitcoin-family)
//! and `ethereum.c` (Ethereum), reimplemented as explicit state structs
//! owned by the dispatcher per `spec.md` §9 "Global state": "model them as
//! explicit state structs owned by the dispatcher, indexed by a 'current
//! operation' tagged union".

pub mod bitcoin;
pub mod ethereum;
pub mod exchange;
