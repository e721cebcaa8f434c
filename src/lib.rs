// VaultCore: firmware core for a hardware cryptocurrency wallet
//
// This software is distributed without any warranty.

#![recursion_limit = "256"]
// Coding conventions
#![deny(
    non_upper_case_globals,
    non_camel_case_types,
    non_snake_case,
    unused_mut,
    unused_imports,
    // dead_code
    // missing_docs,
)]
#![allow(dead_code)]
#![allow(unused_variables)]

#[macro_use]
extern crate amplify;
#[macro_use]
extern crate amplify_derive;

pub mod config;
pub mod confirm;
pub mod crypto;
pub mod dispatcher;
pub mod error;
pub mod flash;
pub mod hal;
pub mod passphrase;
pub mod pin;
pub mod policy;
pub mod protocol;
pub mod recovery;
pub mod secret;
pub mod session;
pub mod signer;
pub mod storage;

pub use dispatcher::Dispatcher;
pub use error::Error;
