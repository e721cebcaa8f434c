// VaultCore: firmware core for a hardware cryptocurrency wallet
// Written in 2021-2026
//
// This software is distributed without any warranty.

use std::io;

use crate::protocol::FailureCode;

/// Crate-wide error type. Every fallible operation in the core funnels
/// through this enum; the dispatcher converts it into a `Failure` message
/// before replying to the host (see [`Error::failure_code`]).
#[derive(Clone, Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum Error {
    /// message framing error: {0}
    #[from]
    Frame(crate::protocol::FrameError),

    /// unexpected message {0} received for the current state
    UnexpectedMessage(&'static str),

    /// message payload failed to decode: {0}
    DataError(String),

    /// the action was cancelled by the user or by an incoming Cancel/Initialize message
    ActionCancelled,

    /// a PIN was expected but the operation was not PIN-authenticated
    PinExpected,

    /// PIN entry was cancelled
    PinCancelled,

    /// the PIN (or recovery word) entered was not valid
    PinInvalid,

    /// a signature failed to validate
    InvalidSignature,

    /// storage has not been initialized
    NotInitialized,

    /// the transaction does not have enough input value to cover its outputs and fee
    NotEnoughFunds,

    /// a hardware/firmware fault was detected, the device must be rebooted
    FirmwareError(String),

    /// {0}
    Other(String),

    // --- storage engine ---
    /// flash commit failed after exhausting all retries
    FlashCommitFailed,

    /// no flash sector carries a valid magic; storage is uninitialized
    StorageUninitialized,

    /// decrypted secret fingerprint does not match the recorded one; storage has been wiped
    FingerprintMismatch,

    /// storage schema version {0} is not supported for reading
    UnsupportedSchemaVersion(u16),

    #[from]
    Io(io::Error),

    // --- signer ---
    /// previous-transaction amount changed during signing
    AmountChangedDuringSigning,

    /// phase-1/phase-2 checksum mismatch while streaming the transaction
    ChecksumMismatch,

    /// more than one output was classified as change
    MultipleChangeOutputs,

    /// a BIP-143 input is missing its declared amount
    MissingInputAmount,

    /// fee exceeds the coin's configured threshold
    FeeOverThreshold,

    // --- ethereum signer ---
    /// ethereum `to` field must be 20 bytes or empty
    InvalidEthereumRecipient,

    /// ethereum gas_price_size + gas_limit_size exceeds the overflow guard
    EthereumFeeOverflow,

    /// ethereum data payload exceeds the 16 MiB limit
    EthereumDataTooLarge,

    /// ethereum chain_id {0} is out of the supported [1, 109] range
    EthereumChainIdOutOfRange(u32),

    /// ERC-20 transfer must carry a zero value and empty data
    InvalidTokenTransfer,

    // --- exchange policy hook ---
    /// exchange contract verification failed: {0}
    ExchangeError(String),

    // --- recovery cipher ---
    /// the entered word sequence is not valid BIP-39 English
    SyntaxError,

    /// BIP-39 checksum validation failed
    ChecksumInvalid,
}

impl Error {
    /// Maps this error onto the wire-level failure code used in `Failure`
    /// replies (`spec.md` §6/§7). Integrity failures never reach this path:
    /// they are handled by a fatal halt before a `Failure` would be sent.
    pub fn failure_code(&self) -> FailureCode {
        match self {
            Error::Frame(_) | Error::UnexpectedMessage(_) => {
                FailureCode::UnexpectedMessage
            }
            Error::DataError(_)
            | Error::UnsupportedSchemaVersion(_)
            | Error::InvalidEthereumRecipient
            | Error::EthereumFeeOverflow
            | Error::EthereumDataTooLarge
            | Error::EthereumChainIdOutOfRange(_)
            | Error::InvalidTokenTransfer
            | Error::SyntaxError
            | Error::ChecksumInvalid => FailureCode::DataError,
            Error::ActionCancelled => FailureCode::ActionCancelled,
            Error::PinExpected => FailureCode::PinExpected,
            Error::PinCancelled => FailureCode::PinCancelled,
            Error::PinInvalid => FailureCode::PinInvalid,
            Error::InvalidSignature => FailureCode::InvalidSignature,
            Error::NotInitialized => FailureCode::NotInitialized,
            Error::NotEnoughFunds => FailureCode::NotEnoughFunds,
            Error::FirmwareError(_)
            | Error::FlashCommitFailed
            | Error::StorageUninitialized
            | Error::FingerprintMismatch => FailureCode::FirmwareError,
            Error::ChecksumMismatch
            | Error::MultipleChangeOutputs
            | Error::MissingInputAmount
            | Error::FeeOverThreshold
            | Error::AmountChangedDuringSigning
            | Error::ExchangeError(_)
            | Error::Io(_)
            | Error::Other(_) => FailureCode::Other,
        }
    }
}
