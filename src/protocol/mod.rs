// VaultCore: firmware core for a hardware cryptocurrency wallet
//
// This software is distributed without any warranty.

//! The host-facing wire protocol (`spec.md` §6 "External Interfaces"): the
//! transport frame envelope and the message set the dispatcher matches on.
//! USB HID packetization below the envelope, and the pixel-level rendering
//! of any message, stay external (`crate::hal`).

pub mod frame;
pub mod message;

pub use frame::{FrameError, Reassembler, HEADER_LEN, HID_PACKET_LEN};
pub use message::{
    ButtonRequestKind, Request, Reply, TxRequestKind,
};

use serde::{Deserialize, Serialize};

/// Wire-level failure codes (`spec.md` §6 "Failure codes").
#[derive(Copy, Clone, Eq, PartialEq, Debug, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCode {
    #[display("unexpected_message")]
    UnexpectedMessage,
    #[display("button_expected")]
    ButtonExpected,
    #[display("data_error")]
    DataError,
    #[display("action_cancelled")]
    ActionCancelled,
    #[display("pin_expected")]
    PinExpected,
    #[display("pin_cancelled")]
    PinCancelled,
    #[display("pin_invalid")]
    PinInvalid,
    #[display("invalid_signature")]
    InvalidSignature,
    #[display("other")]
    Other,
    #[display("not_enough_funds")]
    NotEnoughFunds,
    #[display("not_initialized")]
    NotInitialized,
    #[display("firmware_error")]
    FirmwareError,
}
