// VaultCore: firmware core for a hardware cryptocurrency wallet
//
// This software is distributed without any warranty.

//! Interfaces to the collaborators `spec.md` §1 places out of scope: the
//! display/pixel compositor, button input, the USB HID transport below the
//! message envelope, the hardware RNG, the QR encoder and the coin table.
//!
//! The core depends only on these traits, never on a concrete hardware
//! binding, the same way the teacher's `Runtime` depends on `storage::Driver`
//! and `cache::Driver` traits rather than a concrete file format.

use crate::protocol::FailureCode;

/// A source of hardware entropy, mixed with host-supplied entropy by the
/// storage engine when deriving salts (`spec.md` §4.1) and never used on its
/// own (`spec.md` §1 Non-goals).
pub trait HardwareRng {
    /// Fill `dest` with hardware-sourced random bytes.
    fn fill(&mut self, dest: &mut [u8]);
}

/// Which physical button the user pressed, reported by the (external)
/// button debouncer.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ButtonEvent {
    Confirm,
    Cancel,
}

/// Polls the button hardware. Implementations must be non-blocking: the
/// confirmation state machine (`spec.md` §4.3) polls this alongside the
/// tiny-message channel at every suspension point.
pub trait Buttons {
    fn poll(&mut self) -> Option<ButtonEvent>;
}

/// What to render for a confirmation dialogue. `spec.md` §4.3 requires an
/// automatic hex fallback whenever the body contains a byte outside
/// `[0x20, 0x7E]`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ConfirmLayout {
    /// Plain multi-line text body, e.g. "Send 0.1 ETH to 0x...".
    Text { title: String, lines: Vec<String> },
    /// Hex rendering, used automatically for non-printable payloads (EOS
    /// memos, arbitrary data blobs).
    Hex { title: String, bytes: Vec<u8> },
    /// Three-line exchange-specific dialogue (`spec.md` §4.9).
    Exchange {
        counterparty: String,
        destination: String,
        return_address: String,
    },
    /// Distinct layout for TRANSFER outputs, which move funds between the
    /// user's own accounts without being classified as change.
    Transfer { title: String, lines: Vec<String> },
}

/// The display compositor. The core only ever asks it to show a button
/// request body; pixel layout, fonts and animation are the display's
/// business.
pub trait Display {
    fn show_confirm(&mut self, layout: &ConfirmLayout);
    fn show_progress(&mut self, title: &str, permille: u16);
    fn show_fatal(&mut self, message: &str);
    fn show_home(&mut self);
}

/// Per-coin limits and formatting hints the signer consults but never
/// computes itself (`spec.md` §1 Non-goals: "coin-table data").
#[derive(Clone, Debug)]
pub struct CoinParams {
    pub coin_name: &'static str,
    pub max_fee_per_kb: u64,
    pub forkid_enabled: bool,
    pub decimals: u8,
}

/// Per-token limits for ERC-20 transfers (`spec.md` §4.8).
#[derive(Clone, Debug)]
pub struct TokenParams {
    pub symbol: &'static str,
    pub contract_address: [u8; 20],
    pub max_gas_limit: u64,
}

/// External coin/token table lookups.
pub trait CoinTable {
    fn coin(&self, name: &str) -> Option<CoinParams>;
    fn token(&self, shortcut: &str) -> Option<TokenParams>;
}

/// A framed transport endpoint. `spec.md` §6 fixes the envelope
/// (`'?' '#' '#' id:u16_be len:u32_be payload`); how those bytes travel over
/// USB HID packets of <=64 bytes is external to the core.
pub trait Transport {
    fn recv_frame(&mut self) -> std::io::Result<Vec<u8>>;
    fn send_frame(&mut self, id: u16, payload: &[u8]) -> std::io::Result<()>;
}

/// A reply the dispatcher can use in place of a successfully decoded
/// message, surfaced on protocol violations.
pub fn unexpected(name: &'static str) -> (FailureCode, String) {
    (FailureCode::UnexpectedMessage, format!("unexpected message: {name}"))
}
