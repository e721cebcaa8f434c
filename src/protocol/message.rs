// VaultCore: firmware core for a hardware cryptocurrency wallet
//
// This software is distributed without any warranty.

//! The message set (`spec.md` §6, `SPEC_FULL.md` §4.2 expansion). A
//! language-neutral equivalent of the original's static
//! `(id, schema, handler, variant-gate)` table (`spec.md` §9 "Design
//! Notes"): [`Request`] is the tagged union the dispatcher matches on,
//! [`Reply`] is everything a handler can hand back.
//!
//! Field fidelity favors the three subsystems this crate actually
//! implements (storage, state machines, signer) over exhaustively
//! replicating every cosmetic field of the original wire schema; `spec.md`
//! itself calls its message table "representative, not exhaustive".

use serde::{Deserialize, Serialize};

use crate::policy::PolicyId;
use crate::protocol::FailureCode;
use crate::signer::bitcoin::{TxInputWire, TxOutputWire};
use crate::signer::ethereum::EthereumSignTxWire;

/// What the confirmation primitive is asking the user to approve
/// (`spec.md` §4.3).
#[derive(Copy, Clone, Eq, PartialEq, Debug, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ButtonRequestKind {
    #[display("other")]
    Other,
    #[display("confirm_output")]
    ConfirmOutput,
    #[display("confirm_transfer")]
    ConfirmTransfer,
    #[display("confirm_fee_over_threshold")]
    FeeOverThreshold,
    #[display("confirm_summary")]
    SignTx,
    #[display("wipe_device")]
    WipeDevice,
    #[display("protect_call")]
    ProtectCall,
    #[display("confirm_word")]
    ConfirmWord,
    #[display("confirm_recovery")]
    RecoveryHome,
    #[display("confirm_exchange")]
    Exchange,
    #[display("confirm_cipher")]
    Cipher,
}

/// What phase of the streaming signer a `TxRequest` is asking the host
/// for (`spec.md` §4.7).
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxRequestKind {
    TxInput,
    TxOutput,
    TxMeta,
    TxExtraData,
    TxFinished,
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct HdNodeWire {
    pub depth: u8,
    pub fingerprint: u32,
    pub child_num: u32,
    pub chain_code: [u8; 32],
    pub private_key: Option<[u8; 32]>,
    pub public_key: Option<[u8; 33]>,
}

#[derive(Clone, Eq, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct FeaturesReply {
    pub vendor: String,
    pub major_version: u32,
    pub minor_version: u32,
    pub patch_version: u32,
    pub initialized: bool,
    pub label: Option<String>,
    pub language: Option<String>,
    pub pin_protection: bool,
    pub pin_cached: bool,
    pub passphrase_protection: bool,
    pub passphrase_cached: bool,
    pub imported: bool,
    pub no_backup: bool,
    pub policies: Vec<(String, bool)>,
    pub u2f_counter: u32,
}

/// Inbound requests the dispatcher resolves to a handler (`spec.md` §4.2).
/// Each variant's doc comment names the handler's authentication/variant
/// gate it is grounded on.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Request {
    /// Cancels everything in flight; always allowed, never gated.
    Initialize,
    /// Reports device capabilities; always allowed.
    GetFeatures,
    /// Unwinds the current operation without resetting the session.
    Cancel,
    /// Drops the cached PIN/passphrase/seed (`SessionState::session_clear`).
    ClearSession,

    PinMatrixAck { pin: String },
    PassphraseAck { passphrase: String },
    ButtonAck,

    WipeDevice,
    LoadDevice {
        mnemonic: Option<String>,
        node: Option<HdNodeWire>,
        pin: Option<String>,
        passphrase_protection: bool,
        label: Option<String>,
        language: Option<String>,
    },
    ResetDevice {
        passphrase_protection: bool,
        pin_protection: bool,
        label: Option<String>,
        language: Option<String>,
        no_backup: bool,
        strength: u32,
    },
    RecoveryDevice {
        word_count: u32,
        passphrase_protection: bool,
        pin_protection: bool,
        enforce_wordlist: bool,
        dry_run: bool,
        label: Option<String>,
        language: Option<String>,
    },
    WordAck { word: String },
    ChangePin { remove: bool },
    ApplySettings {
        label: Option<String>,
        language: Option<String>,
        use_passphrase: Option<bool>,
        auto_lock_delay_ms: Option<u32>,
    },
    ApplyPolicies { policies: Vec<(PolicyId, bool)> },

    GetAddress { address_n: Vec<u32>, coin_name: String, show_display: bool },
    GetPublicKey { address_n: Vec<u32>, coin_name: String },

    SignTx { inputs_count: u32, outputs_count: u32, coin_name: String, lock_time: u32 },
    TxAck {
        inputs: Vec<TxInputWire>,
        outputs: Vec<TxOutputWire>,
        version: u32,
        lock_time: u32,
        /// Raw bytes of a previous transaction, streamed in chunks when the
        /// dispatcher requested `TxRequestKind::TxMeta`/`TxInput` for a
        /// `prev_hash` lookup (`spec.md` §4.7 "Previous-transaction
        /// parsing").
        prev_tx_chunk: Option<Vec<u8>>,
    },

    EthereumSignTx(EthereumSignTxWire),
    EthereumTxAck { data_chunk: Vec<u8> },

    /// `SPEC_FULL.md` §4.2 expansion: signs an arbitrary message with a
    /// derived key, the same "review a plaintext body then sign its
    /// digest" shape as `SignTx`/`EthereumSignTx` but over one message
    /// rather than a streamed transaction.
    SignMessage { address_n: Vec<u32>, message: Vec<u8>, coin_name: String },
    /// Checks a signature against an address without any key material on
    /// the device; never touches the PIN/passphrase/signer subsystems.
    VerifyMessage { address: String, message: Vec<u8>, signature: [u8; 65], coin_name: String },

    /// Reports the serialized size Phase 1 would produce for a
    /// transaction of this shape, without running the signer or touching
    /// the session (`SPEC_FULL.md` §4.2 expansion).
    EstimateTxSize { inputs_count: u32, outputs_count: u32, coin_name: String },

    /// `spec.md` §6 message table / `original_source/lib/firmware/fsm.c`'s
    /// `fsm_msgCipherKeyValue`: a symmetric key-wrap primitive, keying an
    /// AES-256-CBC operation off a derived node and a caller-chosen `key`
    /// string rather than exposing the derived private key itself.
    /// `value` must be a multiple of 16 bytes. `iv` overrides the IV
    /// derived from `key`/`address_n` when present, matching the original's
    /// `msg->iv.size == 16` check.
    CipherKeyValue {
        address_n: Vec<u32>,
        key: String,
        value: Vec<u8>,
        encrypt: bool,
        ask_on_encrypt: bool,
        ask_on_decrypt: bool,
        iv: Option<[u8; 16]>,
    },

    /// The exchange policy hook's off-device contract endorsement
    /// (`spec.md` §4.9, `SPEC_FULL.md` §4.2 expansion): verifies the
    /// issuer-signed contract, then signs its digest with a device key so
    /// the exchange can prove device-side endorsement.
    EndorseTransaction {
        address_n: Vec<u32>,
        counterparty: String,
        destination: String,
        return_address: String,
        issuer_signature: Vec<u8>,
    },

    DebugLinkGetState,
}

/// Outbound replies (`spec.md` §6).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Reply {
    Features(FeaturesReply),
    Success { message: String },
    Failure { code: FailureCode, message: String },

    PinMatrixRequest,
    PassphraseRequest,
    ButtonRequest { code: ButtonRequestKind },

    WordRequest,

    Address { address: String },
    PublicKey { node: HdNodeWire, xpub: String },

    TxRequest {
        kind: TxRequestKind,
        /// Which input/output index the host should supply next, when
        /// applicable.
        index: Option<u32>,
        /// Serialized bytes the dispatcher is streaming back to the host
        /// (`spec.md` §4.7 Phase 2: "emits the serialised bytes chunk").
        serialized_chunk: Option<Vec<u8>>,
    },

    EthereumTxRequest {
        data_length: Option<u32>,
        signature_v: Option<u32>,
        signature_r: Option<[u8; 32]>,
        signature_s: Option<[u8; 32]>,
    },

    /// Reply to [`Request::SignMessage`].
    MessageSignature { address: String, signature: [u8; 65] },

    /// Reply to [`Request::EstimateTxSize`]: the Phase 1 serialized size in
    /// bytes, computed without running the signer.
    TxSize { size: u32 },

    /// Reply to [`Request::CipherKeyValue`].
    CipheredKeyValue { value: Vec<u8> },

    /// Reply to [`Request::EndorseTransaction`]: the device's signature
    /// over the verified exchange contract, proving device-side
    /// endorsement (`spec.md` §4.9).
    Endorsement { signature: Vec<u8> },

    DebugLinkState { mnemonic: Option<String>, pin: Option<String> },
}

impl Reply {
    pub fn failure(code: FailureCode, message: impl Into<String>) -> Reply {
        Reply::Failure { code, message: message.into() }
    }

    pub fn success(message: impl Into<String>) -> Reply {
        Reply::Success { message: message.into() }
    }
}

impl From<crate::error::Error> for Reply {
    fn from(err: crate::error::Error) -> Reply {
        let code = err.failure_code();
        Reply::Failure { code, message: err.to_string() }
    }
}
