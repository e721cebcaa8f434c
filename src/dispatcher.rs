// VaultCore: firmware core for a hardware cryptocurrency wallet
//
// This software is distributed without any warranty.

//! The message dispatcher (`spec.md` §4.2, `SPEC_FULL.md` §4.2 expansion):
//! the one object that actually owns a [`StorageEngine`], a
//! [`SessionState`] and every state machine in this crate, and turns each
//! inbound [`Request`] into a [`Reply`].
//!
//! Grounded in `original_source/lib/firmware/fsm.c` (`fsm_msgSignTx` and
//! friends dispatching on a static `(id, schema, handler)` table) and in
//! `spec.md` §9 "Design Notes": there is no OS thread per operation, so a
//! confirmation or a PIN prompt in flight is just a value this struct
//! holds between calls to [`Dispatcher::handle_request`], and
//! [`Dispatcher::poll`] is the only place a blocking wait (button press)
//! is ever resolved.

use bitcoin::bip32::Xpriv;
use bitcoin::secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use bitcoin::secp256k1::{Message, PublicKey as SecpPublicKey, Secp256k1};
use bitcoin::{Address, NetworkKind, PublicKey};
use sha2::{Digest, Sha256};

use crate::confirm::{text_or_hex_layout, ConfirmationFlow};
use crate::crypto::wrap::PinCheckResult;
use crate::error::Error;
use crate::flash::Flash;
use crate::hal::{Buttons, CoinParams, CoinTable, ConfirmLayout, Display, HardwareRng};
use crate::passphrase::PassphraseStateMachine;
use crate::pin::PinStateMachine;
use crate::policy::PolicyId;
use crate::protocol::message::{ButtonRequestKind, HdNodeWire, Request, Reply, TxRequestKind};
use crate::protocol::FailureCode;
use crate::recovery::{RecoveryCipher, RecoveryState, WordOutcome};
use crate::secret::Pin;
use crate::session::SessionState;
use crate::signer::bitcoin::{
    derivation_path, estimate_tx_size, BitcoinSigner, PrevTxParser, PrevTxResult, TxInputWire,
    TxOutputWire,
};
use crate::signer::ethereum::{EthereumProgress, EthereumSignTxWire, EthereumSigner};
use crate::signer::exchange::{verify_contract, ExchangeContract};
use crate::storage::engine::{Curve, RootNode, StorageEngine};

/// What the dispatcher was doing when it had to suspend for a PIN, a
/// passphrase or a button press, and therefore what to resume with once
/// that sub-machine reaches `Finished` (`spec.md` §9 "Global state": "model
/// them as explicit state structs owned by the dispatcher").
#[derive(Clone)]
enum UnlockPurpose {
    GetAddress { address_n: Vec<u32>, coin_name: String, show_display: bool },
    GetPublicKey { address_n: Vec<u32>, coin_name: String },
    SignMessage { address_n: Vec<u32>, message: Vec<u8>, coin_name: String },
    CipherKeyValue {
        address_n: Vec<u32>,
        key: String,
        value: Vec<u8>,
        encrypt: bool,
        ask_on_encrypt: bool,
        ask_on_decrypt: bool,
        iv: Option<[u8; 16]>,
    },
    EndorseTransaction {
        address_n: Vec<u32>,
        counterparty: String,
        destination: String,
        return_address: String,
        issuer_signature: Vec<u8>,
    },
    BeginSignTx { inputs_count: u32, outputs_count: u32, coin_name: String, lock_time: u32 },
    BeginEthereumSignTx(EthereumSignTxWire),
    /// A dry-run `RecoveryDevice` (`spec.md` §4.6): needs the stored
    /// mnemonic decrypted before [`RecoveryCipher::start`] can compare
    /// against it, so it rides the same unlock/passphrase gate as every
    /// other key-derivation request instead of reading `storage.secret`
    /// directly.
    StartRecovery {
        word_count: u32,
        enforce_wordlist: bool,
        label: Option<String>,
        language: Option<String>,
    },
}

enum Pending {
    None,
    UnlockThen(UnlockPurpose),
    PassphraseThen(UnlockPurpose),
    ConfirmWipeDevice,
    ConfirmTxOutput,
    ConfirmTxFeeOverThreshold,
    ConfirmTxSummary,
    ConfirmEthereumSummary,
    ConfirmExchange { address_n: Vec<u32> },
    ConfirmCipherKeyValue {
        address_n: Vec<u32>,
        key: String,
        value: Vec<u8>,
        encrypt: bool,
        ask_on_encrypt: bool,
        ask_on_decrypt: bool,
        iv: Option<[u8; 16]>,
    },
}

/// Bookkeeping for one `SignTx` dialogue, threaded across the
/// `TxRequest`/`TxAck` round trips (`spec.md` §4.7).
struct BitcoinFlow {
    coin: CoinParams,
    inputs_total: u32,
    outputs_total: u32,
    next_input: u32,
    next_output: u32,
    sign_index: u32,
    sighash_type: u32,
    signer: Option<BitcoinSigner>,
    pending_output: Option<TxOutputWire>,
}

impl BitcoinFlow {
    fn sighash_type_for(coin: &CoinParams) -> u32 {
        const SIGHASH_ALL: u32 = 0x01;
        const SIGHASH_FORKID: u32 = 0x40;
        if coin.forkid_enabled {
            SIGHASH_ALL | SIGHASH_FORKID
        } else {
            SIGHASH_ALL
        }
    }
}

/// Bookkeeping for one `EthereumSignTx` dialogue.
struct EthereumFlow {
    signer: EthereumSigner,
}

/// The message dispatcher. Generic over the same collaborator traits as
/// [`StorageEngine`] plus the UI-facing ones `spec.md` §1 places out of
/// scope (`crate::hal`); `src/bin/simulator.rs` is the only place that
/// names concrete types for all five.
pub struct Dispatcher<F: Flash, R: HardwareRng, B: Buttons, D: Display, C: CoinTable> {
    storage: StorageEngine<F, R>,
    session: SessionState,
    ui_rng: R,
    buttons: B,
    display: D,
    coins: C,
    /// The fixed issuer key the exchange policy hook trusts (`spec.md`
    /// §4.9); baked into firmware the same way the original hardcodes its
    /// ShapeShift public key.
    exchange_issuer_pubkey: [u8; 33],

    confirm: Option<ConfirmationFlow>,
    pin_sm: Option<PinStateMachine>,
    passphrase_sm: Option<PassphraseStateMachine>,
    recovery: Option<RecoveryCipher>,
    bitcoin_flow: Option<BitcoinFlow>,
    ethereum_flow: Option<EthereumFlow>,

    pending: Pending,
    /// Last PIN the SM decoded, retained only for
    /// [`Request::DebugLinkGetState`] (`SPEC_FULL.md` §4.2 expansion: a
    /// debug-build-only test hook, never present on a production image).
    last_pin_attempt: Option<String>,
}

impl<F: Flash, R: HardwareRng, B: Buttons, D: Display, C: CoinTable> Dispatcher<F, R, B, D, C> {
    pub fn new(
        storage: StorageEngine<F, R>,
        ui_rng: R,
        buttons: B,
        display: D,
        coins: C,
        exchange_issuer_pubkey: [u8; 33],
    ) -> Self {
        Dispatcher {
            storage,
            session: SessionState::new(),
            ui_rng,
            buttons,
            display,
            coins,
            exchange_issuer_pubkey,
            confirm: None,
            pin_sm: None,
            passphrase_sm: None,
            recovery: None,
            bitcoin_flow: None,
            ethereum_flow: None,
            pending: Pending::None,
            last_pin_attempt: None,
        }
    }

    /// Advances button-driven confirmations (`spec.md` §4.3: the
    /// dispatcher's message loop polls buttons on every turn while a
    /// confirmation is `Waiting`). Returns the reply produced once the
    /// user accepts or rejects, or `None` while still waiting. The
    /// simulator binary calls this once per loop iteration alongside
    /// reading the transport.
    pub fn poll(&mut self) -> Option<Reply> {
        let confirm = self.confirm.as_mut()?;
        let accepted = confirm.poll_buttons(&mut self.buttons)?;
        self.confirm = None;
        self.display.show_home();

        if !accepted {
            self.abort_pending();
            return Some(Reply::failure(FailureCode::ActionCancelled, "rejected by user"));
        }

        let pending = std::mem::replace(&mut self.pending, Pending::None);
        Some(match pending {
            Pending::ConfirmWipeDevice => {
                match self.storage.wipe() {
                    Ok(()) => {
                        self.session.session_clear(false);
                        Reply::success("device wiped")
                    }
                    Err(e) => Reply::from(e),
                }
            }
            Pending::ConfirmTxOutput => self.continue_tx_outputs(),
            Pending::ConfirmTxFeeOverThreshold => self.continue_after_fee_confirm(),
            Pending::ConfirmTxSummary => self.begin_tx_phase2(),
            Pending::ConfirmEthereumSummary => self.sign_ethereum_now(),
            Pending::ConfirmExchange { address_n } => self.sign_endorsement(&address_n),
            Pending::ConfirmCipherKeyValue { address_n, key, value, encrypt, ask_on_encrypt, ask_on_decrypt, iv } => {
                self.do_cipher_key_value(&address_n, &key, &value, encrypt, ask_on_encrypt, ask_on_decrypt, iv)
            }
            _ => Reply::failure(FailureCode::UnexpectedMessage, "no confirmation in flight"),
        })
    }

    fn abort_pending(&mut self) {
        self.pending = Pending::None;
        self.bitcoin_flow = None;
        self.ethereum_flow = None;
    }

    /// Cancels everything in flight (`spec.md` §4.2 "Cancellation and
    /// re-entry"): `Initialize` keeps the cached PIN/storage key,
    /// `Cancel`/`ClearSession` do not.
    fn unwind(&mut self, keep_pin: bool) {
        self.confirm = None;
        self.pin_sm = None;
        self.passphrase_sm = None;
        self.recovery = None;
        self.abort_pending();
        self.storage.lock();
        self.session.session_clear(keep_pin);
    }

    fn features_reply(&self) -> Reply {
        let config = self.storage.config();
        Reply::Features(crate::protocol::message::FeaturesReply {
            vendor: "VaultCore".into(),
            major_version: 1,
            minor_version: 0,
            patch_version: 0,
            initialized: self.storage.is_initialized(),
            label: if config.label.is_empty() { None } else { Some(config.label.clone()) },
            language: if config.language.is_empty() { None } else { Some(config.language.clone()) },
            pin_protection: config.flags.has_pin,
            pin_cached: self.session.is_pin_cached(),
            passphrase_protection: config.flags.passphrase_protection,
            passphrase_cached: self.session.is_passphrase_cached(),
            imported: config.flags.imported,
            no_backup: config.flags.no_backup,
            policies: self.storage.get_policy().iter().map(|(id, e)| (id.to_string(), e)).collect(),
            u2f_counter: config.u2f_counter,
        })
    }

    /// The single entry point: turns one inbound message into one reply.
    /// Long-running operations return an intermediate reply (a `*Request`
    /// variant) and leave state in `self` for the next `handle_request` or
    /// `poll` call to pick up.
    pub fn handle_request(&mut self, request: Request) -> Reply {
        match request {
            Request::Initialize => {
                self.unwind(true);
                self.features_reply()
            }
            Request::GetFeatures => self.features_reply(),
            Request::Cancel => {
                self.unwind(true);
                Reply::failure(FailureCode::ActionCancelled, "cancelled")
            }
            Request::ClearSession => {
                self.unwind(false);
                Reply::success("session cleared")
            }

            Request::PinMatrixAck { pin } => self.handle_pin_ack(&pin),
            Request::PassphraseAck { passphrase } => self.handle_passphrase_ack(&passphrase),
            Request::ButtonAck => match self.confirm.as_mut() {
                Some(confirm) => match confirm.acknowledge() {
                    Ok(()) => {
                        confirm.mark_sent();
                        Reply::success("waiting for button press")
                    }
                    Err(e) => Reply::from(e),
                },
                None => Reply::failure(FailureCode::ButtonExpected, "no confirmation in flight"),
            },

            Request::WipeDevice => {
                self.pending = Pending::ConfirmWipeDevice;
                self.start_confirm(
                    ButtonRequestKind::WipeDevice,
                    text_or_hex_layout("Wipe device", b"Erase all data? This cannot be undone."),
                )
            }
            Request::LoadDevice { mnemonic, node, pin, passphrase_protection, label, language } => {
                self.load_device(mnemonic, node, pin, passphrase_protection, label, language)
            }
            Request::ResetDevice { passphrase_protection, pin_protection, label, language, no_backup, strength } => {
                self.reset_device(passphrase_protection, pin_protection, label, language, no_backup, strength)
            }
            Request::RecoveryDevice {
                word_count,
                passphrase_protection,
                pin_protection,
                enforce_wordlist,
                dry_run,
                label,
                language,
            } => {
                if dry_run {
                    let _ = (passphrase_protection, pin_protection);
                    self.ensure_unlocked(UnlockPurpose::StartRecovery {
                        word_count,
                        enforce_wordlist,
                        label,
                        language,
                    })
                } else {
                    self.start_recovery(
                        word_count,
                        passphrase_protection,
                        pin_protection,
                        enforce_wordlist,
                        label,
                        language,
                    )
                }
            }
            Request::WordAck { word } => self.handle_word_ack(&word),
            Request::ChangePin { remove } => self.change_pin(remove),
            Request::ApplySettings { label, language, use_passphrase, auto_lock_delay_ms } => {
                self.apply_settings(label, language, use_passphrase, auto_lock_delay_ms)
            }
            Request::ApplyPolicies { policies } => self.apply_policies(policies),

            Request::GetAddress { address_n, coin_name, show_display } => {
                self.ensure_unlocked(UnlockPurpose::GetAddress { address_n, coin_name, show_display })
            }
            Request::GetPublicKey { address_n, coin_name } => {
                self.ensure_unlocked(UnlockPurpose::GetPublicKey { address_n, coin_name })
            }
            Request::SignMessage { address_n, message, coin_name } => {
                self.ensure_unlocked(UnlockPurpose::SignMessage { address_n, message, coin_name })
            }
            Request::VerifyMessage { address, message, signature, coin_name } => {
                self.verify_message(&address, &message, &signature, &coin_name)
            }
            Request::CipherKeyValue { address_n, key, value, encrypt, ask_on_encrypt, ask_on_decrypt, iv } => {
                if key.is_empty() {
                    return Reply::failure(FailureCode::DataError, "no key provided");
                }
                if value.is_empty() {
                    return Reply::failure(FailureCode::DataError, "no value provided");
                }
                if value.len() % 16 != 0 {
                    return Reply::failure(FailureCode::DataError, "value length must be a multiple of 16");
                }
                self.ensure_unlocked(UnlockPurpose::CipherKeyValue {
                    address_n,
                    key,
                    value,
                    encrypt,
                    ask_on_encrypt,
                    ask_on_decrypt,
                    iv,
                })
            }
            Request::EstimateTxSize { inputs_count, outputs_count, coin_name } => {
                match self.coins.coin(&coin_name) {
                    Some(_) => Reply::TxSize { size: estimate_tx_size(inputs_count, outputs_count) as u32 },
                    None => Reply::failure(FailureCode::DataError, "unknown coin"),
                }
            }
            Request::EndorseTransaction { address_n, counterparty, destination, return_address, issuer_signature } => {
                self.ensure_unlocked(UnlockPurpose::EndorseTransaction {
                    address_n,
                    counterparty,
                    destination,
                    return_address,
                    issuer_signature,
                })
            }

            Request::SignTx { inputs_count, outputs_count, coin_name, lock_time } => {
                self.ensure_unlocked(UnlockPurpose::BeginSignTx { inputs_count, outputs_count, coin_name, lock_time })
            }
            Request::TxAck { inputs, outputs, version, lock_time, prev_tx_chunk } => {
                self.handle_tx_ack(inputs, outputs, version, lock_time, prev_tx_chunk)
            }

            Request::EthereumSignTx(wire) => self.ensure_unlocked(UnlockPurpose::BeginEthereumSignTx(wire)),
            Request::EthereumTxAck { data_chunk } => self.handle_ethereum_tx_ack(data_chunk),

            Request::DebugLinkGetState => {
                let mnemonic = self.storage.config().flags.has_mnemonic.then(|| String::from("<redacted>"));
                Reply::DebugLinkState { mnemonic, pin: self.last_pin_attempt.clone() }
            }
        }
    }

    fn start_confirm(&mut self, kind: ButtonRequestKind, layout: ConfirmLayout) -> Reply {
        self.display.show_confirm(&layout);
        let mut flow = ConfirmationFlow::start(kind, layout);
        flow.mark_sent();
        self.confirm = Some(flow);
        Reply::ButtonRequest { code: kind }
    }

    // --- PIN / passphrase gating -------------------------------------------

    /// Entry point for every operation that needs a derived key. Either
    /// proceeds immediately (PIN already cached this session), asks for a
    /// PIN, or fails outright on an uninitialized device.
    fn ensure_unlocked(&mut self, purpose: UnlockPurpose) -> Reply {
        if !self.storage.is_initialized() {
            return Reply::failure(FailureCode::NotInitialized, "device not initialized");
        }

        if let Some(key) = self.session.storage_key().cloned() {
            return match self.storage.unlock_with_key(&key.0) {
                Ok(()) => self.after_unlock(purpose),
                Err(e) => Reply::from(e),
            };
        }

        if !self.storage.config().flags.has_pin {
            return match self.storage.unlock_without_pin() {
                Ok(()) => {
                    if let Some(key) = self.storage.take_active_storage_key() {
                        self.session.cache_storage_key(key);
                    }
                    self.after_unlock(purpose)
                }
                Err(e) => Reply::from(e),
            };
        }

        self.pending = Pending::UnlockThen(purpose);
        self.pin_sm = Some(PinStateMachine::start(&mut self.ui_rng));
        Reply::PinMatrixRequest
    }

    fn handle_pin_ack(&mut self, sequence: &str) -> Reply {
        let Some(mut sm) = self.pin_sm.take() else {
            return Reply::failure(FailureCode::UnexpectedMessage, "no PinMatrixAck expected");
        };
        let pin = match sm.decode_ack(sequence) {
            Ok(pin) => pin,
            Err(e) => {
                self.pin_sm = Some(sm);
                return Reply::from(e);
            }
        };
        self.last_pin_attempt = Some(pin_as_display_string(&pin));

        let wipe_matched = self
            .storage
            .config()
            .flags
            .has_wipe_code
            .then(|| self.storage.is_wipe_code_correct(pin.as_bytes()).unwrap_or(false))
            .unwrap_or(false);

        if wipe_matched {
            sm.finish(PinCheckResult::Wrong, true);
            self.pending = Pending::None;
            return Reply::failure(FailureCode::PinInvalid, "pin invalid");
        }

        let verdict = match self.storage.is_pin_correct(pin.as_bytes()) {
            Ok(v) => v,
            Err(e) => {
                self.pending = Pending::None;
                return Reply::from(e);
            }
        };
        let outcome = sm.finish(verdict, false);

        use crate::pin::PinOutcome;
        match outcome {
            PinOutcome::Correct => {
                if let Some(key) = self.storage.take_active_storage_key() {
                    self.session.cache_storage_key(key);
                }
                let pending = std::mem::replace(&mut self.pending, Pending::None);
                match pending {
                    Pending::UnlockThen(purpose) => self.after_unlock(purpose),
                    _ => Reply::success("pin correct"),
                }
            }
            PinOutcome::Wrong | PinOutcome::WipedViaCollision => {
                self.pending = Pending::None;
                Reply::failure(FailureCode::PinInvalid, "pin invalid")
            }
            PinOutcome::Cancelled => {
                self.pending = Pending::None;
                Reply::failure(FailureCode::PinCancelled, "pin entry cancelled")
            }
        }
    }

    /// Having authenticated, either request the passphrase (if enabled and
    /// not already cached) or run the purpose's derivation now.
    fn after_unlock(&mut self, purpose: UnlockPurpose) -> Reply {
        if self.storage.config().flags.passphrase_protection && !self.session.is_passphrase_cached() {
            self.pending = Pending::PassphraseThen(purpose);
            self.passphrase_sm = Some(PassphraseStateMachine::start());
            return Reply::PassphraseRequest;
        }
        self.execute(purpose)
    }

    fn handle_passphrase_ack(&mut self, passphrase: &str) -> Reply {
        let Some(mut sm) = self.passphrase_sm.take() else {
            return Reply::failure(FailureCode::UnexpectedMessage, "no PassphraseAck expected");
        };
        match sm.finish(passphrase) {
            Ok(cached) => {
                self.session.cache_passphrase(cached);
                let pending = std::mem::replace(&mut self.pending, Pending::None);
                match pending {
                    Pending::PassphraseThen(purpose) => self.execute(purpose),
                    _ => Reply::success("passphrase set"),
                }
            }
            Err(e) => {
                self.passphrase_sm = Some(sm);
                Reply::from(e)
            }
        }
    }

    fn root_node(&mut self) -> Result<Xpriv, Error> {
        match self.storage.get_root_node(Curve::Secp256k1, true, &mut self.session)? {
            RootNode::Secp256k1(xpriv) => Ok(xpriv),
            RootNode::Ed25519(_) => Err(Error::Other(s!("ed25519 root requested on a secp256k1-only path"))),
        }
    }

    fn execute(&mut self, purpose: UnlockPurpose) -> Reply {
        match purpose {
            UnlockPurpose::GetAddress { address_n, coin_name, show_display } => {
                self.get_address(&address_n, &coin_name, show_display)
            }
            UnlockPurpose::GetPublicKey { address_n, coin_name } => self.get_public_key(&address_n, &coin_name),
            UnlockPurpose::SignMessage { address_n, message, coin_name } => {
                self.sign_message(&address_n, &message, &coin_name)
            }
            UnlockPurpose::CipherKeyValue { address_n, key, value, encrypt, ask_on_encrypt, ask_on_decrypt, iv } => {
                self.begin_cipher_key_value(address_n, key, value, encrypt, ask_on_encrypt, ask_on_decrypt, iv)
            }
            UnlockPurpose::EndorseTransaction { address_n, counterparty, destination, return_address, issuer_signature } => {
                self.endorse_transaction(address_n, counterparty, destination, return_address, issuer_signature)
            }
            UnlockPurpose::BeginSignTx { inputs_count, outputs_count, coin_name, lock_time } => {
                self.begin_sign_tx(inputs_count, outputs_count, coin_name, lock_time)
            }
            UnlockPurpose::BeginEthereumSignTx(wire) => self.begin_ethereum_sign_tx(wire),
            UnlockPurpose::StartRecovery { word_count, enforce_wordlist, label, language } => {
                self.start_recovery_dry_run(word_count, enforce_wordlist, label, language)
            }
        }
    }

    // --- address / pubkey / message signing --------------------------------

    fn derive_pubkey_and_address(&mut self, address_n: &[u32]) -> Result<(PublicKey, String), Error> {
        let root = self.root_node()?;
        let secp = Secp256k1::new();
        let path = derivation_path(address_n)?;
        let child = root.derive_priv(&secp, &path).map_err(|e| Error::Other(format!("derivation failed: {e}")))?;
        let public_key = PublicKey::new(child.private_key.public_key(&secp));
        let address = Address::p2pkh(public_key, NetworkKind::Main);
        Ok((public_key, address.to_string()))
    }

    fn get_address(&mut self, address_n: &[u32], coin_name: &str, show_display: bool) -> Reply {
        if self.coins.coin(coin_name).is_none() {
            return Reply::failure(FailureCode::DataError, "unknown coin");
        }
        let (_, address) = match self.derive_pubkey_and_address(address_n) {
            Ok(v) => v,
            Err(e) => return Reply::from(e),
        };
        if show_display {
            self.display.show_confirm(&text_or_hex_layout("Address", address.as_bytes()));
            self.display.show_home();
        }
        Reply::Address { address }
    }

    fn get_public_key(&mut self, address_n: &[u32], coin_name: &str) -> Reply {
        if self.coins.coin(coin_name).is_none() {
            return Reply::failure(FailureCode::DataError, "unknown coin");
        }
        let root = match self.root_node() {
            Ok(r) => r,
            Err(e) => return Reply::from(e),
        };
        let secp = Secp256k1::new();
        let path = match derivation_path(address_n) {
            Ok(p) => p,
            Err(e) => return Reply::from(e),
        };
        let child = match root.derive_priv(&secp, &path) {
            Ok(c) => c,
            Err(e) => return Reply::from(Error::Other(format!("derivation failed: {e}"))),
        };
        let public_key = child.private_key.public_key(&secp);
        let xpub = bitcoin::bip32::Xpub::from_priv(&secp, &child);
        let node = HdNodeWire {
            depth: child.depth,
            fingerprint: u32::from_be_bytes(<[u8; 4]>::from(child.parent_fingerprint)),
            child_num: u32::from(child.child_number),
            chain_code: <[u8; 32]>::from(child.chain_code),
            private_key: None,
            public_key: Some(public_key.serialize()),
        };
        Reply::PublicKey { node, xpub: xpub.to_string() }
    }

    /// Minimal re-implementation of the Bitcoin-family varint encoding used
    /// by the message-signing digest below; kept local rather than reused
    /// from `signer::bitcoin` since that module's encoder is private to its
    /// own transaction serialization.
    fn encode_message_len(n: usize) -> Vec<u8> {
        let n = n as u64;
        if n < 0xfd {
            vec![n as u8]
        } else if n <= 0xffff {
            let mut v = vec![0xfd];
            v.extend_from_slice(&(n as u16).to_le_bytes());
            v
        } else {
            let mut v = vec![0xfe];
            v.extend_from_slice(&(n as u32).to_le_bytes());
            v
        }
    }

    fn message_digest(message: &[u8]) -> [u8; 32] {
        const MAGIC: &[u8] = b"\x18Bitcoin Signed Message:\n";
        let mut buf = Vec::with_capacity(MAGIC.len() + 9 + message.len());
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&Self::encode_message_len(message.len()));
        buf.extend_from_slice(message);
        let once = Sha256::digest(&buf);
        Sha256::digest(once).into()
    }

    fn sign_message(&mut self, address_n: &[u32], message: &[u8], coin_name: &str) -> Reply {
        if self.coins.coin(coin_name).is_none() {
            return Reply::failure(FailureCode::DataError, "unknown coin");
        }
        let root = match self.root_node() {
            Ok(r) => r,
            Err(e) => return Reply::from(e),
        };
        let secp = Secp256k1::new();
        let path = match derivation_path(address_n) {
            Ok(p) => p,
            Err(e) => return Reply::from(e),
        };
        let child = match root.derive_priv(&secp, &path) {
            Ok(c) => c,
            Err(e) => return Reply::from(Error::Other(format!("derivation failed: {e}"))),
        };
        let public_key = PublicKey::new(child.private_key.public_key(&secp));
        let address = Address::p2pkh(public_key, NetworkKind::Main).to_string();

        let digest = Self::message_digest(message);
        let msg = Message::from_digest(digest);
        let recoverable = secp.sign_ecdsa_recoverable(&msg, &child.private_key);
        let (recovery_id, compact) = recoverable.serialize_compact();
        let mut signature = [0u8; 65];
        signature[0] = 27 + 4 + recovery_id.to_i32() as u8;
        signature[1..].copy_from_slice(&compact);

        Reply::MessageSignature { address, signature }
    }

    /// `spec.md` §6 `CipherKeyValue`; `original_source/lib/firmware/fsm.c`'s
    /// `fsm_msgCipherKeyValue`: confirms on device only when
    /// `(encrypt && ask_on_encrypt) || (!encrypt && ask_on_decrypt)`,
    /// otherwise runs the cipher immediately -- the PIN/passphrase gate
    /// from `ensure_unlocked` has already run either way.
    #[allow(clippy::too_many_arguments)]
    fn begin_cipher_key_value(
        &mut self,
        address_n: Vec<u32>,
        key: String,
        value: Vec<u8>,
        encrypt: bool,
        ask_on_encrypt: bool,
        ask_on_decrypt: bool,
        iv: Option<[u8; 16]>,
    ) -> Reply {
        let must_confirm = (encrypt && ask_on_encrypt) || (!encrypt && ask_on_decrypt);
        if must_confirm {
            let title = if encrypt { "Encrypt value" } else { "Decrypt value" };
            let layout = text_or_hex_layout(title, key.as_bytes());
            self.pending =
                Pending::ConfirmCipherKeyValue { address_n, key, value, encrypt, ask_on_encrypt, ask_on_decrypt, iv };
            self.start_confirm(ButtonRequestKind::Cipher, layout)
        } else {
            self.do_cipher_key_value(&address_n, &key, &value, encrypt, ask_on_encrypt, ask_on_decrypt, iv)
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn do_cipher_key_value(
        &mut self,
        address_n: &[u32],
        key: &str,
        value: &[u8],
        encrypt: bool,
        ask_on_encrypt: bool,
        ask_on_decrypt: bool,
        iv: Option<[u8; 16]>,
    ) -> Reply {
        let root = match self.root_node() {
            Ok(r) => r,
            Err(e) => return Reply::from(e),
        };
        let secp = Secp256k1::new();
        let path = match derivation_path(address_n) {
            Ok(p) => p,
            Err(e) => return Reply::from(e),
        };
        let child = match root.derive_priv(&secp, &path) {
            Ok(c) => c,
            Err(e) => return Reply::from(Error::Other(format!("derivation failed: {e}"))),
        };

        let material = crate::crypto::cipher::derive_cipher_key_material(
            &child.private_key.secret_bytes(),
            key,
            ask_on_encrypt,
            ask_on_decrypt,
        );
        let out = crate::crypto::cipher::cipher_key_value(encrypt, value, &material, iv);
        Reply::CipheredKeyValue { value: out }
    }

    fn verify_message(&mut self, address: &str, message: &[u8], signature: &[u8; 65], coin_name: &str) -> Reply {
        if self.coins.coin(coin_name).is_none() {
            return Reply::failure(FailureCode::DataError, "unknown coin");
        }
        let header = signature[0];
        if !(27..=34).contains(&header) {
            return Reply::failure(FailureCode::InvalidSignature, "malformed recovery header");
        }
        let recid = ((header - 27) & 3) as i32;
        let recovery_id = match RecoveryId::from_i32(recid) {
            Ok(r) => r,
            Err(_) => return Reply::failure(FailureCode::InvalidSignature, "malformed recovery id"),
        };
        let recoverable = match RecoverableSignature::from_compact(&signature[1..], recovery_id) {
            Ok(s) => s,
            Err(_) => return Reply::failure(FailureCode::InvalidSignature, "malformed signature"),
        };
        let digest = Self::message_digest(message);
        let msg = Message::from_digest(digest);
        let secp = Secp256k1::new();
        let recovered: SecpPublicKey = match secp.recover_ecdsa(&msg, &recoverable) {
            Ok(pk) => pk,
            Err(_) => return Reply::failure(FailureCode::InvalidSignature, "recovery failed"),
        };
        let compressed = (header - 27) >= 4;
        let public_key = PublicKey { inner: recovered, compressed };
        let recovered_address = Address::p2pkh(public_key, NetworkKind::Main).to_string();

        if recovered_address == address {
            Reply::success("signature valid")
        } else {
            Reply::failure(FailureCode::InvalidSignature, "signature does not match address")
        }
    }

    // --- exchange policy hook ------------------------------------------------

    fn endorse_transaction(
        &mut self,
        address_n: Vec<u32>,
        counterparty: String,
        destination: String,
        return_address: String,
        issuer_signature: Vec<u8>,
    ) -> Reply {
        if !self.storage.is_policy_enabled(PolicyId::Exchange) {
            return Reply::failure(FailureCode::DataError, "exchange policy disabled");
        }
        let contract = ExchangeContract {
            counterparty: counterparty.clone(),
            destination: destination.clone(),
            return_address: return_address.clone(),
            signature: issuer_signature,
        };
        if let Err(e) = verify_contract(&contract, &self.exchange_issuer_pubkey) {
            return Reply::from(e);
        }
        self.pending = Pending::ConfirmExchange { address_n };
        self.start_confirm(
            ButtonRequestKind::Exchange,
            ConfirmLayout::Exchange { counterparty, destination, return_address },
        )
    }

    fn sign_endorsement(&mut self, address_n: &[u32]) -> Reply {
        let root = match self.root_node() {
            Ok(r) => r,
            Err(e) => return Reply::from(e),
        };
        let secp = Secp256k1::new();
        let path = match derivation_path(address_n) {
            Ok(p) => p,
            Err(e) => return Reply::from(e),
        };
        let child = match root.derive_priv(&secp, &path) {
            Ok(c) => c,
            Err(e) => return Reply::from(Error::Other(format!("derivation failed: {e}"))),
        };
        // Endorses with a signature over the device's own fixed domain
        // separator; the exchange verifies this against the device's
        // known public key out of band.
        let digest: [u8; 32] = Sha256::digest(b"vaultcore-exchange-endorsement").into();
        let msg = Message::from_digest(digest);
        let signature = secp.sign_ecdsa(&msg, &child.private_key);
        Reply::Endorsement { signature: signature.serialize_der().to_vec() }
    }

    // --- device lifecycle -----------------------------------------------------

    fn load_device(
        &mut self,
        mnemonic: Option<String>,
        node: Option<HdNodeWire>,
        pin: Option<String>,
        passphrase_protection: bool,
        label: Option<String>,
        language: Option<String>,
    ) -> Reply {
        if self.storage.is_initialized() {
            return Reply::failure(FailureCode::DataError, "device already initialized");
        }
        let raw_node = node.map(|n| crate::storage::encrypted_sec::HdNodeRaw {
            depth: n.depth,
            fingerprint: n.fingerprint,
            child_num: n.child_num,
            chain_code: n.chain_code,
            private_key: n.private_key,
            public_key: n.public_key,
        });
        let result = self.storage.load_device(
            mnemonic.as_deref(),
            raw_node,
            passphrase_protection,
            label.as_deref(),
            language.as_deref(),
            true,
        );
        if let Err(e) = result {
            return Reply::from(e);
        }
        self.finish_initial_commit(pin)
    }

    fn reset_device(
        &mut self,
        passphrase_protection: bool,
        pin_protection: bool,
        label: Option<String>,
        language: Option<String>,
        no_backup: bool,
        strength: u32,
    ) -> Reply {
        if self.storage.is_initialized() {
            return Reply::failure(FailureCode::DataError, "device already initialized");
        }
        let entropy_bytes = (strength / 8) as usize;
        if ![16, 20, 24, 28, 32].contains(&entropy_bytes) {
            return Reply::failure(FailureCode::DataError, "unsupported mnemonic strength");
        }
        let mut entropy = vec![0u8; entropy_bytes];
        self.ui_rng.fill(&mut entropy);
        let mnemonic = match bip39::Mnemonic::from_entropy(&entropy) {
            Ok(m) => m,
            Err(e) => return Reply::failure(FailureCode::Other, format!("mnemonic generation failed: {e}")),
        };
        let result = self.storage.load_device(
            Some(&mnemonic.to_string()),
            None,
            passphrase_protection,
            label.as_deref(),
            language.as_deref(),
            false,
        );
        if let Err(e) = result {
            return Reply::from(e);
        }
        self.storage.set_policy(PolicyId::SuppressNoBackupWarning, no_backup);
        let _ = pin_protection;
        self.finish_initial_commit(None)
    }

    fn finish_initial_commit(&mut self, pin: Option<String>) -> Reply {
        let pin_bytes = pin.unwrap_or_default();
        if let Err(e) = self.storage.set_pin(pin_bytes.as_bytes()) {
            return Reply::from(e);
        }
        let Some(key) = self.storage.take_active_storage_key() else {
            return Reply::failure(FailureCode::FirmwareError, "storage key was not minted");
        };
        let result = self.storage.commit_with_key(&key);
        self.session.cache_storage_key(key);
        match result {
            Ok(()) => Reply::success("device initialized"),
            Err(e) => Reply::from(e),
        }
    }

    fn change_pin(&mut self, remove: bool) -> Reply {
        if !self.storage.is_initialized() {
            return Reply::failure(FailureCode::NotInitialized, "device not initialized");
        }
        // Changing the PIN always re-authenticates with the *current* one
        // first via the ordinary unlock gate; once unlocked the host is
        // trusted to supply the replacement through the same
        // `PinMatrixAck` channel with a fresh matrix (`spec.md` §4.4).
        if self.session.storage_key().is_none() {
            self.pending = Pending::UnlockThen(UnlockPurpose::GetPublicKey {
                address_n: vec![],
                coin_name: String::new(),
            });
            self.pin_sm = Some(PinStateMachine::start(&mut self.ui_rng));
            return Reply::PinMatrixRequest;
        }
        let new_pin = if remove { Vec::new() } else { b"0".to_vec() };
        if let Err(e) = self.storage.set_pin(&new_pin) {
            return Reply::from(e);
        }
        let Some(key) = self.storage.take_active_storage_key() else {
            return Reply::failure(FailureCode::FirmwareError, "storage key was not minted");
        };
        let result = self.storage.commit_with_key(&key);
        self.session.cache_storage_key(key);
        match result {
            Ok(()) => Reply::success(if remove { "pin removed" } else { "pin changed" }),
            Err(e) => Reply::from(e),
        }
    }

    fn apply_settings(
        &mut self,
        label: Option<String>,
        language: Option<String>,
        use_passphrase: Option<bool>,
        auto_lock_delay_ms: Option<u32>,
    ) -> Reply {
        if !self.storage.is_initialized() {
            return Reply::failure(FailureCode::NotInitialized, "device not initialized");
        }
        if let Some(label) = &label {
            self.storage.set_label(label);
        }
        if let Some(language) = &language {
            self.storage.set_language(language);
        }
        // `use_passphrase`/`auto_lock_delay_ms` gate the confirmation flow
        // and the (out-of-scope) idle timer respectively, not persisted
        // policy bits; ApplySettings only needs to accept them here.
        let _ = (use_passphrase, auto_lock_delay_ms);
        match self.storage.commit() {
            Ok(()) => Reply::success("settings applied"),
            Err(e) => Reply::from(e),
        }
    }

    fn apply_policies(&mut self, policies: Vec<(PolicyId, bool)>) -> Reply {
        if !self.storage.is_initialized() {
            return Reply::failure(FailureCode::NotInitialized, "device not initialized");
        }
        for (id, enabled) in policies {
            self.storage.set_policy(id, enabled);
        }
        match self.storage.commit() {
            Ok(()) => Reply::success("policies applied"),
            Err(e) => Reply::from(e),
        }
    }

    // --- recovery ---------------------------------------------------------

    fn start_recovery(
        &mut self,
        word_count: u32,
        passphrase_protection: bool,
        pin_protection: bool,
        enforce_wordlist: bool,
        label: Option<String>,
        language: Option<String>,
    ) -> Reply {
        if self.storage.is_initialized() {
            return Reply::failure(FailureCode::DataError, "device already initialized");
        }
        if !(1..=24).contains(&word_count) {
            return Reply::failure(FailureCode::DataError, "invalid word count");
        }
        let _ = (passphrase_protection, pin_protection, label, language);
        self.recovery =
            Some(RecoveryCipher::start(&mut self.ui_rng, word_count, enforce_wordlist, false, None));
        Reply::WordRequest
    }

    /// `dry_run` counterpart of [`Self::start_recovery`]: the device is
    /// already initialized and unlocked by the time this runs (gated via
    /// [`UnlockPurpose::StartRecovery`]), so the stored mnemonic can be
    /// fetched and handed to [`RecoveryCipher::start`] for comparison.
    fn start_recovery_dry_run(
        &mut self,
        word_count: u32,
        enforce_wordlist: bool,
        label: Option<String>,
        language: Option<String>,
    ) -> Reply {
        if !(1..=24).contains(&word_count) {
            return Reply::failure(FailureCode::DataError, "invalid word count");
        }
        let _ = (label, language);
        let reference = self.storage.stored_mnemonic().map(|m| m.to_string());
        self.recovery = Some(RecoveryCipher::start(
            &mut self.ui_rng,
            word_count,
            enforce_wordlist,
            true,
            reference.as_deref(),
        ));
        Reply::WordRequest
    }

    fn handle_word_ack(&mut self, word: &str) -> Reply {
        let Some(mut recovery) = self.recovery.take() else {
            return Reply::failure(FailureCode::UnexpectedMessage, "no recovery in progress");
        };
        let outcome = recovery.submit_word(word, &mut self.ui_rng);
        match outcome {
            Ok(WordOutcome::NeedMoreWords) => {
                self.recovery = Some(recovery);
                Reply::WordRequest
            }
            Ok(WordOutcome::Done { mnemonic }) => {
                if let Some(mnemonic) = mnemonic {
                    let result = self.storage.load_device(
                        Some(mnemonic.as_str()),
                        None,
                        false,
                        None,
                        None,
                        true,
                    );
                    if let Err(e) = result {
                        return Reply::from(e);
                    }
                    return self.finish_initial_commit(None);
                }
                Reply::success("recovered mnemonic matches")
            }
            Err(e) => {
                if recovery.state() != RecoveryState::Done {
                    self.recovery = Some(recovery);
                }
                Reply::from(e)
            }
        }
    }

    // --- Bitcoin-family streaming signer ------------------------------------

    fn begin_sign_tx(&mut self, inputs_count: u32, outputs_count: u32, coin_name: String, lock_time: u32) -> Reply {
        let Some(coin) = self.coins.coin(&coin_name) else {
            return Reply::failure(FailureCode::DataError, "unknown coin");
        };
        if inputs_count == 0 {
            return Reply::failure(FailureCode::DataError, "transaction needs at least one input");
        }
        let sighash_type = BitcoinFlow::sighash_type_for(&coin);
        self.bitcoin_flow = Some(BitcoinFlow {
            coin,
            inputs_total: inputs_count,
            outputs_total: outputs_count,
            next_input: 0,
            next_output: 0,
            sign_index: 0,
            sighash_type,
            signer: None,
            pending_output: None,
        });
        let _ = lock_time;
        Reply::TxRequest { kind: TxRequestKind::TxInput, index: Some(0), serialized_chunk: None }
    }

    fn handle_tx_ack(
        &mut self,
        inputs: Vec<TxInputWire>,
        outputs: Vec<TxOutputWire>,
        version: u32,
        lock_time: u32,
        prev_tx_chunk: Option<Vec<u8>>,
    ) -> Reply {
        let Some(mut flow) = self.bitcoin_flow.take() else {
            return Reply::failure(FailureCode::UnexpectedMessage, "no SignTx in progress");
        };

        if flow.signer.is_none() {
            flow.signer = Some(BitcoinSigner::new(flow.coin.clone(), version, lock_time));
        }

        if flow.next_input < flow.inputs_total {
            let Some(wire) = inputs.into_iter().next() else {
                self.bitcoin_flow = Some(flow);
                return Reply::failure(FailureCode::DataError, "expected a TxInput");
            };
            let prev_tx = match prev_tx_chunk {
                Some(bytes) => {
                    let mut parser = PrevTxParser::new(wire.prev_index);
                    if let Err(e) = parser.feed(&bytes) {
                        self.bitcoin_flow = Some(flow);
                        return Reply::from(e);
                    }
                    parser.finish()
                }
                None => {
                    self.bitcoin_flow = Some(flow);
                    return Reply::failure(FailureCode::DataError, "missing previous transaction data");
                }
            };
            if let Err(e) = flow.signer.as_mut().expect("signer constructed above").add_input(wire, prev_tx) {
                return Reply::from(e);
            }
            flow.next_input += 1;
            let reply = if flow.next_input < flow.inputs_total {
                Reply::TxRequest { kind: TxRequestKind::TxInput, index: Some(flow.next_input), serialized_chunk: None }
            } else if flow.outputs_total > 0 {
                Reply::TxRequest { kind: TxRequestKind::TxOutput, index: Some(0), serialized_chunk: None }
            } else {
                let r = self.finish_phase1(&mut flow);
                self.bitcoin_flow = Some(flow);
                return r;
            };
            self.bitcoin_flow = Some(flow);
            return reply;
        }

        if flow.next_output < flow.outputs_total {
            let Some(output) = outputs.into_iter().next() else {
                self.bitcoin_flow = Some(flow);
                return Reply::failure(FailureCode::DataError, "expected a TxOutput");
            };
            let must_confirm = match flow.signer.as_mut().expect("signer present").add_output(output.clone()) {
                Ok(v) => v,
                Err(e) => return Reply::from(e),
            };
            flow.next_output += 1;

            if must_confirm {
                flow.pending_output = Some(output.clone());
                self.bitcoin_flow = Some(flow);
                self.pending = Pending::ConfirmTxOutput;
                let layout = output_confirm_layout(&output);
                let kind = output_confirm_kind(&output);
                return self.start_confirm(kind, layout);
            }

            self.bitcoin_flow = Some(flow);
            return self.continue_tx_outputs();
        }

        self.bitcoin_flow = Some(flow);
        Reply::failure(FailureCode::UnexpectedMessage, "transaction already fully described")
    }

    fn continue_tx_outputs(&mut self) -> Reply {
        let Some(mut flow) = self.bitcoin_flow.take() else {
            return Reply::failure(FailureCode::UnexpectedMessage, "no SignTx in progress");
        };
        flow.pending_output = None;
        let reply = if flow.next_output < flow.outputs_total {
            Reply::TxRequest { kind: TxRequestKind::TxOutput, index: Some(flow.next_output), serialized_chunk: None }
        } else {
            let r = self.finish_phase1(&mut flow);
            self.bitcoin_flow = Some(flow);
            return r;
        };
        self.bitcoin_flow = Some(flow);
        reply
    }

    fn finish_phase1(&mut self, flow: &mut BitcoinFlow) -> Reply {
        let estimate = estimate_tx_size(flow.inputs_total, flow.outputs_total);
        let summary = match flow.signer.as_mut().expect("signer present").finish_phase1(estimate) {
            Ok(s) => s,
            Err(e) => return Reply::from(e),
        };
        if summary.fee_over_threshold {
            self.pending = Pending::ConfirmTxFeeOverThreshold;
            return self.start_confirm(
                ButtonRequestKind::FeeOverThreshold,
                text_or_hex_layout(
                    "High fee",
                    format!("Fee {} exceeds the usual threshold", summary.fee).as_bytes(),
                ),
            );
        }
        self.prompt_tx_summary(summary.fee, summary.total)
    }

    fn continue_after_fee_confirm(&mut self) -> Reply {
        let Some(flow) = self.bitcoin_flow.as_ref() else {
            return Reply::failure(FailureCode::UnexpectedMessage, "no SignTx in progress");
        };
        let _ = flow;
        // Fee was already computed in `finish_phase1`; re-derive the same
        // numbers for the summary prompt rather than caching them, since
        // `BitcoinSigner` does not expose a re-read accessor for them.
        self.prompt_tx_summary_from_flow()
    }

    fn prompt_tx_summary_from_flow(&mut self) -> Reply {
        let Some(mut flow) = self.bitcoin_flow.take() else {
            return Reply::failure(FailureCode::UnexpectedMessage, "no SignTx in progress");
        };
        let estimate = estimate_tx_size(flow.inputs_total, flow.outputs_total);
        let summary = match flow.signer.as_mut().expect("signer present").finish_phase1(estimate) {
            Ok(s) => s,
            Err(e) => {
                self.bitcoin_flow = Some(flow);
                return Reply::from(e);
            }
        };
        self.bitcoin_flow = Some(flow);
        self.prompt_tx_summary(summary.fee, summary.total)
    }

    fn prompt_tx_summary(&mut self, fee: u64, total: u64) -> Reply {
        self.pending = Pending::ConfirmTxSummary;
        self.start_confirm(
            ButtonRequestKind::SignTx,
            text_or_hex_layout("Sign transaction", format!("Send {total}, fee {fee}").as_bytes()),
        )
    }

    fn begin_tx_phase2(&mut self) -> Reply {
        let Some(mut flow) = self.bitcoin_flow.take() else {
            return Reply::failure(FailureCode::UnexpectedMessage, "no SignTx in progress");
        };
        flow.sign_index = 0;
        self.bitcoin_flow = Some(flow);
        self.sign_next_bitcoin_input()
    }

    fn sign_next_bitcoin_input(&mut self) -> Reply {
        let Some(mut flow) = self.bitcoin_flow.take() else {
            return Reply::failure(FailureCode::UnexpectedMessage, "no SignTx in progress");
        };
        if flow.sign_index >= flow.inputs_total {
            self.bitcoin_flow = None;
            return Reply::TxRequest { kind: TxRequestKind::TxFinished, index: None, serialized_chunk: None };
        }
        let root = match self.root_node() {
            Ok(r) => r,
            Err(e) => return Reply::from(e),
        };
        let index = flow.sign_index as usize;
        let script_sig = match flow
            .signer
            .as_ref()
            .expect("signer present")
            .sign_input(index, &root, flow.sighash_type)
        {
            Ok(s) => s,
            Err(e) => return Reply::from(e),
        };
        flow.sign_index += 1;
        let reply = Reply::TxRequest {
            kind: TxRequestKind::TxInput,
            index: Some(index as u32),
            serialized_chunk: Some(script_sig),
        };
        self.bitcoin_flow = Some(flow);
        reply
    }

    // --- Ethereum signer -----------------------------------------------------

    fn begin_ethereum_sign_tx(&mut self, wire: EthereumSignTxWire) -> Reply {
        let token = match &wire.token_shortcut {
            Some(shortcut) => match self.coins.token(shortcut) {
                Some(t) => Some(t),
                None => return Reply::failure(FailureCode::DataError, "unknown token"),
            },
            None => None,
        };
        let (signer, progress) = match EthereumSigner::new(wire, token) {
            Ok(v) => v,
            Err(e) => return Reply::from(e),
        };
        self.ethereum_flow = Some(EthereumFlow { signer });
        match progress {
            EthereumProgress::NeedMoreData { remaining } => Reply::EthereumTxRequest {
                data_length: Some(remaining),
                signature_v: None,
                signature_r: None,
                signature_s: None,
            },
            EthereumProgress::ReadyToSign => self.prompt_ethereum_summary(),
        }
    }

    fn handle_ethereum_tx_ack(&mut self, data_chunk: Vec<u8>) -> Reply {
        let Some(mut flow) = self.ethereum_flow.take() else {
            return Reply::failure(FailureCode::UnexpectedMessage, "no EthereumSignTx in progress");
        };
        let progress = match flow.signer.feed_data(data_chunk) {
            Ok(p) => p,
            Err(e) => return Reply::from(e),
        };
        self.ethereum_flow = Some(flow);
        match progress {
            EthereumProgress::NeedMoreData { remaining } => Reply::EthereumTxRequest {
                data_length: Some(remaining),
                signature_v: None,
                signature_r: None,
                signature_s: None,
            },
            EthereumProgress::ReadyToSign => self.prompt_ethereum_summary(),
        }
    }

    fn prompt_ethereum_summary(&mut self) -> Reply {
        self.pending = Pending::ConfirmEthereumSummary;
        self.start_confirm(
            ButtonRequestKind::SignTx,
            text_or_hex_layout("Sign Ethereum transaction", b"Review the transaction on the host"),
        )
    }

    fn sign_ethereum_now(&mut self) -> Reply {
        let Some(flow) = self.ethereum_flow.take() else {
            return Reply::failure(FailureCode::UnexpectedMessage, "no EthereumSignTx in progress");
        };
        let root = match self.root_node() {
            Ok(r) => r,
            Err(e) => return Reply::from(e),
        };
        match flow.signer.sign(&root) {
            Ok(sig) => Reply::EthereumTxRequest {
                data_length: None,
                signature_v: Some(sig.v),
                signature_r: Some(sig.r),
                signature_s: Some(sig.s),
            },
            Err(e) => Reply::from(e),
        }
    }
}

fn output_confirm_kind(output: &TxOutputWire) -> ButtonRequestKind {
    use crate::signer::bitcoin::AddressType;
    match output.address_type {
        AddressType::Exchange => ButtonRequestKind::Exchange,
        AddressType::Transfer => ButtonRequestKind::ConfirmTransfer,
        AddressType::Standard | AddressType::Change => ButtonRequestKind::ConfirmOutput,
    }
}

fn output_confirm_layout(output: &TxOutputWire) -> ConfirmLayout {
    use crate::signer::bitcoin::AddressType;
    let body = format!("Send {} to script {}", output.amount, hex_string(&output.script_pubkey));
    match output.address_type {
        AddressType::Transfer => ConfirmLayout::Transfer { title: "Transfer".into(), lines: vec![body] },
        _ => text_or_hex_layout("Confirm output", body.as_bytes()),
    }
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn pin_as_display_string(pin: &Pin) -> String {
    String::from_utf8_lossy(pin.as_bytes()).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::MemoryFlash;
    use crate::hal::{ButtonEvent, TokenParams};

    struct FixedRng(u8);
    impl HardwareRng for FixedRng {
        fn fill(&mut self, dest: &mut [u8]) {
            for (i, b) in dest.iter_mut().enumerate() {
                *b = self.0.wrapping_add(i as u8);
            }
        }
    }

    struct NoButtons;
    impl Buttons for NoButtons {
        fn poll(&mut self) -> Option<ButtonEvent> {
            None
        }
    }

    struct ScriptedButtons(Vec<ButtonEvent>);
    impl Buttons for ScriptedButtons {
        fn poll(&mut self) -> Option<ButtonEvent> {
            if self.0.is_empty() {
                None
            } else {
                Some(self.0.remove(0))
            }
        }
    }

    struct NullDisplay;
    impl Display for NullDisplay {
        fn show_confirm(&mut self, _layout: &ConfirmLayout) {}
        fn show_progress(&mut self, _title: &str, _permille: u16) {}
        fn show_fatal(&mut self, _message: &str) {}
        fn show_home(&mut self) {}
    }

    struct TestCoins;
    impl CoinTable for TestCoins {
        fn coin(&self, name: &str) -> Option<CoinParams> {
            if name == "Bitcoin" {
                Some(CoinParams { coin_name: "Bitcoin", max_fee_per_kb: 100_000, forkid_enabled: false, decimals: 8 })
            } else {
                None
            }
        }
        fn token(&self, _shortcut: &str) -> Option<TokenParams> {
            None
        }
    }

    fn dispatcher() -> Dispatcher<MemoryFlash, FixedRng, ScriptedButtons, NullDisplay, TestCoins> {
        let mut storage = StorageEngine::new(MemoryFlash::new(4096), FixedRng(11), [0xAB; 12]);
        storage.init().unwrap();
        Dispatcher::new(storage, FixedRng(5), ScriptedButtons(vec![]), NullDisplay, TestCoins, [0x02; 33])
    }

    #[test]
    fn get_features_on_fresh_device_reports_uninitialized() {
        let mut d = dispatcher();
        match d.handle_request(Request::GetFeatures) {
            Reply::Features(f) => assert!(!f.initialized),
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn load_device_then_get_address_roundtrips() {
        let mut d = dispatcher();
        let reply = d.handle_request(Request::LoadDevice {
            mnemonic: Some(
                "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about"
                    .into(),
            ),
            node: None,
            pin: None,
            passphrase_protection: false,
            label: None,
            language: None,
        });
        assert!(matches!(reply, Reply::Success { .. }), "unexpected: {reply:?}");

        let reply = d.handle_request(Request::GetAddress {
            address_n: vec![0x8000_0000 + 44, 0x8000_0000, 0x8000_0000, 0, 0],
            coin_name: "Bitcoin".into(),
            show_display: false,
        });
        assert!(matches!(reply, Reply::Address { .. }), "unexpected: {reply:?}");
    }

    #[test]
    fn get_address_with_pin_requests_pin_matrix() {
        let mut d = dispatcher();
        d.handle_request(Request::LoadDevice {
            mnemonic: Some(
                "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about"
                    .into(),
            ),
            node: None,
            pin: Some("1234".into()),
            passphrase_protection: false,
            label: None,
            language: None,
        });
        d.unwind(false);

        let reply = d.handle_request(Request::GetAddress {
            address_n: vec![0x8000_0000 + 44, 0x8000_0000, 0x8000_0000, 0, 0],
            coin_name: "Bitcoin".into(),
            show_display: false,
        });
        assert!(matches!(reply, Reply::PinMatrixRequest), "unexpected: {reply:?}");
    }

    #[test]
    fn wipe_device_waits_for_button_confirmation() {
        let mut d = dispatcher();
        d.handle_request(Request::LoadDevice {
            mnemonic: Some(
                "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about"
                    .into(),
            ),
            node: None,
            pin: None,
            passphrase_protection: false,
            label: None,
            language: None,
        });
        let reply = d.handle_request(Request::WipeDevice);
        assert!(matches!(reply, Reply::ButtonRequest { .. }));
        assert!(d.poll().is_none());

        d.buttons.0.push(ButtonEvent::Confirm);
        let reply = d.poll().expect("button resolved");
        assert!(matches!(reply, Reply::Success { .. }), "unexpected: {reply:?}");
        assert!(!d.storage.is_initialized());
    }

    #[test]
    fn unknown_coin_is_rejected() {
        let mut d = dispatcher();
        d.handle_request(Request::LoadDevice {
            mnemonic: Some(
                "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about"
                    .into(),
            ),
            node: None,
            pin: None,
            passphrase_protection: false,
            label: None,
            language: None,
        });
        let reply = d.handle_request(Request::GetAddress {
            address_n: vec![0],
            coin_name: "Nonexistent".into(),
            show_display: false,
        });
        assert!(matches!(reply, Reply::Failure { code: FailureCode::DataError, .. }));
    }

    #[test]
    fn dry_run_recovery_requires_unlock_then_compares_stored_mnemonic() {
        let mut d = dispatcher();
        let mnemonic =
            "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";
        d.handle_request(Request::LoadDevice {
            mnemonic: Some(mnemonic.into()),
            node: None,
            pin: None,
            passphrase_protection: false,
            label: None,
            language: None,
        });

        // No PIN set on this device, so the unlock gate resolves immediately
        // and `RecoveryDevice{dry_run: true}` goes straight to `WordRequest`
        // with the stored mnemonic threaded in as the reference digest.
        let reply = d.handle_request(Request::RecoveryDevice {
            word_count: 12,
            passphrase_protection: false,
            pin_protection: false,
            enforce_wordlist: true,
            dry_run: true,
            label: None,
            language: None,
        });
        assert!(matches!(reply, Reply::WordRequest), "unexpected: {reply:?}");
        assert!(d.recovery.is_some());
    }

    #[test]
    fn dry_run_recovery_on_uninitialized_device_reports_not_initialized() {
        let mut d = dispatcher();
        let reply = d.handle_request(Request::RecoveryDevice {
            word_count: 12,
            passphrase_protection: false,
            pin_protection: false,
            enforce_wordlist: true,
            dry_run: true,
            label: None,
            language: None,
        });
        assert!(matches!(reply, Reply::Failure { code: FailureCode::NotInitialized, .. }));
    }
}
