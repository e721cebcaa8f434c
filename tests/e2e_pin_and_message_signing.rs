// VaultCore: firmware core for a hardware cryptocurrency wallet
//
// This software is distributed without any warranty.

//! End-to-end protocol scenarios (`spec.md` §8), driven purely through the
//! public `Dispatcher`/`Request`/`Reply` surface the way a real host would
//! talk to this core -- no access to any private field, the same boundary
//! `src/bin/simulator.rs` sits at.

use vaultcore::flash::MemoryFlash;
use vaultcore::hal::{
    ButtonEvent, Buttons, CoinParams, CoinTable, ConfirmLayout, Display, HardwareRng, TokenParams,
};
use vaultcore::protocol::message::{Reply, Request};
use vaultcore::protocol::FailureCode;
use vaultcore::storage::StorageEngine;
use vaultcore::Dispatcher;

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

struct NullDisplay;
impl Display for NullDisplay {
    fn show_confirm(&mut self, _layout: &ConfirmLayout) {}
    fn show_progress(&mut self, _title: &str, _permille: u16) {}
    fn show_fatal(&mut self, _message: &str) {}
    fn show_home(&mut self) {}
}

struct OneCoin;
impl CoinTable for OneCoin {
    fn coin(&self, name: &str) -> Option<CoinParams> {
        (name == "Bitcoin").then_some(CoinParams {
            coin_name: "Bitcoin",
            max_fee_per_kb: 100_000,
            forkid_enabled: false,
            decimals: 8,
        })
    }

    fn token(&self, _shortcut: &str) -> Option<TokenParams> {
        None
    }
}

type TestDispatcher = Dispatcher<MemoryFlash, FixedRng, NoButtons, NullDisplay, OneCoin>;

fn fresh_dispatcher() -> TestDispatcher {
    let mut storage = StorageEngine::new(MemoryFlash::new(4096), FixedRng(7), [0x11; 12]);
    storage.init().expect("init on blank flash");
    Dispatcher::new(storage, FixedRng(3), NoButtons, NullDisplay, OneCoin, [0u8; 33])
}

const MNEMONIC: &str =
    "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

/// `spec.md` §8: a device protected by a PIN asks for `PinMatrixRequest`
/// before the first key-derivation operation each session, caches the
/// storage key for the rest of the session, and re-asks after
/// `ClearSession`.
#[test]
fn pin_is_requested_once_per_session_then_cached() {
    let mut d = fresh_dispatcher();
    d.handle_request(Request::LoadDevice {
        mnemonic: Some(MNEMONIC.into()),
        node: None,
        pin: Some("1234".into()),
        passphrase_protection: false,
        label: None,
        language: None,
    });

    let address_n = vec![0x8000_002C, 0x8000_0000, 0x8000_0000, 0, 0];

    let reply = d.handle_request(Request::GetAddress {
        address_n: address_n.clone(),
        coin_name: "Bitcoin".into(),
        show_display: false,
    });
    assert!(matches!(reply, Reply::PinMatrixRequest));

    let reply = d.handle_request(Request::PinMatrixAck { pin: "1234".into() });
    assert!(matches!(reply, Reply::Address { .. }), "{reply:?}");

    // Second request this session: PIN is cached, no new prompt.
    let reply = d.handle_request(Request::GetPublicKey { address_n: address_n.clone(), coin_name: "Bitcoin".into() });
    assert!(matches!(reply, Reply::PublicKey { .. }), "{reply:?}");

    d.handle_request(Request::ClearSession);

    let reply = d.handle_request(Request::GetAddress { address_n, coin_name: "Bitcoin".into(), show_display: false });
    assert!(matches!(reply, Reply::PinMatrixRequest));
}

/// `spec.md` §8: a wrong PIN is rejected and a subsequent correct PIN still
/// succeeds (no lockout from a single miss).
#[test]
fn wrong_pin_then_correct_pin() {
    let mut d = fresh_dispatcher();
    d.handle_request(Request::LoadDevice {
        mnemonic: Some(MNEMONIC.into()),
        node: None,
        pin: Some("1234".into()),
        passphrase_protection: false,
        label: None,
        language: None,
    });

    let address_n = vec![0x8000_002C, 0x8000_0000, 0x8000_0000, 0, 0];
    let reply = d.handle_request(Request::GetAddress {
        address_n: address_n.clone(),
        coin_name: "Bitcoin".into(),
        show_display: false,
    });
    assert!(matches!(reply, Reply::PinMatrixRequest));

    let reply = d.handle_request(Request::PinMatrixAck { pin: "9999".into() });
    assert!(
        matches!(reply, Reply::Failure { code: FailureCode::PinInvalid, .. }),
        "{reply:?}"
    );

    let reply = d.handle_request(Request::GetAddress { address_n, coin_name: "Bitcoin".into(), show_display: false });
    assert!(matches!(reply, Reply::PinMatrixRequest));
    let reply = d.handle_request(Request::PinMatrixAck { pin: "1234".into() });
    assert!(matches!(reply, Reply::Address { .. }), "{reply:?}");
}

/// `spec.md` §4.2 expansion: signs an arbitrary message and verifies it
/// against the address the same key derives.
#[test]
fn sign_message_then_verify() {
    let mut d = fresh_dispatcher();
    d.handle_request(Request::LoadDevice {
        mnemonic: Some(MNEMONIC.into()),
        node: None,
        pin: None,
        passphrase_protection: false,
        label: None,
        language: None,
    });

    let address_n = vec![0x8000_002C, 0x8000_0000, 0x8000_0000, 0, 0];
    let reply = d.handle_request(Request::GetAddress {
        address_n: address_n.clone(),
        coin_name: "Bitcoin".into(),
        show_display: false,
    });
    let address = match reply {
        Reply::Address { address } => address,
        other => panic!("unexpected: {other:?}"),
    };

    let message = b"vaultcore e2e test message".to_vec();
    let reply = d.handle_request(Request::SignMessage {
        address_n,
        message: message.clone(),
        coin_name: "Bitcoin".into(),
    });
    let signature = match reply {
        Reply::MessageSignature { signature, .. } => signature,
        other => panic!("unexpected: {other:?}"),
    };

    let reply = d.handle_request(Request::VerifyMessage {
        address,
        message,
        signature,
        coin_name: "Bitcoin".into(),
    });
    assert!(matches!(reply, Reply::Success { .. }), "{reply:?}");
}

/// `spec.md` §4.6: a dry-run `RecoveryDevice` against a device's own
/// just-loaded mnemonic reaches `WordRequest` (the comparison itself only
/// resolves once every word has been fed back through `WordAck`).
#[test]
fn dry_run_recovery_matches_loaded_mnemonic() {
    let mut d = fresh_dispatcher();
    d.handle_request(Request::LoadDevice {
        mnemonic: Some(MNEMONIC.into()),
        node: None,
        pin: None,
        passphrase_protection: false,
        label: None,
        language: None,
    });

    let reply = d.handle_request(Request::RecoveryDevice {
        word_count: 12,
        passphrase_protection: false,
        pin_protection: false,
        enforce_wordlist: true,
        dry_run: true,
        label: None,
        language: None,
    });
    assert!(matches!(reply, Reply::WordRequest), "{reply:?}");
}
