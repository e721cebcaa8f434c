// VaultCore: firmware core for a hardware cryptocurrency wallet
//
// This software is distributed without any warranty.

//! A host-side simulator for driving the [`vaultcore::Dispatcher`] without
//! real hardware: reads one JSON-encoded [`Request`] per line on stdin,
//! writes one JSON-encoded [`Reply`] per line to stdout, draining any
//! button confirmations through [`Dispatcher::poll`] after every request
//! (`spec.md` §9 "Design Notes": the dispatcher has no thread of its own,
//! so something outside it has to call `poll` at the suspension points).
//!
//! Grounded in the teacher crate's own `rpc`/`runtime` split (a thin
//! frontend that only wires a transport to a stateful core): here the
//! "transport" is stdin/stdout JSON lines rather than a ZMQ socket, since
//! the USB HID framing this core's messages actually travel over
//! (`protocol::frame`) is itself an external collaborator per `spec.md`
//! §1/§6.

use std::io::{self, BufRead, Write};

use clap::Parser;
use rand_core::{OsRng, RngCore};

use vaultcore::config::DeviceConfig;
use vaultcore::flash::MemoryFlash;
use vaultcore::hal::{Buttons, ButtonEvent, CoinParams, CoinTable, ConfirmLayout, Display, HardwareRng, TokenParams};
use vaultcore::protocol::message::{Request, Reply};
use vaultcore::storage::StorageEngine;
use vaultcore::Dispatcher;

#[derive(Parser, Debug)]
#[command(author, version, about = "Drives a vaultcore Dispatcher over stdin/stdout JSON lines", long_about = None)]
struct SimulatorOpts {
    /// Path to a `DeviceConfig` TOML file; the built-in defaults are used
    /// when omitted.
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// Automatically resolve every `ButtonRequest` as a confirm, instead of
    /// prompting on stderr for `y`/`n`. Convenient for scripted fixtures.
    #[arg(long, default_value_t = false)]
    auto_confirm: bool,

    /// Hex-encoded 33-byte secp256k1 public key the exchange policy hook
    /// trusts for `EndorseTransaction` contracts; defaults to the
    /// all-zero key (so `EndorseTransaction` always fails validation
    /// unless a real key is supplied).
    #[arg(long)]
    exchange_issuer_pubkey: Option<String>,
}

/// Real OS entropy, via the `rand_core`/`getrandom` path the teacher's own
/// dependency table already pulls in for exactly this purpose.
struct OsHardwareRng;

impl HardwareRng for OsHardwareRng {
    fn fill(&mut self, dest: &mut [u8]) {
        OsRng.fill_bytes(dest);
    }
}

/// Either auto-confirms every button request, or asks the operator on
/// stderr. Either way `poll()` never blocks: `Buttons::poll` is documented
/// as non-blocking, so the "ask" path simply reads one line of stdin
/// before returning.
struct CliButtons {
    auto_confirm: bool,
}

impl Buttons for CliButtons {
    fn poll(&mut self) -> Option<ButtonEvent> {
        if self.auto_confirm {
            return Some(ButtonEvent::Confirm);
        }
        eprint!("confirm? [y/N] ");
        let _ = io::stderr().flush();
        let mut line = String::new();
        if io::stdin().read_line(&mut line).is_err() {
            return Some(ButtonEvent::Cancel);
        }
        match line.trim() {
            "y" | "Y" => Some(ButtonEvent::Confirm),
            _ => Some(ButtonEvent::Cancel),
        }
    }
}

/// Logs what a real display would have rendered, instead of compositing
/// pixels (`spec.md` §1 places the compositor itself out of scope).
struct LoggingDisplay;

impl Display for LoggingDisplay {
    fn show_confirm(&mut self, layout: &ConfirmLayout) {
        log::info!("display: {layout:?}");
    }

    fn show_progress(&mut self, title: &str, permille: u16) {
        log::info!("display: {title} {}/1000", permille);
    }

    fn show_fatal(&mut self, message: &str) {
        log::error!("display: FATAL {message}");
    }

    fn show_home(&mut self) {
        log::info!("display: home screen");
    }
}

/// A fixed coin/token table covering the coins this crate's signer
/// actually exercises in its tests; a production host would load this
/// from the same coin-definition data the teacher's `citadeld` reads at
/// startup rather than hardcoding it.
struct StaticCoinTable;

impl CoinTable for StaticCoinTable {
    fn coin(&self, name: &str) -> Option<CoinParams> {
        match name {
            "Bitcoin" => Some(CoinParams {
                coin_name: "Bitcoin",
                max_fee_per_kb: 100_000,
                forkid_enabled: false,
                decimals: 8,
            }),
            "BitcoinCash" => Some(CoinParams {
                coin_name: "BitcoinCash",
                max_fee_per_kb: 100_000,
                forkid_enabled: true,
                decimals: 8,
            }),
            "Testnet" => Some(CoinParams {
                coin_name: "Testnet",
                max_fee_per_kb: 100_000,
                forkid_enabled: false,
                decimals: 8,
            }),
            _ => None,
        }
    }

    fn token(&self, shortcut: &str) -> Option<TokenParams> {
        match shortcut {
            "USDT" => Some(TokenParams {
                symbol: "USDT",
                contract_address: [
                    0xda, 0xc1, 0x7f, 0x95, 0x8d, 0x2e, 0xe5, 0x23, 0xa2, 0x20, 0x62, 0x06, 0x99,
                    0x45, 0x97, 0xc1, 0x3d, 0x83, 0x1e, 0xc7,
                ],
                max_gas_limit: 200_000,
            }),
            _ => None,
        }
    }
}

fn parse_issuer_pubkey(hex_str: &Option<String>) -> [u8; 33] {
    let mut key = [0u8; 33];
    let Some(hex_str) = hex_str else { return key };
    if hex_str.len() != 66 {
        log::warn!("--exchange-issuer-pubkey must be 66 hex chars, ignoring");
        return key;
    }
    for i in 0..33 {
        let Ok(byte) = u8::from_str_radix(&hex_str[i * 2..i * 2 + 2], 16) else {
            log::warn!("--exchange-issuer-pubkey is not valid hex, ignoring");
            return [0u8; 33];
        };
        key[i] = byte;
    }
    key
}

fn main() {
    env_logger::init();
    let opts = SimulatorOpts::parse();

    let config = match &opts.config {
        Some(path) => {
            let text = std::fs::read_to_string(path).expect("reading --config file");
            DeviceConfig::from_toml_str(&text).expect("parsing --config file")
        }
        None => DeviceConfig::default(),
    };

    let flash = MemoryFlash::new(config.flash.sector_size);
    let mut hardware_id = [0u8; vaultcore::storage::layout::UUID_LEN];
    OsRng.fill_bytes(&mut hardware_id);
    let storage = StorageEngine::new(flash, OsHardwareRng, hardware_id);

    let issuer_pubkey = parse_issuer_pubkey(&opts.exchange_issuer_pubkey);
    let mut dispatcher = Dispatcher::new(
        storage,
        OsHardwareRng,
        CliButtons { auto_confirm: opts.auto_confirm },
        LoggingDisplay,
        StaticCoinTable,
        issuer_pubkey,
    );

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut out = stdout.lock();

    for line in stdin.lock().lines() {
        let line = line.expect("reading stdin");
        if line.trim().is_empty() {
            continue;
        }
        let request: Request = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                log::error!("malformed request: {e}");
                continue;
            }
        };

        let reply = dispatcher.handle_request(request);
        write_reply(&mut out, &reply);
        while let Some(reply) = dispatcher.poll() {
            write_reply(&mut out, &reply);
        }
    }
}

fn write_reply(out: &mut impl Write, reply: &Reply) {
    let text = serde_json::to_string(reply).expect("serializing reply");
    writeln!(out, "{text}").expect("writing reply");
    let _ = out.flush();
}
