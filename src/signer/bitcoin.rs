// VaultCore: firmware core for a hardware cryptocurrency wallet
//
// This software is distributed without any warranty.

//! The Bitcoin-family streaming signer (`spec.md` §4.7). Processes a
//! transaction in two passes without ever holding the whole thing in
//! memory: Phase 1 surveys inputs and outputs, accumulating the BIP-143
//! preimage fields and a phase-spanning checksum; Phase 2 re-streams the
//! same data to emit signatures, checked against the Phase-1 checksum
//! before anything is signed.
//!
//! Grounded in `original_source/lib/firmware/signing.c` (`signing_init`,
//! `signing_txack`, `signing_sign_input`) and `transaction.c`'s
//! `tx_serialize_*`/`hasher_*` helpers; the canonical `bitcoin` crate
//! (already in this crate's dependency stack for BIP-32) supplies script
//! construction and the secp256k1 ECDSA signing primitive, per `spec.md`
//! §1's "assumed available as vetted library routines".

use bitcoin::bip32::{ChildNumber, DerivationPath, Xpriv};
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{self, Message, Secp256k1};
use bitcoin::{PubkeyHash, PublicKey, ScriptBuf, WPubkeyHash};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Error;
use crate::hal::CoinParams;

/// How an input/output's funds are locked (`spec.md` §4.7 "script_type").
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub enum ScriptType {
    P2pkh,
    P2sh,
    P2wpkh,
    P2wsh,
    PayToMultisig,
}

/// How an output is classified for the confirmation/change logic
/// (`spec.md` §4.7).
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub enum AddressType {
    Standard,
    Change,
    /// Moves funds between the user's own accounts; not change, but shown
    /// with a distinct "Transfer" layout (`spec.md` §4.7).
    Transfer,
    /// Gated by the exchange policy hook (`spec.md` §4.9).
    Exchange,
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct MultisigWire {
    pub m: u8,
    pub pubkeys: Vec<[u8; 33]>,
}

impl MultisigWire {
    /// `spec.md` Glossary "Multisig fingerprint": SHA-256 over `m`, the
    /// canonically-sorted cosigner list, and `n`.
    pub fn fingerprint(&self) -> [u8; 32] {
        let mut sorted = self.pubkeys.clone();
        sorted.sort();
        let mut hasher = Sha256::new();
        hasher.update([self.m]);
        for pk in &sorted {
            hasher.update(pk);
        }
        hasher.update([self.pubkeys.len() as u8]);
        let digest = hasher.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        out
    }
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct TxInputWire {
    pub address_n: Vec<u32>,
    pub prev_hash: [u8; 32],
    pub prev_index: u32,
    pub script_type: ScriptType,
    pub sequence: u32,
    /// Declared amount. Mandatory for BIP-143 coins (`spec.md` invariant
    /// "For BIP-143 coins every input must carry `amount`").
    pub amount: Option<u64>,
    pub multisig: Option<MultisigWire>,
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct TxOutputWire {
    /// Non-empty only for the device's own addresses (change/transfer
    /// candidates); externally addressed outputs leave this empty.
    pub address_n: Vec<u32>,
    pub script_pubkey: Vec<u8>,
    pub amount: u64,
    pub script_type: ScriptType,
    pub address_type: AddressType,
    pub multisig: Option<MultisigWire>,
}

/// BIP-143 style preimage fields accumulated across a full pass over the
/// transaction (`spec.md` §4.7 "Accumulates `hash_prevouts`,
/// `hash_sequence`, `hash_outputs`").
struct RollingHashes {
    prevouts: Sha256,
    sequence: Sha256,
    outputs: Sha256,
}

impl RollingHashes {
    fn new() -> Self {
        RollingHashes { prevouts: Sha256::new(), sequence: Sha256::new(), outputs: Sha256::new() }
    }

    fn add_input(&mut self, prev_hash: &[u8; 32], prev_index: u32, sequence: u32) {
        self.prevouts.update(prev_hash);
        self.prevouts.update(prev_index.to_le_bytes());
        self.sequence.update(sequence.to_le_bytes());
    }

    fn add_output(&mut self, output: &TxOutputWire) {
        self.outputs.update(output.amount.to_le_bytes());
        self.outputs.update(encode_varint(output.script_pubkey.len() as u64));
        self.outputs.update(&output.script_pubkey);
    }

    fn finish(self) -> ([u8; 32], [u8; 32], [u8; 32]) {
        (double_sha256(self.prevouts), double_sha256(self.sequence), double_sha256(self.outputs))
    }
}

fn double_sha256(first: Sha256) -> [u8; 32] {
    let once = first.finalize();
    let twice = Sha256::digest(once);
    let mut out = [0u8; 32];
    out.copy_from_slice(&twice);
    out
}

fn encode_varint(n: u64) -> Vec<u8> {
    if n < 0xfd {
        vec![n as u8]
    } else if n <= 0xffff {
        let mut v = vec![0xfd];
        v.extend_from_slice(&(n as u16).to_le_bytes());
        v
    } else if n <= 0xffff_ffff {
        let mut v = vec![0xfe];
        v.extend_from_slice(&(n as u32).to_le_bytes());
        v
    } else {
        let mut v = vec![0xff];
        v.extend_from_slice(&n.to_le_bytes());
        v
    }
}

/// Rough serialized-size estimate for a legacy P2PKH-shaped transaction
/// with `inputs`/`outputs` of this count, used by `Request::EstimateTxSize`
/// and to size the fee-over-threshold check in `finish_phase1` before any
/// input's actual script type is known. 148 bytes/input and 34
/// bytes/output are the conventional P2PKH/P2PKH-output estimates; actual
/// segwit or multisig transactions come in smaller or larger, which is why
/// this is an estimate rather than an exact size.
pub fn estimate_tx_size(inputs: u32, outputs: u32) -> u64 {
    10 + inputs as u64 * 148 + outputs as u64 * 34
}

/// Byte-oriented state machine that verifies a referenced previous
/// transaction and extracts the value of the output it spends, without
/// ever buffering the whole previous transaction (`spec.md` §4.7
/// "Previous-transaction parsing"): `NOT_PARSING -> PARSING_VERSION ->
/// PARSING_INPUT_COUNT -> PARSING_INPUTS -> PARSING_OUTPUT_COUNT ->
/// PARSING_OUTPUTS_VALUE -> PARSING_OUTPUTS -> PARSING_LOCKTIME`.
pub struct PrevTxParser {
    state: ParseState,
    hasher: Sha256,
    varint: VarIntReader,
    fixed_buf: Vec<u8>,
    inputs_total: u64,
    inputs_remaining: u64,
    outputs_total: u64,
    outputs_remaining: u64,
    output_cursor: u64,
    script_remaining: u64,
    target_output_index: u32,
    found_value: Option<u64>,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum ParseState {
    Version,
    InputCount,
    InputPrevout,
    InputScriptLen,
    InputScript,
    InputSequence,
    OutputCount,
    OutputValue,
    OutputScriptLen,
    OutputScript,
    Locktime,
    Done,
}

struct VarIntReader {
    buf: Vec<u8>,
    needed: usize,
}

impl VarIntReader {
    fn new() -> Self {
        VarIntReader { buf: Vec::new(), needed: 0 }
    }

    fn push(&mut self, byte: u8) -> Option<u64> {
        if self.buf.is_empty() {
            self.needed = match byte {
                0xfd => 3,
                0xfe => 5,
                0xff => 9,
                _ => 1,
            };
        }
        self.buf.push(byte);
        if self.buf.len() < self.needed {
            return None;
        }
        let value = match self.buf[0] {
            0xfd => u16::from_le_bytes([self.buf[1], self.buf[2]]) as u64,
            0xfe => u32::from_le_bytes(self.buf[1..5].try_into().unwrap()) as u64,
            0xff => u64::from_le_bytes(self.buf[1..9].try_into().unwrap()),
            v => v as u64,
        };
        self.buf.clear();
        self.needed = 0;
        Some(value)
    }
}

/// The result of a completed previous-transaction parse.
pub struct PrevTxResult {
    /// Double-SHA256 over every byte fed in, compared against the
    /// claiming input's `prev_hash`.
    pub txid: [u8; 32],
    pub output_value: Option<u64>,
    pub is_complete: bool,
}

impl PrevTxParser {
    pub fn new(target_output_index: u32) -> Self {
        PrevTxParser {
            state: ParseState::Version,
            hasher: Sha256::new(),
            varint: VarIntReader::new(),
            fixed_buf: Vec::new(),
            inputs_total: 0,
            inputs_remaining: 0,
            outputs_total: 0,
            outputs_remaining: 0,
            output_cursor: 0,
            script_remaining: 0,
            target_output_index,
            found_value: None,
        }
    }

    pub fn feed(&mut self, data: &[u8]) -> Result<(), Error> {
        for &byte in data {
            if self.state == ParseState::Done {
                return Err(Error::DataError(s!(
                    "previous-transaction bytes received after locktime was parsed"
                )));
            }
            self.hasher.update([byte]);
            self.consume(byte);
        }
        Ok(())
    }

    fn consume(&mut self, byte: u8) {
        match self.state {
            ParseState::Version => {
                self.fixed_buf.push(byte);
                if self.fixed_buf.len() == 4 {
                    self.fixed_buf.clear();
                    self.state = ParseState::InputCount;
                }
            }
            ParseState::InputCount => {
                if let Some(n) = self.varint.push(byte) {
                    self.inputs_total = n;
                    self.inputs_remaining = n;
                    self.state =
                        if n == 0 { ParseState::OutputCount } else { ParseState::InputPrevout };
                }
            }
            ParseState::InputPrevout => {
                self.fixed_buf.push(byte);
                if self.fixed_buf.len() == 36 {
                    self.fixed_buf.clear();
                    self.state = ParseState::InputScriptLen;
                }
            }
            ParseState::InputScriptLen => {
                if let Some(n) = self.varint.push(byte) {
                    self.script_remaining = n;
                    self.state =
                        if n == 0 { ParseState::InputSequence } else { ParseState::InputScript };
                }
            }
            ParseState::InputScript => {
                self.script_remaining -= 1;
                if self.script_remaining == 0 {
                    self.state = ParseState::InputSequence;
                }
            }
            ParseState::InputSequence => {
                self.fixed_buf.push(byte);
                if self.fixed_buf.len() == 4 {
                    self.fixed_buf.clear();
                    self.inputs_remaining -= 1;
                    self.state = if self.inputs_remaining == 0 {
                        ParseState::OutputCount
                    } else {
                        ParseState::InputPrevout
                    };
                }
            }
            ParseState::OutputCount => {
                if let Some(n) = self.varint.push(byte) {
                    self.outputs_total = n;
                    self.outputs_remaining = n;
                    self.output_cursor = 0;
                    self.state =
                        if n == 0 { ParseState::Locktime } else { ParseState::OutputValue };
                }
            }
            ParseState::OutputValue => {
                self.fixed_buf.push(byte);
                if self.fixed_buf.len() == 8 {
                    let value = u64::from_le_bytes(self.fixed_buf[..].try_into().unwrap());
                    if self.output_cursor == self.target_output_index as u64 {
                        self.found_value = Some(value);
                    }
                    self.fixed_buf.clear();
                    self.state = ParseState::OutputScriptLen;
                }
            }
            ParseState::OutputScriptLen => {
                if let Some(n) = self.varint.push(byte) {
                    self.script_remaining = n;
                    if n == 0 {
                        self.advance_output();
                    } else {
                        self.state = ParseState::OutputScript;
                    }
                }
            }
            ParseState::OutputScript => {
                self.script_remaining -= 1;
                if self.script_remaining == 0 {
                    self.advance_output();
                }
            }
            ParseState::Locktime => {
                self.fixed_buf.push(byte);
                if self.fixed_buf.len() == 4 {
                    self.fixed_buf.clear();
                    self.state = ParseState::Done;
                }
            }
            ParseState::Done => unreachable!("feed() rejects further bytes once Done"),
        }
    }

    fn advance_output(&mut self) {
        self.outputs_remaining -= 1;
        self.output_cursor += 1;
        self.state =
            if self.outputs_remaining == 0 { ParseState::Locktime } else { ParseState::OutputValue };
    }

    /// Whether enough bytes have been fed to reach the locktime field.
    /// The dispatcher polls this after every chunk to decide whether to
    /// request more previous-transaction bytes or move on to
    /// [`Self::finish`].
    pub fn is_done(&self) -> bool {
        self.state == ParseState::Done
    }

    pub fn finish(self) -> PrevTxResult {
        let is_complete = self.state == ParseState::Done;
        let once = self.hasher.finalize();
        let twice = Sha256::digest(once);
        let mut txid = [0u8; 32];
        txid.copy_from_slice(&twice);
        PrevTxResult { txid, output_value: self.found_value, is_complete }
    }
}

/// Per-input bookkeeping retained between Phase 1 and Phase 2.
struct InputRecord {
    wire: TxInputWire,
}

/// The streaming Bitcoin-family signer (`spec.md` §4.7 `SignerState`).
pub struct BitcoinSigner {
    coin: CoinParams,
    version: u32,
    lock_time: u32,
    inputs: Vec<InputRecord>,
    outputs: Vec<TxOutputWire>,
    to_spend: u64,
    spending: u64,
    change_count: u32,
    change_spend: u64,
    multisig_fingerprint: Option<[u8; 32]>,
    multisig_agrees: bool,
    hashes: RollingHashes,
    checksum: Sha256,
    phase1_checksum: Option<[u8; 32]>,
    hash_prevouts: Option<[u8; 32]>,
    hash_sequence: Option<[u8; 32]>,
    hash_outputs: Option<[u8; 32]>,
    fee: u64,
}

/// The outcome of Phase 1, handed to the dispatcher so it can drive the
/// confirmation sequence before Phase 2 begins.
pub struct Phase1Summary {
    pub fee: u64,
    pub total: u64,
    pub fee_over_threshold: bool,
}

impl BitcoinSigner {
    pub fn new(coin: CoinParams, version: u32, lock_time: u32) -> Self {
        BitcoinSigner {
            coin,
            version,
            lock_time,
            inputs: Vec::new(),
            outputs: Vec::new(),
            to_spend: 0,
            spending: 0,
            change_count: 0,
            change_spend: 0,
            multisig_fingerprint: None,
            multisig_agrees: true,
            hashes: RollingHashes::new(),
            checksum: Sha256::new(),
            phase1_checksum: None,
            hash_prevouts: None,
            hash_sequence: None,
            hash_outputs: None,
            fee: 0,
        }
    }

    /// Phase 1: records one input after its previous transaction has been
    /// verified (`spec.md` §4.7 Phase 1). `prev_tx` is the completed parse
    /// of the transaction `wire.prev_hash` is supposed to reference.
    pub fn add_input(&mut self, wire: TxInputWire, prev_tx: PrevTxResult) -> Result<(), Error> {
        if !prev_tx.is_complete || prev_tx.txid != wire.prev_hash {
            return Err(Error::DataError(s!("previous transaction hash does not match prev_hash")));
        }
        let prev_value = prev_tx
            .output_value
            .ok_or_else(|| Error::DataError(s!("prev_index out of range in previous transaction")))?;

        if let Some(declared) = wire.amount {
            if declared != prev_value {
                return Err(Error::AmountChangedDuringSigning);
            }
        } else if self.coin.forkid_enabled || matches!(wire.script_type, ScriptType::P2wpkh | ScriptType::P2wsh) {
            return Err(Error::MissingInputAmount);
        }

        if let Some(ms) = &wire.multisig {
            let fp = ms.fingerprint();
            match self.multisig_fingerprint {
                None => self.multisig_fingerprint = Some(fp),
                Some(existing) if existing == fp => {}
                Some(_) => self.multisig_agrees = false,
            }
        } else {
            self.multisig_agrees = false;
        }

        self.hashes.add_input(&wire.prev_hash, wire.prev_index, wire.sequence);
        self.checksum.update(wire.prev_hash);
        self.checksum.update(wire.prev_index.to_le_bytes());
        self.checksum.update(wire.sequence.to_le_bytes());
        self.to_spend = self.to_spend.saturating_add(prev_value);

        self.inputs.push(InputRecord { wire });
        Ok(())
    }

    /// Phase 1: records one output, classifying it as change per
    /// `spec.md` §4.7. Returns whether the confirmation dialogue must be
    /// shown to the user (`false` for change, `true` otherwise).
    pub fn add_output(&mut self, output: TxOutputWire) -> Result<bool, Error> {
        let is_change = self.classify_change(&output);
        if is_change {
            self.change_count += 1;
            if self.change_count > 1 {
                return Err(Error::MultipleChangeOutputs);
            }
            self.change_spend = self.change_spend.saturating_add(output.amount);
        }

        self.hashes.add_output(&output);
        self.checksum.update(output.amount.to_le_bytes());
        self.checksum.update(encode_varint(output.script_pubkey.len() as u64));
        self.checksum.update(&output.script_pubkey);
        self.spending = self.spending.saturating_add(output.amount);

        self.outputs.push(output);
        Ok(!is_change)
    }

    /// `spec.md` §4.7 change-classification predicate.
    fn classify_change(&self, output: &TxOutputWire) -> bool {
        if matches!(output.address_type, AddressType::Transfer | AddressType::Exchange) {
            return false;
        }

        if output.script_type == ScriptType::PayToMultisig {
            if let (Some(out_ms), Some(in_fp)) = (&output.multisig, self.multisig_fingerprint) {
                if self.multisig_agrees && out_ms.fingerprint() == in_fp {
                    if let Some(first_input_ms) =
                        self.inputs.first().and_then(|i| i.wire.multisig.as_ref())
                    {
                        if out_ms.m == first_input_ms.m
                            && out_ms.pubkeys.len() == first_input_ms.pubkeys.len()
                        {
                            return true;
                        }
                    }
                }
            }
        }

        if !output.address_n.is_empty() {
            // Position 3 (0-indexed) of the derivation path is the BIP-44
            // "chain" index; `1` means the internal/change chain.
            let is_internal_chain = output.address_n.get(3).copied() == Some(1);
            if is_internal_chain || output.address_type == AddressType::Change {
                return true;
            }
        }

        false
    }

    /// Finalizes Phase 1: checks funds are sufficient, computes the fee,
    /// and freezes the checksum Phase 2 must reproduce.
    pub fn finish_phase1(&mut self, tx_size_bytes: u64) -> Result<Phase1Summary, Error> {
        if self.to_spend < self.spending {
            return Err(Error::NotEnoughFunds);
        }
        self.fee = self.to_spend - self.spending;
        let total = self.to_spend - self.change_spend;

        let (prevouts, sequence, outputs) =
            std::mem::replace(&mut self.hashes, RollingHashes::new()).finish();
        self.hash_prevouts = Some(prevouts);
        self.hash_sequence = Some(sequence);
        self.hash_outputs = Some(outputs);

        let digest = std::mem::replace(&mut self.checksum, Sha256::new()).finalize();
        let mut checksum = [0u8; 32];
        checksum.copy_from_slice(&digest);
        self.phase1_checksum = Some(checksum);

        let tx_est_size_kb = (tx_size_bytes as f64 / 1000.0).ceil().max(1.0);
        let fee_over_threshold = (self.fee as f64) > tx_est_size_kb * (self.coin.max_fee_per_kb as f64);

        Ok(Phase1Summary { fee: self.fee, total, fee_over_threshold })
    }

    /// Phase 2: re-streams the same inputs/outputs and checks the checksum
    /// before signing anything (`spec.md` §4.7 invariant: "checksum ...
    /// must be identical in Phase 1 and Phase 2. Mismatch aborts").
    pub fn verify_phase2_checksum(&self, inputs: &[TxInputWire], outputs: &[TxOutputWire]) -> Result<(), Error> {
        let mut hasher = Sha256::new();
        for input in inputs {
            hasher.update(input.prev_hash);
            hasher.update(input.prev_index.to_le_bytes());
            hasher.update(input.sequence.to_le_bytes());
        }
        for output in outputs {
            hasher.update(output.amount.to_le_bytes());
            hasher.update(encode_varint(output.script_pubkey.len() as u64));
            hasher.update(&output.script_pubkey);
        }
        let digest = hasher.finalize();
        let mut checksum = [0u8; 32];
        checksum.copy_from_slice(&digest);

        match self.phase1_checksum {
            Some(expected) if expected == checksum => Ok(()),
            _ => Err(Error::ChecksumMismatch),
        }
    }

    /// Phase 2: signs input `index`, returning the compiled `scriptSig`
    /// bytes to serialize in its place.
    pub fn sign_input(
        &self,
        index: usize,
        root: &Xpriv,
        sighash_type: u32,
    ) -> Result<Vec<u8>, Error> {
        let record = self.inputs.get(index).ok_or_else(|| Error::Other(s!("input index out of range")))?;
        let wire = &record.wire;
        let secp = Secp256k1::new();

        let path = derivation_path(&wire.address_n)?;
        let child = root
            .derive_priv(&secp, &path)
            .map_err(|e| Error::Other(format!("child key derivation failed: {e}")))?;
        let public_key = PublicKey::new(child.private_key.public_key(&secp));

        let script_code = script_code_for(wire.script_type, &public_key, wire.multisig.as_ref())?;

        let is_bip143 = self.coin.forkid_enabled
            || matches!(wire.script_type, ScriptType::P2wpkh | ScriptType::P2wsh);

        let sighash = if is_bip143 {
            let amount = wire.amount.ok_or(Error::MissingInputAmount)?;
            self.bip143_sighash(index, &script_code, amount, sighash_type)?
        } else {
            self.legacy_sighash(index, &script_code, sighash_type)?
        };

        let message = Message::from_digest(sighash);
        let signature = secp.sign_ecdsa(&message, &child.private_key);
        Ok(compile_script_sig(wire.script_type, &signature, &public_key, wire.multisig.as_ref()))
    }

    fn bip143_sighash(
        &self,
        index: usize,
        script_code: &[u8],
        amount: u64,
        sighash_type: u32,
    ) -> Result<[u8; 32], Error> {
        let record = &self.inputs[index];
        let mut preimage = Vec::new();
        preimage.extend_from_slice(&self.version.to_le_bytes());
        preimage.extend_from_slice(&self.hash_prevouts.ok_or(Error::ChecksumMismatch)?);
        preimage.extend_from_slice(&self.hash_sequence.ok_or(Error::ChecksumMismatch)?);
        preimage.extend_from_slice(&record.wire.prev_hash);
        preimage.extend_from_slice(&record.wire.prev_index.to_le_bytes());
        preimage.extend_from_slice(&encode_varint(script_code.len() as u64));
        preimage.extend_from_slice(script_code);
        preimage.extend_from_slice(&amount.to_le_bytes());
        preimage.extend_from_slice(&record.wire.sequence.to_le_bytes());
        preimage.extend_from_slice(&self.hash_outputs.ok_or(Error::ChecksumMismatch)?);
        preimage.extend_from_slice(&self.lock_time.to_le_bytes());
        preimage.extend_from_slice(&sighash_type.to_le_bytes());

        let once = Sha256::digest(&preimage);
        let twice = Sha256::digest(once);
        let mut out = [0u8; 32];
        out.copy_from_slice(&twice);
        Ok(out)
    }

    fn legacy_sighash(&self, index: usize, script_code: &[u8], sighash_type: u32) -> Result<[u8; 32], Error> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&encode_varint(self.inputs.len() as u64));
        for (i, input) in self.inputs.iter().enumerate() {
            buf.extend_from_slice(&input.wire.prev_hash);
            buf.extend_from_slice(&input.wire.prev_index.to_le_bytes());
            if i == index {
                buf.extend_from_slice(&encode_varint(script_code.len() as u64));
                buf.extend_from_slice(script_code);
            } else {
                buf.extend_from_slice(&encode_varint(0));
            }
            buf.extend_from_slice(&input.wire.sequence.to_le_bytes());
        }
        buf.extend_from_slice(&encode_varint(self.outputs.len() as u64));
        for output in &self.outputs {
            buf.extend_from_slice(&output.amount.to_le_bytes());
            buf.extend_from_slice(&encode_varint(output.script_pubkey.len() as u64));
            buf.extend_from_slice(&output.script_pubkey);
        }
        buf.extend_from_slice(&self.lock_time.to_le_bytes());
        buf.extend_from_slice(&sighash_type.to_le_bytes());

        let once = Sha256::digest(&buf);
        let twice = Sha256::digest(once);
        let mut out = [0u8; 32];
        out.copy_from_slice(&twice);
        Ok(out)
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }
}

pub(crate) fn derivation_path(address_n: &[u32]) -> Result<DerivationPath, Error> {
    let children: Result<Vec<ChildNumber>, _> =
        address_n.iter().map(|&n| ChildNumber::from_normal_idx(n & 0x7fff_ffff).map(|c| if n & 0x8000_0000 != 0 { c.into_hardened().unwrap_or(c) } else { c })).collect();
    let children = children.map_err(|e| Error::Other(format!("invalid derivation path: {e}")))?;
    Ok(DerivationPath::from(children))
}

fn script_code_for(
    script_type: ScriptType,
    public_key: &PublicKey,
    multisig: Option<&MultisigWire>,
) -> Result<Vec<u8>, Error> {
    match script_type {
        ScriptType::P2pkh | ScriptType::P2wpkh => {
            let hash = PubkeyHash::from(*public_key);
            Ok(ScriptBuf::new_p2pkh(&hash).into_bytes())
        }
        ScriptType::P2sh | ScriptType::P2wsh | ScriptType::PayToMultisig => {
            let ms = multisig.ok_or_else(|| Error::DataError(s!("multisig script requires cosigner pubkeys")))?;
            Ok(compile_multisig_redeem_script(ms))
        }
    }
}

fn compile_multisig_redeem_script(ms: &MultisigWire) -> Vec<u8> {
    use bitcoin::blockdata::opcodes::all::{OP_CHECKMULTISIG, OP_PUSHNUM_1};
    use bitcoin::blockdata::script::{Builder, PushBytesBuf};

    let mut sorted = ms.pubkeys.clone();
    sorted.sort();

    let m_op = (OP_PUSHNUM_1.to_u8() + ms.m - 1).into();
    let n_op: bitcoin::blockdata::opcodes::Opcode = (OP_PUSHNUM_1.to_u8() + sorted.len() as u8 - 1).into();

    let mut builder = Builder::new().push_opcode(m_op);
    for pk in &sorted {
        let push = PushBytesBuf::try_from(pk.to_vec()).expect("33-byte pubkey fits a script push");
        builder = builder.push_slice(&push);
    }
    builder = builder.push_opcode(n_op).push_opcode(OP_CHECKMULTISIG);
    builder.into_script().into_bytes()
}

fn compile_script_sig(
    script_type: ScriptType,
    signature: &secp256k1::ecdsa::Signature,
    public_key: &PublicKey,
    multisig: Option<&MultisigWire>,
) -> Vec<u8> {
    use bitcoin::blockdata::script::{Builder, PushBytesBuf};

    let mut sig_with_type = signature.serialize_der().to_vec();
    sig_with_type.push(0x01); // SIGHASH_ALL; forkid coins OR in their bit separately at the call site.

    match script_type {
        ScriptType::P2pkh => {
            let sig_push = PushBytesBuf::try_from(sig_with_type).expect("DER signature fits a script push");
            let pk_push =
                PushBytesBuf::try_from(public_key.to_bytes()).expect("compressed pubkey fits a script push");
            Builder::new().push_slice(&sig_push).push_slice(&pk_push).into_script().into_bytes()
        }
        ScriptType::P2wpkh => {
            // Witness-carried; the legacy scriptSig stays empty.
            Vec::new()
        }
        ScriptType::P2sh | ScriptType::PayToMultisig => {
            let ms = multisig.expect("multisig script_type always carries cosigner pubkeys");
            let redeem = compile_multisig_redeem_script(ms);
            let sig_push = PushBytesBuf::try_from(sig_with_type).expect("DER signature fits a script push");
            let redeem_push =
                PushBytesBuf::try_from(redeem).expect("redeem script fits a script push");
            Builder::new()
                .push_opcode(bitcoin::blockdata::opcodes::all::OP_PUSHBYTES_0)
                .push_slice(&sig_push)
                .push_slice(&redeem_push)
                .into_script()
                .into_bytes()
        }
        ScriptType::P2wsh => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coin(forkid: bool) -> CoinParams {
        CoinParams { coin_name: "Bitcoin", max_fee_per_kb: 100_000, forkid_enabled: forkid, decimals: 8 }
    }

    /// Serializes a minimal 1-output legacy transaction the way a real
    /// previous transaction would look on the wire, for feeding into
    /// [`PrevTxParser`].
    fn serialize_minimal_prev_tx(output_value: u64, output_script: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u32.to_le_bytes()); // version
        buf.push(1); // input count
        buf.extend_from_slice(&[0xAAu8; 32]); // prevout hash
        buf.extend_from_slice(&0u32.to_le_bytes()); // prevout index
        buf.push(0); // empty scriptSig
        buf.extend_from_slice(&0xFFFF_FFFFu32.to_le_bytes()); // sequence
        buf.push(1); // output count
        buf.extend_from_slice(&output_value.to_le_bytes());
        buf.push(output_script.len() as u8);
        buf.extend_from_slice(output_script);
        buf.extend_from_slice(&0u32.to_le_bytes()); // locktime
        buf
    }

    #[test]
    fn prev_tx_parser_extracts_referenced_output_value() {
        let script = [0x76, 0xa9, 0x14];
        let raw = serialize_minimal_prev_tx(123_456_789, &script);

        let mut parser = PrevTxParser::new(0);
        parser.feed(&raw).unwrap();
        let result = parser.finish();

        assert!(result.is_complete);
        assert_eq!(result.output_value, Some(123_456_789));

        let once = Sha256::digest(&raw);
        let twice = Sha256::digest(once);
        assert_eq!(&result.txid[..], &twice[..]);
    }

    #[test]
    fn prev_tx_parser_handles_chunked_feed() {
        let raw = serialize_minimal_prev_tx(42, &[0x51]);
        let mut parser = PrevTxParser::new(0);
        for chunk in raw.chunks(3) {
            parser.feed(chunk).unwrap();
        }
        let result = parser.finish();
        assert!(result.is_complete);
        assert_eq!(result.output_value, Some(42));
    }

    fn sample_input(amount: Option<u64>) -> (TxInputWire, PrevTxResult) {
        let script = [0x51u8];
        let raw = serialize_minimal_prev_tx(100_000, &script);
        let mut parser = PrevTxParser::new(0);
        parser.feed(&raw).unwrap();
        let result = parser.finish();
        let wire = TxInputWire {
            address_n: vec![0x8000_0000 + 44, 0x8000_0000, 0x8000_0000, 0, 0],
            prev_hash: result.txid,
            prev_index: 0,
            script_type: ScriptType::P2pkh,
            sequence: 0xFFFF_FFFF,
            amount,
            multisig: None,
        };
        (wire, result)
    }

    #[test]
    fn enough_funds_roundtrips_through_phase1() {
        let mut signer = BitcoinSigner::new(coin(false), 1, 0);
        let (input, prev) = sample_input(None);
        signer.add_input(input, prev).unwrap();

        let output = TxOutputWire {
            address_n: vec![],
            script_pubkey: vec![0x76, 0xa9, 0x14],
            amount: 90_000,
            script_type: ScriptType::P2pkh,
            address_type: AddressType::Standard,
            multisig: None,
        };
        let must_confirm = signer.add_output(output).unwrap();
        assert!(must_confirm);

        let summary = signer.finish_phase1(250).unwrap();
        assert_eq!(summary.fee, 10_000);
        assert_eq!(summary.total, 90_000);
    }

    #[test]
    fn not_enough_funds_is_rejected() {
        let mut signer = BitcoinSigner::new(coin(false), 1, 0);
        let (input, prev) = sample_input(None);
        signer.add_input(input, prev).unwrap();

        let output = TxOutputWire {
            address_n: vec![],
            script_pubkey: vec![0x76, 0xa9, 0x14],
            amount: 1_000_000,
            script_type: ScriptType::P2pkh,
            address_type: AddressType::Standard,
            multisig: None,
        };
        signer.add_output(output).unwrap();
        assert!(matches!(signer.finish_phase1(250), Err(Error::NotEnoughFunds)));
    }

    #[test]
    fn change_output_does_not_require_confirmation() {
        let mut signer = BitcoinSigner::new(coin(false), 1, 0);
        let (input, prev) = sample_input(None);
        signer.add_input(input, prev).unwrap();

        let change = TxOutputWire {
            address_n: vec![0x8000_0000 + 44, 0x8000_0000, 0x8000_0000, 1, 0],
            script_pubkey: vec![0x76, 0xa9, 0x14],
            amount: 50_000,
            script_type: ScriptType::P2pkh,
            address_type: AddressType::Standard,
            multisig: None,
        };
        let must_confirm = signer.add_output(change).unwrap();
        assert!(!must_confirm);
    }

    #[test]
    fn second_change_output_is_rejected() {
        let mut signer = BitcoinSigner::new(coin(false), 1, 0);
        let (input, prev) = sample_input(None);
        signer.add_input(input, prev).unwrap();

        let change = |amount| TxOutputWire {
            address_n: vec![0, 0, 0, 1, 0],
            script_pubkey: vec![0x51],
            amount,
            script_type: ScriptType::P2pkh,
            address_type: AddressType::Standard,
            multisig: None,
        };
        signer.add_output(change(10_000)).unwrap();
        assert!(matches!(signer.add_output(change(10_000)), Err(Error::MultipleChangeOutputs)));
    }

    #[test]
    fn bip143_coin_requires_input_amount() {
        let mut signer = BitcoinSigner::new(coin(true), 1, 0);
        let (input, prev) = sample_input(None);
        assert!(matches!(signer.add_input(input, prev), Err(Error::MissingInputAmount)));
    }

    #[test]
    fn amount_mismatch_against_previous_transaction_is_rejected() {
        let mut signer = BitcoinSigner::new(coin(false), 1, 0);
        let (input, prev) = sample_input(Some(1));
        assert!(matches!(signer.add_input(input, prev), Err(Error::AmountChangedDuringSigning)));
    }

    #[test]
    fn phase2_checksum_matches_phase1_for_identical_data() {
        let mut signer = BitcoinSigner::new(coin(false), 1, 0);
        let (input, prev) = sample_input(None);
        let input_clone = input.clone();
        signer.add_input(input, prev).unwrap();

        let output = TxOutputWire {
            address_n: vec![],
            script_pubkey: vec![0x76, 0xa9, 0x14],
            amount: 90_000,
            script_type: ScriptType::P2pkh,
            address_type: AddressType::Standard,
            multisig: None,
        };
        let output_clone = output.clone();
        signer.add_output(output).unwrap();
        signer.finish_phase1(250).unwrap();

        assert!(signer.verify_phase2_checksum(&[input_clone], &[output_clone]).is_ok());
    }

    #[test]
    fn phase2_checksum_mismatch_is_detected() {
        let mut signer = BitcoinSigner::new(coin(false), 1, 0);
        let (input, prev) = sample_input(None);
        signer.add_input(input, prev).unwrap();

        let output = TxOutputWire {
            address_n: vec![],
            script_pubkey: vec![0x76, 0xa9, 0x14],
            amount: 90_000,
            script_type: ScriptType::P2pkh,
            address_type: AddressType::Standard,
            multisig: None,
        };
        signer.add_output(output.clone()).unwrap();
        signer.finish_phase1(250).unwrap();

        let mut tampered = output;
        tampered.amount = 1;
        let (input2, _) = sample_input(None);
        assert!(matches!(
            signer.verify_phase2_checksum(&[input2], &[tampered]),
            Err(Error::ChecksumMismatch)
        ));
    }
}
