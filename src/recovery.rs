// VaultCore: firmware core for a hardware cryptocurrency wallet
//
// This software is distributed without any warranty.

//! The recovery-cipher state machine (`spec.md` §4.6). Grounded in
//! `original_source/lib/firmware/recovery_cipher.c`
//! (`recovery_cipher_init`/`recovery_cipher_word`/`recovery_character`):
//! the plain English alphabet is scrambled into a displayed cipher; the
//! host sends cipher-letter acks (`Request::WordAck`) that this module
//! decodes against the current permutation and resolves against the
//! BIP-39 wordlist using the same timing-safe, randomly-permuted lookup
//! the design notes (`spec.md` §9) prescribe for PIN-adjacent secret
//! comparisons.

use bip39::{Language, Mnemonic};
use sha2::{Digest, Sha256};
use std::str::FromStr;

use crate::crypto::constant_time::memcmp_s;
use crate::error::Error;
use crate::hal::HardwareRng;
use crate::secret::MnemonicBuf;

/// `spec.md` §4.6: "Enforces a <=4-character-per-word limit (BIP-39 prefix
/// property)": any 4-letter prefix uniquely identifies one BIP-39 English
/// word.
pub const MAX_WORD_PREFIX_LEN: usize = 4;

/// Words longer than this are truncated for the fixed-width, timing-
/// uniform prefix comparison (`spec.md` §4.6 "wordlist is padded to 9
/// chars"); no English BIP-39 word exceeds 8 letters.
const PADDED_WORD_LEN: usize = 9;

/// A random substitution cipher over `a..z` (`spec.md` §4.6: "scrambles the
/// plain English alphabet into a displayed cipher").
pub struct CipherAlphabet {
    /// `plain_to_cipher[i]` is the cipher letter displayed in place of
    /// plain letter `b'a' + i`.
    plain_to_cipher: [u8; 26],
    /// Inverse mapping, used to decode an incoming cipher-letter ack.
    cipher_to_plain: [u8; 26],
}

impl CipherAlphabet {
    /// Shuffles `a..z` with a Fisher-Yates pass driven by `rng` (`spec.md`
    /// §4.6: "displays a random permutation of `a..z`").
    pub fn scramble(rng: &mut impl HardwareRng) -> Self {
        let mut plain_to_cipher: [u8; 26] = std::array::from_fn(|i| b'a' + i as u8);
        for i in (1..plain_to_cipher.len()).rev() {
            let mut byte = [0u8; 1];
            rng.fill(&mut byte);
            let j = (byte[0] as usize) % (i + 1);
            plain_to_cipher.swap(i, j);
        }
        let mut cipher_to_plain = [0u8; 26];
        for (plain_idx, &cipher_letter) in plain_to_cipher.iter().enumerate() {
            cipher_to_plain[(cipher_letter - b'a') as usize] = b'a' + plain_idx as u8;
        }
        CipherAlphabet { plain_to_cipher, cipher_to_plain }
    }

    /// What to display: the cipher letter shown in place of each plain
    /// letter, in `a..z` order.
    pub fn displayed(&self) -> &[u8; 26] {
        &self.plain_to_cipher
    }

    /// Decodes one cipher letter back to plaintext; `None` for non-`a..z`
    /// bytes.
    fn decode_byte(&self, cipher_byte: u8) -> Option<u8> {
        if !cipher_byte.is_ascii_lowercase() {
            return None;
        }
        Some(self.cipher_to_plain[(cipher_byte - b'a') as usize])
    }

    /// Decodes a full cipher-letter sequence. Returns `None` if any byte
    /// isn't a lowercase letter.
    pub fn decode(&self, ciphered: &str) -> Option<String> {
        ciphered.bytes().map(|b| self.decode_byte(b).map(|p| p as char)).collect()
    }
}

fn padded9(s: &str) -> [u8; PADDED_WORD_LEN] {
    let mut buf = [0u8; PADDED_WORD_LEN];
    let bytes = s.as_bytes();
    let n = bytes.len().min(PADDED_WORD_LEN);
    buf[..n].copy_from_slice(&bytes[..n]);
    buf
}

/// Whether `word`'s first `prefix.len()` bytes equal `prefix`, compared
/// through fixed-width, zero-padded buffers so the comparison cost does
/// not vary with the candidate word's length.
fn word_matches_prefix(word: &str, prefix: &str) -> bool {
    if prefix.is_empty() || prefix.len() > PADDED_WORD_LEN {
        return false;
    }
    let w = padded9(word);
    let p = padded9(prefix);
    memcmp_s(&w[..prefix.len()], &p[..prefix.len()])
}

/// Result of resolving one `WordAck` against the wordlist.
struct WordMatch {
    /// The resolved full word, if the (decoded) prefix matched exactly one
    /// wordlist entry.
    word: Option<&'static str>,
    /// Whether the *raw* (un-decoded) input also matched some wordlist
    /// entry -- i.e. the host typed plaintext rather than cipher letters.
    matched_uncyphered: bool,
}

/// Scans the full BIP-39 English wordlist in a freshly randomly permuted
/// order, touching every entry regardless of where the match falls
/// (`spec.md` §4.6 "timing-safe search ... so that lookup timing does not
/// leak the word"; `spec.md` §9 "instruction-barrier to prevent the
/// compiler from eliding the permutation").
fn resolve_word(decoded_prefix: &str, raw_prefix: &str, rng: &mut impl HardwareRng) -> WordMatch {
    let word_list = Language::English.word_list();
    let mut indices: Vec<usize> = (0..word_list.len()).collect();
    for i in (1..indices.len()).rev() {
        let mut byte = [0u8; 4];
        rng.fill(&mut byte);
        let j = (u32::from_le_bytes(byte) as usize) % (i + 1);
        indices.swap(i, j);
    }

    let mut matched_word = None;
    let mut matched_uncyphered = false;
    for &idx in &indices {
        let candidate = word_list[idx];
        let cyphered_hit = word_matches_prefix(candidate, decoded_prefix);
        let plain_hit = word_matches_prefix(candidate, raw_prefix);
        if cyphered_hit {
            matched_word = Some(candidate);
        }
        if plain_hit {
            matched_uncyphered = true;
        }
        // Instruction barrier: without this the loop body above is pure
        // and LLVM is free to hoist it out of the permuted order entirely,
        // which would defeat the point of permuting in the first place.
        std::hint::black_box(candidate);
    }

    WordMatch { word: matched_word, matched_uncyphered }
}

/// `spec.md` §4.6: "if the host enters plaintext ... more than 3 times and
/// never enters a cyphered-only word, abort with `SyntaxError`".
const MAX_UNCYPHERED_BEFORE_ABORT: u32 = 3;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum RecoveryState {
    AwaitingWord,
    Done,
}

/// The recovery-cipher state machine (`spec.md` §4.6 `SessionState`-adjacent
/// recovery state). One instance lives for the whole `RecoveryDevice`
/// dialogue; the dispatcher feeds it one `WordAck` per message.
pub struct RecoveryCipher {
    state: RecoveryState,
    alphabet: CipherAlphabet,
    word_count: u32,
    words: Vec<&'static str>,
    uncyphered_count: u32,
    cyphered_used: bool,
    enforce_wordlist: bool,
    dry_run: bool,
    /// `SHA-256` of the device's currently stored mnemonic, used only in
    /// dry-run mode (`spec.md` §4.6: "Dry-run mode compares against the
    /// stored mnemonic via digest comparison, never exposing match success
    /// through timing").
    reference_digest: Option<[u8; 32]>,
}

pub enum WordOutcome {
    NeedMoreWords,
    /// All `word_count` words were collected and validated; carries the
    /// joined mnemonic (empty in dry-run mode, where the mnemonic itself is
    /// never reconstructed for the host).
    Done { mnemonic: Option<MnemonicBuf> },
}

impl RecoveryCipher {
    pub fn start(
        rng: &mut impl HardwareRng,
        word_count: u32,
        enforce_wordlist: bool,
        dry_run: bool,
        reference_mnemonic: Option<&str>,
    ) -> Self {
        let reference_digest = reference_mnemonic.map(|m| {
            let digest = Sha256::digest(m.as_bytes());
            let mut out = [0u8; 32];
            out.copy_from_slice(&digest);
            out
        });
        RecoveryCipher {
            state: RecoveryState::AwaitingWord,
            alphabet: CipherAlphabet::scramble(rng),
            word_count,
            words: Vec::new(),
            uncyphered_count: 0,
            cyphered_used: false,
            enforce_wordlist,
            dry_run,
            reference_digest,
        }
    }

    pub fn state(&self) -> RecoveryState {
        self.state
    }

    pub fn displayed_cipher(&self) -> &[u8; 26] {
        self.alphabet.displayed()
    }

    /// Feeds one `WordAck`. `raw` is exactly what the host sent: normally
    /// cipher letters, but a host that (accidentally or adversarially)
    /// types the plaintext word is still tracked via `raw_prefix` matching
    /// (`spec.md` §4.6 "uncyphered matches").
    pub fn submit_word(
        &mut self,
        raw: &str,
        rng: &mut impl HardwareRng,
    ) -> Result<WordOutcome, Error> {
        if self.state != RecoveryState::AwaitingWord {
            return Err(Error::UnexpectedMessage("WordAck"));
        }
        if raw.is_empty() || raw.len() > MAX_WORD_PREFIX_LEN {
            return Err(Error::SyntaxError);
        }

        let decoded = self.alphabet.decode(raw).ok_or(Error::SyntaxError)?;
        let result = resolve_word(&decoded, raw, rng);

        if result.matched_uncyphered {
            self.uncyphered_count += 1;
        } else {
            self.cyphered_used = true;
        }
        if self.uncyphered_count > MAX_UNCYPHERED_BEFORE_ABORT && !self.cyphered_used {
            self.state = RecoveryState::Done;
            return Err(Error::SyntaxError);
        }

        let word = result.word.ok_or(Error::SyntaxError)?;
        self.words.push(word);

        if (self.words.len() as u32) < self.word_count {
            return Ok(WordOutcome::NeedMoreWords);
        }

        self.state = RecoveryState::Done;
        self.finish()
    }

    fn finish(&self) -> Result<WordOutcome, Error> {
        let joined = self.words.join(" ");

        if self.enforce_wordlist {
            Mnemonic::from_str(&joined).map_err(|_| Error::ChecksumInvalid)?;
        }

        if self.dry_run {
            let digest = Sha256::digest(joined.as_bytes());
            let mut actual = [0u8; 32];
            actual.copy_from_slice(&digest);
            let expected = self.reference_digest.unwrap_or([0u8; 32]);
            if !memcmp_s(&actual, &expected) {
                return Err(Error::ChecksumInvalid);
            }
            return Ok(WordOutcome::Done { mnemonic: None });
        }

        let mnemonic = MnemonicBuf::try_from_str(&joined)
            .ok_or_else(|| Error::DataError(s!("recovered mnemonic too long")))?;
        Ok(WordOutcome::Done { mnemonic: Some(mnemonic) })
    }

    /// The host's `Cancel`/`Initialize` arrived mid-recovery (`spec.md`
    /// §4.2).
    pub fn cancel(&mut self) {
        self.state = RecoveryState::Done;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedRng(u32);
    impl HardwareRng for FixedRng {
        fn fill(&mut self, dest: &mut [u8]) {
            for b in dest.iter_mut() {
                *b = self.0 as u8;
                self.0 = self.0.wrapping_add(101);
            }
        }
    }

    #[test]
    fn cipher_alphabet_decode_round_trips_displayed_letters() {
        let mut rng = FixedRng(5);
        let cipher = CipherAlphabet::scramble(&mut rng);
        for plain in b'a'..=b'z' {
            let ciphered = cipher.plain_to_cipher[(plain - b'a') as usize];
            let decoded = cipher.decode_byte(ciphered).unwrap();
            assert_eq!(decoded, plain);
        }
    }

    fn cipher_for(word: &str, cipher: &CipherAlphabet) -> String {
        word.bytes()
            .map(|p| cipher.plain_to_cipher[(p - b'a') as usize] as char)
            .collect()
    }

    #[test]
    fn full_recovery_with_twelve_word_mnemonic_succeeds() {
        let mut rng = FixedRng(11);
        let cipher = CipherAlphabet::scramble(&mut rng);
        let mut recovery = RecoveryCipher { alphabet: cipher, ..fresh(12, true, false, None) };

        let words = [
            "abandon", "abandon", "abandon", "abandon", "abandon", "abandon", "abandon",
            "abandon", "abandon", "abandon", "abandon", "about",
        ];
        let mut outcome = WordOutcome::NeedMoreWords;
        for word in words {
            let ciphered = cipher_for(&word[..MAX_WORD_PREFIX_LEN.min(word.len())], &recovery_alphabet(&recovery));
            outcome = recovery.submit_word(&ciphered, &mut rng).unwrap();
        }
        match outcome {
            WordOutcome::Done { mnemonic: Some(m) } => {
                assert!(m.as_str().starts_with("abandon"));
                assert!(m.as_str().ends_with("about"));
            }
            _ => panic!("expected Done with a mnemonic"),
        }
    }

    fn recovery_alphabet(recovery: &RecoveryCipher) -> &CipherAlphabet {
        &recovery.alphabet
    }

    fn fresh(word_count: u32, enforce_wordlist: bool, dry_run: bool, reference: Option<&str>) -> RecoveryCipher {
        let mut rng = FixedRng(1);
        RecoveryCipher::start(&mut rng, word_count, enforce_wordlist, dry_run, reference)
    }

    #[test]
    fn prefix_longer_than_four_is_rejected() {
        let mut rng = FixedRng(3);
        let mut recovery = fresh(12, true, false, None);
        assert!(matches!(recovery.submit_word("abcde", &mut rng), Err(Error::SyntaxError)));
    }

    #[test]
    fn ack_outside_awaiting_state_is_rejected() {
        let mut rng = FixedRng(3);
        let mut recovery = fresh(12, true, false, None);
        recovery.cancel();
        assert!(matches!(recovery.submit_word("abcd", &mut rng), Err(Error::UnexpectedMessage(_))));
    }

    #[test]
    fn repeated_uncyphered_entry_without_any_cyphered_word_aborts() {
        let mut rng = FixedRng(9);
        let cipher = CipherAlphabet::scramble(&mut rng);
        let mut recovery = RecoveryCipher { alphabet: cipher, ..fresh(12, true, false, None) };

        // Feed the *plaintext* prefix of "abandon" four times in a row:
        // since the cipher is (almost certainly) not the identity
        // permutation, each of these only matches as "uncyphered".
        for _ in 0..4 {
            let outcome = recovery.submit_word("aban", &mut rng);
            if let Err(Error::SyntaxError) = outcome {
                return;
            }
        }
        panic!("expected a SyntaxError abort from repeated uncyphered entry");
    }

    #[test]
    fn dry_run_matches_reference_mnemonic_digest() {
        let reference =
            "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";
        let mut rng = FixedRng(21);
        let cipher = CipherAlphabet::scramble(&mut rng);
        let mut recovery =
            RecoveryCipher { alphabet: cipher, ..fresh(12, true, true, Some(reference)) };

        let words: Vec<&str> = reference.split(' ').collect();
        let mut outcome = WordOutcome::NeedMoreWords;
        for word in &words {
            let ciphered =
                cipher_for(&word[..MAX_WORD_PREFIX_LEN.min(word.len())], &recovery_alphabet(&recovery));
            outcome = recovery.submit_word(&ciphered, &mut rng).unwrap();
        }
        assert!(matches!(outcome, WordOutcome::Done { mnemonic: None }));
    }
}
