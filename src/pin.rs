// VaultCore: firmware core for a hardware cryptocurrency wallet
//
// This software is distributed without any warranty.

//! The PIN state machine (`spec.md` §4.4). Grounded in
//! `original_source/lib/firmware/pinmatrix.c`/`protect.c`
//! (`pinmatrix_start`/`pinmatrix_done`/`protectPin`), reshaped into an
//! explicit struct the dispatcher drives one message at a time instead of
//! the original's blocking `protectPin` call (`spec.md` §9 "Design Notes":
//! state machines replace the original's blocking waits).

use crate::crypto::wrap::PinCheckResult;
use crate::error::Error;
use crate::hal::HardwareRng;
use crate::secret::Pin;

/// `spec.md` §4.4 "Matrix scrambling": the nine PIN-pad positions in their
/// canonical (unscrambled) order.
const PIN_MATRIX: [u8; 9] = *b"123456789";

/// States of the PIN state machine (`spec.md` §4.4: "`Request -> Waiting
/// -> (Ack|Cancel|Init) -> Finished`").
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum PinState {
    Request,
    Waiting,
    Finished,
}

/// Outcome handed back to the dispatcher once the SM reaches `Finished`.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum PinOutcome {
    Correct,
    Wrong,
    /// The submitted value matched the wipe-code target; the caller has
    /// already wiped storage. Reported back as an ordinary wrong PIN so
    /// the host cannot distinguish the two cases (`spec.md` §4.4: "the
    /// response is `PinInvalid` — indistinguishable from an ordinary
    /// wrong-PIN from the host side").
    WipedViaCollision,
    Cancelled,
}

/// A random permutation of [`PIN_MATRIX`], generated fresh every time the
/// SM is entered.
pub struct PinMatrix {
    permutation: [u8; 9],
}

impl PinMatrix {
    /// Shuffles [`PIN_MATRIX`] with a Fisher-Yates pass driven by
    /// `rng` (`spec.md` §4.4 "produces a random permutation ... with a
    /// scramble animation"; the animation itself is `crate::hal::Display`'s
    /// business).
    pub fn scramble(rng: &mut impl HardwareRng) -> Self {
        let mut permutation = PIN_MATRIX;
        for i in (1..permutation.len()).rev() {
            let mut byte = [0u8; 1];
            rng.fill(&mut byte);
            let j = (byte[0] as usize) % (i + 1);
            permutation.swap(i, j);
        }
        PinMatrix { permutation }
    }

    /// What to show the host/display: the digits in scrambled
    /// display order.
    pub fn displayed_digits(&self) -> &[u8; 9] {
        &self.permutation
    }

    /// Decodes one matrix-position digit (`'1'..='9'`) back to the
    /// cleartext PIN digit it represents.
    fn decode_position(&self, position_digit: u8) -> Result<u8, Error> {
        if !(b'1'..=b'9').contains(&position_digit) {
            return Err(Error::DataError(s!("pin matrix ack digit out of range")));
        }
        let index = (position_digit - b'1') as usize;
        Ok(self.permutation[index])
    }

    /// Decodes a full keypad-position sequence into the cleartext PIN
    /// (`spec.md` §4.4 "the SM decodes each digit via the matrix").
    /// Validates length `[1, 9]` per the same paragraph.
    pub fn decode(&self, sequence: &str) -> Result<Pin, Error> {
        if sequence.is_empty() || sequence.len() > 9 {
            return Err(Error::PinInvalid);
        }
        let mut cleartext = String::with_capacity(sequence.len());
        for ch in sequence.bytes() {
            cleartext.push(self.decode_position(ch)? as char);
        }
        Pin::try_from_str(&cleartext).ok_or(Error::PinInvalid)
    }
}

/// The PIN state machine itself. Holds the current matrix so the
/// dispatcher can re-render it if the transport needs a retransmit, and
/// tracks whether this SM run may accept a wipe-code collision (only
/// `is_pin_correct` callers do; `set_pin`/`ResetDevice` callers pass a new
/// PIN through [`PinMatrix::decode`] directly without this SM).
pub struct PinStateMachine {
    state: PinState,
    matrix: PinMatrix,
}

impl PinStateMachine {
    pub fn start(rng: &mut impl HardwareRng) -> Self {
        PinStateMachine { state: PinState::Request, matrix: PinMatrix::scramble(rng) }
    }

    pub fn state(&self) -> PinState {
        self.state
    }

    pub fn matrix(&self) -> &PinMatrix {
        &self.matrix
    }

    /// Call once `PinMatrixRequest` has been sent to the host
    /// (`spec.md` §4.4 states: `Request -> Waiting`).
    pub fn mark_sent(&mut self) {
        self.state = PinState::Waiting;
    }

    /// The host's `Cancel`/`Initialize` arrived while waiting
    /// (`spec.md` §4.2 "Cancellation and re-entry").
    pub fn cancel(&mut self) -> PinOutcome {
        self.state = PinState::Finished;
        PinOutcome::Cancelled
    }

    /// The host submitted `PinMatrixAck`. Decodes against the current
    /// matrix; the caller is responsible for running the decoded PIN
    /// through `StorageEngine::is_pin_correct`/`is_wipe_code_correct` and
    /// feeding the resulting [`PinCheckResult`] back via
    /// [`Self::finish`].
    pub fn decode_ack(&mut self, sequence: &str) -> Result<Pin, Error> {
        if self.state != PinState::Waiting {
            return Err(Error::UnexpectedMessage("PinMatrixAck"));
        }
        self.matrix.decode(sequence)
    }

    /// Finalizes the SM with the storage engine's verdict.
    pub fn finish(&mut self, verdict: PinCheckResult, wipe_code_matched: bool) -> PinOutcome {
        self.state = PinState::Finished;
        if wipe_code_matched {
            return PinOutcome::WipedViaCollision;
        }
        match verdict {
            PinCheckResult::Wrong => PinOutcome::Wrong,
            PinCheckResult::Good | PinCheckResult::Rewrap => PinOutcome::Correct,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedRng(u8);
    impl HardwareRng for FixedRng {
        fn fill(&mut self, dest: &mut [u8]) {
            for b in dest {
                *b = self.0;
                self.0 = self.0.wrapping_add(37);
            }
        }
    }

    #[test]
    fn scrambled_matrix_is_a_permutation_of_1_through_9() {
        let mut rng = FixedRng(3);
        let matrix = PinMatrix::scramble(&mut rng);
        let mut sorted = *matrix.displayed_digits();
        sorted.sort();
        assert_eq!(sorted, PIN_MATRIX);
    }

    #[test]
    fn decode_roundtrips_through_scrambled_positions() {
        let mut rng = FixedRng(11);
        let matrix = PinMatrix::scramble(&mut rng);

        // Find the keypad position whose digit decodes to each of '1'..'9'
        // and reconstruct "123456789" by feeding those positions in order.
        let mut sequence = String::new();
        for digit in PIN_MATRIX {
            let position = matrix.displayed_digits().iter().position(|&d| d == digit).unwrap();
            sequence.push((b'1' + position as u8) as char);
        }

        let pin = matrix.decode(&sequence).unwrap();
        assert_eq!(pin.as_bytes(), &PIN_MATRIX[..]);
    }

    #[test]
    fn empty_sequence_is_rejected() {
        let mut rng = FixedRng(5);
        let matrix = PinMatrix::scramble(&mut rng);
        assert!(matches!(matrix.decode(""), Err(Error::PinInvalid)));
    }

    #[test]
    fn too_long_sequence_is_rejected() {
        let mut rng = FixedRng(5);
        let matrix = PinMatrix::scramble(&mut rng);
        assert!(matches!(matrix.decode("1111111111"), Err(Error::PinInvalid)));
    }

    #[test]
    fn state_machine_transitions_request_waiting_finished() {
        let mut rng = FixedRng(9);
        let mut sm = PinStateMachine::start(&mut rng);
        assert_eq!(sm.state(), PinState::Request);
        sm.mark_sent();
        assert_eq!(sm.state(), PinState::Waiting);

        let sequence: String = (1..=9).map(|d| (b'0' + d) as char).collect();
        let _pin = sm.decode_ack(&sequence).unwrap();
        let outcome = sm.finish(PinCheckResult::Good, false);
        assert_eq!(outcome, PinOutcome::Correct);
        assert_eq!(sm.state(), PinState::Finished);
    }

    #[test]
    fn wipe_code_collision_masquerades_as_wrong_pin() {
        let mut rng = FixedRng(2);
        let mut sm = PinStateMachine::start(&mut rng);
        sm.mark_sent();
        let outcome = sm.finish(PinCheckResult::Wrong, true);
        assert_eq!(outcome, PinOutcome::WipedViaCollision);
    }

    #[test]
    fn ack_outside_waiting_state_is_rejected() {
        let mut rng = FixedRng(2);
        let mut sm = PinStateMachine::start(&mut rng);
        assert!(matches!(sm.decode_ack("123456789"), Err(Error::UnexpectedMessage(_))));
    }
}
