// VaultCore: firmware core for a hardware cryptocurrency wallet
//
// This software is distributed without any warranty.

//! The passphrase state machine (`spec.md` §4.5). Grounded in
//! `original_source/lib/firmware/passphrase_sm.c`
//! (`passphrase_protect`/`passphrase_handlePassphraseAck`), reshaped the
//! same way `pin.rs` reshapes `protect.c`: an explicit struct the
//! dispatcher drives one message at a time rather than a blocking call.

use crate::error::Error;
use crate::secret::Passphrase;

/// `spec.md` §4.5: "When enabled and not yet cached, any derivation
/// request first emits `PassphraseRequest` and awaits `PassphraseAck`".
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum PassphraseState {
    Request,
    Waiting,
    Finished,
}

pub struct PassphraseStateMachine {
    state: PassphraseState,
}

impl PassphraseStateMachine {
    pub fn start() -> Self {
        PassphraseStateMachine { state: PassphraseState::Request }
    }

    pub fn state(&self) -> PassphraseState {
        self.state
    }

    /// Call once `PassphraseRequest` has been sent to the host.
    pub fn mark_sent(&mut self) {
        self.state = PassphraseState::Waiting;
    }

    /// The host's `Cancel`/`Initialize` arrived while waiting (`spec.md`
    /// §4.2 "Cancellation and re-entry").
    pub fn cancel(&mut self) -> Error {
        self.state = PassphraseState::Finished;
        Error::ActionCancelled
    }

    /// The host submitted `PassphraseAck`. `spec.md` §3 bounds a cached
    /// passphrase at 50 bytes; anything longer is a protocol-level data
    /// error rather than silently truncated, since truncating a
    /// passphrase would silently change which funds it unlocks.
    pub fn finish(&mut self, passphrase: &str) -> Result<Passphrase, Error> {
        if self.state != PassphraseState::Waiting {
            return Err(Error::UnexpectedMessage("PassphraseAck"));
        }
        self.state = PassphraseState::Finished;
        Passphrase::try_from_str(passphrase)
            .ok_or_else(|| Error::DataError(s!("passphrase exceeds 50 bytes")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_request_waiting_finished() {
        let mut sm = PassphraseStateMachine::start();
        assert_eq!(sm.state(), PassphraseState::Request);
        sm.mark_sent();
        assert_eq!(sm.state(), PassphraseState::Waiting);
        let passphrase = sm.finish("correct horse battery staple").unwrap();
        assert_eq!(passphrase.as_str(), "correct horse battery staple");
        assert_eq!(sm.state(), PassphraseState::Finished);
    }

    #[test]
    fn ack_outside_waiting_state_is_rejected() {
        let mut sm = PassphraseStateMachine::start();
        assert!(matches!(sm.finish("x"), Err(Error::UnexpectedMessage(_))));
    }

    #[test]
    fn overlong_passphrase_is_rejected() {
        let mut sm = PassphraseStateMachine::start();
        sm.mark_sent();
        let too_long = "x".repeat(51);
        assert!(matches!(sm.finish(&too_long), Err(Error::DataError(_))));
    }

    #[test]
    fn empty_passphrase_is_accepted() {
        let mut sm = PassphraseStateMachine::start();
        sm.mark_sent();
        let passphrase = sm.finish("").unwrap();
        assert!(passphrase.is_empty());
    }

    #[test]
    fn cancel_transitions_to_finished_and_reports_cancelled() {
        let mut sm = PassphraseStateMachine::start();
        sm.mark_sent();
        let err = sm.cancel();
        assert!(matches!(err, Error::ActionCancelled));
        assert_eq!(sm.state(), PassphraseState::Finished);
    }
}
