// VaultCore: firmware core for a hardware cryptocurrency wallet
//
// This software is distributed without any warranty.

//! The user-confirmation primitive (`spec.md` §4.3). Grounded in
//! `original_source/lib/firmware/confirm_sm.c`
//! (`confirm_helper`/`review`/`protectButton`): the dispatcher sends
//! `ButtonRequest(kind)`, renders the body through
//! [`crate::hal::Display::show_confirm`], then the *physical* buttons
//! (not a reply message) decide accept/reject while the dispatcher keeps
//! draining tiny protocol messages (`Cancel`/`Initialize`) concurrently
//! -- there is no separate thread, so [`ConfirmationFlow::poll_buttons`]
//! is just another thing the dispatcher's message loop calls on every
//! turn while `Waiting`.

use crate::hal::{ButtonEvent, Buttons, ConfirmLayout};
use crate::protocol::message::ButtonRequestKind;
use crate::error::Error;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ConfirmState {
    Request,
    Waiting,
    Finished,
}

/// One confirmation dialogue in flight. The dispatcher owns at most one
/// of these at a time (`spec.md` §9 "Global state": a second confirmation
/// request while one is already in flight is a protocol error).
pub struct ConfirmationFlow {
    state: ConfirmState,
    kind: ButtonRequestKind,
    layout: ConfirmLayout,
}

impl ConfirmationFlow {
    pub fn start(kind: ButtonRequestKind, layout: ConfirmLayout) -> Self {
        ConfirmationFlow { state: ConfirmState::Request, kind, layout }
    }

    pub fn state(&self) -> ConfirmState {
        self.state
    }

    pub fn kind(&self) -> ButtonRequestKind {
        self.kind
    }

    pub fn layout(&self) -> &ConfirmLayout {
        &self.layout
    }

    /// Call once `ButtonRequest` has been sent and the layout rendered.
    pub fn mark_sent(&mut self) {
        self.state = ConfirmState::Waiting;
    }

    /// The host's `ButtonAck` arrived. Purely a protocol nicety confirming
    /// the host received the request; the actual accept/reject decision
    /// comes from [`Self::poll_buttons`], not from this message.
    pub fn acknowledge(&mut self) -> Result<(), Error> {
        if self.state != ConfirmState::Waiting {
            return Err(Error::UnexpectedMessage("ButtonAck"));
        }
        Ok(())
    }

    /// Polls the physical buttons once. Returns `Some(true)` on Confirm,
    /// `Some(false)` on Cancel, `None` while still waiting. The dispatcher
    /// calls this on every iteration of its message loop while a
    /// confirmation is `Waiting` (`spec.md` §4.3 "polls buttons + tiny
    /// messages concurrently").
    pub fn poll_buttons(&mut self, buttons: &mut impl Buttons) -> Option<bool> {
        if self.state != ConfirmState::Waiting {
            return None;
        }
        match buttons.poll()? {
            ButtonEvent::Confirm => {
                self.state = ConfirmState::Finished;
                Some(true)
            }
            ButtonEvent::Cancel => {
                self.state = ConfirmState::Finished;
                Some(false)
            }
        }
    }

    /// The host's `Cancel`/`Initialize` arrived mid-confirmation
    /// (`spec.md` §4.2 "Cancellation and re-entry").
    pub fn cancel(&mut self) -> Error {
        self.state = ConfirmState::Finished;
        Error::ActionCancelled
    }
}

/// Chooses a [`ConfirmLayout::Text`] or automatic [`ConfirmLayout::Hex`]
/// fallback for an arbitrary body (`spec.md` §4.3: "automatic hex
/// fallback whenever the body contains a byte outside `[0x20, 0x7E]`").
pub fn text_or_hex_layout(title: impl Into<String>, body: &[u8]) -> ConfirmLayout {
    let title = title.into();
    if body.iter().all(|&b| (0x20..=0x7e).contains(&b)) {
        ConfirmLayout::Text {
            title,
            lines: vec![String::from_utf8_lossy(body).into_owned()],
        }
    } else {
        ConfirmLayout::Hex { title, bytes: body.to_vec() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn printable_body_renders_as_text() {
        let layout = text_or_hex_layout("Send", b"0.1 BTC to bc1q...");
        assert!(matches!(layout, ConfirmLayout::Text { .. }));
    }

    #[test]
    fn non_printable_body_falls_back_to_hex() {
        let layout = text_or_hex_layout("Memo", &[0x00, 0xff, 0x10]);
        assert!(matches!(layout, ConfirmLayout::Hex { .. }));
    }

    #[test]
    fn confirm_button_accepts() {
        let mut flow = ConfirmationFlow::start(
            ButtonRequestKind::ConfirmOutput,
            text_or_hex_layout("t", b"x"),
        );
        flow.mark_sent();
        let mut buttons = ScriptedButtons(vec![ButtonEvent::Confirm]);
        assert_eq!(flow.poll_buttons(&mut buttons), Some(true));
        assert_eq!(flow.state(), ConfirmState::Finished);
    }

    #[test]
    fn cancel_button_rejects() {
        let mut flow = ConfirmationFlow::start(
            ButtonRequestKind::ConfirmOutput,
            text_or_hex_layout("t", b"x"),
        );
        flow.mark_sent();
        let mut buttons = ScriptedButtons(vec![ButtonEvent::Cancel]);
        assert_eq!(flow.poll_buttons(&mut buttons), Some(false));
    }

    #[test]
    fn no_button_event_keeps_waiting() {
        let mut flow = ConfirmationFlow::start(
            ButtonRequestKind::ConfirmOutput,
            text_or_hex_layout("t", b"x"),
        );
        flow.mark_sent();
        let mut buttons = ScriptedButtons(vec![]);
        assert_eq!(flow.poll_buttons(&mut buttons), None);
        assert_eq!(flow.state(), ConfirmState::Waiting);
    }

    #[test]
    fn ack_outside_waiting_state_is_rejected() {
        let mut flow = ConfirmationFlow::start(
            ButtonRequestKind::ConfirmOutput,
            text_or_hex_layout("t", b"x"),
        );
        assert!(matches!(flow.acknowledge(), Err(Error::UnexpectedMessage(_))));
    }

    #[test]
    fn host_cancel_finishes_with_action_cancelled() {
        let mut flow = ConfirmationFlow::start(
            ButtonRequestKind::ConfirmOutput,
            text_or_hex_layout("t", b"x"),
        );
        flow.mark_sent();
        let err = flow.cancel();
        assert!(matches!(err, Error::ActionCancelled));
        assert_eq!(flow.state(), ConfirmState::Finished);
    }
}
