// VaultCore: firmware core for a hardware cryptocurrency wallet
//
// This software is distributed without any warranty.

//! The transport frame envelope (`spec.md` §6): a logical message is
//! `'?' '#' '#' id:u16_be len:u32_be payload[len]`, delivered over HID
//! packets of at most [`HID_PACKET_LEN`] bytes. The first packet carries the
//! header and as much payload as fits; continuation packets carry only a
//! leading `'?'` marker followed by more payload bytes. [`Reassembler`] is
//! the device-side half of this; [`fragment_frame`] is the host-side half,
//! kept here too so the crate's own tests can round-trip a message without
//! a real USB HID stack.

/// Maximum size of one HID packet (`spec.md` §6: "HID packets of <=64
/// bytes each").
pub const HID_PACKET_LEN: usize = 64;

/// `'?' '#' '#'` frame-start prefix.
pub const FRAME_PREFIX: [u8; 3] = [b'?', b'#', b'#'];

/// `'?'`-only continuation-packet prefix.
pub const CONTINUATION_PREFIX: u8 = b'?';

/// Bytes consumed by the frame header (`'?' '#' '#' id:u16_be len:u32_be`).
pub const HEADER_LEN: usize = FRAME_PREFIX.len() + 2 + 4;

#[derive(Clone, Debug, Display, Error, Eq, PartialEq)]
#[display(doc_comments)]
pub enum FrameError {
    /// HID packet shorter than the expected header/continuation prefix
    Truncated,
    /// packet did not start with the expected frame/continuation prefix
    BadPrefix,
    /// a continuation packet arrived with no frame in progress
    UnexpectedContinuation,
    /// declared payload length exceeds what this device will ever buffer
    PayloadTooLarge,
}

/// An upper bound on payload length this device will reassemble, guarding
/// against a malformed `len` field forcing an unbounded allocation
/// (`spec.md` §5 "Memory discipline": no surprise heap growth from
/// host-controlled input).
pub const MAX_PAYLOAD_LEN: usize = 1 << 20;

/// Splits one logical message into HID packets (`spec.md` §6). Host-side
/// counterpart to [`Reassembler::feed`]; kept here so `protocol`'s own round
/// trip tests don't need a transport mock.
pub fn fragment_frame(id: u16, payload: &[u8]) -> Vec<[u8; HID_PACKET_LEN]> {
    let mut packets = Vec::new();

    let mut first = [0u8; HID_PACKET_LEN];
    first[0..3].copy_from_slice(&FRAME_PREFIX);
    first[3..5].copy_from_slice(&id.to_be_bytes());
    first[5..9].copy_from_slice(&(payload.len() as u32).to_be_bytes());
    let first_cap = HID_PACKET_LEN - HEADER_LEN;
    let first_take = payload.len().min(first_cap);
    first[HEADER_LEN..HEADER_LEN + first_take].copy_from_slice(&payload[..first_take]);
    packets.push(first);

    let mut rest = &payload[first_take..];
    let cont_cap = HID_PACKET_LEN - 1;
    while !rest.is_empty() {
        let mut pkt = [0u8; HID_PACKET_LEN];
        pkt[0] = CONTINUATION_PREFIX;
        let take = rest.len().min(cont_cap);
        pkt[1..1 + take].copy_from_slice(&rest[..take]);
        packets.push(pkt);
        rest = &rest[take..];
    }
    packets
}

enum State {
    Idle,
    InProgress { id: u16, expected: usize, buf: Vec<u8> },
}

/// Device-side frame reassembler. One instance lives in the dispatcher and
/// is fed every inbound HID packet; it returns `Some((id, payload))` once a
/// full logical message has arrived.
pub struct Reassembler {
    state: State,
}

impl Default for Reassembler {
    fn default() -> Self {
        Reassembler { state: State::Idle }
    }
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resets mid-reassembly state, used when the dispatcher aborts an
    /// in-flight operation (`spec.md` §4.2 cancellation/re-entry).
    pub fn reset(&mut self) {
        self.state = State::Idle;
    }

    pub fn feed(&mut self, packet: &[u8]) -> Result<Option<(u16, Vec<u8>)>, FrameError> {
        match &mut self.state {
            State::Idle => {
                if packet.len() < HEADER_LEN || packet[0..3] != FRAME_PREFIX {
                    return Err(FrameError::BadPrefix);
                }
                let id = u16::from_be_bytes([packet[3], packet[4]]);
                let len = u32::from_be_bytes([packet[5], packet[6], packet[7], packet[8]]) as usize;
                if len > MAX_PAYLOAD_LEN {
                    return Err(FrameError::PayloadTooLarge);
                }
                let mut buf = Vec::with_capacity(len.min(MAX_PAYLOAD_LEN));
                let avail = &packet[HEADER_LEN..];
                let take = avail.len().min(len);
                buf.extend_from_slice(&avail[..take]);
                if buf.len() >= len {
                    return Ok(Some((id, buf)));
                }
                self.state = State::InProgress { id, expected: len, buf };
                Ok(None)
            }
            State::InProgress { id, expected, buf } => {
                if packet.is_empty() || packet[0] != CONTINUATION_PREFIX {
                    return Err(FrameError::UnexpectedContinuation);
                }
                let avail = &packet[1..];
                let remaining = *expected - buf.len();
                let take = avail.len().min(remaining);
                buf.extend_from_slice(&avail[..take]);
                if buf.len() >= *expected {
                    let id = *id;
                    let out = std::mem::take(buf);
                    self.state = State::Idle;
                    Ok(Some((id, out)))
                } else {
                    Ok(None)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_packet_round_trip() {
        let packets = fragment_frame(42, b"hello");
        assert_eq!(packets.len(), 1);
        let mut reassembler = Reassembler::new();
        let (id, payload) = reassembler.feed(&packets[0]).unwrap().unwrap();
        assert_eq!(id, 42);
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn multi_packet_round_trip() {
        let payload: Vec<u8> = (0..300u32).map(|b| b as u8).collect();
        let packets = fragment_frame(7, &payload);
        assert!(packets.len() > 1);

        let mut reassembler = Reassembler::new();
        let mut result = None;
        for pkt in &packets {
            if let Some(out) = reassembler.feed(pkt).unwrap() {
                result = Some(out);
            }
        }
        let (id, out_payload) = result.expect("frame should complete on the last packet");
        assert_eq!(id, 7);
        assert_eq!(out_payload, payload);
    }

    #[test]
    fn bad_prefix_is_rejected() {
        let mut reassembler = Reassembler::new();
        let mut junk = [0u8; HID_PACKET_LEN];
        junk[0] = b'X';
        assert_eq!(reassembler.feed(&junk).unwrap_err(), FrameError::BadPrefix);
    }

    #[test]
    fn continuation_without_frame_in_progress_errors() {
        let mut reassembler = Reassembler::new();
        let mut pkt = [0u8; HID_PACKET_LEN];
        pkt[0] = CONTINUATION_PREFIX;
        assert_eq!(
            reassembler.feed(&pkt).unwrap_err(),
            FrameError::UnexpectedContinuation
        );
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let mut reassembler = Reassembler::new();
        let mut pkt = [0u8; HID_PACKET_LEN];
        pkt[0..3].copy_from_slice(&FRAME_PREFIX);
        pkt[5..9].copy_from_slice(&((MAX_PAYLOAD_LEN as u32) + 1).to_be_bytes());
        assert_eq!(reassembler.feed(&pkt).unwrap_err(), FrameError::PayloadTooLarge);
    }
}
