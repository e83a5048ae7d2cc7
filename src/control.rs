//! Control-frame handling and the keep-alive clock.

use crate::frame::{encode_frame, Opcode};

/// What the connection engine should do after a control frame arrives.
pub enum ControlAction {
    /// Reply immediately with a PONG carrying the same payload.
    Pong(Vec<u8>),
    /// No reply; just keep going.
    None,
    /// The peer asked to close; tear the connection down without echoing a reply
    /// CLOSE frame.
    Close,
}

/// Decide the reaction to an inbound control frame. `payload` is already unmasked.
pub fn handle(opcode: Opcode, payload: Vec<u8>) -> ControlAction {
    match opcode {
        Opcode::Ping => ControlAction::Pong(payload),
        Opcode::Pong => ControlAction::None,
        Opcode::Close => ControlAction::Close,
        Opcode::Text | Opcode::Binary | Opcode::Continuation => {
            unreachable!("data opcodes are handled by the message assembler")
        }
    }
}

/// Monotonic counter driving the periodic keep-alive PING. Each frame's payload is
/// the ASCII decimal representation of the counter at the time it was sent.
#[derive(Default)]
pub struct PingClock {
    next: u32,
}

impl PingClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the next keep-alive PING frame and advance the counter. The counter
    /// advances regardless of whether the frame is ever actually written.
    pub fn next_ping_frame(&mut self) -> Vec<u8> {
        let payload = self.next.to_string().into_bytes();
        self.next = self.next.wrapping_add(1);
        encode_frame(Opcode::Ping, &payload)
    }
}
