//! Message assembly across continuation frames.
//!
//! Pure logic: the connection engine feeds it one frame's `(opcode, is_final,
//! unmasked payload)` at a time and gets back `Some(Message)` exactly when a message
//! is complete.

use crate::error::FrameError;
use crate::frame::Opcode;

/// A fully reassembled application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(Vec<u8>),
    Binary(Vec<u8>),
}

impl Message {
    pub fn is_binary(&self) -> bool {
        matches!(self, Message::Binary(_))
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Message::Text(b) | Message::Binary(b) => b,
        }
    }
}

/// Per-connection continuation state: the message currently being reassembled.
#[derive(Default)]
pub struct Assembler {
    is_binary: bool,
    is_continuing: bool,
    in_message: Vec<u8>,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one data frame (TEXT, BINARY, or CONTINUATION; control frames never reach
    /// this). Returns the assembled message once a final frame closes it out.
    pub fn feed(
        &mut self,
        opcode: Opcode,
        is_final: bool,
        mut payload: Vec<u8>,
    ) -> Result<Option<Message>, FrameError> {
        match opcode {
            Opcode::Continuation => {
                if !self.is_continuing {
                    return Err(FrameError::UnexpectedContinuation);
                }
                self.in_message.append(&mut payload);
                if is_final {
                    self.is_continuing = false;
                    Ok(Some(self.drain()))
                } else {
                    Ok(None)
                }
            }
            Opcode::Text | Opcode::Binary => {
                if self.is_continuing {
                    return Err(FrameError::ContinuationInProgress);
                }
                self.is_binary = opcode == Opcode::Binary;
                if is_final {
                    self.in_message.append(&mut payload);
                    Ok(Some(self.drain()))
                } else {
                    self.is_continuing = true;
                    self.in_message.append(&mut payload);
                    Ok(None)
                }
            }
            Opcode::Close | Opcode::Ping | Opcode::Pong => {
                unreachable!("control frames are serviced by the control plane, not the assembler")
            }
        }
    }

    fn drain(&mut self) -> Message {
        let data = std::mem::take(&mut self.in_message);
        if self.is_binary {
            Message::Binary(data)
        } else {
            Message::Text(data)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_final_text_frame_yields_message() {
        let mut a = Assembler::new();
        let msg = a
            .feed(Opcode::Text, true, b"Hello".to_vec())
            .unwrap()
            .unwrap();
        assert_eq!(msg, Message::Text(b"Hello".to_vec()));
        assert!(!msg.is_binary());
    }

    #[test]
    fn continuation_sequence_concatenates() {
        let mut a = Assembler::new();
        assert!(a.feed(Opcode::Text, false, b"Hel".to_vec()).unwrap().is_none());
        assert!(a
            .feed(Opcode::Continuation, false, b"lo".to_vec())
            .unwrap()
            .is_none());
        let msg = a
            .feed(Opcode::Continuation, true, b", world".to_vec())
            .unwrap()
            .unwrap();
        assert_eq!(msg, Message::Text(b"Hello, world".to_vec()));
    }

    #[test]
    fn continuation_without_open_message_is_an_error() {
        let mut a = Assembler::new();
        let err = a.feed(Opcode::Continuation, true, vec![]).unwrap_err();
        assert_eq!(err, FrameError::UnexpectedContinuation);
    }

    #[test]
    fn data_frame_mid_continuation_is_an_error() {
        let mut a = Assembler::new();
        a.feed(Opcode::Text, false, b"a".to_vec()).unwrap();
        let err = a.feed(Opcode::Binary, true, b"b".to_vec()).unwrap_err();
        assert_eq!(err, FrameError::ContinuationInProgress);
    }

    #[test]
    fn binary_flag_is_tracked_per_message() {
        let mut a = Assembler::new();
        let msg = a.feed(Opcode::Binary, true, vec![1, 2, 3]).unwrap().unwrap();
        assert!(msg.is_binary());
    }
}
