//! Extracts complete message frames from an accumulating byte stream
//! (§4.E).

use crate::error::Error;
use crate::message::{Message, MAX_MESSAGE_LENGTH};
use crate::protocol::Endianness;

/// Owns the inbound accumulation buffer and hands whole message frames to
/// the codec as they become available.
#[derive(Debug, Default)]
pub struct Framer {
    buf: Vec<u8>,
}

impl Framer {
    /// Construct an empty framer.
    pub fn new() -> Framer {
        Framer { buf: Vec::new() }
    }

    /// Append freshly read bytes to the accumulation buffer.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Attempt to decode and remove the next complete message.
    ///
    /// Returns `Ok(None)` when fewer than a whole frame is currently
    /// buffered; the buffer's read cursor is never advanced in that case.
    /// Malformed frames of the right advertised size are discarded (after
    /// the caller logs them) so the framer can continue on the remainder.
    pub fn next_frame(&mut self) -> Result<Option<Message>, Error> {
        let Some(total) = self.peek_frame_size() else {
            return Ok(None);
        };

        let frame = self.buf.drain(..total).collect::<Vec<u8>>();
        Ok(Some(Message::decode(&frame)?))
    }

    /// Like [`Framer::next_frame`] but never propagates a codec error:
    /// malformed frames are discarded and `None` is returned for them,
    /// leaving the caller free to keep polling for the next frame.
    pub fn next_frame_lossy(&mut self) -> Option<Result<Message, Error>> {
        let total = self.peek_frame_size()?;
        let frame = self.buf.drain(..total).collect::<Vec<u8>>();
        Some(Message::decode(&frame))
    }

    fn peek_frame_size(&self) -> Option<usize> {
        if self.buf.len() < 16 {
            return None;
        }

        let endianness = match self.buf[0] {
            b'l' => Endianness::LITTLE,
            b'B' => Endianness::BIG,
            _ => return None,
        };

        let body_length = read_u32(&self.buf[4..8], endianness);
        let fields_length = read_u32(&self.buf[12..16], endianness);

        let mut total = 16usize + fields_length as usize;
        total += (8 - (total % 8)) % 8;
        total += body_length as usize;

        if total as u64 > MAX_MESSAGE_LENGTH as u64 {
            return None;
        }

        if self.buf.len() < total {
            return None;
        }

        Some(total)
    }

    /// Whether the buffer currently holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

fn read_u32(bytes: &[u8], endianness: Endianness) -> u32 {
    let bytes: [u8; 4] = bytes.try_into().unwrap();

    match endianness {
        Endianness::LITTLE => u32::from_le_bytes(bytes),
        _ => u32::from_be_bytes(bytes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_path::ObjectPath;

    #[test]
    fn returns_none_on_partial_input() {
        let mut framer = Framer::new();
        framer.feed(&[b'l', 1, 0, 1]);
        assert!(framer.next_frame().unwrap().is_none());
        assert!(!framer.is_empty());
    }

    #[test]
    fn extracts_a_whole_message_and_leaves_the_remainder() {
        let path = ObjectPath::new("/a").unwrap().to_owned();
        let mut message = Message::method_call(path, "M");
        message.endianness = Endianness::LITTLE;
        message.serial = 1;

        let bytes = message.encode().unwrap();

        let mut framer = Framer::new();
        framer.feed(&bytes);
        framer.feed(b"trailing-garbage-that-isnt-a-frame-yet");

        let decoded = framer.next_frame().unwrap().unwrap();
        assert_eq!(decoded, message);
        assert!(!framer.is_empty());
        assert!(framer.next_frame().unwrap().is_none());
    }

    #[test]
    fn cursor_does_not_advance_on_truncated_input() {
        let path = ObjectPath::new("/a").unwrap().to_owned();
        let mut message = Message::method_call(path, "M");
        message.endianness = Endianness::LITTLE;
        message.serial = 1;
        let bytes = message.encode().unwrap();

        let mut framer = Framer::new();
        framer.feed(&bytes[..bytes.len() - 1]);
        assert!(framer.next_frame().unwrap().is_none());

        framer.feed(&bytes[bytes.len() - 1..]);
        assert!(framer.next_frame().unwrap().is_some());
    }
}
