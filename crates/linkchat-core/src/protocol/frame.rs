//! In-stream framing of control messages
//!
//! Envelopes are wrapped between a start and an end token on the byte stream.
//! Both tokens are ASCII control characters, which JSON always escapes, so they
//! cannot occur inside an envelope. Raw file bytes that follow a
//! `File.Response` frame are not framed at all and must be taken by length with
//! [`FrameBuffer::take_up_to`] before the buffer is scanned again.

/// Marks the beginning of a frame (ASCII STX)
pub const START_TOKEN: u8 = 0x02;

/// Marks the end of a frame (ASCII ETX)
pub const END_TOKEN: u8 = 0x03;

/// Wrap envelope text into a frame
pub fn frame(text: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(text.len() + 2);
    bytes.push(START_TOKEN);
    bytes.extend_from_slice(text.as_bytes());
    bytes.push(END_TOKEN);
    bytes
}

/// Rolling receive buffer that extracts complete frames
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly read bytes
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete frame, returning the enclosed bytes
    ///
    /// Bytes before a start token belong to no frame and are dropped. An
    /// incomplete frame stays buffered until its end token arrives.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        let Some(start) = self.buf.iter().position(|b| *b == START_TOKEN) else {
            self.buf.clear();
            return None;
        };
        if start > 0 {
            self.buf.drain(..start);
        }

        let end = self.buf[1..].iter().position(|b| *b == END_TOKEN)? + 1;
        let frame = self.buf[1..end].to_vec();
        self.buf.drain(..=end);
        Some(frame)
    }

    /// Take up to `n` buffered bytes from the front, used for file payloads
    pub fn take_up_to(&mut self, n: usize) -> Vec<u8> {
        let n = n.min(self.buf.len());
        self.buf.drain(..n).collect()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
