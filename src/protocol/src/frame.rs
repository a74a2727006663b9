use bytes::{Buf, BytesMut};
use tracing::{debug, warn};

use crate::codec::{Message, decode};
use crate::error::{ProtocolError, Result};
use crate::{BEGIN_MARKER, END_MARKER, FRAME_OVERHEAD};

/// Reassembles frames from a byte stream that may split or coalesce them.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: BytesMut,
    max_frame_bytes: usize,
}

impl FrameBuffer {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(8192),
            max_frame_bytes,
        }
    }

    /// Buffer to read socket data into.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Pop the next complete frame, if one is buffered.
    ///
    /// Bytes before a begin marker are dropped. A frame whose end marker is
    /// not where its size says it should be discards the whole buffer.
    pub fn next_message(&mut self) -> Result<Option<Message>> {
        self.skip_to_begin_marker();

        let header = BEGIN_MARKER.len() + 4;
        if self.buf.len() < header {
            return Ok(None);
        }

        let size = u32::from_be_bytes([self.buf[6], self.buf[7], self.buf[8], self.buf[9]]);
        if size < 4 {
            self.buf.clear();
            return Err(ProtocolError::InvalidSize { size });
        }

        let total = size as usize + FRAME_OVERHEAD;
        if total > self.max_frame_bytes {
            self.buf.clear();
            return Err(ProtocolError::FrameTooLarge {
                size: total,
                limit: self.max_frame_bytes,
            });
        }

        if self.buf.len() < total {
            debug!(
                buffered = self.buf.len(),
                expected = total,
                "Waiting for rest of frame"
            );
            return Ok(None);
        }

        if &self.buf[total - END_MARKER.len()..total] != END_MARKER.as_slice() {
            self.buf.clear();
            return Err(ProtocolError::MissingEndMarker);
        }

        let frame = self.buf.split_to(total);
        Ok(Some(decode(&frame)))
    }

    fn skip_to_begin_marker(&mut self) {
        if self.buf.starts_with(BEGIN_MARKER) {
            return;
        }

        let skip = match self
            .buf
            .windows(BEGIN_MARKER.len())
            .position(|window| window == BEGIN_MARKER)
        {
            Some(pos) => pos,
            // keep a tail that could still grow into a marker
            None => self
                .buf
                .len()
                .saturating_sub(BEGIN_MARKER.len() - 1),
        };

        if skip > 0 {
            warn!(bytes = skip, "Discarding bytes before begin marker");
            self.buf.advance(skip);
        }
    }
}
