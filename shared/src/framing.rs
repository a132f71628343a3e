//! Bounded line reading for the newline-delimited wire format.

use crate::codec::FRAME_DELIMITER;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Longest frame, delimiter included, that either end will buffer.
pub const MAX_FRAME_LENGTH: usize = 64 * 1024;

/// Outcome of a single [`read_frame`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameRead {
    /// `buf` holds one frame, delimiter included unless the stream ended
    /// mid-line.
    Frame,
    /// The line ran past the limit. Its bytes were discarded up to and
    /// including the next delimiter and `buf` is empty.
    Oversized,
    /// The stream is closed.
    Eof,
}

/// Reads the next frame into `buf`, buffering at most `max_len` bytes.
///
/// Not cancel safe: dropping the future mid-read may lose part of a frame.
pub async fn read_frame<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    max_len: usize,
) -> std::io::Result<FrameRead>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let read = (&mut *reader)
        .take(max_len as u64)
        .read_until(FRAME_DELIMITER, buf)
        .await?;

    if read == 0 {
        return Ok(FrameRead::Eof);
    }
    if read < max_len || buf.last() == Some(&FRAME_DELIMITER) {
        return Ok(FrameRead::Frame);
    }

    buf.clear();
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(FrameRead::Oversized);
        }
        let (consumed, done) = match available.iter().position(|b| *b == FRAME_DELIMITER) {
            Some(pos) => (pos + 1, true),
            None => (available.len(), false),
        };
        reader.consume(consumed);
        if done {
            return Ok(FrameRead::Oversized);
        }
    }
}
