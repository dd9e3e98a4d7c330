// SPDX-FileCopyrightText: 2025 Contributors to the vsink project.
// SPDX-License-Identifier: Apache-2.0

//! Message framing: encoding to bytes and incremental decoding.

use std::marker::PhantomData;

use crate::{DecodeError, Result};

/// Message magic, the first two bytes of every message.
pub const MAGIC: [u8; 2] = *b"VS";

/// Size of the `['V', 'S', length]` header.
pub const HEADER_LEN: usize = 3;

/// A message type that can be framed on the wire.
///
/// Implemented by [`crate::ClientMessage`] and [`crate::ServerMessage`].
/// Implementors only deal with the body; the header and type tag are handled
/// by [`encode`] and [`decode`].
pub trait Message: Sized {
    /// Type tag written as the first byte after the header.
    fn tag(&self) -> u8;

    /// Appends the big-endian body (everything after the tag) to `out`.
    fn encode_body(&self, out: &mut Vec<u8>);

    /// Parses a body for the given tag.
    ///
    /// Trailing bytes beyond what the type needs are ignored so that newer
    /// peers can extend messages.
    fn decode_body(tag: u8, body: &[u8]) -> Result<Self>;
}

/// Encodes a message, including its header, into a new buffer.
///
/// # Panics
///
/// Panics if the body does not fit the one-byte length field. No message
/// defined by this crate comes close to that limit.
pub fn encode<M: Message>(message: &M) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + 1 + 64);
    out.extend_from_slice(&MAGIC);
    out.push(0);
    out.push(message.tag());
    message.encode_body(&mut out);
    let length = u8::try_from(out.len() - HEADER_LEN)
        .expect("protocol message exceeds 255 bytes");
    out[2] = length;
    out
}

/// Decodes the first complete message at the front of `buf`.
///
/// Consumed bytes are drained from `buf`; an incomplete trailing message is
/// left in place for the next call.
///
/// # Returns
///
/// - `None` when `buf` holds no complete message yet
/// - `Some(Ok(message))` for a well-formed message
/// - `Some(Err(_))` when bytes were discarded: garbage before the next magic,
///   an empty message, an unknown tag or a short body. The stream stays
///   usable and the caller should simply call again.
pub fn decode<M: Message>(buf: &mut Vec<u8>) -> Option<Result<M>> {
    if buf.is_empty() {
        return None;
    }

    if !starts_with_magic(buf) {
        let discarded = resync_point(buf);
        buf.drain(..discarded);
        return Some(Err(DecodeError::BadMagic { discarded }));
    }

    if buf.len() < HEADER_LEN {
        return None;
    }

    let length = buf[2] as usize;
    if length == 0 {
        buf.drain(..HEADER_LEN);
        return Some(Err(DecodeError::Empty));
    }

    let total = HEADER_LEN + length;
    if buf.len() < total {
        return None;
    }

    let tag = buf[HEADER_LEN];
    let result = M::decode_body(tag, &buf[HEADER_LEN + 1..total]);
    buf.drain(..total);
    Some(result)
}

/// True when `buf` starts with the magic, or with the first half of it.
fn starts_with_magic(buf: &[u8]) -> bool {
    match buf {
        [a] => *a == MAGIC[0],
        [a, b, ..] => *a == MAGIC[0] && *b == MAGIC[1],
        [] => true,
    }
}

/// Number of leading bytes to drop so the buffer starts at a possible magic.
fn resync_point(buf: &[u8]) -> usize {
    (1..buf.len())
        .find(|&i| starts_with_magic(&buf[i..]))
        .unwrap_or(buf.len())
}

/// Incremental decoder for one direction of the protocol.
///
/// Bytes are appended as they arrive from the socket; complete messages are
/// pulled out with [`Decoder::next_message`]. Partial messages are kept across
/// calls, so reads may split messages at arbitrary byte boundaries.
///
/// # Examples
///
/// ```
/// use vsink_proto::{Decoder, ServerMessage, encode};
///
/// let mut bytes = encode(&ServerMessage::BufferRelease { buffer_id: 1 });
/// bytes.extend(encode(&ServerMessage::RateInfo { refresh_rate_hz: 60 }));
///
/// let mut decoder = Decoder::<ServerMessage>::new();
/// decoder.extend(&bytes);
/// let messages: Vec<_> = decoder.drain().collect();
/// assert_eq!(messages.len(), 2);
/// ```
#[derive(Debug)]
pub struct Decoder<M> {
    buf: Vec<u8>,
    phantom: PhantomData<fn() -> M>,
}

impl<M> Default for Decoder<M> {
    fn default() -> Self {
        Self {
            buf: Vec::new(),
            phantom: PhantomData,
        }
    }
}

impl<M: Message> Decoder<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends freshly received bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pops the next complete message, see [`decode`].
    pub fn next_message(&mut self) -> Option<Result<M>> {
        decode(&mut self.buf)
    }

    /// Iterates over every complete message currently buffered.
    pub fn drain(&mut self) -> impl Iterator<Item = Result<M>> + '_ {
        std::iter::from_fn(move || self.next_message())
    }

    /// Bytes of a not yet complete message.
    pub fn pending(&self) -> &[u8] {
        &self.buf
    }

    /// Drops any buffered partial message.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

pub(crate) fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}

pub(crate) fn put_i64(out: &mut Vec<u8>, value: i64) {
    out.extend_from_slice(&value.to_be_bytes());
}

/// Bounds-checked big-endian cursor over a message body.
pub(crate) struct BodyReader<'a> {
    tag: u8,
    body: &'a [u8],
    pos: usize,
}

impl<'a> BodyReader<'a> {
    pub(crate) fn new(tag: u8, body: &'a [u8]) -> Self {
        Self { tag, body, pos: 0 }
    }

    /// Fails early when the whole body is shorter than `len`.
    pub(crate) fn require(&self, len: usize) -> Result<()> {
        if self.body.len() < len {
            return Err(DecodeError::Truncated {
                tag: self.tag,
                expected: len,
                actual: self.body.len(),
            });
        }
        Ok(())
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N]> {
        let end = self.pos + N;
        let bytes = self
            .body
            .get(self.pos..end)
            .ok_or(DecodeError::Truncated {
                tag: self.tag,
                expected: end,
                actual: self.body.len(),
            })?;
        self.pos = end;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        Ok(self.take::<1>()?[0])
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take()?))
    }

    pub(crate) fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.take()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ClientMessage, ServerMessage};

    #[test]
    fn garbage_before_magic_is_skipped() {
        let mut buf = vec![0xff, 0x00, b'V'];
        buf.extend(encode(&ServerMessage::BufferRelease { buffer_id: 9 }));

        assert_eq!(
            decode::<ServerMessage>(&mut buf),
            Some(Err(DecodeError::BadMagic { discarded: 3 }))
        );
        assert_eq!(
            decode::<ServerMessage>(&mut buf),
            Some(Ok(ServerMessage::BufferRelease { buffer_id: 9 }))
        );
        assert_eq!(decode::<ServerMessage>(&mut buf), None);
    }

    #[test]
    fn lone_leading_v_waits_for_more() {
        let mut buf = vec![b'V'];
        assert_eq!(decode::<ServerMessage>(&mut buf), None);
        assert_eq!(buf, vec![b'V']);
    }

    #[test]
    fn unknown_tag_consumes_whole_message() {
        let mut buf = vec![b'V', b'S', 3, b'?', 1, 2];
        buf.extend(encode(&ServerMessage::Underflow { frame_time_us: 42 }));

        assert_eq!(
            decode::<ServerMessage>(&mut buf),
            Some(Err(DecodeError::UnknownType { tag: b'?' }))
        );
        assert_eq!(
            decode::<ServerMessage>(&mut buf),
            Some(Ok(ServerMessage::Underflow { frame_time_us: 42 }))
        );
    }

    #[test]
    fn empty_message_is_dropped() {
        let mut buf = vec![b'V', b'S', 0];
        buf.extend(encode(&ClientMessage::Flush));
        assert_eq!(
            decode::<ClientMessage>(&mut buf),
            Some(Err(DecodeError::Empty))
        );
        assert_eq!(decode::<ClientMessage>(&mut buf), Some(Ok(ClientMessage::Flush)));
    }

    #[test]
    fn byte_at_a_time_delivery() {
        let bytes = encode(&ClientMessage::SessionInfo {
            sync_type: 1,
            session_id: 0xdead_beef,
        });
        let mut decoder = Decoder::<ClientMessage>::new();
        let (last, head) = bytes.split_last().unwrap();
        for byte in head {
            decoder.extend(std::slice::from_ref(byte));
            assert!(decoder.next_message().is_none());
        }
        decoder.extend(std::slice::from_ref(last));
        assert_eq!(
            decoder.next_message(),
            Some(Ok(ClientMessage::SessionInfo {
                sync_type: 1,
                session_id: 0xdead_beef
            }))
        );
        assert!(decoder.pending().is_empty());
    }
}
