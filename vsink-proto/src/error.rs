// SPDX-FileCopyrightText: 2025 Contributors to the vsink project.
// SPDX-License-Identifier: Apache-2.0

//! Errors produced while decoding the wire protocol.

/// Convenience result type using [`DecodeError`] as the error variant.
pub type Result<T> = core::result::Result<T, DecodeError>;

/// A malformed or unexpected inbound message.
///
/// Decoding errors never poison a [`crate::Decoder`]: the offending bytes have
/// already been discarded when the error is returned, so the caller can log it
/// and keep reading.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The stream did not start with the `VS` magic; `discarded` bytes were
    /// skipped to resynchronise.
    #[error("Bad magic, discarded {discarded} byte(s)")]
    BadMagic { discarded: usize },

    /// A header announced an empty message (no type tag).
    #[error("Empty message")]
    Empty,

    /// The type tag is not defined for this direction.
    #[error("Unknown message type {tag:#04x}")]
    UnknownType { tag: u8 },

    /// The body is shorter than the message type requires.
    #[error("Message {tag:#04x} truncated: need {expected} byte(s), got {actual}")]
    Truncated {
        tag: u8,
        expected: usize,
        actual: usize,
    },
}
