// SPDX-FileCopyrightText: 2025 Contributors to the vsink project.
// SPDX-License-Identifier: Apache-2.0

//! # vsink-proto - video sink / display consumer wire protocol
//!
//! Message types and a typed codec for the byte stream exchanged between the
//! video sink (the *client*) and an external display consumer (the *server*,
//! typically a compositor or video server process) over a Unix domain stream
//! socket.
//!
//! ## Framing
//!
//! Every message starts with a three byte header followed by a type tag and a
//! type-specific body:
//!
//! ```text
//! +-----+-----+--------+-----+----------------------+
//! | 'V' | 'S' | length | tag | body (length-1 bytes) |
//! +-----+-----+--------+-----+----------------------+
//! ```
//!
//! `length` counts every byte after the header, starting with the tag. All
//! multi-byte integers are big-endian. A frame message additionally carries
//! one to three dma-buf file descriptors as `SCM_RIGHTS` ancillary data on the
//! same `sendmsg` call; descriptors never appear in the byte stream.
//!
//! ## Directions
//!
//! - [`ClientMessage`]: sink → consumer (frames and control messages)
//! - [`ServerMessage`]: consumer → sink (buffer releases and status)
//!
//! ## Examples
//!
//! ```
//! use vsink_proto::{ClientMessage, Decoder, Rect, encode};
//!
//! let bytes = encode(&ClientMessage::Rect(Rect::new(0, 0, 1920, 1080)));
//!
//! let mut decoder = Decoder::<ClientMessage>::new();
//! decoder.extend(&bytes[..5]);
//! assert!(decoder.next_message().is_none()); // partial message stays buffered
//! decoder.extend(&bytes[5..]);
//! assert_eq!(
//!     decoder.next_message().unwrap().unwrap(),
//!     ClientMessage::Rect(Rect::new(0, 0, 1920, 1080))
//! );
//! ```

mod codec;
mod error;
mod message;

pub use codec::{Decoder, HEADER_LEN, MAGIC, Message, decode, encode};
pub use error::{DecodeError, Result};
pub use message::{ClientMessage, FrameInfo, MAX_PLANES, PlaneLayout, Rect, ServerMessage, tag};
