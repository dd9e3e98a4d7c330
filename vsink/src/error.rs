// SPDX-FileCopyrightText: 2025 Contributors to the vsink project.
// SPDX-License-Identifier: Apache-2.0

//! Error types for vsink operations.
//!
//! The variants follow how each failure is handled: allocation and protocol
//! errors are recovered locally, a failed consumer connection degrades to the
//! local-only mode, and only mandatory lifecycle transitions surface
//! [`Error::TransitionFailed`] to the host.

use std::path::PathBuf;

use crate::lifecycle::StateChange;

/// Convenience result type using [`Error`] as the error variant.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors that can occur in the buffer pool, allocators, delivery channel and
/// lifecycle controller.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Creating, mapping or exporting an OS buffer failed. Fatal for the
    /// current frame only.
    #[error("Allocation of {width}x{height} plane {plane} failed: {reason}")]
    AllocationFailed {
        width: u32,
        height: u32,
        plane: usize,
        reason: String,
    },

    /// The consumer socket could not be reached.
    #[error("Failed to connect to consumer at \"{}\": {source}", path.display())]
    ConnectFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Writing to the consumer socket failed mid-session.
    #[error("Send failed: {0}")]
    SendFailed(nix::errno::Errno),

    /// The consumer closed its end of the socket; sends are skipped until a
    /// new channel is opened.
    #[error("Consumer is gone")]
    PeerGone,

    /// The channel was disconnected and cannot be used again.
    #[error("Channel is disconnected")]
    Disconnected,

    /// An inbound message could not be decoded. The bytes have been dropped.
    #[error("Protocol error: {0}")]
    Protocol(#[from] vsink_proto::DecodeError),

    /// The pool is flushing; blocking operations were interrupted.
    #[error("Flushing")]
    Flushing,

    /// A mandatory lifecycle transition failed.
    #[error("State change {transition:?} failed: {reason}")]
    TransitionFailed {
        transition: StateChange,
        reason: String,
    },

    /// The operation is not valid in the current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The buffer strategy does not support the requested operation.
    #[error("Unsupported: {0}")]
    Unsupported(&'static str),

    /// An argument was out of range (unknown slot, bad geometry, ...).
    #[error("Invalid argument: {0}")]
    InvalidArg(String),

    /// Settings could not be parsed.
    #[error("Invalid settings: {0}")]
    Settings(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("System call failed: {0}")]
    Errno(#[from] nix::errno::Errno),

    /// A generic error for failures not covered above.
    #[error("Other error: {0}")]
    Other(String),
}

impl Error {
    /// True when the error means the consumer went away rather than a
    /// transient send problem.
    pub fn is_peer_gone(&self) -> bool {
        use nix::errno::Errno;

        match self {
            Error::PeerGone | Error::Disconnected => true,
            Error::SendFailed(errno) => matches!(
                errno,
                Errno::EPIPE | Errno::ECONNRESET | Errno::ENOTCONN | Errno::ESHUTDOWN
            ),
            _ => false,
        }
    }
}
