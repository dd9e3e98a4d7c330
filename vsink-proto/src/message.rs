// SPDX-FileCopyrightText: 2025 Contributors to the vsink project.
// SPDX-License-Identifier: Apache-2.0

//! Protocol message definitions.

use crate::{
    Result,
    codec::{BodyReader, Message, put_i64, put_u32},
};

/// Maximum number of planes (and therefore file descriptors) a frame carries.
pub const MAX_PLANES: usize = 3;

/// One-byte message type tags.
///
/// Tags are scoped by direction: `b'S'` is a rectangle when sent by the sink
/// and a status update when sent by the consumer.
pub mod tag {
    /// Sink → consumer: a new frame with attached dma-buf descriptors.
    pub const FRAME: u8 = b'F';
    /// Sink → consumer: show or hide the video plane.
    pub const HIDE: u8 = b'H';
    /// Sink → consumer: destination rectangle on screen.
    pub const RECT: u8 = b'S';
    /// Sink → consumer: AV sync type and session id.
    pub const SESSION_INFO: u8 = b'I';
    /// Sink → consumer: drop every queued frame.
    pub const FLUSH: u8 = b'X';
    /// Sink → consumer: pause or resume presentation.
    pub const PAUSE: u8 = b'Z';

    /// Consumer → sink: display refresh rate.
    pub const RATE_INFO: u8 = b'R';
    /// Consumer → sink: a buffer may be reused.
    pub const BUFFER_RELEASE: u8 = b'B';
    /// Consumer → sink: presentation progress.
    pub const STATUS_UPDATE: u8 = b'S';
    /// Consumer → sink: the consumer ran out of frames.
    pub const UNDERFLOW: u8 = b'U';
}

/// Screen rectangle, in consumer output coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    fn put(&self, out: &mut Vec<u8>) {
        put_u32(out, self.x);
        put_u32(out, self.y);
        put_u32(out, self.width);
        put_u32(out, self.height);
    }

    fn read(reader: &mut BodyReader<'_>) -> Result<Self> {
        Ok(Self {
            x: reader.u32()?,
            y: reader.u32()?,
            width: reader.u32()?,
            height: reader.u32()?,
        })
    }
}

/// Placement of one plane inside its dma-buf.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PlaneLayout {
    pub offset: u32,
    pub stride: u32,
}

/// Payload of a [`ClientMessage::Frame`].
///
/// Unused planes are all-zero. The number of descriptors attached to the
/// message equals [`FrameInfo::plane_count`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameInfo {
    pub width: u32,
    pub height: u32,
    /// DRM fourcc pixel format code.
    pub format: u32,
    /// Destination rectangle for this frame.
    pub rect: Rect,
    pub planes: [PlaneLayout; MAX_PLANES],
    /// Identifier echoed back by the consumer in [`ServerMessage::BufferRelease`].
    pub buffer_id: u32,
    /// Presentation time in microseconds.
    pub frame_time_us: i64,
}

impl FrameInfo {
    /// Number of planes in use (planes with a non-zero stride).
    pub fn plane_count(&self) -> usize {
        self.planes.iter().take_while(|p| p.stride != 0).count()
    }
}

/// Messages sent by the video sink to the display consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Frame(FrameInfo),
    Hide(bool),
    Rect(Rect),
    SessionInfo { sync_type: u8, session_id: u32 },
    Flush,
    Pause(bool),
}

/// Messages sent by the display consumer back to the video sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerMessage {
    RateInfo { refresh_rate_hz: u32 },
    BufferRelease { buffer_id: u32 },
    StatusUpdate { frame_time_us: i64, num_dropped: u32 },
    Underflow { frame_time_us: i64 },
}

impl Message for ClientMessage {
    fn tag(&self) -> u8 {
        match self {
            ClientMessage::Frame(_) => tag::FRAME,
            ClientMessage::Hide(_) => tag::HIDE,
            ClientMessage::Rect(_) => tag::RECT,
            ClientMessage::SessionInfo { .. } => tag::SESSION_INFO,
            ClientMessage::Flush => tag::FLUSH,
            ClientMessage::Pause(_) => tag::PAUSE,
        }
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        match self {
            ClientMessage::Frame(frame) => {
                put_u32(out, frame.width);
                put_u32(out, frame.height);
                put_u32(out, frame.format);
                frame.rect.put(out);
                for plane in &frame.planes {
                    put_u32(out, plane.offset);
                    put_u32(out, plane.stride);
                }
                put_u32(out, frame.buffer_id);
                put_i64(out, frame.frame_time_us);
            }
            ClientMessage::Hide(hide) | ClientMessage::Pause(hide) => out.push(u8::from(*hide)),
            ClientMessage::Rect(rect) => rect.put(out),
            ClientMessage::SessionInfo {
                sync_type,
                session_id,
            } => {
                out.push(*sync_type);
                put_u32(out, *session_id);
            }
            ClientMessage::Flush => {}
        }
    }

    fn decode_body(tag: u8, body: &[u8]) -> Result<Self> {
        let mut reader = BodyReader::new(tag, body);
        match tag {
            tag::FRAME => {
                reader.require(64)?;
                let width = reader.u32()?;
                let height = reader.u32()?;
                let format = reader.u32()?;
                let rect = Rect::read(&mut reader)?;
                let mut planes = [PlaneLayout::default(); MAX_PLANES];
                for plane in planes.iter_mut() {
                    plane.offset = reader.u32()?;
                    plane.stride = reader.u32()?;
                }
                Ok(ClientMessage::Frame(FrameInfo {
                    width,
                    height,
                    format,
                    rect,
                    planes,
                    buffer_id: reader.u32()?,
                    frame_time_us: reader.i64()?,
                }))
            }
            tag::HIDE => Ok(ClientMessage::Hide(reader.u8()? != 0)),
            tag::RECT => {
                reader.require(16)?;
                Ok(ClientMessage::Rect(Rect::read(&mut reader)?))
            }
            tag::SESSION_INFO => {
                reader.require(5)?;
                Ok(ClientMessage::SessionInfo {
                    sync_type: reader.u8()?,
                    session_id: reader.u32()?,
                })
            }
            tag::FLUSH => Ok(ClientMessage::Flush),
            tag::PAUSE => Ok(ClientMessage::Pause(reader.u8()? != 0)),
            other => Err(crate::DecodeError::UnknownType { tag: other }),
        }
    }
}

impl Message for ServerMessage {
    fn tag(&self) -> u8 {
        match self {
            ServerMessage::RateInfo { .. } => tag::RATE_INFO,
            ServerMessage::BufferRelease { .. } => tag::BUFFER_RELEASE,
            ServerMessage::StatusUpdate { .. } => tag::STATUS_UPDATE,
            ServerMessage::Underflow { .. } => tag::UNDERFLOW,
        }
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        match self {
            ServerMessage::RateInfo { refresh_rate_hz } => put_u32(out, *refresh_rate_hz),
            ServerMessage::BufferRelease { buffer_id } => put_u32(out, *buffer_id),
            ServerMessage::StatusUpdate {
                frame_time_us,
                num_dropped,
            } => {
                put_i64(out, *frame_time_us);
                put_u32(out, *num_dropped);
            }
            ServerMessage::Underflow { frame_time_us } => put_i64(out, *frame_time_us),
        }
    }

    fn decode_body(tag: u8, body: &[u8]) -> Result<Self> {
        let mut reader = BodyReader::new(tag, body);
        match tag {
            tag::RATE_INFO => Ok(ServerMessage::RateInfo {
                refresh_rate_hz: reader.u32()?,
            }),
            tag::BUFFER_RELEASE => Ok(ServerMessage::BufferRelease {
                buffer_id: reader.u32()?,
            }),
            tag::STATUS_UPDATE => {
                reader.require(12)?;
                Ok(ServerMessage::StatusUpdate {
                    frame_time_us: reader.i64()?,
                    num_dropped: reader.u32()?,
                })
            }
            tag::UNDERFLOW => Ok(ServerMessage::Underflow {
                frame_time_us: reader.i64()?,
            }),
            other => Err(crate::DecodeError::UnknownType { tag: other }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{decode, encode};

    #[test]
    fn hide_message_layout() {
        assert_eq!(
            encode(&ClientMessage::Hide(true)),
            vec![b'V', b'S', 2, b'H', 1]
        );
    }

    #[test]
    fn frame_message_length_covers_tag_and_body() {
        let frame = FrameInfo {
            width: 1920,
            height: 1080,
            format: 0x3231_564e,
            rect: Rect::new(0, 0, 1280, 720),
            planes: [
                PlaneLayout {
                    offset: 0,
                    stride: 1920,
                },
                PlaneLayout {
                    offset: 0,
                    stride: 1920,
                },
                PlaneLayout::default(),
            ],
            buffer_id: 7,
            frame_time_us: -5,
        };
        let bytes = encode(&ClientMessage::Frame(frame));
        assert_eq!(bytes[2], 65);
        assert_eq!(bytes.len(), 3 + 65);
        assert_eq!(&bytes[4..8], &1920u32.to_be_bytes());
        assert_eq!(&bytes[bytes.len() - 8..], &(-5i64).to_be_bytes());
        assert_eq!(frame.plane_count(), 2);

        let mut buf = bytes;
        assert_eq!(
            decode::<ClientMessage>(&mut buf),
            Some(Ok(ClientMessage::Frame(frame)))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn status_update_is_big_endian() {
        let bytes = encode(&ServerMessage::StatusUpdate {
            frame_time_us: 0x0102_0304_0506_0708,
            num_dropped: 3,
        });
        assert_eq!(
            bytes,
            vec![
                b'V', b'S', 13, b'S', 1, 2, 3, 4, 5, 6, 7, 8, 0, 0, 0, 3
            ]
        );
    }

    #[test]
    fn same_tag_means_different_things_per_direction() {
        let mut rect = encode(&ClientMessage::Rect(Rect::new(1, 2, 3, 4)));
        assert!(matches!(
            decode::<ServerMessage>(&mut rect),
            Some(Ok(ServerMessage::StatusUpdate { .. }))
        ));
    }

    #[test]
    fn short_body_is_rejected() {
        let mut buf = vec![b'V', b'S', 3, b'B', 0, 1];
        assert_eq!(
            decode::<ServerMessage>(&mut buf),
            Some(Err(crate::DecodeError::Truncated {
                tag: b'B',
                expected: 4,
                actual: 2
            }))
        );
        assert!(buf.is_empty());
    }
}
