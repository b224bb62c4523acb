//! Typed frames and the frame codec
//!
//! Every frame on the wire is `type (1), channel (2), payload size (4),
//! payload, 0xCE`. Method frames start their payload with a class id and a
//! method id; the registry in this module maps those pairs onto typed
//! method values. Header frames carry a [`ContentHeader`], body frames an
//! opaque chunk of message data.

use bytes::{BufMut, Bytes, BytesMut};

use crate::constants::{
    FRAME_BODY, FRAME_END, FRAME_HEADER, FRAME_HEARTBEAT, FRAME_METHOD, FRAME_OVERHEAD,
};
use crate::content::ContentHeader;
use crate::read::ReadBuffer;
use crate::Error;

pub mod basic;
pub mod channel;
pub mod confirm;
pub mod connection;
pub mod exchange;
pub mod queue;
pub mod tx;

/// Class id of connection methods
pub const CLASS_CONNECTION: u16 = 10;
/// Class id of channel methods
pub const CLASS_CHANNEL: u16 = 20;
/// Class id of exchange methods
pub const CLASS_EXCHANGE: u16 = 40;
/// Class id of queue methods
pub const CLASS_QUEUE: u16 = 50;
/// Class id of basic methods
pub const CLASS_BASIC: u16 = 60;
/// Class id of confirm methods (RabbitMQ extension)
pub const CLASS_CONFIRM: u16 = 85;
/// Class id of transaction methods
pub const CLASS_TX: u16 = 90;

/// A complete frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A method frame
    Method {
        /// Channel the method applies to, 0 for the connection
        channel: u16,
        /// The typed method
        method: Method,
    },
    /// A content header frame
    Header {
        /// Channel carrying the content
        channel: u16,
        /// The decoded header
        header: ContentHeader,
    },
    /// A content body frame
    Body {
        /// Channel carrying the content
        channel: u16,
        /// A chunk of message data
        payload: Bytes,
    },
    /// A heartbeat frame
    Heartbeat {
        /// Always 0 in practice
        channel: u16,
    },
}

impl Frame {
    /// The channel id in the frame header
    pub fn channel(&self) -> u16 {
        match self {
            Frame::Method { channel, .. }
            | Frame::Header { channel, .. }
            | Frame::Body { channel, .. }
            | Frame::Heartbeat { channel } => *channel,
        }
    }

    /// Whether the frame may be sent while the connection handshake is
    /// still in progress. Handshake traffic and heartbeats bypass the
    /// pre-handshake outbound queue; everything else waits in it.
    pub fn part_of_handshake(&self) -> bool {
        match self {
            Frame::Method { method, .. } => matches!(method, Method::Connection(_)),
            Frame::Heartbeat { .. } => true,
            _ => false,
        }
    }
}

/// A typed method, grouped by class
#[derive(Debug, Clone, PartialEq)]
pub enum Method {
    /// Class 10
    Connection(connection::Method),
    /// Class 20
    Channel(channel::Method),
    /// Class 40
    Exchange(exchange::Method),
    /// Class 50
    Queue(queue::Method),
    /// Class 60
    Basic(basic::Method),
    /// Class 85
    Confirm(confirm::Method),
    /// Class 90
    Tx(tx::Method),
}

impl Method {
    /// The class id the method belongs to
    pub fn class_id(&self) -> u16 {
        match self {
            Method::Connection(_) => CLASS_CONNECTION,
            Method::Channel(_) => CLASS_CHANNEL,
            Method::Exchange(_) => CLASS_EXCHANGE,
            Method::Queue(_) => CLASS_QUEUE,
            Method::Basic(_) => CLASS_BASIC,
            Method::Confirm(_) => CLASS_CONFIRM,
            Method::Tx(_) => CLASS_TX,
        }
    }

    /// The method id within its class
    pub fn method_id(&self) -> u16 {
        match self {
            Method::Connection(m) => m.method_id(),
            Method::Channel(m) => m.method_id(),
            Method::Exchange(m) => m.method_id(),
            Method::Queue(m) => m.method_id(),
            Method::Basic(m) => m.method_id(),
            Method::Confirm(m) => m.method_id(),
            Method::Tx(m) => m.method_id(),
        }
    }

    /// Decode a method payload from its class id onward
    pub fn decode(buffer: &mut ReadBuffer<'_>) -> Result<Method, Error> {
        let class_id = buffer.next_u16()?;
        let method_id = buffer.next_u16()?;
        match class_id {
            CLASS_CONNECTION => connection::Method::decode(method_id, buffer).map(Method::Connection),
            CLASS_CHANNEL => channel::Method::decode(method_id, buffer).map(Method::Channel),
            CLASS_EXCHANGE => exchange::Method::decode(method_id, buffer).map(Method::Exchange),
            CLASS_QUEUE => queue::Method::decode(method_id, buffer).map(Method::Queue),
            CLASS_BASIC => basic::Method::decode(method_id, buffer).map(Method::Basic),
            CLASS_CONFIRM => confirm::Method::decode(method_id, buffer).map(Method::Confirm),
            CLASS_TX => tx::Method::decode(method_id, buffer).map(Method::Tx),
            other => Err(Error::UnknownClass(other)),
        }
    }

    /// Encode the class id, method id and arguments
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), Error> {
        buf.put_u16(self.class_id());
        buf.put_u16(self.method_id());
        match self {
            Method::Connection(m) => m.encode(buf),
            Method::Channel(m) => m.encode(buf),
            Method::Exchange(m) => m.encode(buf),
            Method::Queue(m) => m.encode(buf),
            Method::Basic(m) => m.encode(buf),
            Method::Confirm(m) => m.encode(buf),
            Method::Tx(m) => m.encode(buf),
        }
    }
}

/// Decode one frame from the front of `src`.
///
/// Returns `Ok(None)` when `src` holds only part of a frame; the caller
/// supplies more bytes and calls again. On success the returned count is
/// the number of bytes the frame occupied. A `max_frame` of zero disables
/// the size check.
pub fn decode_frame(src: &[u8], max_frame: u32) -> Result<Option<(Frame, usize)>, Error> {
    if src.len() < 7 {
        return Ok(None);
    }
    let frame_type = src[0];
    let channel = u16::from_be_bytes([src[1], src[2]]);
    let size = u32::from_be_bytes([src[3], src[4], src[5], src[6]]);

    if max_frame > 0 && size > max_frame - FRAME_OVERHEAD {
        return Err(Error::FrameTooLarge);
    }
    let total = size as usize + FRAME_OVERHEAD as usize;
    if src.len() < total {
        return Ok(None);
    }
    if src[total - 1] != FRAME_END {
        return Err(Error::BadFrameEnd);
    }

    let payload = &src[7..total - 1];
    let mut buffer = ReadBuffer::new(payload);
    let frame = match frame_type {
        FRAME_METHOD => Frame::Method {
            channel,
            method: Method::decode(&mut buffer).map_err(complete)?,
        },
        FRAME_HEADER => Frame::Header {
            channel,
            header: ContentHeader::decode(&mut buffer).map_err(complete)?,
        },
        FRAME_BODY => Frame::Body {
            channel,
            payload: Bytes::copy_from_slice(payload),
        },
        // some brokers emit the legacy heartbeat type byte 4
        FRAME_HEARTBEAT | 4 => Frame::Heartbeat { channel },
        other => return Err(Error::UnknownFrameType(other)),
    };
    Ok(Some((frame, total)))
}

/// Encode a frame, including its header and end marker, onto `dst`
pub fn encode_frame(frame: &Frame, dst: &mut BytesMut) -> Result<(), Error> {
    let (frame_type, channel) = match frame {
        Frame::Method { channel, .. } => (FRAME_METHOD, *channel),
        Frame::Header { channel, .. } => (FRAME_HEADER, *channel),
        Frame::Body { channel, .. } => (FRAME_BODY, *channel),
        Frame::Heartbeat { channel } => (FRAME_HEARTBEAT, *channel),
    };
    dst.put_u8(frame_type);
    dst.put_u16(channel);
    let size_at = dst.len();
    dst.put_u32(0);
    match frame {
        Frame::Method { method, .. } => method.encode(dst)?,
        Frame::Header { header, .. } => header.encode(dst)?,
        Frame::Body { payload, .. } => dst.put_slice(payload),
        Frame::Heartbeat { .. } => {}
    }
    let size = (dst.len() - size_at - 4) as u32;
    dst[size_at..size_at + 4].copy_from_slice(&size.to_be_bytes());
    dst.put_u8(FRAME_END);
    Ok(())
}

// A complete frame whose payload runs short is malformed, not truncated.
fn complete(err: Error) -> Error {
    match err {
        Error::Truncated => Error::Malformed("method arguments run past the payload"),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::properties::Properties;

    fn roundtrip(frame: Frame) {
        let mut buf = BytesMut::new();
        encode_frame(&frame, &mut buf).unwrap();
        let declared = u32::from_be_bytes([buf[3], buf[4], buf[5], buf[6]]);
        assert_eq!(buf.len(), declared as usize + FRAME_OVERHEAD as usize);
        let (decoded, consumed) = decode_frame(&buf, 0).unwrap().unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(decoded, frame);
    }

    #[test]
    fn method_frame_roundtrips() {
        roundtrip(Frame::Method {
            channel: 3,
            method: Method::Queue(queue::Method::Declare(queue::Declare {
                ticket: 0,
                queue: "q1".into(),
                passive: false,
                durable: true,
                exclusive: false,
                auto_delete: false,
                nowait: false,
                arguments: Default::default(),
            })),
        });
    }

    #[test]
    fn header_and_body_frames_roundtrip() {
        roundtrip(Frame::Header {
            channel: 1,
            header: ContentHeader::basic(11, Properties::persistent()),
        });
        roundtrip(Frame::Body {
            channel: 1,
            payload: Bytes::from_static(b"hello world"),
        });
        roundtrip(Frame::Heartbeat { channel: 0 });
    }

    #[test]
    fn partial_frame_decodes_to_none() {
        let mut buf = BytesMut::new();
        encode_frame(&Frame::Heartbeat { channel: 0 }, &mut buf).unwrap();
        for cut in 0..buf.len() {
            assert!(decode_frame(&buf[..cut], 0).unwrap().is_none());
        }
    }

    #[test]
    fn max_frame_is_enforced_exactly() {
        let payload = Bytes::from(vec![0u8; 100]);
        let mut buf = BytesMut::new();
        encode_frame(
            &Frame::Body {
                channel: 1,
                payload,
            },
            &mut buf,
        )
        .unwrap();
        // a frame of exactly max bytes passes, one byte smaller fails
        assert!(decode_frame(&buf, 108).unwrap().is_some());
        assert!(matches!(decode_frame(&buf, 107), Err(Error::FrameTooLarge)));
    }

    #[test]
    fn bad_end_marker_is_rejected() {
        let mut buf = BytesMut::new();
        encode_frame(&Frame::Heartbeat { channel: 0 }, &mut buf).unwrap();
        let last = buf.len() - 1;
        buf[last] = 0x00;
        assert!(matches!(decode_frame(&buf, 0), Err(Error::BadFrameEnd)));
    }

    #[test]
    fn unknown_class_and_method_are_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(FRAME_METHOD);
        buf.put_u16(0);
        buf.put_u32(4);
        buf.put_u16(99); // no such class
        buf.put_u16(10);
        buf.put_u8(FRAME_END);
        assert!(matches!(decode_frame(&buf, 0), Err(Error::UnknownClass(99))));

        let mut buf = BytesMut::new();
        buf.put_u8(FRAME_METHOD);
        buf.put_u16(0);
        buf.put_u32(4);
        buf.put_u16(CLASS_TX);
        buf.put_u16(77); // no such method
        buf.put_u8(FRAME_END);
        assert!(matches!(
            decode_frame(&buf, 0),
            Err(Error::UnknownMethod(CLASS_TX, 77))
        ));
    }
}
