//! Channel class methods (class id 20)

use bytes::{BufMut, Bytes, BytesMut};

use crate::read::ReadBuffer;
use crate::write::{put_long_bytes, put_short_string};
use crate::Error;

use super::CLASS_CHANNEL;

/// Method id of channel.open
pub const OPEN: u16 = 10;
/// Method id of channel.open-ok
pub const OPEN_OK: u16 = 11;
/// Method id of channel.flow
pub const FLOW: u16 = 20;
/// Method id of channel.flow-ok
pub const FLOW_OK: u16 = 21;
/// Method id of channel.close
pub const CLOSE: u16 = 40;
/// Method id of channel.close-ok
pub const CLOSE_OK: u16 = 41;

/// A channel class method
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum Method {
    Open(Open),
    OpenOk(OpenOk),
    Flow(Flow),
    FlowOk(FlowOk),
    Close(Close),
    CloseOk,
}

/// Opens a channel
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Open {
    /// Deprecated, must be empty
    pub out_of_band: String,
}

/// Confirms a channel is open
#[derive(Debug, Clone, PartialEq)]
pub struct OpenOk {
    /// Deprecated, ignored
    pub channel_id: Bytes,
}

/// Asks the peer to pause (`active = false`) or resume deliveries
#[derive(Debug, Clone, PartialEq)]
pub struct Flow {
    /// Whether the peer should start sending content
    pub active: bool,
}

/// Confirms a flow request
#[derive(Debug, Clone, PartialEq)]
pub struct FlowOk {
    /// The flow state now in effect
    pub active: bool,
}

/// Asks to close the channel, or reports why it is being closed
#[derive(Debug, Clone, PartialEq)]
pub struct Close {
    /// Reply code, 200 for a clean close
    pub reply_code: u16,
    /// Human readable reason
    pub reply_text: String,
    /// Class of the method that caused the close, or 0
    pub failing_class_id: u16,
    /// Method that caused the close, or 0
    pub failing_method_id: u16,
}

impl Close {
    /// A clean close request
    pub fn ok() -> Self {
        Close {
            reply_code: 200,
            reply_text: String::new(),
            failing_class_id: 0,
            failing_method_id: 0,
        }
    }
}

impl Method {
    /// The method id within the channel class
    pub fn method_id(&self) -> u16 {
        match self {
            Method::Open(_) => OPEN,
            Method::OpenOk(_) => OPEN_OK,
            Method::Flow(_) => FLOW,
            Method::FlowOk(_) => FLOW_OK,
            Method::Close(_) => CLOSE,
            Method::CloseOk => CLOSE_OK,
        }
    }

    pub(crate) fn decode(method_id: u16, buffer: &mut ReadBuffer<'_>) -> Result<Method, Error> {
        let method = match method_id {
            OPEN => Method::Open(Open {
                out_of_band: buffer.short_string()?,
            }),
            OPEN_OK => Method::OpenOk(OpenOk {
                channel_id: buffer.long_bytes()?,
            }),
            FLOW => Method::Flow(Flow {
                active: buffer.next_u8()? & 0x01 != 0,
            }),
            FLOW_OK => Method::FlowOk(FlowOk {
                active: buffer.next_u8()? & 0x01 != 0,
            }),
            CLOSE => Method::Close(Close {
                reply_code: buffer.next_u16()?,
                reply_text: buffer.short_string()?,
                failing_class_id: buffer.next_u16()?,
                failing_method_id: buffer.next_u16()?,
            }),
            CLOSE_OK => Method::CloseOk,
            other => return Err(Error::UnknownMethod(CLASS_CHANNEL, other)),
        };
        Ok(method)
    }

    pub(crate) fn encode(&self, buf: &mut BytesMut) -> Result<(), Error> {
        match self {
            Method::Open(m) => put_short_string(buf, &m.out_of_band)?,
            Method::OpenOk(m) => put_long_bytes(buf, &m.channel_id),
            Method::Flow(m) => buf.put_u8(u8::from(m.active)),
            Method::FlowOk(m) => buf.put_u8(u8::from(m.active)),
            Method::Close(m) => {
                buf.put_u16(m.reply_code);
                put_short_string(buf, &m.reply_text)?;
                buf.put_u16(m.failing_class_id);
                buf.put_u16(m.failing_method_id);
            }
            Method::CloseOk => {}
        }
        Ok(())
    }
}
