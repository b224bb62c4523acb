//! Connection class methods (class id 10)

use bytes::{BufMut, Bytes, BytesMut};

use crate::read::ReadBuffer;
use crate::value::Table;
use crate::write::{put_long_bytes, put_short_string};
use crate::Error;

use super::CLASS_CONNECTION;

/// Method id of connection.start
pub const START: u16 = 10;
/// Method id of connection.start-ok
pub const START_OK: u16 = 11;
/// Method id of connection.secure
pub const SECURE: u16 = 20;
/// Method id of connection.secure-ok
pub const SECURE_OK: u16 = 21;
/// Method id of connection.tune
pub const TUNE: u16 = 30;
/// Method id of connection.tune-ok
pub const TUNE_OK: u16 = 31;
/// Method id of connection.open
pub const OPEN: u16 = 40;
/// Method id of connection.open-ok
pub const OPEN_OK: u16 = 41;
/// Method id of connection.close
pub const CLOSE: u16 = 50;
/// Method id of connection.close-ok
pub const CLOSE_OK: u16 = 51;

/// A connection class method
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum Method {
    Start(Start),
    StartOk(StartOk),
    Secure(Secure),
    SecureOk(SecureOk),
    Tune(Tune),
    TuneOk(TuneOk),
    Open(Open),
    OpenOk(OpenOk),
    Close(Close),
    CloseOk,
}

/// Starts connection negotiation; the first method the server sends
#[derive(Debug, Clone, PartialEq)]
pub struct Start {
    /// Protocol major version, 0 for 0-9-1
    pub version_major: u8,
    /// Protocol minor version, 9 for 0-9-1
    pub version_minor: u8,
    /// Server properties such as product and capabilities
    pub server_properties: Table,
    /// Space separated list of SASL mechanisms
    pub mechanisms: Bytes,
    /// Space separated list of message locales
    pub locales: Bytes,
}

/// Selects a SASL mechanism and carries the initial response
#[derive(Debug, Clone, PartialEq)]
pub struct StartOk {
    /// Client properties reported to the server
    pub client_properties: Table,
    /// The selected mechanism, `PLAIN` in this library
    pub mechanism: String,
    /// The SASL response, `\0user\0password` for PLAIN
    pub response: Bytes,
    /// The selected locale
    pub locale: String,
}

/// A SASL challenge; never sent for PLAIN
#[derive(Debug, Clone, PartialEq)]
pub struct Secure {
    /// Challenge data
    pub challenge: Bytes,
}

/// Response to a SASL challenge
#[derive(Debug, Clone, PartialEq)]
pub struct SecureOk {
    /// Response data
    pub response: Bytes,
}

/// The server's proposed connection limits
#[derive(Debug, Clone, PartialEq)]
pub struct Tune {
    /// Highest channel id the server accepts, 0 for no limit
    pub channel_max: u16,
    /// Largest frame size the server accepts, 0 for no limit
    pub frame_max: u32,
    /// Heartbeat interval the server suggests, in seconds
    pub heartbeat: u16,
}

/// The limits the client settles on
#[derive(Debug, Clone, PartialEq)]
pub struct TuneOk {
    /// Agreed channel limit
    pub channel_max: u16,
    /// Agreed frame size limit
    pub frame_max: u32,
    /// Agreed heartbeat interval, 0 to disable
    pub heartbeat: u16,
}

/// Opens the connection to a virtual host
#[derive(Debug, Clone, PartialEq)]
pub struct Open {
    /// The virtual host to open
    pub vhost: String,
    /// Deprecated, must be empty
    pub capabilities: String,
    /// Deprecated, must be false
    pub insist: bool,
}

impl Open {
    /// An open frame for the given virtual host
    pub fn new(vhost: impl Into<String>) -> Self {
        Open {
            vhost: vhost.into(),
            capabilities: String::new(),
            insist: false,
        }
    }
}

/// Confirms the connection is open
#[derive(Debug, Clone, PartialEq)]
pub struct OpenOk {
    /// Deprecated, ignored
    pub known_hosts: String,
}

/// Asks to close the connection, or reports why it is being closed
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

impl Method {
    /// The method id within the connection class
    pub fn method_id(&self) -> u16 {
        match self {
            Method::Start(_) => START,
            Method::StartOk(_) => START_OK,
            Method::Secure(_) => SECURE,
            Method::SecureOk(_) => SECURE_OK,
            Method::Tune(_) => TUNE,
            Method::TuneOk(_) => TUNE_OK,
            Method::Open(_) => OPEN,
            Method::OpenOk(_) => OPEN_OK,
            Method::Close(_) => CLOSE,
            Method::CloseOk => CLOSE_OK,
        }
    }

    pub(crate) fn decode(method_id: u16, buffer: &mut ReadBuffer<'_>) -> Result<Method, Error> {
        let method = match method_id {
            START => Method::Start(Start {
                version_major: buffer.next_u8()?,
                version_minor: buffer.next_u8()?,
                server_properties: Table::decode(buffer)?,
                mechanisms: buffer.long_bytes()?,
                locales: buffer.long_bytes()?,
            }),
            START_OK => Method::StartOk(StartOk {
                client_properties: Table::decode(buffer)?,
                mechanism: buffer.short_string()?,
                response: buffer.long_bytes()?,
                locale: buffer.short_string()?,
            }),
            SECURE => Method::Secure(Secure {
                challenge: buffer.long_bytes()?,
            }),
            SECURE_OK => Method::SecureOk(SecureOk {
                response: buffer.long_bytes()?,
            }),
            TUNE => Method::Tune(Tune {
                channel_max: buffer.next_u16()?,
                frame_max: buffer.next_u32()?,
                heartbeat: buffer.next_u16()?,
            }),
            TUNE_OK => Method::TuneOk(TuneOk {
                channel_max: buffer.next_u16()?,
                frame_max: buffer.next_u32()?,
                heartbeat: buffer.next_u16()?,
            }),
            OPEN => Method::Open(Open {
                vhost: buffer.short_string()?,
                capabilities: buffer.short_string()?,
                insist: buffer.next_u8()? & 0x01 != 0,
            }),
            OPEN_OK => Method::OpenOk(OpenOk {
                known_hosts: buffer.short_string()?,
            }),
            CLOSE => Method::Close(Close {
                reply_code: buffer.next_u16()?,
                reply_text: buffer.short_string()?,
                failing_class_id: buffer.next_u16()?,
                failing_method_id: buffer.next_u16()?,
            }),
            CLOSE_OK => Method::CloseOk,
            other => return Err(Error::UnknownMethod(CLASS_CONNECTION, other)),
        };
        Ok(method)
    }

    pub(crate) fn encode(&self, buf: &mut BytesMut) -> Result<(), Error> {
        match self {
            Method::Start(m) => {
                buf.put_u8(m.version_major);
                buf.put_u8(m.version_minor);
                m.server_properties.encode(buf)?;
                put_long_bytes(buf, &m.mechanisms);
                put_long_bytes(buf, &m.locales);
            }
            Method::StartOk(m) => {
                m.client_properties.encode(buf)?;
                put_short_string(buf, &m.mechanism)?;
                put_long_bytes(buf, &m.response);
                put_short_string(buf, &m.locale)?;
            }
            Method::Secure(m) => put_long_bytes(buf, &m.challenge),
            Method::SecureOk(m) => put_long_bytes(buf, &m.response),
            Method::Tune(m) => {
                buf.put_u16(m.channel_max);
                buf.put_u32(m.frame_max);
                buf.put_u16(m.heartbeat);
            }
            Method::TuneOk(m) => {
                buf.put_u16(m.channel_max);
                buf.put_u32(m.frame_max);
                buf.put_u16(m.heartbeat);
            }
            Method::Open(m) => {
                put_short_string(buf, &m.vhost)?;
                put_short_string(buf, &m.capabilities)?;
                buf.put_u8(u8::from(m.insist));
            }
            Method::OpenOk(m) => put_short_string(buf, &m.known_hosts)?,
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
