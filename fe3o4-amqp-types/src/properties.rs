//! The fourteen optional content-header properties
//!
//! A content header carries a 16 bit presence bitmap followed by the
//! properties whose bit is set, in bit order from the most significant bit
//! down. Bit 0 is a continuation flag reserved for classes with more than
//! fifteen properties; the basic class never sets it but a decoder must
//! still skip the extra flag word when it appears.

use bytes::{BufMut, BytesMut};

use crate::read::ReadBuffer;
use crate::value::Table;
use crate::write::put_short_string;
use crate::Error;

/// Value of `delivery_mode` that asks the broker to persist the message
pub const DELIVERY_MODE_PERSISTENT: u8 = 2;

const CONTENT_TYPE: u16 = 1 << 15;
const CONTENT_ENCODING: u16 = 1 << 14;
const HEADERS: u16 = 1 << 13;
const DELIVERY_MODE: u16 = 1 << 12;
const PRIORITY: u16 = 1 << 11;
const CORRELATION_ID: u16 = 1 << 10;
const REPLY_TO: u16 = 1 << 9;
const EXPIRATION: u16 = 1 << 8;
const MESSAGE_ID: u16 = 1 << 7;
const TIMESTAMP: u16 = 1 << 6;
const TYPE_NAME: u16 = 1 << 5;
const USER_ID: u16 = 1 << 4;
const APP_ID: u16 = 1 << 3;
const CLUSTER_ID: u16 = 1 << 2;
const CONTINUATION: u16 = 1;

/// Message meta data: the optional properties of a basic content header
///
/// Only properties that are `Some` appear on the wire.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Properties {
    /// MIME content type
    pub content_type: Option<String>,
    /// MIME content encoding
    pub content_encoding: Option<String>,
    /// Application supplied header table
    pub headers: Option<Table>,
    /// 1 for transient, 2 for persistent
    pub delivery_mode: Option<u8>,
    /// Priority from 0 to 9
    pub priority: Option<u8>,
    /// Application correlation identifier
    pub correlation_id: Option<String>,
    /// Address to reply to
    pub reply_to: Option<String>,
    /// Message expiration specification
    pub expiration: Option<String>,
    /// Application message identifier
    pub message_id: Option<String>,
    /// Message timestamp in seconds since the unix epoch
    pub timestamp: Option<u64>,
    /// Message type name
    pub type_name: Option<String>,
    /// Creating user id, verified by the broker
    pub user_id: Option<String>,
    /// Creating application id
    pub app_id: Option<String>,
    /// Deprecated cluster id
    pub cluster_id: Option<String>,
}

impl Properties {
    /// A property set with only `delivery_mode` set to persistent
    pub fn persistent() -> Self {
        Properties {
            delivery_mode: Some(DELIVERY_MODE_PERSISTENT),
            ..Default::default()
        }
    }

    /// Whether the message asks for broker persistence
    pub fn is_persistent(&self) -> bool {
        self.delivery_mode == Some(DELIVERY_MODE_PERSISTENT)
    }

    fn flags(&self) -> u16 {
        let mut flags = 0;
        let mut set = |present: bool, bit: u16| {
            if present {
                flags |= bit;
            }
        };
        set(self.content_type.is_some(), CONTENT_TYPE);
        set(self.content_encoding.is_some(), CONTENT_ENCODING);
        set(self.headers.is_some(), HEADERS);
        set(self.delivery_mode.is_some(), DELIVERY_MODE);
        set(self.priority.is_some(), PRIORITY);
        set(self.correlation_id.is_some(), CORRELATION_ID);
        set(self.reply_to.is_some(), REPLY_TO);
        set(self.expiration.is_some(), EXPIRATION);
        set(self.message_id.is_some(), MESSAGE_ID);
        set(self.timestamp.is_some(), TIMESTAMP);
        set(self.type_name.is_some(), TYPE_NAME);
        set(self.user_id.is_some(), USER_ID);
        set(self.app_id.is_some(), APP_ID);
        set(self.cluster_id.is_some(), CLUSTER_ID);
        flags
    }

    /// Encode the presence bitmap followed by the present properties
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), Error> {
        buf.put_u16(self.flags());
        if let Some(v) = &self.content_type {
            put_short_string(buf, v)?;
        }
        if let Some(v) = &self.content_encoding {
            put_short_string(buf, v)?;
        }
        if let Some(v) = &self.headers {
            v.encode(buf)?;
        }
        if let Some(v) = self.delivery_mode {
            buf.put_u8(v);
        }
        if let Some(v) = self.priority {
            buf.put_u8(v);
        }
        if let Some(v) = &self.correlation_id {
            put_short_string(buf, v)?;
        }
        if let Some(v) = &self.reply_to {
            put_short_string(buf, v)?;
        }
        if let Some(v) = &self.expiration {
            put_short_string(buf, v)?;
        }
        if let Some(v) = &self.message_id {
            put_short_string(buf, v)?;
        }
        if let Some(v) = self.timestamp {
            buf.put_u64(v);
        }
        if let Some(v) = &self.type_name {
            put_short_string(buf, v)?;
        }
        if let Some(v) = &self.user_id {
            put_short_string(buf, v)?;
        }
        if let Some(v) = &self.app_id {
            put_short_string(buf, v)?;
        }
        if let Some(v) = &self.cluster_id {
            put_short_string(buf, v)?;
        }
        Ok(())
    }

    /// Decode the presence bitmap and the properties it announces
    pub fn decode(buffer: &mut ReadBuffer<'_>) -> Result<Properties, Error> {
        let flags = buffer.next_u16()?;
        // swallow continuation words; the basic class defines no properties
        // behind them
        let mut continuation = flags;
        while continuation & CONTINUATION != 0 {
            continuation = buffer.next_u16()?;
        }

        let mut properties = Properties::default();
        if flags & CONTENT_TYPE != 0 {
            properties.content_type = Some(buffer.short_string()?);
        }
        if flags & CONTENT_ENCODING != 0 {
            properties.content_encoding = Some(buffer.short_string()?);
        }
        if flags & HEADERS != 0 {
            properties.headers = Some(Table::decode(buffer)?);
        }
        if flags & DELIVERY_MODE != 0 {
            properties.delivery_mode = Some(buffer.next_u8()?);
        }
        if flags & PRIORITY != 0 {
            properties.priority = Some(buffer.next_u8()?);
        }
        if flags & CORRELATION_ID != 0 {
            properties.correlation_id = Some(buffer.short_string()?);
        }
        if flags & REPLY_TO != 0 {
            properties.reply_to = Some(buffer.short_string()?);
        }
        if flags & EXPIRATION != 0 {
            properties.expiration = Some(buffer.short_string()?);
        }
        if flags & MESSAGE_ID != 0 {
            properties.message_id = Some(buffer.short_string()?);
        }
        if flags & TIMESTAMP != 0 {
            properties.timestamp = Some(buffer.next_u64()?);
        }
        if flags & TYPE_NAME != 0 {
            properties.type_name = Some(buffer.short_string()?);
        }
        if flags & USER_ID != 0 {
            properties.user_id = Some(buffer.short_string()?);
        }
        if flags & APP_ID != 0 {
            properties.app_id = Some(buffer.short_string()?);
        }
        if flags & CLUSTER_ID != 0 {
            properties.cluster_id = Some(buffer.short_string()?);
        }
        Ok(properties)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(properties: &Properties) -> Properties {
        let mut buf = BytesMut::new();
        properties.encode(&mut buf).unwrap();
        let mut buffer = ReadBuffer::new(&buf);
        let decoded = Properties::decode(&mut buffer).unwrap();
        assert_eq!(buffer.remaining(), 0);
        decoded
    }

    #[test]
    fn empty_properties_encode_to_zero_flags() {
        let properties = Properties::default();
        let mut buf = BytesMut::new();
        properties.encode(&mut buf).unwrap();
        assert_eq!(&buf[..], &[0, 0]);
        assert_eq!(roundtrip(&properties), properties);
    }

    #[test]
    fn only_set_properties_survive() {
        let mut headers = Table::new();
        headers.insert("x-attempt", 3i32);
        let properties = Properties {
            content_type: Some("application/json".into()),
            headers: Some(headers),
            delivery_mode: Some(DELIVERY_MODE_PERSISTENT),
            correlation_id: Some("abc-123".into()),
            timestamp: Some(1_600_000_000),
            ..Default::default()
        };
        let decoded = roundtrip(&properties);
        assert_eq!(decoded, properties);
        assert!(decoded.is_persistent());
        assert_eq!(decoded.priority, None);
        assert_eq!(decoded.reply_to, None);
    }

    #[test]
    fn every_property_roundtrips() {
        let properties = Properties {
            content_type: Some("text/plain".into()),
            content_encoding: Some("gzip".into()),
            headers: Some(Table::new()),
            delivery_mode: Some(1),
            priority: Some(4),
            correlation_id: Some("corr".into()),
            reply_to: Some("replies".into()),
            expiration: Some("60000".into()),
            message_id: Some("m-1".into()),
            timestamp: Some(42),
            type_name: Some("event".into()),
            user_id: Some("guest".into()),
            app_id: Some("app".into()),
            cluster_id: Some("cluster".into()),
        };
        assert_eq!(roundtrip(&properties), properties);
    }

    #[test]
    fn continuation_flag_is_skipped() {
        let properties = Properties {
            priority: Some(9),
            ..Default::default()
        };
        let mut buf = BytesMut::new();
        buf.put_u16(PRIORITY | CONTINUATION);
        buf.put_u16(0); // empty continuation word
        buf.put_u8(9);
        let mut buffer = ReadBuffer::new(&buf);
        assert_eq!(Properties::decode(&mut buffer).unwrap(), properties);
    }
}
