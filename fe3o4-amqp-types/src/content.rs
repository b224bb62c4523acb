//! Content header payload
//!
//! A header frame announces the message that the following body frames
//! carry: the owning class, a weight that is always zero, the total body
//! size, and the property set.

use bytes::{BufMut, BytesMut};

use crate::frame::CLASS_BASIC;
use crate::properties::Properties;
use crate::read::ReadBuffer;
use crate::Error;

/// Payload of a content header frame
#[derive(Debug, Clone, PartialEq)]
pub struct ContentHeader {
    /// Class that produced the content, basic (60) in practice
    pub class_id: u16,
    /// Unused on the wire, always zero
    pub weight: u16,
    /// Sum of the payload sizes of all body frames that follow
    pub body_size: u64,
    /// The message properties
    pub properties: Properties,
}

impl ContentHeader {
    /// A basic-class header for a message of the given size
    pub fn basic(body_size: u64, properties: Properties) -> Self {
        ContentHeader {
            class_id: CLASS_BASIC,
            weight: 0,
            body_size,
            properties,
        }
    }

    /// Encode the full header payload
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), Error> {
        buf.put_u16(self.class_id);
        buf.put_u16(self.weight);
        buf.put_u64(self.body_size);
        self.properties.encode(buf)
    }

    /// Decode a header payload
    pub fn decode(buffer: &mut ReadBuffer<'_>) -> Result<Self, Error> {
        let class_id = buffer.next_u16()?;
        if class_id != CLASS_BASIC {
            return Err(Error::UnknownClass(class_id));
        }
        let weight = buffer.next_u16()?;
        let body_size = buffer.next_u64()?;
        let properties = Properties::decode(buffer)?;
        Ok(ContentHeader {
            class_id,
            weight,
            body_size,
            properties,
        })
    }
}
