//! Confirm class methods (class id 85, RabbitMQ extension)

use bytes::{BufMut, BytesMut};

use crate::read::ReadBuffer;
use crate::Error;

use super::CLASS_CONFIRM;

/// Method id of confirm.select
pub const SELECT: u16 = 10;
/// Method id of confirm.select-ok
pub const SELECT_OK: u16 = 11;

/// A confirm class method
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum Method {
    Select(Select),
    SelectOk,
}

/// Puts the channel in publisher-confirm mode
#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    /// Do not wait for a select-ok
    pub nowait: bool,
}

impl Method {
    /// The method id within the confirm class
    pub fn method_id(&self) -> u16 {
        match self {
            Method::Select(_) => SELECT,
            Method::SelectOk => SELECT_OK,
        }
    }

    pub(crate) fn decode(method_id: u16, buffer: &mut ReadBuffer<'_>) -> Result<Method, Error> {
        match method_id {
            SELECT => Ok(Method::Select(Select {
                nowait: buffer.next_u8()? & 0x01 != 0,
            })),
            SELECT_OK => Ok(Method::SelectOk),
            other => Err(Error::UnknownMethod(CLASS_CONFIRM, other)),
        }
    }

    pub(crate) fn encode(&self, buf: &mut BytesMut) -> Result<(), Error> {
        match self {
            Method::Select(m) => buf.put_u8(u8::from(m.nowait)),
            Method::SelectOk => {}
        }
        Ok(())
    }
}
