//! Exchange class methods (class id 40)

use bytes::{BufMut, BytesMut};

use crate::read::ReadBuffer;
use crate::value::Table;
use crate::write::put_short_string;
use crate::Error;

use super::CLASS_EXCHANGE;

/// Method id of exchange.declare
pub const DECLARE: u16 = 10;
/// Method id of exchange.declare-ok
pub const DECLARE_OK: u16 = 11;
/// Method id of exchange.delete
pub const DELETE: u16 = 20;
/// Method id of exchange.delete-ok
pub const DELETE_OK: u16 = 21;
/// Method id of exchange.bind
pub const BIND: u16 = 30;
/// Method id of exchange.bind-ok
pub const BIND_OK: u16 = 31;
/// Method id of exchange.unbind
pub const UNBIND: u16 = 40;
/// Method id of exchange.unbind-ok.
///
/// Contrary to the rule of good continuation this is 51, not the expected
/// 41. Tested against real brokers; it really is 51.
pub const UNBIND_OK: u16 = 51;

/// An exchange class method
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum Method {
    Declare(Declare),
    DeclareOk,
    Delete(Delete),
    DeleteOk,
    Bind(Bind),
    BindOk,
    Unbind(Unbind),
    UnbindOk,
}

/// Creates an exchange, or verifies one exists when `passive` is set
#[derive(Debug, Clone, PartialEq)]
pub struct Declare {
    /// Deprecated access ticket, must be 0
    pub ticket: u16,
    /// Name of the exchange
    pub exchange: String,
    /// Exchange type: fanout, direct, topic or headers
    pub kind: String,
    /// Only check for existence
    pub passive: bool,
    /// Survive broker restarts
    pub durable: bool,
    /// Delete when the last binding goes away
    pub auto_delete: bool,
    /// Only reachable through exchange-to-exchange bindings
    pub internal: bool,
    /// Do not wait for a declare-ok
    pub nowait: bool,
    /// Extension arguments
    pub arguments: Table,
}

/// Deletes an exchange
#[derive(Debug, Clone, PartialEq)]
pub struct Delete {
    /// Deprecated access ticket, must be 0
    pub ticket: u16,
    /// Name of the exchange
    pub exchange: String,
    /// Refuse if the exchange still has bindings
    pub if_unused: bool,
    /// Do not wait for a delete-ok
    pub nowait: bool,
}

/// Binds an exchange to another exchange
#[derive(Debug, Clone, PartialEq)]
pub struct Bind {
    /// Deprecated access ticket, must be 0
    pub ticket: u16,
    /// Exchange that receives the messages
    pub destination: String,
    /// Exchange the messages come from
    pub source: String,
    /// Routing key for the binding
    pub routing_key: String,
    /// Do not wait for a bind-ok
    pub nowait: bool,
    /// Extension arguments
    pub arguments: Table,
}

/// Removes an exchange-to-exchange binding
#[derive(Debug, Clone, PartialEq)]
pub struct Unbind {
    /// Deprecated access ticket, must be 0
    pub ticket: u16,
    /// Exchange that received the messages
    pub destination: String,
    /// Exchange the messages came from
    pub source: String,
    /// Routing key of the binding
    pub routing_key: String,
    /// Do not wait for an unbind-ok
    pub nowait: bool,
    /// Extension arguments
    pub arguments: Table,
}

impl Method {
    /// The method id within the exchange class
    pub fn method_id(&self) -> u16 {
        match self {
            Method::Declare(_) => DECLARE,
            Method::DeclareOk => DECLARE_OK,
            Method::Delete(_) => DELETE,
            Method::DeleteOk => DELETE_OK,
            Method::Bind(_) => BIND,
            Method::BindOk => BIND_OK,
            Method::Unbind(_) => UNBIND,
            Method::UnbindOk => UNBIND_OK,
        }
    }

    pub(crate) fn decode(method_id: u16, buffer: &mut ReadBuffer<'_>) -> Result<Method, Error> {
        let method = match method_id {
            DECLARE => {
                let ticket = buffer.next_u16()?;
                let exchange = buffer.short_string()?;
                let kind = buffer.short_string()?;
                let bits = buffer.next_u8()?;
                Method::Declare(Declare {
                    ticket,
                    exchange,
                    kind,
                    passive: bits & 0x01 != 0,
                    durable: bits & 0x02 != 0,
                    auto_delete: bits & 0x04 != 0,
                    internal: bits & 0x08 != 0,
                    nowait: bits & 0x10 != 0,
                    arguments: Table::decode(buffer)?,
                })
            }
            DECLARE_OK => Method::DeclareOk,
            DELETE => {
                let ticket = buffer.next_u16()?;
                let exchange = buffer.short_string()?;
                let bits = buffer.next_u8()?;
                Method::Delete(Delete {
                    ticket,
                    exchange,
                    if_unused: bits & 0x01 != 0,
                    nowait: bits & 0x02 != 0,
                })
            }
            DELETE_OK => Method::DeleteOk,
            BIND => {
                let ticket = buffer.next_u16()?;
                let destination = buffer.short_string()?;
                let source = buffer.short_string()?;
                let routing_key = buffer.short_string()?;
                let bits = buffer.next_u8()?;
                Method::Bind(Bind {
                    ticket,
                    destination,
                    source,
                    routing_key,
                    nowait: bits & 0x01 != 0,
                    arguments: Table::decode(buffer)?,
                })
            }
            BIND_OK => Method::BindOk,
            UNBIND => {
                let ticket = buffer.next_u16()?;
                let destination = buffer.short_string()?;
                let source = buffer.short_string()?;
                let routing_key = buffer.short_string()?;
                let bits = buffer.next_u8()?;
                Method::Unbind(Unbind {
                    ticket,
                    destination,
                    source,
                    routing_key,
                    nowait: bits & 0x01 != 0,
                    arguments: Table::decode(buffer)?,
                })
            }
            UNBIND_OK => Method::UnbindOk,
            other => return Err(Error::UnknownMethod(CLASS_EXCHANGE, other)),
        };
        Ok(method)
    }

    pub(crate) fn encode(&self, buf: &mut BytesMut) -> Result<(), Error> {
        match self {
            Method::Declare(m) => {
                buf.put_u16(m.ticket);
                put_short_string(buf, &m.exchange)?;
                put_short_string(buf, &m.kind)?;
                let mut bits = 0u8;
                bits |= u8::from(m.passive);
                bits |= u8::from(m.durable) << 1;
                bits |= u8::from(m.auto_delete) << 2;
                bits |= u8::from(m.internal) << 3;
                bits |= u8::from(m.nowait) << 4;
                buf.put_u8(bits);
                m.arguments.encode(buf)?;
            }
            Method::DeclareOk => {}
            Method::Delete(m) => {
                buf.put_u16(m.ticket);
                put_short_string(buf, &m.exchange)?;
                let bits = u8::from(m.if_unused) | u8::from(m.nowait) << 1;
                buf.put_u8(bits);
            }
            Method::DeleteOk => {}
            Method::Bind(m) => {
                buf.put_u16(m.ticket);
                put_short_string(buf, &m.destination)?;
                put_short_string(buf, &m.source)?;
                put_short_string(buf, &m.routing_key)?;
                buf.put_u8(u8::from(m.nowait));
                m.arguments.encode(buf)?;
            }
            Method::BindOk => {}
            Method::Unbind(m) => {
                buf.put_u16(m.ticket);
                put_short_string(buf, &m.destination)?;
                put_short_string(buf, &m.source)?;
                put_short_string(buf, &m.routing_key)?;
                buf.put_u8(u8::from(m.nowait));
                m.arguments.encode(buf)?;
            }
            Method::UnbindOk => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbind_ok_keeps_the_odd_method_id() {
        assert_eq!(Method::UnbindOk.method_id(), 51);
        let mut empty = ReadBuffer::new(&[]);
        assert!(matches!(
            Method::decode(41, &mut empty),
            Err(Error::UnknownMethod(CLASS_EXCHANGE, 41))
        ));
    }
}
