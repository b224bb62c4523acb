//! Queue class methods (class id 50)

use bytes::{BufMut, BytesMut};

use crate::read::ReadBuffer;
use crate::value::Table;
use crate::write::put_short_string;
use crate::Error;

use super::CLASS_QUEUE;

/// Method id of queue.declare
pub const DECLARE: u16 = 10;
/// Method id of queue.declare-ok
pub const DECLARE_OK: u16 = 11;
/// Method id of queue.bind
pub const BIND: u16 = 20;
/// Method id of queue.bind-ok
pub const BIND_OK: u16 = 21;
/// Method id of queue.purge
pub const PURGE: u16 = 30;
/// Method id of queue.purge-ok
pub const PURGE_OK: u16 = 31;
/// Method id of queue.delete
pub const DELETE: u16 = 40;
/// Method id of queue.delete-ok
pub const DELETE_OK: u16 = 41;
/// Method id of queue.unbind
pub const UNBIND: u16 = 50;
/// Method id of queue.unbind-ok
pub const UNBIND_OK: u16 = 51;

/// A queue class method
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum Method {
    Declare(Declare),
    DeclareOk(DeclareOk),
    Bind(Bind),
    BindOk,
    Purge(Purge),
    PurgeOk(PurgeOk),
    Delete(Delete),
    DeleteOk(DeleteOk),
    Unbind(Unbind),
    UnbindOk,
}

/// Creates a queue, or verifies one exists when `passive` is set
#[derive(Debug, Clone, PartialEq)]
pub struct Declare {
    /// Deprecated access ticket, must be 0
    pub ticket: u16,
    /// Queue name; empty asks the server to generate one
    pub queue: String,
    /// Only check for existence
    pub passive: bool,
    /// Survive broker restarts
    pub durable: bool,
    /// Only accessible on this connection, deleted with it
    pub exclusive: bool,
    /// Delete when the last consumer goes away
    pub auto_delete: bool,
    /// Do not wait for a declare-ok
    pub nowait: bool,
    /// Extension arguments
    pub arguments: Table,
}

/// Confirms a declare and reports the queue's state
#[derive(Debug, Clone, PartialEq)]
pub struct DeclareOk {
    /// The queue name, possibly server generated
    pub queue: String,
    /// Messages currently in the queue
    pub message_count: u32,
    /// Consumers currently on the queue
    pub consumer_count: u32,
}

/// Binds a queue to an exchange
#[derive(Debug, Clone, PartialEq)]
pub struct Bind {
    /// Deprecated access ticket, must be 0
    pub ticket: u16,
    /// The queue to bind
    pub queue: String,
    /// The exchange to bind to
    pub exchange: String,
    /// Routing key for the binding
    pub routing_key: String,
    /// Do not wait for a bind-ok
    pub nowait: bool,
    /// Extension arguments
    pub arguments: Table,
}

/// Removes all messages from a queue that need no acknowledgement
#[derive(Debug, Clone, PartialEq)]
pub struct Purge {
    /// Deprecated access ticket, must be 0
    pub ticket: u16,
    /// The queue to purge
    pub queue: String,
    /// Do not wait for a purge-ok
    pub nowait: bool,
}

/// Reports how many messages a purge removed
#[derive(Debug, Clone, PartialEq)]
pub struct PurgeOk {
    /// Number of messages purged
    pub message_count: u32,
}

/// Deletes a queue
#[derive(Debug, Clone, PartialEq)]
pub struct Delete {
    /// Deprecated access ticket, must be 0
    pub ticket: u16,
    /// The queue to delete
    pub queue: String,
    /// Refuse if the queue still has consumers
    pub if_unused: bool,
    /// Refuse if the queue still has messages
    pub if_empty: bool,
    /// Do not wait for a delete-ok
    pub nowait: bool,
}

/// Reports how many messages a delete dropped
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteOk {
    /// Number of messages deleted with the queue
    pub message_count: u32,
}

/// Removes a queue binding; has no nowait variant
#[derive(Debug, Clone, PartialEq)]
pub struct Unbind {
    /// Deprecated access ticket, must be 0
    pub ticket: u16,
    /// The bound queue
    pub queue: String,
    /// The exchange it is bound to
    pub exchange: String,
    /// Routing key of the binding
    pub routing_key: String,
    /// Extension arguments
    pub arguments: Table,
}

impl Method {
    /// The method id within the queue class
    pub fn method_id(&self) -> u16 {
        match self {
            Method::Declare(_) => DECLARE,
            Method::DeclareOk(_) => DECLARE_OK,
            Method::Bind(_) => BIND,
            Method::BindOk => BIND_OK,
            Method::Purge(_) => PURGE,
            Method::PurgeOk(_) => PURGE_OK,
            Method::Delete(_) => DELETE,
            Method::DeleteOk(_) => DELETE_OK,
            Method::Unbind(_) => UNBIND,
            Method::UnbindOk => UNBIND_OK,
        }
    }

    pub(crate) fn decode(method_id: u16, buffer: &mut ReadBuffer<'_>) -> Result<Method, Error> {
        let method = match method_id {
            DECLARE => {
                let ticket = buffer.next_u16()?;
                let queue = buffer.short_string()?;
                let bits = buffer.next_u8()?;
                Method::Declare(Declare {
                    ticket,
                    queue,
                    passive: bits & 0x01 != 0,
                    durable: bits & 0x02 != 0,
                    exclusive: bits & 0x04 != 0,
                    auto_delete: bits & 0x08 != 0,
                    nowait: bits & 0x10 != 0,
                    arguments: Table::decode(buffer)?,
                })
            }
            DECLARE_OK => Method::DeclareOk(DeclareOk {
                queue: buffer.short_string()?,
                message_count: buffer.next_u32()?,
                consumer_count: buffer.next_u32()?,
            }),
            BIND => {
                let ticket = buffer.next_u16()?;
                let queue = buffer.short_string()?;
                let exchange = buffer.short_string()?;
                let routing_key = buffer.short_string()?;
                let bits = buffer.next_u8()?;
                Method::Bind(Bind {
                    ticket,
                    queue,
                    exchange,
                    routing_key,
                    nowait: bits & 0x01 != 0,
                    arguments: Table::decode(buffer)?,
                })
            }
            BIND_OK => Method::BindOk,
            PURGE => {
                let ticket = buffer.next_u16()?;
                let queue = buffer.short_string()?;
                let bits = buffer.next_u8()?;
                Method::Purge(Purge {
                    ticket,
                    queue,
                    nowait: bits & 0x01 != 0,
                })
            }
            PURGE_OK => Method::PurgeOk(PurgeOk {
                message_count: buffer.next_u32()?,
            }),
            DELETE => {
                let ticket = buffer.next_u16()?;
                let queue = buffer.short_string()?;
                let bits = buffer.next_u8()?;
                Method::Delete(Delete {
                    ticket,
                    queue,
                    if_unused: bits & 0x01 != 0,
                    if_empty: bits & 0x02 != 0,
                    nowait: bits & 0x04 != 0,
                })
            }
            DELETE_OK => Method::DeleteOk(DeleteOk {
                message_count: buffer.next_u32()?,
            }),
            UNBIND => Method::Unbind(Unbind {
                ticket: buffer.next_u16()?,
                queue: buffer.short_string()?,
                exchange: buffer.short_string()?,
                routing_key: buffer.short_string()?,
                arguments: Table::decode(buffer)?,
            }),
            UNBIND_OK => Method::UnbindOk,
            other => return Err(Error::UnknownMethod(CLASS_QUEUE, other)),
        };
        Ok(method)
    }

    pub(crate) fn encode(&self, buf: &mut BytesMut) -> Result<(), Error> {
        match self {
            Method::Declare(m) => {
                buf.put_u16(m.ticket);
                put_short_string(buf, &m.queue)?;
                let mut bits = 0u8;
                bits |= u8::from(m.passive);
                bits |= u8::from(m.durable) << 1;
                bits |= u8::from(m.exclusive) << 2;
                bits |= u8::from(m.auto_delete) << 3;
                bits |= u8::from(m.nowait) << 4;
                buf.put_u8(bits);
                m.arguments.encode(buf)?;
            }
            Method::DeclareOk(m) => {
                put_short_string(buf, &m.queue)?;
                buf.put_u32(m.message_count);
                buf.put_u32(m.consumer_count);
            }
            Method::Bind(m) => {
                buf.put_u16(m.ticket);
                put_short_string(buf, &m.queue)?;
                put_short_string(buf, &m.exchange)?;
                put_short_string(buf, &m.routing_key)?;
                buf.put_u8(u8::from(m.nowait));
                m.arguments.encode(buf)?;
            }
            Method::BindOk => {}
            Method::Purge(m) => {
                buf.put_u16(m.ticket);
                put_short_string(buf, &m.queue)?;
                buf.put_u8(u8::from(m.nowait));
            }
            Method::PurgeOk(m) => buf.put_u32(m.message_count),
            Method::Delete(m) => {
                buf.put_u16(m.ticket);
                put_short_string(buf, &m.queue)?;
                let bits =
                    u8::from(m.if_unused) | u8::from(m.if_empty) << 1 | u8::from(m.nowait) << 2;
                buf.put_u8(bits);
            }
            Method::DeleteOk(m) => buf.put_u32(m.message_count),
            Method::Unbind(m) => {
                buf.put_u16(m.ticket);
                put_short_string(buf, &m.queue)?;
                put_short_string(buf, &m.exchange)?;
                put_short_string(buf, &m.routing_key)?;
                m.arguments.encode(buf)?;
            }
            Method::UnbindOk => {}
        }
        Ok(())
    }
}
