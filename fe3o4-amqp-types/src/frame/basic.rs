//! Basic class methods (class id 60)

use bytes::{BufMut, BytesMut};

use crate::read::ReadBuffer;
use crate::value::Table;
use crate::write::put_short_string;
use crate::Error;

use super::CLASS_BASIC;

/// Method id of basic.qos
pub const QOS: u16 = 10;
/// Method id of basic.qos-ok
pub const QOS_OK: u16 = 11;
/// Method id of basic.consume
pub const CONSUME: u16 = 20;
/// Method id of basic.consume-ok
pub const CONSUME_OK: u16 = 21;
/// Method id of basic.cancel
pub const CANCEL: u16 = 30;
/// Method id of basic.cancel-ok
pub const CANCEL_OK: u16 = 31;
/// Method id of basic.publish
pub const PUBLISH: u16 = 40;
/// Method id of basic.return
pub const RETURN: u16 = 50;
/// Method id of basic.deliver
pub const DELIVER: u16 = 60;
/// Method id of basic.get
pub const GET: u16 = 70;
/// Method id of basic.get-ok
pub const GET_OK: u16 = 71;
/// Method id of basic.get-empty
pub const GET_EMPTY: u16 = 72;
/// Method id of basic.ack
pub const ACK: u16 = 80;
/// Method id of basic.reject
pub const REJECT: u16 = 90;
/// Method id of basic.recover-async
pub const RECOVER_ASYNC: u16 = 100;
/// Method id of basic.recover
pub const RECOVER: u16 = 110;
/// Method id of basic.recover-ok
pub const RECOVER_OK: u16 = 111;
/// Method id of basic.nack (RabbitMQ extension)
pub const NACK: u16 = 120;

/// A basic class method
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum Method {
    Qos(Qos),
    QosOk,
    Consume(Consume),
    ConsumeOk(ConsumeOk),
    Cancel(Cancel),
    CancelOk(CancelOk),
    Publish(Publish),
    Return(Return),
    Deliver(Deliver),
    Get(Get),
    GetOk(GetOk),
    GetEmpty(GetEmpty),
    Ack(Ack),
    Reject(Reject),
    RecoverAsync(RecoverAsync),
    Recover(Recover),
    RecoverOk,
    Nack(Nack),
}

/// Limits how many messages the broker sends ahead of acknowledgements
#[derive(Debug, Clone, PartialEq)]
pub struct Qos {
    /// Prefetch window in bytes, 0 for no limit
    pub prefetch_size: u32,
    /// Prefetch window in messages, 0 for no limit
    pub prefetch_count: u16,
    /// Apply to the whole connection instead of this channel
    pub global: bool,
}

/// Starts a consumer on a queue
#[derive(Debug, Clone, PartialEq)]
pub struct Consume {
    /// Deprecated access ticket, must be 0
    pub ticket: u16,
    /// The queue to consume from
    pub queue: String,
    /// Consumer tag; empty asks the server to generate one
    pub consumer_tag: String,
    /// Do not deliver messages published on this connection
    pub no_local: bool,
    /// Deliver without expecting acknowledgements
    pub no_ack: bool,
    /// Request exclusive consumer access
    pub exclusive: bool,
    /// Do not wait for a consume-ok
    pub nowait: bool,
    /// Extension arguments
    pub arguments: Table,
}

/// Confirms a consumer and reports its tag
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumeOk {
    /// The consumer tag, possibly server generated
    pub consumer_tag: String,
}

/// Stops a consumer. Also sent by the server when it cancels one, for
/// instance because the queue was deleted.
#[derive(Debug, Clone, PartialEq)]
pub struct Cancel {
    /// The consumer to stop
    pub consumer_tag: String,
    /// Do not wait for a cancel-ok
    pub nowait: bool,
}

/// Confirms a cancel
#[derive(Debug, Clone, PartialEq)]
pub struct CancelOk {
    /// The stopped consumer
    pub consumer_tag: String,
}

/// Publishes a message; a content header and body frames follow
#[derive(Debug, Clone, PartialEq)]
pub struct Publish {
    /// Deprecated access ticket, must be 0
    pub ticket: u16,
    /// Exchange to publish to; empty for the default exchange
    pub exchange: String,
    /// Routing key
    pub routing_key: String,
    /// Return the message if it cannot be routed
    pub mandatory: bool,
    /// Return the message if it cannot be delivered immediately
    pub immediate: bool,
}

/// Returns a message that could not be routed or delivered
#[derive(Debug, Clone, PartialEq)]
pub struct Return {
    /// Why the message came back
    pub reply_code: u16,
    /// Human readable reason
    pub reply_text: String,
    /// Exchange it was published to
    pub exchange: String,
    /// Routing key it was published with
    pub routing_key: String,
}

/// Delivers a message to a consumer; a content header and body follow
#[derive(Debug, Clone, PartialEq)]
pub struct Deliver {
    /// The consumer the message is for
    pub consumer_tag: String,
    /// Identifies the delivery on this channel for acknowledgement
    pub delivery_tag: u64,
    /// Whether the message was delivered before
    pub redelivered: bool,
    /// Exchange it was published to
    pub exchange: String,
    /// Routing key it was published with
    pub routing_key: String,
}

/// Synchronously fetches a single message
#[derive(Debug, Clone, PartialEq)]
pub struct Get {
    /// Deprecated access ticket, must be 0
    pub ticket: u16,
    /// The queue to fetch from
    pub queue: String,
    /// Fetch without expecting an acknowledgement
    pub no_ack: bool,
}

/// Answers a get with a message; a content header and body follow
#[derive(Debug, Clone, PartialEq)]
pub struct GetOk {
    /// Identifies the delivery on this channel for acknowledgement
    pub delivery_tag: u64,
    /// Whether the message was delivered before
    pub redelivered: bool,
    /// Exchange it was published to
    pub exchange: String,
    /// Routing key it was published with
    pub routing_key: String,
    /// Messages remaining in the queue
    pub message_count: u32,
}

/// Answers a get on an empty queue
#[derive(Debug, Clone, PartialEq)]
pub struct GetEmpty {
    /// Deprecated, ignored
    pub cluster_id: String,
}

/// Acknowledges one or more deliveries
#[derive(Debug, Clone, PartialEq)]
pub struct Ack {
    /// The delivery to acknowledge
    pub delivery_tag: u64,
    /// Also acknowledge everything up to and including the tag
    pub multiple: bool,
}

/// Rejects a single delivery
#[derive(Debug, Clone, PartialEq)]
pub struct Reject {
    /// The delivery to reject
    pub delivery_tag: u64,
    /// Put the message back on the queue instead of discarding it
    pub requeue: bool,
}

/// Deprecated fire-and-forget variant of recover
#[derive(Debug, Clone, PartialEq)]
pub struct RecoverAsync {
    /// Requeue instead of redelivering to the same consumer
    pub requeue: bool,
}

/// Asks the broker to redeliver all unacknowledged messages
#[derive(Debug, Clone, PartialEq)]
pub struct Recover {
    /// Requeue instead of redelivering to the same consumer
    pub requeue: bool,
}

/// Negatively acknowledges one or more deliveries (RabbitMQ extension)
#[derive(Debug, Clone, PartialEq)]
pub struct Nack {
    /// The delivery to reject
    pub delivery_tag: u64,
    /// Also reject everything up to and including the tag
    pub multiple: bool,
    /// Put the messages back on the queue instead of discarding them
    pub requeue: bool,
}

impl Method {
    /// The method id within the basic class
    pub fn method_id(&self) -> u16 {
        match self {
            Method::Qos(_) => QOS,
            Method::QosOk => QOS_OK,
            Method::Consume(_) => CONSUME,
            Method::ConsumeOk(_) => CONSUME_OK,
            Method::Cancel(_) => CANCEL,
            Method::CancelOk(_) => CANCEL_OK,
            Method::Publish(_) => PUBLISH,
            Method::Return(_) => RETURN,
            Method::Deliver(_) => DELIVER,
            Method::Get(_) => GET,
            Method::GetOk(_) => GET_OK,
            Method::GetEmpty(_) => GET_EMPTY,
            Method::Ack(_) => ACK,
            Method::Reject(_) => REJECT,
            Method::RecoverAsync(_) => RECOVER_ASYNC,
            Method::Recover(_) => RECOVER,
            Method::RecoverOk => RECOVER_OK,
            Method::Nack(_) => NACK,
        }
    }

    pub(crate) fn decode(method_id: u16, buffer: &mut ReadBuffer<'_>) -> Result<Method, Error> {
        let method = match method_id {
            QOS => {
                let prefetch_size = buffer.next_u32()?;
                let prefetch_count = buffer.next_u16()?;
                Method::Qos(Qos {
                    prefetch_size,
                    prefetch_count,
                    global: buffer.next_u8()? & 0x01 != 0,
                })
            }
            QOS_OK => Method::QosOk,
            CONSUME => {
                let ticket = buffer.next_u16()?;
                let queue = buffer.short_string()?;
                let consumer_tag = buffer.short_string()?;
                let bits = buffer.next_u8()?;
                Method::Consume(Consume {
                    ticket,
                    queue,
                    consumer_tag,
                    no_local: bits & 0x01 != 0,
                    no_ack: bits & 0x02 != 0,
                    exclusive: bits & 0x04 != 0,
                    nowait: bits & 0x08 != 0,
                    arguments: Table::decode(buffer)?,
                })
            }
            CONSUME_OK => Method::ConsumeOk(ConsumeOk {
                consumer_tag: buffer.short_string()?,
            }),
            CANCEL => Method::Cancel(Cancel {
                consumer_tag: buffer.short_string()?,
                nowait: buffer.next_u8()? & 0x01 != 0,
            }),
            CANCEL_OK => Method::CancelOk(CancelOk {
                consumer_tag: buffer.short_string()?,
            }),
            PUBLISH => {
                let ticket = buffer.next_u16()?;
                let exchange = buffer.short_string()?;
                let routing_key = buffer.short_string()?;
                let bits = buffer.next_u8()?;
                Method::Publish(Publish {
                    ticket,
                    exchange,
                    routing_key,
                    mandatory: bits & 0x01 != 0,
                    immediate: bits & 0x02 != 0,
                })
            }
            RETURN => Method::Return(Return {
                reply_code: buffer.next_u16()?,
                reply_text: buffer.short_string()?,
                exchange: buffer.short_string()?,
                routing_key: buffer.short_string()?,
            }),
            DELIVER => Method::Deliver(Deliver {
                consumer_tag: buffer.short_string()?,
                delivery_tag: buffer.next_u64()?,
                redelivered: buffer.next_u8()? & 0x01 != 0,
                exchange: buffer.short_string()?,
                routing_key: buffer.short_string()?,
            }),
            GET => {
                let ticket = buffer.next_u16()?;
                let queue = buffer.short_string()?;
                Method::Get(Get {
                    ticket,
                    queue,
                    no_ack: buffer.next_u8()? & 0x01 != 0,
                })
            }
            GET_OK => Method::GetOk(GetOk {
                delivery_tag: buffer.next_u64()?,
                redelivered: buffer.next_u8()? & 0x01 != 0,
                exchange: buffer.short_string()?,
                routing_key: buffer.short_string()?,
                message_count: buffer.next_u32()?,
            }),
            GET_EMPTY => Method::GetEmpty(GetEmpty {
                cluster_id: buffer.short_string()?,
            }),
            ACK => Method::Ack(Ack {
                delivery_tag: buffer.next_u64()?,
                multiple: buffer.next_u8()? & 0x01 != 0,
            }),
            REJECT => Method::Reject(Reject {
                delivery_tag: buffer.next_u64()?,
                requeue: buffer.next_u8()? & 0x01 != 0,
            }),
            RECOVER_ASYNC => Method::RecoverAsync(RecoverAsync {
                requeue: buffer.next_u8()? & 0x01 != 0,
            }),
            RECOVER => Method::Recover(Recover {
                requeue: buffer.next_u8()? & 0x01 != 0,
            }),
            RECOVER_OK => Method::RecoverOk,
            NACK => {
                let delivery_tag = buffer.next_u64()?;
                let bits = buffer.next_u8()?;
                Method::Nack(Nack {
                    delivery_tag,
                    multiple: bits & 0x01 != 0,
                    requeue: bits & 0x02 != 0,
                })
            }
            other => return Err(Error::UnknownMethod(CLASS_BASIC, other)),
        };
        Ok(method)
    }

    pub(crate) fn encode(&self, buf: &mut BytesMut) -> Result<(), Error> {
        match self {
            Method::Qos(m) => {
                buf.put_u32(m.prefetch_size);
                buf.put_u16(m.prefetch_count);
                buf.put_u8(u8::from(m.global));
            }
            Method::QosOk => {}
            Method::Consume(m) => {
                buf.put_u16(m.ticket);
                put_short_string(buf, &m.queue)?;
                put_short_string(buf, &m.consumer_tag)?;
                let mut bits = 0u8;
                bits |= u8::from(m.no_local);
                bits |= u8::from(m.no_ack) << 1;
                bits |= u8::from(m.exclusive) << 2;
                bits |= u8::from(m.nowait) << 3;
                buf.put_u8(bits);
                m.arguments.encode(buf)?;
            }
            Method::ConsumeOk(m) => put_short_string(buf, &m.consumer_tag)?,
            Method::Cancel(m) => {
                put_short_string(buf, &m.consumer_tag)?;
                buf.put_u8(u8::from(m.nowait));
            }
            Method::CancelOk(m) => put_short_string(buf, &m.consumer_tag)?,
            Method::Publish(m) => {
                buf.put_u16(m.ticket);
                put_short_string(buf, &m.exchange)?;
                put_short_string(buf, &m.routing_key)?;
                let bits = u8::from(m.mandatory) | u8::from(m.immediate) << 1;
                buf.put_u8(bits);
            }
            Method::Return(m) => {
                buf.put_u16(m.reply_code);
                put_short_string(buf, &m.reply_text)?;
                put_short_string(buf, &m.exchange)?;
                put_short_string(buf, &m.routing_key)?;
            }
            Method::Deliver(m) => {
                put_short_string(buf, &m.consumer_tag)?;
                buf.put_u64(m.delivery_tag);
                buf.put_u8(u8::from(m.redelivered));
                put_short_string(buf, &m.exchange)?;
                put_short_string(buf, &m.routing_key)?;
            }
            Method::Get(m) => {
                buf.put_u16(m.ticket);
                put_short_string(buf, &m.queue)?;
                buf.put_u8(u8::from(m.no_ack));
            }
            Method::GetOk(m) => {
                buf.put_u64(m.delivery_tag);
                buf.put_u8(u8::from(m.redelivered));
                put_short_string(buf, &m.exchange)?;
                put_short_string(buf, &m.routing_key)?;
                buf.put_u32(m.message_count);
            }
            Method::GetEmpty(m) => put_short_string(buf, &m.cluster_id)?,
            Method::Ack(m) => {
                buf.put_u64(m.delivery_tag);
                buf.put_u8(u8::from(m.multiple));
            }
            Method::Reject(m) => {
                buf.put_u64(m.delivery_tag);
                buf.put_u8(u8::from(m.requeue));
            }
            Method::RecoverAsync(m) => buf.put_u8(u8::from(m.requeue)),
            Method::Recover(m) => buf.put_u8(u8::from(m.requeue)),
            Method::RecoverOk => {}
            Method::Nack(m) => {
                buf.put_u64(m.delivery_tag);
                let bits = u8::from(m.multiple) | u8::from(m.requeue) << 1;
                buf.put_u8(bits);
            }
        }
        Ok(())
    }
}
