//! The per-channel engine
//!
//! A channel keeps an ordered queue of deferred operations, one per
//! outbound synchronous method. The protocol guarantees that replies
//! arrive in request order on a channel, so inbound `*-ok` frames always
//! complete the deferred at the head of the queue. Content-bearing frames
//! (deliver, get-ok, return) are routed into the reassembler instead, and
//! publisher confirms into the confirm hooks.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::rc::{Rc, Weak};

use bytes::{Bytes, BytesMut};
use fe3o4_amqp_types::content::ContentHeader;
use fe3o4_amqp_types::frame::{
    basic, channel as wire, confirm as confirm_wire, exchange, queue, tx, Frame, Method,
};
use fe3o4_amqp_types::value::Table;

use crate::confirm::{self, ConfirmInner, DeferredConfirm};
use crate::connection::{self, Connection, ConnectionState};
use crate::consumer::{self, ConsumerInner, DeferredConsumer};
use crate::deferred::{self, Core, Deferred, DeferredCancel, DeferredDelete, DeferredQueue};
use crate::flags;
use crate::get::{self, DeferredGet, GetInner};
use crate::message::Envelope;
use crate::monitor::Monitor;
use crate::recall::{self, DeferredRecall, RecallInner};
use crate::receiver;

/// The type of a declared exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeType {
    /// Route to every bound queue
    Fanout,
    /// Route on an exact routing key match
    Direct,
    /// Route on a pattern match against the routing key
    Topic,
    /// Route on message header values
    Headers,
}

impl ExchangeType {
    fn as_str(self) -> &'static str {
        match self {
            ExchangeType::Fanout => "fanout",
            ExchangeType::Direct => "direct",
            ExchangeType::Topic => "topic",
            ExchangeType::Headers => "headers",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChState {
    Connected,
    Closed,
}

/// One entry in the pending-reply queue
#[derive(Clone)]
pub(crate) enum PendingOp {
    General(Rc<RefCell<Core<()>>>),
    Queue(Rc<RefCell<Core<(String, u32, u32)>>>),
    Delete(Rc<RefCell<Core<(u32,)>>>),
    Cancel(Rc<RefCell<Core<(String,)>>>),
    Consume(Rc<RefCell<ConsumerInner>>),
    Get(Rc<RefCell<GetInner>>),
    Confirm(Rc<RefCell<ConfirmInner>>),
    Close(Rc<RefCell<Core<()>>>),
}

/// The receiver the next header and body frames belong to
#[derive(Clone)]
pub(crate) enum CurrentReceiver {
    Consumer(Rc<RefCell<ConsumerInner>>),
    Get(Rc<RefCell<GetInner>>),
    Recall(Rc<RefCell<RecallInner>>),
}

pub(crate) struct ChannelState {
    pub(crate) id: u16,
    pub(crate) connection: Weak<RefCell<ConnectionState>>,
    pub(crate) state: ChState,
    opened: bool,
    closed_reason: Option<String>,

    transaction: bool,
    confirm_enabled: bool,
    paused: bool,
    /// Delivery tag the next publish in confirm mode will get
    next_delivery_tag: u64,

    pending: VecDeque<PendingOp>,
    current: Option<CurrentReceiver>,
    consumers: HashMap<String, Rc<RefCell<ConsumerInner>>>,
    recall: Option<Rc<RefCell<RecallInner>>>,
    pub(crate) confirm: Option<Rc<RefCell<ConfirmInner>>>,

    ready: Option<Box<dyn FnOnce(u16)>>,
    error_cb: Option<Box<dyn FnMut(&str)>>,
}

impl ChannelState {
    pub(crate) fn is_connected(&self) -> bool {
        self.state == ChState::Connected
    }
}

/// A channel: a multiplexed stream over the connection and the unit of
/// request/reply pairing
///
/// Cloning hands out another handle to the same channel.
#[derive(Clone)]
pub struct Channel {
    pub(crate) inner: Rc<RefCell<ChannelState>>,
}

impl Channel {
    /// Open a new channel on the connection. The channel.open frame goes
    /// out immediately (or as soon as the handshake finishes); the
    /// [`on_ready`](Channel::on_ready) callback fires when the broker
    /// confirms.
    pub fn new(connection: &Connection) -> Channel {
        let state = ChannelState {
            id: 0,
            connection: Rc::downgrade(&connection.inner),
            state: ChState::Connected,
            opened: false,
            closed_reason: None,
            transaction: false,
            confirm_enabled: false,
            paused: false,
            next_delivery_tag: 1,
            pending: VecDeque::new(),
            current: None,
            consumers: HashMap::new(),
            recall: None,
            confirm: None,
            ready: None,
            error_cb: None,
        };
        let inner = Rc::new(RefCell::new(state));

        if !connection.usable() {
            {
                let mut chan = inner.borrow_mut();
                chan.state = ChState::Closed;
                chan.closed_reason = Some("connection is no longer usable".to_owned());
            }
            return Channel { inner };
        }

        let id = connection::add_channel(&mut connection.inner.borrow_mut(), inner.clone());
        if id == 0 {
            {
                let mut chan = inner.borrow_mut();
                chan.state = ChState::Closed;
                chan.closed_reason = Some("max number of channels reached".to_owned());
            }
            return Channel { inner };
        }
        inner.borrow_mut().id = id;

        let core = Core::new();
        inner.borrow_mut().pending.push_back(PendingOp::General(core));
        let _ = send_method(
            &inner,
            Method::Channel(wire::Method::Open(wire::Open::default())),
        );
        Channel { inner }
    }

    /// The channel id on the wire
    pub fn id(&self) -> u16 {
        self.inner.borrow().id
    }

    /// Whether the channel has not been closed
    pub fn connected(&self) -> bool {
        self.inner.borrow().is_connected()
    }

    /// Whether operations can still be sent: the channel is open and so is
    /// the connection under it
    pub fn usable(&self) -> bool {
        usable(&self.inner)
    }

    /// Whether a transaction is active
    pub fn in_transaction(&self) -> bool {
        self.inner.borrow().transaction
    }

    /// Whether deliveries are currently paused by channel flow
    pub fn paused(&self) -> bool {
        self.inner.borrow().paused
    }

    /// Run a callback with the channel id once the broker confirms the
    /// channel is open. Fires immediately when that already happened.
    pub fn on_ready(&self, callback: impl FnOnce(u16) + 'static) {
        let mut chan = self.inner.borrow_mut();
        if chan.opened {
            let id = chan.id;
            drop(chan);
            callback(id);
        } else {
            chan.ready = Some(Box::new(callback));
        }
    }

    /// Install the channel-wide error callback. It fires when the broker
    /// closes the channel or the connection dies. On an already dead
    /// channel it fires immediately with the original reason.
    pub fn on_error(&self, callback: impl FnMut(&str) + 'static) {
        let mut chan = self.inner.borrow_mut();
        if chan.is_connected() {
            chan.error_cb = Some(Box::new(callback));
        } else {
            let reason = chan
                .closed_reason
                .clone()
                .unwrap_or_else(|| "channel is no longer usable".to_owned());
            drop(chan);
            let mut callback = callback;
            callback(&reason);
        }
    }

    /// Stop the broker from delivering on this channel
    pub fn pause(&self) -> Deferred {
        self.general(Method::Channel(wire::Method::Flow(wire::Flow {
            active: false,
        })))
    }

    /// Resume deliveries on a paused channel
    pub fn resume(&self) -> Deferred {
        self.general(Method::Channel(wire::Method::Flow(wire::Flow {
            active: true,
        })))
    }

    /// Put the channel in transaction mode
    pub fn start_transaction(&self) -> Deferred {
        self.general(Method::Tx(tx::Method::Select))
    }

    /// Commit the pending transaction
    pub fn commit_transaction(&self) -> Deferred {
        self.general(Method::Tx(tx::Method::Commit))
    }

    /// Roll back the pending transaction
    pub fn rollback_transaction(&self) -> Deferred {
        self.general(Method::Tx(tx::Method::Rollback))
    }

    /// Declare an exchange. Recognized flags: `DURABLE`, `AUTODELETE`,
    /// `PASSIVE`, `INTERNAL`, `NOWAIT`.
    pub fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeType,
        flag_bits: u32,
        arguments: Table,
    ) -> Deferred {
        self.general_nowait(
            Method::Exchange(exchange::Method::Declare(exchange::Declare {
                ticket: 0,
                exchange: name.to_owned(),
                kind: kind.as_str().to_owned(),
                passive: flag_bits & flags::PASSIVE != 0,
                durable: flag_bits & flags::DURABLE != 0,
                auto_delete: flag_bits & flags::AUTODELETE != 0,
                internal: flag_bits & flags::INTERNAL != 0,
                nowait: flag_bits & flags::NOWAIT != 0,
                arguments,
            })),
            flag_bits,
        )
    }

    /// Delete an exchange. Recognized flags: `IFUNUSED`, `NOWAIT`.
    pub fn remove_exchange(&self, name: &str, flag_bits: u32) -> Deferred {
        self.general_nowait(
            Method::Exchange(exchange::Method::Delete(exchange::Delete {
                ticket: 0,
                exchange: name.to_owned(),
                if_unused: flag_bits & flags::IFUNUSED != 0,
                nowait: flag_bits & flags::NOWAIT != 0,
            })),
            flag_bits,
        )
    }

    /// Bind the target exchange to the source exchange. Recognized flags:
    /// `NOWAIT`.
    pub fn bind_exchange(
        &self,
        source: &str,
        target: &str,
        routing_key: &str,
        flag_bits: u32,
        arguments: Table,
    ) -> Deferred {
        self.general_nowait(
            Method::Exchange(exchange::Method::Bind(exchange::Bind {
                ticket: 0,
                destination: target.to_owned(),
                source: source.to_owned(),
                routing_key: routing_key.to_owned(),
                nowait: flag_bits & flags::NOWAIT != 0,
                arguments,
            })),
            flag_bits,
        )
    }

    /// Remove an exchange-to-exchange binding. Recognized flags: `NOWAIT`.
    pub fn unbind_exchange(
        &self,
        source: &str,
        target: &str,
        routing_key: &str,
        flag_bits: u32,
        arguments: Table,
    ) -> Deferred {
        self.general_nowait(
            Method::Exchange(exchange::Method::Unbind(exchange::Unbind {
                ticket: 0,
                destination: target.to_owned(),
                source: source.to_owned(),
                routing_key: routing_key.to_owned(),
                nowait: flag_bits & flags::NOWAIT != 0,
                arguments,
            })),
            flag_bits,
        )
    }

    /// Declare a queue; an empty name asks the broker to generate one.
    /// Recognized flags: `DURABLE`, `AUTODELETE`, `PASSIVE`, `EXCLUSIVE`,
    /// `NOWAIT`.
    pub fn declare_queue(&self, name: &str, flag_bits: u32, arguments: Table) -> DeferredQueue {
        let method = Method::Queue(queue::Method::Declare(queue::Declare {
            ticket: 0,
            queue: name.to_owned(),
            passive: flag_bits & flags::PASSIVE != 0,
            durable: flag_bits & flags::DURABLE != 0,
            exclusive: flag_bits & flags::EXCLUSIVE != 0,
            auto_delete: flag_bits & flags::AUTODELETE != 0,
            nowait: flag_bits & flags::NOWAIT != 0,
            arguments,
        }));
        match send_method(&self.inner, method) {
            Err(reason) => DeferredQueue::failed(reason),
            Ok(()) => {
                let core = Core::new();
                if flag_bits & flags::NOWAIT != 0 {
                    deferred::report_success(&core, (name.to_owned(), 0, 0));
                } else {
                    self.inner
                        .borrow_mut()
                        .pending
                        .push_back(PendingOp::Queue(core.clone()));
                }
                DeferredQueue::pending(core)
            }
        }
    }

    /// Bind a queue to an exchange. Recognized flags: `NOWAIT`.
    pub fn bind_queue(
        &self,
        exchange_name: &str,
        queue_name: &str,
        routing_key: &str,
        flag_bits: u32,
        arguments: Table,
    ) -> Deferred {
        self.general_nowait(
            Method::Queue(queue::Method::Bind(queue::Bind {
                ticket: 0,
                queue: queue_name.to_owned(),
                exchange: exchange_name.to_owned(),
                routing_key: routing_key.to_owned(),
                nowait: flag_bits & flags::NOWAIT != 0,
                arguments,
            })),
            flag_bits,
        )
    }

    /// Remove a queue binding
    pub fn unbind_queue(
        &self,
        exchange_name: &str,
        queue_name: &str,
        routing_key: &str,
        arguments: Table,
    ) -> Deferred {
        self.general(Method::Queue(queue::Method::Unbind(queue::Unbind {
            ticket: 0,
            queue: queue_name.to_owned(),
            exchange: exchange_name.to_owned(),
            routing_key: routing_key.to_owned(),
            arguments,
        })))
    }

    /// Purge a queue. Recognized flags: `NOWAIT`.
    pub fn purge_queue(&self, name: &str, flag_bits: u32) -> DeferredDelete {
        self.delete_op(
            Method::Queue(queue::Method::Purge(queue::Purge {
                ticket: 0,
                queue: name.to_owned(),
                nowait: flag_bits & flags::NOWAIT != 0,
            })),
            flag_bits,
        )
    }

    /// Delete a queue. Recognized flags: `IFUNUSED`, `IFEMPTY`, `NOWAIT`.
    pub fn remove_queue(&self, name: &str, flag_bits: u32) -> DeferredDelete {
        self.delete_op(
            Method::Queue(queue::Method::Delete(queue::Delete {
                ticket: 0,
                queue: name.to_owned(),
                if_unused: flag_bits & flags::IFUNUSED != 0,
                if_empty: flag_bits & flags::IFEMPTY != 0,
                nowait: flag_bits & flags::NOWAIT != 0,
            })),
            flag_bits,
        )
    }

    /// Cap how many messages the broker sends ahead of acknowledgements.
    /// Recognized flags: `GLOBAL`.
    pub fn set_qos(&self, prefetch_count: u16, flag_bits: u32) -> Deferred {
        self.general(Method::Basic(basic::Method::Qos(basic::Qos {
            prefetch_size: 0,
            prefetch_count,
            global: flag_bits & flags::GLOBAL != 0,
        })))
    }

    /// Start consuming from a queue. An empty tag asks the broker to
    /// assign one. Recognized flags: `NOLOCAL`, `NOACK`, `EXCLUSIVE`,
    /// `NOWAIT`.
    pub fn consume(
        &self,
        queue_name: &str,
        tag: &str,
        flag_bits: u32,
        arguments: Table,
    ) -> DeferredConsumer {
        let method = Method::Basic(basic::Method::Consume(basic::Consume {
            ticket: 0,
            queue: queue_name.to_owned(),
            consumer_tag: tag.to_owned(),
            no_local: flag_bits & flags::NOLOCAL != 0,
            no_ack: flag_bits & flags::NOACK != 0,
            exclusive: flag_bits & flags::EXCLUSIVE != 0,
            nowait: flag_bits & flags::NOWAIT != 0,
            arguments,
        }));
        match send_method(&self.inner, method) {
            Err(reason) => DeferredConsumer::failed(reason),
            Ok(()) => {
                let inner = ConsumerInner::new();
                if flag_bits & flags::NOWAIT != 0 {
                    // no consume-ok will come; the broker uses the tag we sent
                    let mut chan = self.inner.borrow_mut();
                    chan.consumers.insert(tag.to_owned(), inner.clone());
                    drop(chan);
                    let core = inner.borrow().core.clone();
                    deferred::report_success(&core, (tag.to_owned(),));
                } else {
                    self.inner
                        .borrow_mut()
                        .pending
                        .push_back(PendingOp::Consume(inner.clone()));
                }
                DeferredConsumer::new(inner)
            }
        }
    }

    /// Stop a consumer by tag
    pub fn cancel(&self, tag: &str, flag_bits: u32) -> DeferredCancel {
        let method = Method::Basic(basic::Method::Cancel(basic::Cancel {
            consumer_tag: tag.to_owned(),
            nowait: flag_bits & flags::NOWAIT != 0,
        }));
        match send_method(&self.inner, method) {
            Err(reason) => DeferredCancel::failed(reason),
            Ok(()) => {
                let core = Core::new();
                if flag_bits & flags::NOWAIT != 0 {
                    self.inner.borrow_mut().consumers.remove(tag);
                    deferred::report_success(&core, (tag.to_owned(),));
                } else {
                    self.inner
                        .borrow_mut()
                        .pending
                        .push_back(PendingOp::Cancel(core.clone()));
                }
                DeferredCancel::pending(core)
            }
        }
    }

    /// Fetch a single message. Recognized flags: `NOACK`.
    pub fn get(&self, queue_name: &str, flag_bits: u32) -> DeferredGet {
        let method = Method::Basic(basic::Method::Get(basic::Get {
            ticket: 0,
            queue: queue_name.to_owned(),
            no_ack: flag_bits & flags::NOACK != 0,
        }));
        match send_method(&self.inner, method) {
            Err(reason) => DeferredGet::failed(reason),
            Ok(()) => {
                let inner = GetInner::new();
                self.inner
                    .borrow_mut()
                    .pending
                    .push_back(PendingOp::Get(inner.clone()));
                DeferredGet::new(inner)
            }
        }
    }

    /// Publish a message. Fire and forget at this layer: the broker sends
    /// no reply unless the channel is in confirm mode, and even then the
    /// confirm arrives through [`confirm_select`](Channel::confirm_select)
    /// hooks. Recognized flags: `MANDATORY`, `IMMEDIATE`.
    ///
    /// Returns whether the frames were handed to the connection.
    pub fn publish(
        &self,
        exchange_name: &str,
        routing_key: &str,
        flag_bits: u32,
        envelope: &Envelope,
    ) -> bool {
        match encode_publish(&self.inner, exchange_name, routing_key, flag_bits, envelope) {
            Ok((_tag, bytes)) => send_raw(&self.inner, bytes),
            Err(_) => false,
        }
    }

    /// Acknowledge a delivery. Recognized flags: `MULTIPLE`.
    pub fn ack(&self, delivery_tag: u64, flag_bits: u32) -> bool {
        send_method(
            &self.inner,
            Method::Basic(basic::Method::Ack(basic::Ack {
                delivery_tag,
                multiple: flag_bits & flags::MULTIPLE != 0,
            })),
        )
        .is_ok()
    }

    /// Reject a single delivery. Recognized flags: `REQUEUE`.
    pub fn reject(&self, delivery_tag: u64, flag_bits: u32) -> bool {
        send_method(
            &self.inner,
            Method::Basic(basic::Method::Reject(basic::Reject {
                delivery_tag,
                requeue: flag_bits & flags::REQUEUE != 0,
            })),
        )
        .is_ok()
    }

    /// Reject one or more deliveries. Recognized flags: `MULTIPLE`,
    /// `REQUEUE`.
    pub fn nack(&self, delivery_tag: u64, flag_bits: u32) -> bool {
        send_method(
            &self.inner,
            Method::Basic(basic::Method::Nack(basic::Nack {
                delivery_tag,
                multiple: flag_bits & flags::MULTIPLE != 0,
                requeue: flag_bits & flags::REQUEUE != 0,
            })),
        )
        .is_ok()
    }

    /// Ask the broker to redeliver all unacknowledged messages.
    /// Recognized flags: `REQUEUE`.
    pub fn recover(&self, flag_bits: u32) -> Deferred {
        self.general(Method::Basic(basic::Method::Recover(basic::Recover {
            requeue: flag_bits & flags::REQUEUE != 0,
        })))
    }

    /// Put the channel in publisher-confirm mode. From then on every
    /// publish gets a delivery tag, and the broker acks or nacks each tag
    /// through the returned handle's hooks.
    pub fn confirm_select(&self) -> DeferredConfirm {
        if let Some(existing) = self.inner.borrow().confirm.clone() {
            return DeferredConfirm::new(existing);
        }
        let method = Method::Confirm(confirm_wire::Method::Select(confirm_wire::Select {
            nowait: false,
        }));
        match send_method(&self.inner, method) {
            Err(reason) => DeferredConfirm::failed(reason),
            Ok(()) => {
                let inner = ConfirmInner::new();
                {
                    let mut chan = self.inner.borrow_mut();
                    chan.confirm = Some(inner.clone());
                    chan.pending.push_back(PendingOp::Confirm(inner.clone()));
                    // the broker counts every publish after the select
                    // request, so tag assignment starts right away
                    chan.confirm_enabled = true;
                }
                DeferredConfirm::new(inner)
            }
        }
    }

    /// Install the handler for returned messages. Bounces only happen for
    /// publishes with the `MANDATORY` or `IMMEDIATE` flag.
    pub fn on_returned(&self) -> DeferredRecall {
        let mut chan = self.inner.borrow_mut();
        let inner = chan.recall.get_or_insert_with(RecallInner::new).clone();
        drop(chan);
        DeferredRecall::new(inner)
    }

    /// Close the channel. Operations sent earlier complete first; the
    /// broker's close-ok resolves the returned deferred. The channel
    /// refuses new operations from this call on.
    pub fn close(&self) -> Deferred {
        match do_close(&self.inner) {
            Ok(core) => Deferred::pending(core),
            Err(reason) => Deferred::failed(reason),
        }
    }

    fn general(&self, method: Method) -> Deferred {
        self.general_nowait(method, 0)
    }

    /// Send a synchronous method. With `NOWAIT` set the broker stays
    /// silent, so the deferred succeeds on the spot instead of queueing.
    fn general_nowait(&self, method: Method, flag_bits: u32) -> Deferred {
        match send_method(&self.inner, method) {
            Err(reason) => Deferred::failed(reason),
            Ok(()) => {
                let core = Core::new();
                if flag_bits & flags::NOWAIT != 0 {
                    deferred::report_success(&core, ());
                } else {
                    self.inner
                        .borrow_mut()
                        .pending
                        .push_back(PendingOp::General(core.clone()));
                }
                Deferred::pending(core)
            }
        }
    }

    fn delete_op(&self, method: Method, flag_bits: u32) -> DeferredDelete {
        match send_method(&self.inner, method) {
            Err(reason) => DeferredDelete::failed(reason),
            Ok(()) => {
                let core = Core::new();
                if flag_bits & flags::NOWAIT != 0 {
                    deferred::report_success(&core, (0,));
                } else {
                    self.inner
                        .borrow_mut()
                        .pending
                        .push_back(PendingOp::Delete(core.clone()));
                }
                DeferredDelete::pending(core)
            }
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let chan = self.inner.borrow();
        f.debug_struct("Channel")
            .field("id", &chan.id)
            .field("state", &chan.state)
            .field("pending", &chan.pending.len())
            .finish_non_exhaustive()
    }
}

/* ----------------------------- outbound path ----------------------------- */

fn usable(chan: &Rc<RefCell<ChannelState>>) -> bool {
    let state = chan.borrow();
    if !state.is_connected() {
        return false;
    }
    match state.connection.upgrade() {
        Some(conn) => conn.borrow().usable(),
        None => false,
    }
}

fn failure_reason(chan: &Rc<RefCell<ChannelState>>) -> String {
    chan.borrow()
        .closed_reason
        .clone()
        .unwrap_or_else(|| "channel is no longer usable".to_owned())
}

/// Send a method frame on this channel, flushing it to the transport
fn send_method(chan: &Rc<RefCell<ChannelState>>, method: Method) -> Result<(), String> {
    if !usable(chan) {
        return Err(failure_reason(chan));
    }
    let (id, conn) = {
        let state = chan.borrow();
        (state.id, state.connection.upgrade())
    };
    let Some(conn) = conn else {
        return Err("connection lost".to_owned());
    };
    let sent = conn
        .borrow_mut()
        .send(&Frame::Method {
            channel: id,
            method,
        })
        .map_err(|err| err.to_string());
    connection::flush(&conn);
    sent
}

/// Hand pre-encoded frame bytes to the connection
pub(crate) fn send_raw(chan: &Rc<RefCell<ChannelState>>, bytes: Bytes) -> bool {
    let conn = chan.borrow().connection.upgrade();
    let Some(conn) = conn else { return false };
    conn.borrow_mut().send_bytes(bytes, false);
    connection::flush(&conn);
    true
}

/// Encode a complete publish sequence, method + header + body frames, into
/// one buffer. In confirm mode the message is assigned the next delivery
/// tag; outside it the returned tag is 0.
pub(crate) fn encode_publish(
    chan: &Rc<RefCell<ChannelState>>,
    exchange_name: &str,
    routing_key: &str,
    flag_bits: u32,
    envelope: &Envelope,
) -> Result<(u64, Bytes), String> {
    if !usable(chan) {
        return Err(failure_reason(chan));
    }
    let (id, tag, max_payload) = {
        let mut state = chan.borrow_mut();
        let tag = if state.confirm_enabled {
            let tag = state.next_delivery_tag;
            state.next_delivery_tag += 1;
            tag
        } else {
            0
        };
        let conn = state
            .connection
            .upgrade()
            .ok_or_else(|| "connection lost".to_owned())?;
        let max_payload = conn.borrow().max_payload() as usize;
        (state.id, tag, max_payload)
    };

    let mut buf = BytesMut::new();
    let publish = Frame::Method {
        channel: id,
        method: Method::Basic(basic::Method::Publish(basic::Publish {
            ticket: 0,
            exchange: exchange_name.to_owned(),
            routing_key: routing_key.to_owned(),
            mandatory: flag_bits & flags::MANDATORY != 0,
            immediate: flag_bits & flags::IMMEDIATE != 0,
        })),
    };
    fe3o4_amqp_types::frame::encode_frame(&publish, &mut buf).map_err(|err| err.to_string())?;

    let header = Frame::Header {
        channel: id,
        header: ContentHeader::basic(envelope.body_size(), envelope.properties.clone()),
    };
    fe3o4_amqp_types::frame::encode_frame(&header, &mut buf).map_err(|err| err.to_string())?;

    // the body is cut into frames of at most max-frame minus overhead
    for chunk in envelope.body().chunks(max_payload.max(1)) {
        let body = Frame::Body {
            channel: id,
            payload: Bytes::copy_from_slice(chunk),
        };
        fe3o4_amqp_types::frame::encode_frame(&body, &mut buf).map_err(|err| err.to_string())?;
    }

    Ok((tag, buf.freeze()))
}

pub(crate) fn close_frame(id: u16) -> Frame {
    Frame::Method {
        channel: id,
        method: Method::Channel(wire::Method::Close(wire::Close::ok())),
    }
}

/// Close the channel: send the close frame, queue the close deferred and
/// refuse further operations
pub(crate) fn do_close(
    chan: &Rc<RefCell<ChannelState>>,
) -> Result<Rc<RefCell<Core<()>>>, String> {
    if !usable(chan) {
        return Err(failure_reason(chan));
    }
    send_method(chan, Method::Channel(wire::Method::Close(wire::Close::ok())))?;
    let core = Core::new();
    {
        let mut state = chan.borrow_mut();
        state.pending.push_back(PendingOp::Close(core.clone()));
        state.state = ChState::Closed;
        state.closed_reason = Some("channel is closing".to_owned());
    }
    Ok(core)
}

pub(crate) fn send_close(chan: &Rc<RefCell<ChannelState>>) {
    let _ = do_close(chan);
}

/* ----------------------------- inbound path ------------------------------ */

fn pop_pending(chan: &Rc<RefCell<ChannelState>>) -> Option<PendingOp> {
    chan.borrow_mut().pending.pop_front()
}

/// A reply that does not match the head of the pending queue is a protocol
/// violation and takes the whole connection down
fn unexpected(chan: &Rc<RefCell<ChannelState>>, what: &str) {
    let conn = chan.borrow().connection.upgrade();
    if let Some(conn) = conn {
        connection::report_error(&conn, &format!("unexpected {what} frame"));
    }
}

pub(crate) fn dispatch_method(chan: &Rc<RefCell<ChannelState>>, method: Method) {
    match method {
        Method::Channel(wire::Method::OpenOk(_)) => match pop_pending(chan) {
            Some(PendingOp::General(core)) => {
                let ready = {
                    let mut state = chan.borrow_mut();
                    state.opened = true;
                    state.ready.take()
                };
                deferred::report_success(&core, ());
                let monitor = Monitor::new(chan);
                if let Some(callback) = ready {
                    let id = match monitor.valid() {
                        true => chan.borrow().id,
                        false => return,
                    };
                    callback(id);
                }
            }
            _ => unexpected(chan, "channel.open-ok"),
        },
        Method::Channel(wire::Method::Flow(flow)) => {
            // the broker wants us to stop or resume publishing
            chan.borrow_mut().paused = !flow.active;
            let _ = send_method(
                chan,
                Method::Channel(wire::Method::FlowOk(wire::FlowOk {
                    active: flow.active,
                })),
            );
        }
        Method::Channel(wire::Method::FlowOk(flow)) => match pop_pending(chan) {
            Some(PendingOp::General(core)) => {
                chan.borrow_mut().paused = !flow.active;
                deferred::report_success(&core, ());
            }
            _ => unexpected(chan, "channel.flow-ok"),
        },
        Method::Channel(wire::Method::Close(close)) => {
            let _ = send_method(chan, Method::Channel(wire::Method::CloseOk));
            let message = format!("{}: {}", close.reply_code, close.reply_text);
            report_error(chan, &message);
        }
        Method::Channel(wire::Method::CloseOk) => match pop_pending(chan) {
            Some(PendingOp::Close(core)) => {
                let conn = {
                    let mut state = chan.borrow_mut();
                    state.state = ChState::Closed;
                    state.connection.upgrade()
                };
                if let Some(conn) = conn {
                    let id = chan.borrow().id;
                    connection::remove_channel(&conn, id);
                }
                deferred::report_success(&core, ());
            }
            _ => unexpected(chan, "channel.close-ok"),
        },

        Method::Exchange(exchange::Method::DeclareOk)
        | Method::Exchange(exchange::Method::DeleteOk)
        | Method::Exchange(exchange::Method::BindOk)
        | Method::Exchange(exchange::Method::UnbindOk)
        | Method::Queue(queue::Method::BindOk)
        | Method::Queue(queue::Method::UnbindOk)
        | Method::Basic(basic::Method::QosOk)
        | Method::Basic(basic::Method::RecoverOk) => match pop_pending(chan) {
            Some(PendingOp::General(core)) => deferred::report_success(&core, ()),
            _ => unexpected(chan, "confirmation"),
        },

        Method::Queue(queue::Method::DeclareOk(ok)) => match pop_pending(chan) {
            Some(PendingOp::Queue(core)) => {
                deferred::report_success(&core, (ok.queue, ok.message_count, ok.consumer_count));
            }
            _ => unexpected(chan, "queue.declare-ok"),
        },
        Method::Queue(queue::Method::PurgeOk(ok)) => match pop_pending(chan) {
            Some(PendingOp::Delete(core)) => deferred::report_success(&core, (ok.message_count,)),
            _ => unexpected(chan, "queue.purge-ok"),
        },
        Method::Queue(queue::Method::DeleteOk(ok)) => match pop_pending(chan) {
            Some(PendingOp::Delete(core)) => deferred::report_success(&core, (ok.message_count,)),
            _ => unexpected(chan, "queue.delete-ok"),
        },

        Method::Basic(basic::Method::ConsumeOk(ok)) => match pop_pending(chan) {
            Some(PendingOp::Consume(inner)) => {
                // the broker's tag wins, even over an existing consumer
                chan.borrow_mut()
                    .consumers
                    .insert(ok.consumer_tag.clone(), inner.clone());
                let core = inner.borrow().core.clone();
                deferred::report_success(&core, (ok.consumer_tag,));
            }
            _ => unexpected(chan, "basic.consume-ok"),
        },
        Method::Basic(basic::Method::CancelOk(ok)) => match pop_pending(chan) {
            Some(PendingOp::Cancel(core)) => {
                chan.borrow_mut().consumers.remove(&ok.consumer_tag);
                deferred::report_success(&core, (ok.consumer_tag,));
            }
            _ => unexpected(chan, "basic.cancel-ok"),
        },
        Method::Basic(basic::Method::Cancel(cancel)) => {
            // the broker cancelled the consumer on its own, for instance
            // because its queue was deleted
            let removed = chan.borrow_mut().consumers.remove(&cancel.consumer_tag);
            if !cancel.nowait {
                let _ = send_method(
                    chan,
                    Method::Basic(basic::Method::CancelOk(basic::CancelOk {
                        consumer_tag: cancel.consumer_tag.clone(),
                    })),
                );
            }
            if let Some(inner) = removed {
                consumer::report_cancelled(&inner, &cancel.consumer_tag);
            }
        }

        Method::Basic(basic::Method::Deliver(deliver)) => {
            let target = chan.borrow().consumers.get(&deliver.consumer_tag).cloned();
            // a delivery for a consumer that was just cancelled still has
            // to be reassembled, it just goes nowhere
            let target = target.unwrap_or_else(ConsumerInner::new);
            chan.borrow_mut().current = Some(CurrentReceiver::Consumer(target.clone()));
            receiver::start(
                &target,
                &deliver.exchange,
                &deliver.routing_key,
                deliver.delivery_tag,
                deliver.redelivered,
            );
        }
        Method::Basic(basic::Method::GetOk(ok)) => {
            let front = match chan.borrow().pending.front() {
                Some(PendingOp::Get(inner)) => Some(inner.clone()),
                _ => None,
            };
            match front {
                Some(inner) => {
                    get::report_count(&inner, ok.message_count);
                    chan.borrow_mut().current = Some(CurrentReceiver::Get(inner.clone()));
                    receiver::start(
                        &inner,
                        &ok.exchange,
                        &ok.routing_key,
                        ok.delivery_tag,
                        ok.redelivered,
                    );
                }
                None => unexpected(chan, "basic.get-ok"),
            }
        }
        Method::Basic(basic::Method::GetEmpty(_)) => match pop_pending(chan) {
            Some(PendingOp::Get(inner)) => get::report_empty(&inner),
            _ => unexpected(chan, "basic.get-empty"),
        },
        Method::Basic(basic::Method::Return(bounce)) => {
            let target = chan.borrow().recall.clone();
            match target {
                Some(inner) => {
                    {
                        let mut recall = inner.borrow_mut();
                        recall.reply_code = bounce.reply_code;
                        recall.reply_text = bounce.reply_text.clone();
                    }
                    chan.borrow_mut().current = Some(CurrentReceiver::Recall(inner.clone()));
                    receiver::start(&inner, &bounce.exchange, &bounce.routing_key, 0, false);
                }
                None => {
                    // nobody listens for bounces; swallow the content
                    let sink = ConsumerInner::new();
                    chan.borrow_mut().current = Some(CurrentReceiver::Consumer(sink.clone()));
                    receiver::start(&sink, &bounce.exchange, &bounce.routing_key, 0, false);
                }
            }
        }

        Method::Basic(basic::Method::Ack(ack)) => {
            let target = chan.borrow().confirm.clone();
            if let Some(inner) = target {
                confirm::report_ack(&inner, ack.delivery_tag, ack.multiple);
            }
        }
        Method::Basic(basic::Method::Nack(nack)) => {
            let target = chan.borrow().confirm.clone();
            if let Some(inner) = target {
                confirm::report_nack(&inner, nack.delivery_tag, nack.multiple, nack.requeue);
            }
        }

        Method::Confirm(confirm_wire::Method::SelectOk) => match pop_pending(chan) {
            Some(PendingOp::Confirm(inner)) => {
                let core = inner.borrow().core.clone();
                deferred::report_success(&core, ());
            }
            _ => unexpected(chan, "confirm.select-ok"),
        },

        Method::Tx(tx::Method::SelectOk) => match pop_pending(chan) {
            Some(PendingOp::General(core)) => {
                chan.borrow_mut().transaction = true;
                deferred::report_success(&core, ());
            }
            _ => unexpected(chan, "tx.select-ok"),
        },
        Method::Tx(tx::Method::CommitOk) | Method::Tx(tx::Method::RollbackOk) => {
            match pop_pending(chan) {
                Some(PendingOp::General(core)) => deferred::report_success(&core, ()),
                _ => unexpected(chan, "transaction confirmation"),
            }
        }

        other => unexpected(
            chan,
            &format!("method {}:{}", other.class_id(), other.method_id()),
        ),
    }
}

pub(crate) fn dispatch_header(chan: &Rc<RefCell<ChannelState>>, header: ContentHeader) {
    let current = chan.borrow().current.clone();
    let Some(current) = current else {
        unexpected(chan, "content header");
        return;
    };
    let result = match &current {
        CurrentReceiver::Consumer(inner) => receiver::process_header(inner, &header),
        CurrentReceiver::Get(inner) => receiver::process_header(inner, &header),
        CurrentReceiver::Recall(inner) => receiver::process_header(inner, &header),
    };
    match result {
        Ok(true) => complete_current(chan),
        Ok(false) => {}
        Err(message) => report_error(chan, message),
    }
}

pub(crate) fn dispatch_body(chan: &Rc<RefCell<ChannelState>>, payload: &[u8]) {
    let current = chan.borrow().current.clone();
    let Some(current) = current else {
        unexpected(chan, "content body");
        return;
    };
    let result = match &current {
        CurrentReceiver::Consumer(inner) => receiver::process_body(inner, payload),
        CurrentReceiver::Get(inner) => receiver::process_body(inner, payload),
        CurrentReceiver::Recall(inner) => receiver::process_body(inner, payload),
    };
    match result {
        Ok(true) => complete_current(chan),
        Ok(false) => {}
        Err(message) => report_error(chan, message),
    }
}

/// The in-flight message is complete: hand it out and run the finishing
/// callbacks of whichever deferred owned the reassembly
fn complete_current(chan: &Rc<RefCell<ChannelState>>) {
    let current = chan.borrow_mut().current.take();
    let monitor = Monitor::new(chan);
    match current {
        Some(CurrentReceiver::Consumer(inner)) => {
            consumer::emit(&inner);
            if !monitor.valid() {
                return;
            }
            receiver::fire_complete(&inner);
        }
        Some(CurrentReceiver::Get(inner)) => {
            {
                let mut state = chan.borrow_mut();
                if matches!(state.pending.front(), Some(PendingOp::Get(_))) {
                    state.pending.pop_front();
                }
            }
            get::emit(&inner);
            if !monitor.valid() {
                return;
            }
            receiver::fire_complete(&inner);
            let core = inner.borrow().core.clone();
            deferred::report_success(&core, ());
        }
        Some(CurrentReceiver::Recall(inner)) => {
            recall::emit(&inner);
            if !monitor.valid() {
                return;
            }
            receiver::fire_complete(&inner);
        }
        None => {}
    }
}

/// Fail the channel: every pending deferred fails in arrival order, then
/// the consumers, confirm hooks and return handler, and finally the
/// channel-wide error callback. Each callback may destroy the channel;
/// the monitor cuts the walk short when one does.
pub(crate) fn report_error(chan: &Rc<RefCell<ChannelState>>, message: &str) {
    let conn = {
        let mut state = chan.borrow_mut();
        state.state = ChState::Closed;
        state.opened = false;
        if state.closed_reason.is_none() {
            state.closed_reason = Some(message.to_owned());
        }
        // a partial message dies with the channel
        state.current = None;
        state.connection.upgrade()
    };
    if let Some(conn) = conn {
        let id = chan.borrow().id;
        connection::remove_channel(&conn, id);
    }

    let monitor = Monitor::new(chan);

    loop {
        let Some(op) = pop_pending(chan) else { break };
        match op {
            PendingOp::General(core) | PendingOp::Close(core) => {
                deferred::report_error(&core, message)
            }
            PendingOp::Queue(core) => deferred::report_error(&core, message),
            PendingOp::Delete(core) => deferred::report_error(&core, message),
            PendingOp::Cancel(core) => deferred::report_error(&core, message),
            PendingOp::Consume(inner) => {
                let core = inner.borrow().core.clone();
                deferred::report_error(&core, message);
            }
            PendingOp::Get(inner) => {
                let core = inner.borrow().core.clone();
                deferred::report_error(&core, message);
            }
            PendingOp::Confirm(inner) => {
                let core = inner.borrow().core.clone();
                deferred::report_error(&core, message);
            }
        }
        if !monitor.valid() {
            return;
        }
    }

    loop {
        let entry = {
            let mut state = chan.borrow_mut();
            let tag = state.consumers.keys().next().cloned();
            tag.and_then(|tag| state.consumers.remove(&tag))
        };
        let Some(inner) = entry else { break };
        let core = inner.borrow().core.clone();
        deferred::force_error(&core, message);
        if !monitor.valid() {
            return;
        }
    }

    let confirm_inner = chan.borrow_mut().confirm.take();
    if let Some(inner) = confirm_inner {
        let core = inner.borrow().core.clone();
        deferred::force_error(&core, message);
        if !monitor.valid() {
            return;
        }
    }

    let recall_inner = chan.borrow_mut().recall.take();
    if let Some(inner) = recall_inner {
        let core = inner.borrow().core.clone();
        deferred::force_error(&core, message);
        if !monitor.valid() {
            return;
        }
    }

    let callback = chan.borrow_mut().error_cb.take();
    if let Some(mut callback) = callback {
        callback(message);
        if !monitor.valid() {
            return;
        }
        let mut state = chan.borrow_mut();
        if state.error_cb.is_none() {
            state.error_cb = Some(callback);
        }
    }
}
