//! Per-channel message reassembly
//!
//! A deliver, get-ok or return method frame opens a message; the content
//! header that follows announces the properties and the declared body size;
//! body frames then append bytes until the declared size is reached. At
//! most one message is in flight per channel.
//!
//! The streaming hooks fire as the pieces come in, so an application can
//! process an arbitrarily large body without the engine buffering it. A
//! full [`Message`] is only assembled when a message callback is
//! registered.

use std::cell::RefCell;
use std::rc::Rc;

use fe3o4_amqp_types::content::ContentHeader;
use fe3o4_amqp_types::properties::Properties;

use crate::message::Message;

/// Reassembly state plus the streaming hooks, embedded in every receiving
/// deferred (consumer, get, recall).
pub(crate) struct Receiver {
    pub(crate) begin: Option<Box<dyn FnMut()>>,
    pub(crate) size: Option<Box<dyn FnMut(u64)>>,
    pub(crate) headers: Option<Box<dyn FnMut(&Properties)>>,
    pub(crate) data: Option<Box<dyn FnMut(&[u8])>>,
    pub(crate) complete: Option<Box<dyn FnMut(u64, bool)>>,

    pub(crate) delivery_tag: u64,
    pub(crate) redelivered: bool,
    body_size: u64,
    received: u64,
    pub(crate) message: Option<Message>,
}

impl Receiver {
    pub(crate) fn new() -> Self {
        Receiver {
            begin: None,
            size: None,
            headers: None,
            data: None,
            complete: None,
            delivery_tag: 0,
            redelivered: false,
            body_size: 0,
            received: 0,
            message: None,
        }
    }
}

/// Access to the embedded receiver, so the reassembly flow below works for
/// every receiving deferred kind.
pub(crate) trait HasReceiver {
    fn receiver_mut(&mut self) -> &mut Receiver;

    /// Whether a full message should be assembled for this receiver
    fn wants_message(&self) -> bool;
}

/// Begin a new message. Fires the begin hook; constructs the message
/// object only when someone wants it.
pub(crate) fn start<T: HasReceiver>(
    target: &Rc<RefCell<T>>,
    exchange: &str,
    routing_key: &str,
    delivery_tag: u64,
    redelivered: bool,
) {
    let assemble = {
        let mut inner = target.borrow_mut();
        let assemble = inner.wants_message();
        let receiver = inner.receiver_mut();
        receiver.delivery_tag = delivery_tag;
        receiver.redelivered = redelivered;
        receiver.body_size = 0;
        receiver.received = 0;
        receiver.message = None;
        assemble
    };
    fire_begin(target);
    if assemble {
        target.borrow_mut().receiver_mut().message =
            Some(Message::new(exchange.to_owned(), routing_key.to_owned()));
    }
}

/// Feed the content header. Returns whether the message is already
/// complete (declared body size zero), or the error text when the declared
/// size cannot be represented on this host.
pub(crate) fn process_header<T: HasReceiver>(
    target: &Rc<RefCell<T>>,
    header: &ContentHeader,
) -> Result<bool, &'static str> {
    if header.body_size > usize::MAX as u64 {
        return Err("message body too large for this platform");
    }
    {
        let mut inner = target.borrow_mut();
        let receiver = inner.receiver_mut();
        receiver.body_size = header.body_size;
        if let Some(message) = receiver.message.as_mut() {
            message.set_properties(header.properties.clone());
            message.reserve(header.body_size as usize);
        }
    }
    fire_size(target, header.body_size);
    fire_headers(target, &header.properties);
    Ok(header.body_size == 0)
}

/// Feed a body chunk. Returns whether the message is now complete, or the
/// error text when the chunk overruns the declared size.
pub(crate) fn process_body<T: HasReceiver>(
    target: &Rc<RefCell<T>>,
    chunk: &[u8],
) -> Result<bool, &'static str> {
    {
        let mut inner = target.borrow_mut();
        let receiver = inner.receiver_mut();
        if receiver.received + chunk.len() as u64 > receiver.body_size {
            return Err("message body exceeds the announced size");
        }
        receiver.received += chunk.len() as u64;
        if let Some(message) = receiver.message.as_mut() {
            message.append(chunk);
        }
    }
    fire_data(target, chunk);
    let mut inner = target.borrow_mut();
    let receiver = inner.receiver_mut();
    Ok(receiver.received == receiver.body_size)
}

// The hooks below are taken out of their slot for the duration of the
// call: the callback may re-enter the engine and even reach this same
// receiver. A callback installed from inside the callback wins over the
// one being restored.

pub(crate) fn fire_begin<T: HasReceiver>(target: &Rc<RefCell<T>>) {
    let taken = target.borrow_mut().receiver_mut().begin.take();
    if let Some(mut callback) = taken {
        callback();
        let mut inner = target.borrow_mut();
        let slot = &mut inner.receiver_mut().begin;
        if slot.is_none() {
            *slot = Some(callback);
        }
    }
}

pub(crate) fn fire_size<T: HasReceiver>(target: &Rc<RefCell<T>>, size: u64) {
    let taken = target.borrow_mut().receiver_mut().size.take();
    if let Some(mut callback) = taken {
        callback(size);
        let mut inner = target.borrow_mut();
        let slot = &mut inner.receiver_mut().size;
        if slot.is_none() {
            *slot = Some(callback);
        }
    }
}

pub(crate) fn fire_headers<T: HasReceiver>(target: &Rc<RefCell<T>>, properties: &Properties) {
    let taken = target.borrow_mut().receiver_mut().headers.take();
    if let Some(mut callback) = taken {
        callback(properties);
        let mut inner = target.borrow_mut();
        let slot = &mut inner.receiver_mut().headers;
        if slot.is_none() {
            *slot = Some(callback);
        }
    }
}

pub(crate) fn fire_data<T: HasReceiver>(target: &Rc<RefCell<T>>, chunk: &[u8]) {
    let taken = target.borrow_mut().receiver_mut().data.take();
    if let Some(mut callback) = taken {
        callback(chunk);
        let mut inner = target.borrow_mut();
        let slot = &mut inner.receiver_mut().data;
        if slot.is_none() {
            *slot = Some(callback);
        }
    }
}

pub(crate) fn fire_complete<T: HasReceiver>(target: &Rc<RefCell<T>>) {
    let (taken, tag, redelivered) = {
        let mut inner = target.borrow_mut();
        let receiver = inner.receiver_mut();
        (receiver.complete.take(), receiver.delivery_tag, receiver.redelivered)
    };
    if let Some(mut callback) = taken {
        callback(tag, redelivered);
        let mut inner = target.borrow_mut();
        let slot = &mut inner.receiver_mut().complete;
        if slot.is_none() {
            *slot = Some(callback);
        }
    }
}
