//! The deferred returned by a consume operation
//!
//! Completes once with the consumer tag when the broker confirms the
//! subscription, then keeps delivering: the message and streaming hooks
//! fire again for every delivery routed to the tag.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use fe3o4_amqp_types::properties::Properties;

use crate::deferred::{self, Core};
use crate::message::Message;
use crate::receiver::{HasReceiver, Receiver};

pub(crate) struct ConsumerInner {
    pub(crate) core: Rc<RefCell<Core<(String,)>>>,
    pub(crate) message_cb: Option<Box<dyn FnMut(Message, u64, bool)>>,
    pub(crate) cancelled: Option<Box<dyn FnOnce(&str)>>,
    pub(crate) receiver: Receiver,
}

impl ConsumerInner {
    pub(crate) fn new() -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(ConsumerInner {
            core: Core::new(),
            message_cb: None,
            cancelled: None,
            receiver: Receiver::new(),
        }))
    }
}

impl HasReceiver for ConsumerInner {
    fn receiver_mut(&mut self) -> &mut Receiver {
        &mut self.receiver
    }

    fn wants_message(&self) -> bool {
        self.message_cb.is_some()
    }
}

/// Fire the message callback for a completed delivery
pub(crate) fn emit(inner: &Rc<RefCell<ConsumerInner>>) {
    let (callback, message, tag, redelivered) = {
        let mut consumer = inner.borrow_mut();
        let message = consumer.receiver.message.take();
        (
            consumer.message_cb.take(),
            message,
            consumer.receiver.delivery_tag,
            consumer.receiver.redelivered,
        )
    };
    if let Some(mut callback) = callback {
        if let Some(message) = message {
            callback(message, tag, redelivered);
        }
        let mut consumer = inner.borrow_mut();
        if consumer.message_cb.is_none() {
            consumer.message_cb = Some(callback);
        }
    }
}

/// The broker cancelled the consumer on its own initiative
pub(crate) fn report_cancelled(inner: &Rc<RefCell<ConsumerInner>>, tag: &str) {
    let callback = inner.borrow_mut().cancelled.take();
    if let Some(callback) = callback {
        callback(tag);
    }
}

/// Handle for a running subscription
#[derive(Clone)]
pub struct DeferredConsumer {
    inner: Rc<RefCell<ConsumerInner>>,
}

impl DeferredConsumer {
    pub(crate) fn new(inner: Rc<RefCell<ConsumerInner>>) -> Self {
        DeferredConsumer { inner }
    }

    pub(crate) fn failed(message: impl Into<String>) -> Self {
        let inner = ConsumerInner::new();
        inner.borrow_mut().core = Core::failed(message);
        DeferredConsumer { inner }
    }

    /// Run a callback with the consumer tag once the broker confirms the
    /// subscription
    pub fn on_success(self, callback: impl FnOnce(&str) + 'static) -> Self {
        let core = self.inner.borrow().core.clone();
        deferred::register_success(&core, move |(tag,): (String,)| callback(&tag));
        self
    }

    /// Run a callback when the subscription could not be set up
    pub fn on_error(self, callback: impl FnOnce(&str) + 'static) -> Self {
        let core = self.inner.borrow().core.clone();
        deferred::register_error(&core, callback);
        self
    }

    /// Run a callback when the subscription attempt completes either way
    pub fn on_finalize(self, callback: impl FnOnce(&str) + 'static) -> Self {
        let core = self.inner.borrow().core.clone();
        deferred::register_finalize(&core, callback);
        self
    }

    /// Run a callback for every fully received message
    pub fn on_message(self, callback: impl FnMut(Message, u64, bool) + 'static) -> Self {
        self.inner.borrow_mut().message_cb = Some(Box::new(callback));
        self
    }

    /// Alias for [`on_message`](DeferredConsumer::on_message)
    pub fn on_received(self, callback: impl FnMut(Message, u64, bool) + 'static) -> Self {
        self.on_message(callback)
    }

    /// Run a callback when a new delivery starts
    pub fn on_begin(self, callback: impl FnMut() + 'static) -> Self {
        self.inner.borrow_mut().receiver.begin = Some(Box::new(callback));
        self
    }

    /// Run a callback with the declared body size of each delivery
    pub fn on_size(self, callback: impl FnMut(u64) + 'static) -> Self {
        self.inner.borrow_mut().receiver.size = Some(Box::new(callback));
        self
    }

    /// Run a callback with the properties of each delivery
    pub fn on_headers(self, callback: impl FnMut(&Properties) + 'static) -> Self {
        self.inner.borrow_mut().receiver.headers = Some(Box::new(callback));
        self
    }

    /// Run a callback for every chunk of body data as it arrives. Install
    /// this together with [`on_complete`](DeferredConsumer::on_complete)
    /// to stream large bodies without buffering them.
    pub fn on_data(self, callback: impl FnMut(&[u8]) + 'static) -> Self {
        self.inner.borrow_mut().receiver.data = Some(Box::new(callback));
        self
    }

    /// Run a callback when a delivery has been fully received
    pub fn on_complete(self, callback: impl FnMut(u64, bool) + 'static) -> Self {
        self.inner.borrow_mut().receiver.complete = Some(Box::new(callback));
        self
    }

    /// Run a callback when the broker cancels the consumer, for instance
    /// because its queue was deleted
    pub fn on_cancelled(self, callback: impl FnOnce(&str) + 'static) -> Self {
        self.inner.borrow_mut().cancelled = Some(Box::new(callback));
        self
    }
}

impl fmt::Debug for DeferredConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredConsumer").finish_non_exhaustive()
    }
}
