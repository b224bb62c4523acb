//! The deferred returned by a synchronous get
//!
//! Resolves with either a single message or an empty-queue notification.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use fe3o4_amqp_types::properties::Properties;

use crate::deferred::{self, Core};
use crate::message::Message;
use crate::receiver::{HasReceiver, Receiver};

pub(crate) struct GetInner {
    pub(crate) core: Rc<RefCell<Core<()>>>,
    pub(crate) message_cb: Option<Box<dyn FnOnce(Message, u64, bool)>>,
    pub(crate) empty: Option<Box<dyn FnOnce()>>,
    pub(crate) count: Option<Box<dyn FnOnce(u32)>>,
    pub(crate) receiver: Receiver,
}

impl GetInner {
    pub(crate) fn new() -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(GetInner {
            core: Core::new(),
            message_cb: None,
            empty: None,
            count: None,
            receiver: Receiver::new(),
        }))
    }
}

impl HasReceiver for GetInner {
    fn receiver_mut(&mut self) -> &mut Receiver {
        &mut self.receiver
    }

    fn wants_message(&self) -> bool {
        self.message_cb.is_some()
    }
}

/// Report how many messages remain queued, known as soon as get-ok arrives
pub(crate) fn report_count(inner: &Rc<RefCell<GetInner>>, message_count: u32) {
    let callback = inner.borrow_mut().count.take();
    if let Some(callback) = callback {
        callback(message_count);
    }
}

/// The message completed; hand it out. The owning channel settles the
/// deferred afterwards, once the completion hooks have run.
pub(crate) fn emit(inner: &Rc<RefCell<GetInner>>) {
    let (callback, message, tag, redelivered) = {
        let mut get = inner.borrow_mut();
        let message = get.receiver.message.take();
        (
            get.message_cb.take(),
            message,
            get.receiver.delivery_tag,
            get.receiver.redelivered,
        )
    };
    if let (Some(callback), Some(message)) = (callback, message) {
        callback(message, tag, redelivered);
    }
}

/// The queue was empty; settle the deferred
pub(crate) fn report_empty(inner: &Rc<RefCell<GetInner>>) {
    let (callback, core) = {
        let mut get = inner.borrow_mut();
        (get.empty.take(), get.core.clone())
    };
    if let Some(callback) = callback {
        callback();
    }
    deferred::report_success(&core, ());
}

/// Handle for a single message fetch
#[derive(Clone)]
pub struct DeferredGet {
    inner: Rc<RefCell<GetInner>>,
}

impl DeferredGet {
    pub(crate) fn new(inner: Rc<RefCell<GetInner>>) -> Self {
        DeferredGet { inner }
    }

    pub(crate) fn failed(message: impl Into<String>) -> Self {
        let inner = GetInner::new();
        inner.borrow_mut().core = Core::failed(message);
        DeferredGet { inner }
    }

    /// Run a callback with the fetched message, its delivery tag and the
    /// redelivered flag
    pub fn on_success(self, callback: impl FnOnce(Message, u64, bool) + 'static) -> Self {
        self.inner.borrow_mut().message_cb = Some(Box::new(callback));
        self
    }

    /// Run a callback when the queue turned out to be empty
    pub fn on_empty(self, callback: impl FnOnce() + 'static) -> Self {
        self.inner.borrow_mut().empty = Some(Box::new(callback));
        self
    }

    /// Run a callback with the number of messages still queued behind the
    /// fetched one
    pub fn on_count(self, callback: impl FnOnce(u32) + 'static) -> Self {
        self.inner.borrow_mut().count = Some(Box::new(callback));
        self
    }

    /// Run a callback when the fetch fails
    pub fn on_error(self, callback: impl FnOnce(&str) + 'static) -> Self {
        let core = self.inner.borrow().core.clone();
        deferred::register_error(&core, callback);
        self
    }

    /// Run a callback when the fetch completes either way
    pub fn on_finalize(self, callback: impl FnOnce(&str) + 'static) -> Self {
        let core = self.inner.borrow().core.clone();
        deferred::register_finalize(&core, callback);
        self
    }

    /// Run a callback when the message starts arriving
    pub fn on_begin(self, callback: impl FnMut() + 'static) -> Self {
        self.inner.borrow_mut().receiver.begin = Some(Box::new(callback));
        self
    }

    /// Run a callback with the declared body size
    pub fn on_size(self, callback: impl FnMut(u64) + 'static) -> Self {
        self.inner.borrow_mut().receiver.size = Some(Box::new(callback));
        self
    }

    /// Run a callback with the message properties
    pub fn on_headers(self, callback: impl FnMut(&Properties) + 'static) -> Self {
        self.inner.borrow_mut().receiver.headers = Some(Box::new(callback));
        self
    }

    /// Run a callback for every chunk of body data as it arrives
    pub fn on_data(self, callback: impl FnMut(&[u8]) + 'static) -> Self {
        self.inner.borrow_mut().receiver.data = Some(Box::new(callback));
        self
    }

    /// Run a callback when the body has been fully received
    pub fn on_complete(self, callback: impl FnMut(u64, bool) + 'static) -> Self {
        self.inner.borrow_mut().receiver.complete = Some(Box::new(callback));
        self
    }
}

impl fmt::Debug for DeferredGet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredGet").finish_non_exhaustive()
    }
}
