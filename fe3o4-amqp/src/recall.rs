//! Handling of returned (bounced) messages
//!
//! A message published with the mandatory or immediate flag that the broker
//! cannot place comes back in a basic.return frame followed by its content.
//! Install this handler once per channel; it then fires for every bounce.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use fe3o4_amqp_types::properties::Properties;

use crate::deferred::{self, Core};
use crate::message::Message;
use crate::receiver::{HasReceiver, Receiver};

pub(crate) struct RecallInner {
    pub(crate) core: Rc<RefCell<Core<()>>>,
    pub(crate) bounce_cb: Option<Box<dyn FnMut(Message, u16, &str)>>,
    pub(crate) reply_code: u16,
    pub(crate) reply_text: String,
    pub(crate) receiver: Receiver,
}

impl RecallInner {
    pub(crate) fn new() -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(RecallInner {
            core: Core::new(),
            bounce_cb: None,
            reply_code: 0,
            reply_text: String::new(),
            receiver: Receiver::new(),
        }))
    }
}

impl HasReceiver for RecallInner {
    fn receiver_mut(&mut self) -> &mut Receiver {
        &mut self.receiver
    }

    fn wants_message(&self) -> bool {
        self.bounce_cb.is_some()
    }
}

/// A bounced message finished reassembling; hand it to the callback along
/// with the reply code and text from the return frame
pub(crate) fn emit(inner: &Rc<RefCell<RecallInner>>) {
    let (callback, message, code, text) = {
        let mut recall = inner.borrow_mut();
        let message = recall.receiver.message.take();
        (
            recall.bounce_cb.take(),
            message,
            recall.reply_code,
            recall.reply_text.clone(),
        )
    };
    if let Some(mut callback) = callback {
        if let Some(message) = message {
            callback(message, code, &text);
        }
        let mut recall = inner.borrow_mut();
        if recall.bounce_cb.is_none() {
            recall.bounce_cb = Some(callback);
        }
    }
}

/// Handle for returned message notifications on a channel
#[derive(Clone)]
pub struct DeferredRecall {
    inner: Rc<RefCell<RecallInner>>,
}

impl DeferredRecall {
    pub(crate) fn new(inner: Rc<RefCell<RecallInner>>) -> Self {
        DeferredRecall { inner }
    }

    /// Run a callback for every bounced message, with the reply code and
    /// text the broker gave
    pub fn on_returned(self, callback: impl FnMut(Message, u16, &str) + 'static) -> Self {
        self.inner.borrow_mut().bounce_cb = Some(Box::new(callback));
        self
    }

    /// Alias for [`on_returned`](DeferredRecall::on_returned)
    pub fn on_bounced(self, callback: impl FnMut(Message, u16, &str) + 'static) -> Self {
        self.on_returned(callback)
    }

    /// Run a callback when the channel dies while returns are installed
    pub fn on_error(self, callback: impl FnOnce(&str) + 'static) -> Self {
        let core = self.inner.borrow().core.clone();
        deferred::register_error(&core, callback);
        self
    }

    /// Run a callback when a bounce starts arriving
    pub fn on_begin(self, callback: impl FnMut() + 'static) -> Self {
        self.inner.borrow_mut().receiver.begin = Some(Box::new(callback));
        self
    }

    /// Run a callback with the declared body size of each bounce
    pub fn on_size(self, callback: impl FnMut(u64) + 'static) -> Self {
        self.inner.borrow_mut().receiver.size = Some(Box::new(callback));
        self
    }

    /// Run a callback with the properties of each bounce
    pub fn on_headers(self, callback: impl FnMut(&Properties) + 'static) -> Self {
        self.inner.borrow_mut().receiver.headers = Some(Box::new(callback));
        self
    }

    /// Run a callback for every chunk of bounced body data
    pub fn on_data(self, callback: impl FnMut(&[u8]) + 'static) -> Self {
        self.inner.borrow_mut().receiver.data = Some(Box::new(callback));
        self
    }

    /// Run a callback when a bounce has been fully received
    pub fn on_complete(self, callback: impl FnMut(u64, bool) + 'static) -> Self {
        self.inner.borrow_mut().receiver.complete = Some(Box::new(callback));
        self
    }
}

impl fmt::Debug for DeferredRecall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredRecall").finish_non_exhaustive()
    }
}
