//! The deferred returned by confirm.select
//!
//! Besides the usual completion callbacks it carries the ack and nack hooks
//! that fire for every publisher confirm the broker sends. The reliability
//! wrappers in [`tagger`](crate::tagger), [`throttle`](crate::throttle) and
//! [`reliable`](crate::reliable) build on these hooks.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::deferred::{self, Core};

pub(crate) struct ConfirmInner {
    pub(crate) core: Rc<RefCell<Core<()>>>,
    pub(crate) ack: Option<Box<dyn FnMut(u64, bool)>>,
    pub(crate) nack: Option<Box<dyn FnMut(u64, bool, bool)>>,
}

impl ConfirmInner {
    pub(crate) fn new() -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(ConfirmInner {
            core: Core::new(),
            ack: None,
            nack: None,
        }))
    }
}

pub(crate) fn report_ack(inner: &Rc<RefCell<ConfirmInner>>, delivery_tag: u64, multiple: bool) {
    let taken = inner.borrow_mut().ack.take();
    if let Some(mut callback) = taken {
        callback(delivery_tag, multiple);
        let mut confirm = inner.borrow_mut();
        if confirm.ack.is_none() {
            confirm.ack = Some(callback);
        }
    }
}

pub(crate) fn report_nack(
    inner: &Rc<RefCell<ConfirmInner>>,
    delivery_tag: u64,
    multiple: bool,
    requeue: bool,
) {
    let taken = inner.borrow_mut().nack.take();
    if let Some(mut callback) = taken {
        callback(delivery_tag, multiple, requeue);
        let mut confirm = inner.borrow_mut();
        if confirm.nack.is_none() {
            confirm.nack = Some(callback);
        }
    }
}

/// Handle for publisher-confirm mode on a channel
#[derive(Clone)]
pub struct DeferredConfirm {
    inner: Rc<RefCell<ConfirmInner>>,
}

impl DeferredConfirm {
    pub(crate) fn new(inner: Rc<RefCell<ConfirmInner>>) -> Self {
        DeferredConfirm { inner }
    }

    pub(crate) fn failed(message: impl Into<String>) -> Self {
        let inner = ConfirmInner::new();
        inner.borrow_mut().core = Core::failed(message);
        DeferredConfirm { inner }
    }

    /// Run a callback once the broker confirms the mode switch
    pub fn on_success(self, callback: impl FnOnce() + 'static) -> Self {
        let core = self.inner.borrow().core.clone();
        deferred::register_success(&core, move |()| callback());
        self
    }

    /// Run a callback when confirm mode could not be enabled
    pub fn on_error(self, callback: impl FnOnce(&str) + 'static) -> Self {
        let core = self.inner.borrow().core.clone();
        deferred::register_error(&core, callback);
        self
    }

    /// Run a callback when the mode switch completes either way
    pub fn on_finalize(self, callback: impl FnOnce(&str) + 'static) -> Self {
        let core = self.inner.borrow().core.clone();
        deferred::register_finalize(&core, callback);
        self
    }

    /// Run a callback for every basic.ack from the broker, with the
    /// delivery tag and the multiple flag
    pub fn on_ack(self, callback: impl FnMut(u64, bool) + 'static) -> Self {
        self.inner.borrow_mut().ack = Some(Box::new(callback));
        self
    }

    /// Run a callback for every basic.nack from the broker, with the
    /// delivery tag, the multiple flag and the requeue flag
    pub fn on_nack(self, callback: impl FnMut(u64, bool, bool) + 'static) -> Self {
        self.inner.borrow_mut().nack = Some(Box::new(callback));
        self
    }
}

impl fmt::Debug for DeferredConfirm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredConfirm").finish_non_exhaustive()
    }
}
