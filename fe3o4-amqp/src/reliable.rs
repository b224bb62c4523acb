//! Per-message confirm callbacks on top of a confirmed publisher
//!
//! [`Reliable`] keeps a handle per outstanding delivery tag and resolves
//! it when the broker acks or nacks the tag. It wraps any confirmed
//! publisher: a plain [`Tagger`](crate::tagger::Tagger), or a
//! [`Throttle`](crate::throttle::Throttle) when per-message callbacks and
//! bounded in-flight publishing are wanted at the same time.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use crate::deferred::Deferred;
use crate::message::Envelope;
use crate::tagger::Tagger;

pub(crate) mod sealed {
    use std::rc::Rc;

    /// What the broker said about one or more delivery tags, or that the
    /// channel died underneath the publisher
    #[derive(Debug)]
    pub enum Confirmation {
        Ack { delivery_tag: u64, multiple: bool },
        Nack { delivery_tag: u64, multiple: bool },
        Error(String),
    }

    /// Observer a [`Reliable`](super::Reliable) wrapper installs on its
    /// base publisher; runs before the base's own flow-control handling
    pub type Tap = Box<dyn FnMut(&Confirmation)>;

    /// Outstanding per-message handles the base must wait for on close
    pub type ExtraUnacked = Rc<dyn Fn() -> usize>;

    pub trait Sealed {
        fn install(&self, tap: Tap, extra: ExtraUnacked);
    }
}

use sealed::Confirmation;

/// A publisher whose publishes are tracked by delivery tag
///
/// Implemented by [`Tagger`](crate::tagger::Tagger) and
/// [`Throttle`](crate::throttle::Throttle); sealed because the confirm
/// plumbing between the wrappers is crate internal.
pub trait Publisher: sealed::Sealed {
    /// Publish a message and return the delivery tag it was assigned, or
    /// 0 when the message could not be sent
    fn publish(
        &self,
        exchange_name: &str,
        routing_key: &str,
        flag_bits: u32,
        envelope: &Envelope,
    ) -> u64;

    /// Number of publishes not yet confirmed by the broker
    fn unacknowledged(&self) -> usize;

    /// Close the underlying channel once everything outstanding has been
    /// confirmed
    fn close(&self) -> Deferred;

    /// Install an error callback on the publisher
    fn on_error(&self, callback: impl FnMut(&str) + 'static);
}

struct PublishInner {
    failed: bool,
    ack_cb: Option<Box<dyn FnOnce()>>,
    nack_cb: Option<Box<dyn FnOnce()>>,
    lost_cb: Option<Box<dyn FnOnce(&str)>>,
    error_cb: Option<Box<dyn FnOnce(&str)>>,
}

impl PublishInner {
    fn new(failed: bool) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(PublishInner {
            failed,
            ack_cb: None,
            nack_cb: None,
            lost_cb: None,
            error_cb: None,
        }))
    }
}

fn report_ack(inner: &Rc<RefCell<PublishInner>>) {
    let callback = inner.borrow_mut().ack_cb.take();
    if let Some(callback) = callback {
        callback();
    }
}

fn report_nack(inner: &Rc<RefCell<PublishInner>>) {
    let (nack, lost) = {
        let mut state = inner.borrow_mut();
        (state.nack_cb.take(), state.lost_cb.take())
    };
    if let Some(callback) = nack {
        callback();
    }
    // a nacked message is a lost message
    if let Some(callback) = lost {
        callback("message was nacked");
    }
}

fn report_error(inner: &Rc<RefCell<PublishInner>>, message: &str) {
    let (lost, error) = {
        let mut state = inner.borrow_mut();
        state.failed = true;
        (state.lost_cb.take(), state.error_cb.take())
    };
    if let Some(callback) = lost {
        callback(message);
    }
    if let Some(callback) = error {
        callback(message);
    }
}

/// Handle for a single tracked publish
#[derive(Clone)]
pub struct DeferredPublish {
    inner: Rc<RefCell<PublishInner>>,
}

impl DeferredPublish {
    /// Run a callback when the broker confirms the message
    pub fn on_ack(self, callback: impl FnOnce() + 'static) -> Self {
        self.inner.borrow_mut().ack_cb = Some(Box::new(callback));
        self
    }

    /// Run a callback when the broker rejects the message
    pub fn on_nack(self, callback: impl FnOnce() + 'static) -> Self {
        self.inner.borrow_mut().nack_cb = Some(Box::new(callback));
        self
    }

    /// Run a callback when the message is lost, either because the broker
    /// nacked it or because the channel died first
    pub fn on_lost(self, callback: impl FnOnce(&str) + 'static) -> Self {
        let failed = self.inner.borrow().failed;
        if failed {
            callback("message was never sent");
        } else {
            self.inner.borrow_mut().lost_cb = Some(Box::new(callback));
        }
        self
    }

    /// Run a callback when the channel fails with the message outstanding
    pub fn on_error(self, callback: impl FnOnce(&str) + 'static) -> Self {
        let failed = self.inner.borrow().failed;
        if failed {
            callback("message was never sent");
        } else {
            self.inner.borrow_mut().error_cb = Some(Box::new(callback));
        }
        self
    }
}

impl fmt::Debug for DeferredPublish {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredPublish")
            .field("failed", &self.inner.borrow().failed)
            .finish_non_exhaustive()
    }
}

type Handlers = Rc<RefCell<BTreeMap<u64, Rc<RefCell<PublishInner>>>>>;

/// A publisher that resolves a [`DeferredPublish`] per message
pub struct Reliable<B: Publisher = Tagger> {
    base: B,
    handlers: Handlers,
}

impl<B: Publisher> Reliable<B> {
    /// Wrap a confirmed publisher
    pub fn new(base: B) -> Reliable<B> {
        let handlers: Handlers = Rc::new(RefCell::new(BTreeMap::new()));

        let tap_handlers = handlers.clone();
        let count_handlers = Rc::downgrade(&handlers);
        base.install(
            Box::new(move |confirmation| fan_out(&tap_handlers, confirmation)),
            Rc::new(move || {
                count_handlers
                    .upgrade()
                    .map_or(0, |handlers| handlers.borrow().len())
            }),
        );
        Reliable { base, handlers }
    }

    /// Publish a message and track its confirm. The returned handle fails
    /// synchronously when the message could not be sent at all.
    pub fn publish(
        &self,
        exchange_name: &str,
        routing_key: &str,
        flag_bits: u32,
        envelope: &Envelope,
    ) -> DeferredPublish {
        let tag = self.base.publish(exchange_name, routing_key, flag_bits, envelope);
        let inner = PublishInner::new(tag == 0);
        if tag != 0 {
            self.handlers.borrow_mut().insert(tag, inner.clone());
        }
        DeferredPublish { inner }
    }

    /// Number of publishes whose confirm is still outstanding
    pub fn unacknowledged(&self) -> usize {
        self.handlers.borrow().len()
    }

    /// Close the underlying channel once everything has been confirmed
    pub fn close(&self) -> Deferred {
        self.base.close()
    }

    /// Install an error callback on the underlying publisher
    pub fn on_error(&self, callback: impl FnMut(&str) + 'static) {
        self.base.on_error(callback);
    }

    /// The wrapped publisher
    pub fn base(&self) -> &B {
        &self.base
    }
}

impl<B: Publisher> fmt::Debug for Reliable<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reliable")
            .field("unacknowledged", &self.handlers.borrow().len())
            .finish_non_exhaustive()
    }
}

/// Resolve handles for a confirmation, in delivery-tag order. Runs before
/// the base publisher reacts, so callbacks observe the confirm before any
/// queued publishes go out or the channel close proceeds.
fn fan_out(handlers: &Handlers, confirmation: &Confirmation) {
    match confirmation {
        Confirmation::Ack {
            delivery_tag,
            multiple: false,
        } => {
            let handler = handlers.borrow_mut().remove(delivery_tag);
            if let Some(handler) = handler {
                report_ack(&handler);
            }
        }
        Confirmation::Nack {
            delivery_tag,
            multiple: false,
        } => {
            let handler = handlers.borrow_mut().remove(delivery_tag);
            if let Some(handler) = handler {
                report_nack(&handler);
            }
        }
        Confirmation::Ack {
            delivery_tag,
            multiple: true,
        } => {
            for handler in drain_up_to(handlers, *delivery_tag) {
                report_ack(&handler);
            }
        }
        Confirmation::Nack {
            delivery_tag,
            multiple: true,
        } => {
            for handler in drain_up_to(handlers, *delivery_tag) {
                report_nack(&handler);
            }
        }
        Confirmation::Error(message) => {
            let drained = std::mem::take(&mut *handlers.borrow_mut());
            for (_, handler) in drained {
                report_error(&handler, message);
            }
        }
    }
}

/// Remove every handle with a tag up to and including the given one,
/// keeping them in tag order. Removal happens in one pass before any
/// callback runs so a callback that publishes again cannot disturb the
/// iteration.
fn drain_up_to(handlers: &Handlers, delivery_tag: u64) -> Vec<Rc<RefCell<PublishInner>>> {
    let mut map = handlers.borrow_mut();
    let keep = map.split_off(&(delivery_tag + 1));
    let drained = std::mem::replace(&mut *map, keep);
    drained.into_values().collect()
}
