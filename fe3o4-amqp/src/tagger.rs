//! Base wrapper for publisher confirms
//!
//! Wrap a [`Tagger`] around a channel and publish through it instead: it
//! switches the channel into confirm mode, tracks the delivery tag of
//! every publish, and knows when all of them have been confirmed so a
//! close can drain first. On its own it only counts; combine it with
//! [`Reliable`](crate::reliable::Reliable) for per-message callbacks or
//! use [`Throttle`](crate::throttle::Throttle) to also bound the number of
//! unconfirmed publishes in flight.
//!
//! The tagger takes control of the channel: it installs the channel-wide
//! error callback and the confirm hooks, and counters go stale when the
//! application keeps publishing on the raw channel at the same time.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::channel::{self, Channel};
use crate::deferred::{self, Core, Deferred};
use crate::message::Envelope;
use crate::reliable::sealed::{Confirmation, ExtraUnacked, Sealed, Tap};
use crate::reliable::Publisher;

pub(crate) struct TaggerInner {
    channel: Channel,
    close: Option<Rc<RefCell<Core<()>>>>,
    close_sent: bool,
    error_cb: Option<Box<dyn FnMut(&str)>>,
    tap: Option<Tap>,
    extra_unacked: Option<ExtraUnacked>,
}

/// A channel wrapper that tracks publisher confirms
pub struct Tagger {
    inner: Rc<RefCell<TaggerInner>>,
}

impl Tagger {
    /// Enable publisher confirms on the channel and wrap it
    pub fn new(channel: &Channel) -> Tagger {
        let inner = Rc::new(RefCell::new(TaggerInner {
            channel: channel.clone(),
            close: None,
            close_sent: false,
            error_cb: None,
            tap: None,
            extra_unacked: None,
        }));

        let on_ack = Rc::downgrade(&inner);
        let on_nack = Rc::downgrade(&inner);
        let _ = channel
            .confirm_select()
            .on_ack(move |delivery_tag, multiple| {
                if let Some(inner) = on_ack.upgrade() {
                    handle_confirmation(&inner, &Confirmation::Ack {
                        delivery_tag,
                        multiple,
                    });
                }
            })
            .on_nack(move |delivery_tag, multiple, _requeue| {
                if let Some(inner) = on_nack.upgrade() {
                    handle_confirmation(&inner, &Confirmation::Nack {
                        delivery_tag,
                        multiple,
                    });
                }
            });

        let on_error = Rc::downgrade(&inner);
        channel.on_error(move |message| {
            if let Some(inner) = on_error.upgrade() {
                handle_error(&inner, message);
            }
        });

        Tagger { inner }
    }

    /// The wrapped channel
    pub fn channel(&self) -> Channel {
        self.inner.borrow().channel.clone()
    }
}

impl Publisher for Tagger {
    fn publish(
        &self,
        exchange_name: &str,
        routing_key: &str,
        flag_bits: u32,
        envelope: &Envelope,
    ) -> u64 {
        let channel = {
            let inner = self.inner.borrow();
            // no more publishes once a close has been requested
            if inner.close.is_some() {
                return 0;
            }
            inner.channel.clone()
        };
        match channel::encode_publish(
            &channel.inner,
            exchange_name,
            routing_key,
            flag_bits,
            envelope,
        ) {
            Ok((tag, bytes)) => {
                if channel::send_raw(&channel.inner, bytes) {
                    tag
                } else {
                    0
                }
            }
            Err(_) => 0,
        }
    }

    fn unacknowledged(&self) -> usize {
        extra_unacked(&self.inner)
    }

    fn close(&self) -> Deferred {
        if let Some(core) = self.inner.borrow().close.clone() {
            return Deferred::pending(core);
        }
        let usable = self.inner.borrow().channel.usable();
        let core = if usable {
            Core::new()
        } else {
            Core::failed("channel is no longer usable")
        };
        self.inner.borrow_mut().close = Some(core.clone());

        // unconfirmed publishes are still out there; the close happens
        // when the last ack or nack comes in
        if usable && self.unacknowledged() == 0 {
            chain_channel_close(&self.inner);
        }
        Deferred::pending(core)
    }

    fn on_error(&self, callback: impl FnMut(&str) + 'static) {
        install_error_callback(&self.inner, Box::new(callback));
    }
}

impl Sealed for Tagger {
    fn install(&self, tap: Tap, extra: ExtraUnacked) {
        let mut inner = self.inner.borrow_mut();
        inner.tap = Some(tap);
        inner.extra_unacked = Some(extra);
    }
}

impl fmt::Debug for Tagger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tagger")
            .field("closing", &self.inner.borrow().close.is_some())
            .finish_non_exhaustive()
    }
}

fn extra_unacked(inner: &Rc<RefCell<TaggerInner>>) -> usize {
    let extra = {
        let state = inner.borrow();
        state.extra_unacked.clone()
    };
    extra.map_or(0, |count| count())
}

pub(crate) fn fire_tap<T>(
    inner: &Rc<RefCell<T>>,
    tap_of: impl Fn(&mut T) -> &mut Option<Tap>,
    confirmation: &Confirmation,
) {
    let taken = tap_of(&mut *inner.borrow_mut()).take();
    if let Some(mut tap) = taken {
        tap(confirmation);
        let mut state = inner.borrow_mut();
        let slot = tap_of(&mut *state);
        if slot.is_none() {
            *slot = Some(tap);
        }
    }
}

fn handle_confirmation(inner: &Rc<RefCell<TaggerInner>>, confirmation: &Confirmation) {
    // per-message handlers first, flow control afterwards
    fire_tap(inner, |state| &mut state.tap, confirmation);
    maybe_close(inner);
}

fn maybe_close(inner: &Rc<RefCell<TaggerInner>>) {
    let closing = {
        let state = inner.borrow();
        state.close.is_some() && !state.close_sent
    };
    if !closing || extra_unacked(inner) > 0 {
        return;
    }
    chain_channel_close(inner);
}

fn chain_channel_close(inner: &Rc<RefCell<TaggerInner>>) {
    let (channel, close) = {
        let mut state = inner.borrow_mut();
        let Some(close) = state.close.clone() else { return };
        state.close_sent = true;
        (state.channel.clone(), close)
    };
    let on_success = close.clone();
    let _ = channel
        .close()
        .on_success(move || deferred::report_success(&on_success, ()))
        .on_error(move |message| deferred::report_error(&close, message));
}

fn handle_error(inner: &Rc<RefCell<TaggerInner>>, message: &str) {
    fire_tap(inner, |state| &mut state.tap, &Confirmation::Error(message.to_owned()));

    let callback = inner.borrow_mut().error_cb.take();
    if let Some(mut callback) = callback {
        callback(message);
        let mut state = inner.borrow_mut();
        if state.error_cb.is_none() {
            state.error_cb = Some(callback);
        }
    }
}

pub(crate) fn install_error_callback(
    inner: &Rc<RefCell<TaggerInner>>,
    mut callback: Box<dyn FnMut(&str)>,
) {
    let immediate = {
        let state = inner.borrow();
        if !state.channel.usable() {
            Some("channel is no longer usable")
        } else if state.close.is_some() {
            Some("wrapped channel is closing down")
        } else {
            None
        }
    };
    match immediate {
        Some(message) => callback(message),
        None => inner.borrow_mut().error_cb = Some(callback),
    }
}
