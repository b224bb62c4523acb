//! Bounded in-flight publishing
//!
//! A [`Throttle`] wraps a channel in confirm mode and caps how many
//! publishes may be unconfirmed at once. Publishes beyond the limit are
//! encoded up front and parked in a FIFO; every ack or nack frees slots
//! and drains the queue in order. A close request waits until everything
//! in flight and in the queue has been confirmed.

use std::cell::RefCell;
use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::rc::Rc;

use bytes::Bytes;

use crate::channel::{self, Channel};
use crate::deferred::{self, Core, Deferred};
use crate::message::Envelope;
use crate::reliable::sealed::{Confirmation, ExtraUnacked, Sealed, Tap};
use crate::reliable::Publisher;

struct ThrottleInner {
    channel: Channel,
    limit: usize,
    /// Tag of the last publish actually put on the wire
    last_sent: u64,
    /// Tags on the wire awaiting their confirm
    open: BTreeSet<u64>,
    /// Publishes past the limit: tag plus the fully encoded frames
    queue: VecDeque<(u64, Bytes)>,
    close: Option<Rc<RefCell<Core<()>>>>,
    close_sent: bool,
    error_cb: Option<Box<dyn FnMut(&str)>>,
    tap: Option<Tap>,
    extra_unacked: Option<ExtraUnacked>,
}

/// A channel wrapper that caps concurrent unconfirmed publishes
pub struct Throttle {
    inner: Rc<RefCell<ThrottleInner>>,
}

impl Throttle {
    /// Enable publisher confirms on the channel and cap the number of
    /// unconfirmed publishes at `limit`.
    ///
    /// The throttle takes control of the channel: it installs the
    /// channel-wide error callback and the confirm hooks, and its
    /// bookkeeping goes stale when the application keeps publishing on
    /// the raw channel at the same time.
    pub fn new(channel: &Channel, limit: usize) -> Throttle {
        let inner = Rc::new(RefCell::new(ThrottleInner {
            channel: channel.clone(),
            limit,
            last_sent: 0,
            open: BTreeSet::new(),
            queue: VecDeque::new(),
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

        Throttle { inner }
    }

    /// The configured limit
    pub fn limit(&self) -> usize {
        self.inner.borrow().limit
    }

    /// Change the limit. Lowering it takes effect gradually: nothing is
    /// recalled from the wire, the queue just drains more slowly from the
    /// next acknowledgement on.
    pub fn set_limit(&self, limit: usize) {
        self.inner.borrow_mut().limit = limit;
    }

    /// Number of publishes waiting in the overflow queue
    pub fn queued(&self) -> usize {
        self.inner.borrow().queue.len()
    }

    /// Send queued publishes right now, ignoring the limit: `max` of
    /// them, or all of them when `max` is 0. Returns how many went out.
    pub fn flush(&self, max: usize) -> usize {
        let mut published = 0;
        loop {
            if max > 0 && published >= max {
                break;
            }
            let entry = {
                let mut state = self.inner.borrow_mut();
                match state.queue.pop_front() {
                    Some((tag, bytes)) => {
                        state.open.insert(tag);
                        state.last_sent = tag;
                        Some((state.channel.clone(), bytes))
                    }
                    None => None,
                }
            };
            let Some((channel, bytes)) = entry else { break };
            channel::send_raw(&channel.inner, bytes);
            published += 1;
        }
        published
    }

    /// The wrapped channel
    pub fn channel(&self) -> Channel {
        self.inner.borrow().channel.clone()
    }
}

impl Publisher for Throttle {
    /// Publish a message, or park it when the cap is reached. Either way
    /// the message gets the next delivery tag; parked publishes keep
    /// their tag until they reach the wire.
    fn publish(
        &self,
        exchange_name: &str,
        routing_key: &str,
        flag_bits: u32,
        envelope: &Envelope,
    ) -> u64 {
        let channel = {
            let inner = self.inner.borrow();
            if inner.close.is_some() {
                return 0;
            }
            inner.channel.clone()
        };
        let (tag, bytes) = match channel::encode_publish(
            &channel.inner,
            exchange_name,
            routing_key,
            flag_bits,
            envelope,
        ) {
            Ok(encoded) => encoded,
            Err(_) => return 0,
        };

        let send_now = {
            let mut state = self.inner.borrow_mut();
            if state.queue.is_empty() && state.open.len() < state.limit {
                state.open.insert(tag);
                state.last_sent = tag;
                true
            } else {
                state.queue.push_back((tag, bytes.clone()));
                false
            }
        };
        if send_now && !channel::send_raw(&channel.inner, bytes) {
            return 0;
        }
        tag
    }

    fn unacknowledged(&self) -> usize {
        let own = {
            let state = self.inner.borrow();
            state.open.len() + state.queue.len()
        };
        own + extra_unacked(&self.inner)
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

        // anything on the wire or in the queue still gets confirmed; the
        // close goes out with the final ack or nack
        if usable && self.unacknowledged() == 0 {
            chain_channel_close(&self.inner);
        }
        Deferred::pending(core)
    }

    fn on_error(&self, callback: impl FnMut(&str) + 'static) {
        let mut callback = Box::new(callback);
        let immediate = {
            let state = self.inner.borrow();
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
            None => self.inner.borrow_mut().error_cb = Some(callback),
        }
    }
}

impl Sealed for Throttle {
    fn install(&self, tap: Tap, extra: ExtraUnacked) {
        let mut inner = self.inner.borrow_mut();
        inner.tap = Some(tap);
        inner.extra_unacked = Some(extra);
    }
}

impl fmt::Debug for Throttle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.borrow();
        f.debug_struct("Throttle")
            .field("limit", &state.limit)
            .field("open", &state.open.len())
            .field("queued", &state.queue.len())
            .field("last_sent", &state.last_sent)
            .finish_non_exhaustive()
    }
}

fn extra_unacked(inner: &Rc<RefCell<ThrottleInner>>) -> usize {
    let extra = inner.borrow().extra_unacked.clone();
    extra.map_or(0, |count| count())
}

fn handle_confirmation(inner: &Rc<RefCell<ThrottleInner>>, confirmation: &Confirmation) {
    // per-message handlers first, flow control afterwards
    crate::tagger::fire_tap(inner, |state| &mut state.tap, confirmation);

    {
        let mut state = inner.borrow_mut();
        match confirmation {
            Confirmation::Ack {
                delivery_tag,
                multiple,
            }
            | Confirmation::Nack {
                delivery_tag,
                multiple,
            } => {
                if *multiple {
                    let keep = state.open.split_off(&(delivery_tag + 1));
                    state.open = keep;
                } else {
                    state.open.remove(delivery_tag);
                }
            }
            Confirmation::Error(_) => return,
        }
    }

    drain(inner);
    maybe_close(inner);
}

/// Send queued publishes while there is room under the limit
fn drain(inner: &Rc<RefCell<ThrottleInner>>) {
    loop {
        let entry = {
            let mut state = inner.borrow_mut();
            if state.open.len() >= state.limit {
                None
            } else {
                match state.queue.pop_front() {
                    Some((tag, bytes)) => {
                        state.open.insert(tag);
                        state.last_sent = tag;
                        Some((state.channel.clone(), bytes))
                    }
                    None => None,
                }
            }
        };
        let Some((channel, bytes)) = entry else { break };
        channel::send_raw(&channel.inner, bytes);
    }
}

fn maybe_close(inner: &Rc<RefCell<ThrottleInner>>) {
    let ready = {
        let state = inner.borrow();
        state.close.is_some()
            && !state.close_sent
            && state.open.is_empty()
            && state.queue.is_empty()
    };
    if !ready || extra_unacked(inner) > 0 {
        return;
    }
    chain_channel_close(inner);
}

fn chain_channel_close(inner: &Rc<RefCell<ThrottleInner>>) {
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

fn handle_error(inner: &Rc<RefCell<ThrottleInner>>, message: &str) {
    crate::tagger::fire_tap(
        inner,
        |state| &mut state.tap,
        &Confirmation::Error(message.to_owned()),
    );

    // the channel is broken, the queue will never drain
    inner.borrow_mut().queue.clear();

    let callback = inner.borrow_mut().error_cb.take();
    if let Some(mut callback) = callback {
        callback(message);
        let mut state = inner.borrow_mut();
        if state.error_cb.is_none() {
            state.error_cb = Some(callback);
        }
    }
}
