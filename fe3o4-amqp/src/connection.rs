//! The connection-level state machine
//!
//! Owns the handshake (protocol header, SASL PLAIN, tune negotiation,
//! open), the channel table, the pre-handshake outbound queue and the
//! parse loop that turns inbound bytes into dispatched frames.
//!
//! The engine is sans-IO: it never blocks, spawns nothing and owns no
//! socket. Inbound bytes are pushed in through [`Connection::parse`];
//! outbound bytes leave through the [`ConnectionHandler`]'s `on_data`.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use bytes::{Bytes, BytesMut};
use fe3o4_amqp_types::constants::PROTOCOL_HEADER;
use fe3o4_amqp_types::frame::{connection as wire, decode_frame, encode_frame, Frame, Method};
use fe3o4_amqp_types::value::Table;
use fe3o4_amqp_types::Error as WireError;

use crate::address::{Address, Login};
use crate::channel::{self, ChannelState};
use crate::handler::ConnectionHandler;
use crate::monitor::Monitor;

/// Frame size limit in effect until tune negotiation overrides it.
/// Deliberately conservative; brokers normally raise it right away.
const DEFAULT_MAX_FRAME: u32 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    /// Protocol headers are being exchanged
    Protocol,
    /// Busy with the start/tune/open handshake
    Handshake,
    /// Ready for traffic
    Connected,
    /// Close frame sent, waiting for close-ok
    Closing,
    /// Dead, either cleanly or through an error
    Closed,
}

pub(crate) type HandlerCell = Rc<RefCell<dyn ConnectionHandler>>;

pub(crate) struct ConnectionState {
    pub(crate) state: State,
    handler: HandlerCell,
    login: Login,
    vhost: String,

    pub(crate) channels: HashMap<u16, Rc<RefCell<ChannelState>>>,
    next_channel: u16,
    channel_max: u16,
    pub(crate) max_frame: u32,
    heartbeat: u16,
    expected: u32,

    /// Bytes ready for the handler, delivered by [`flush`]
    outgoing: VecDeque<Bytes>,
    /// Frames held back until the handshake finishes
    queued: VecDeque<Bytes>,
    flushing: bool,
}

impl ConnectionState {
    /// Queue a frame for the transport. Frames sent while the handshake is
    /// still in progress wait in the hold-back queue unless they are part
    /// of the handshake themselves.
    pub(crate) fn send(&mut self, frame: &Frame) -> Result<(), WireError> {
        #[cfg(feature = "tracing")]
        tracing::trace!(channel = frame.channel(), "SEND {:?}", frame);
        #[cfg(feature = "log")]
        log::trace!("SEND channel={} {:?}", frame.channel(), frame);

        let mut buf = BytesMut::new();
        encode_frame(frame, &mut buf)?;
        self.send_bytes(buf.freeze(), frame.part_of_handshake());
        Ok(())
    }

    /// Queue raw, already encoded frame bytes for the transport
    pub(crate) fn send_bytes(&mut self, bytes: Bytes, part_of_handshake: bool) {
        let connecting = matches!(self.state, State::Protocol | State::Handshake);
        if connecting && !part_of_handshake {
            self.queued.push_back(bytes);
        } else {
            self.outgoing.push_back(bytes);
        }
    }

    /// Largest body chunk that fits in one frame
    pub(crate) fn max_payload(&self) -> u32 {
        self.max_frame - 8
    }

    pub(crate) fn handler(&self) -> HandlerCell {
        self.handler.clone()
    }

    pub(crate) fn usable(&self) -> bool {
        matches!(
            self.state,
            State::Protocol | State::Handshake | State::Connected
        )
    }
}

impl Drop for ConnectionState {
    fn drop(&mut self) {
        // best effort close so the broker can clean up after us
        if !matches!(self.state, State::Connected) {
            return;
        }
        self.state = State::Closed;
        let mut buf = BytesMut::new();
        for (id, chan) in &self.channels {
            if chan.borrow().is_connected() {
                let _ = encode_frame(&channel::close_frame(*id), &mut buf);
            }
        }
        let _ = encode_frame(&close_method_frame(), &mut buf);
        self.handler.borrow_mut().on_data(&buf);
    }
}

fn close_method_frame() -> Frame {
    Frame::Method {
        channel: 0,
        method: Method::Connection(wire::Method::Close(wire::Close {
            reply_code: 200,
            reply_text: String::new(),
            failing_class_id: 0,
            failing_method_id: 0,
        })),
    }
}

/// A connection to an AMQP broker
///
/// Cloning hands out another handle to the same connection; the underlying
/// state lives until the last handle is dropped, at which point a best
/// effort close frame is pushed to the handler.
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Rc<RefCell<ConnectionState>>,
}

impl Connection {
    /// Set up a connection that authenticates with the given login and
    /// opens the given vhost. The protocol header is handed to the
    /// handler's `on_data` before this returns.
    pub fn new(
        handler: impl ConnectionHandler + 'static,
        login: Login,
        vhost: impl Into<String>,
    ) -> Connection {
        let state = ConnectionState {
            state: State::Protocol,
            handler: Rc::new(RefCell::new(handler)),
            login,
            vhost: vhost.into(),
            channels: HashMap::new(),
            next_channel: 1,
            channel_max: 0,
            max_frame: DEFAULT_MAX_FRAME,
            heartbeat: 0,
            expected: 7,
            outgoing: VecDeque::new(),
            queued: VecDeque::new(),
            flushing: false,
        };
        let inner = Rc::new(RefCell::new(state));
        inner
            .borrow_mut()
            .outgoing
            .push_back(Bytes::from_static(&PROTOCOL_HEADER));
        flush(&inner);
        Connection { inner }
    }

    /// Set up a connection from a parsed address
    pub fn with_address(handler: impl ConnectionHandler + 'static, address: &Address) -> Connection {
        Connection::new(handler, address.login().clone(), address.vhost())
    }

    /// Parse a buffer of inbound bytes and return how many were consumed.
    ///
    /// The engine keeps no inbound buffer of its own: a partial frame at
    /// the end is left unconsumed and must be included again in the next
    /// call, once more bytes are available.
    pub fn parse(&self, buffer: &[u8]) -> usize {
        let inner = self.inner.clone();
        let mut processed = 0;
        loop {
            let max_frame = {
                let state = inner.borrow();
                if state.state == State::Closed {
                    break;
                }
                state.max_frame
            };
            match decode_frame(&buffer[processed..], max_frame) {
                Ok(Some((frame, consumed))) => {
                    processed += consumed;
                    inner.borrow_mut().expected = 7;
                    dispatch(&inner, frame);
                    flush(&inner);
                }
                Ok(None) => {
                    let rest = &buffer[processed..];
                    let mut state = inner.borrow_mut();
                    state.expected = if rest.len() >= 7 {
                        u32::from_be_bytes([rest[3], rest[4], rest[5], rest[6]]) + 8
                    } else {
                        7
                    };
                    break;
                }
                Err(err) => {
                    report_error(&inner, &err.to_string());
                    flush(&inner);
                    break;
                }
            }
        }
        processed
    }

    /// The number of bytes the next call to [`parse`](Connection::parse)
    /// can do something useful with: the frame header length initially,
    /// the full frame size once a header has been seen
    pub fn expected(&self) -> u32 {
        self.inner.borrow().expected
    }

    /// The max frame size currently in effect
    pub fn max_frame(&self) -> u32 {
        self.inner.borrow().max_frame
    }

    /// The heartbeat interval negotiated with the broker, in seconds
    pub fn heartbeat_interval(&self) -> u16 {
        self.inner.borrow().heartbeat
    }

    /// Number of channels currently attached
    pub fn channels(&self) -> usize {
        self.inner.borrow().channels.len()
    }

    /// Whether the handshake has completed and the connection is ready
    pub fn connected(&self) -> bool {
        self.inner.borrow().state == State::Connected
    }

    /// Whether frames can still be sent
    pub fn usable(&self) -> bool {
        self.inner.borrow().usable()
    }

    /// Send a heartbeat frame. Returns false once the connection is dead.
    pub fn heartbeat(&self) -> bool {
        {
            let mut state = self.inner.borrow_mut();
            if !state.usable() {
                return false;
            }
            let _ = state.send(&Frame::Heartbeat { channel: 0 });
        }
        flush(&self.inner);
        true
    }

    /// Gracefully close the connection: every channel gets a close frame,
    /// then the connection itself. Completion is signalled through the
    /// handler's `on_closed` when the broker confirms.
    pub fn close(&self) -> bool {
        {
            let state = self.inner.borrow();
            if state.state != State::Connected {
                return false;
            }
        }
        let channels: Vec<_> = self.inner.borrow().channels.values().cloned().collect();
        for chan in channels {
            channel::send_close(&chan);
        }
        {
            let mut state = self.inner.borrow_mut();
            state.state = State::Closing;
            let _ = state.send(&close_method_frame());
        }
        flush(&self.inner);
        true
    }

    /// The transport lost the peer. Fails every pending operation on every
    /// channel with the given reason and reports the error to the handler.
    /// Used by adapters for socket loss and connect timeouts.
    pub fn fail(&self, message: &str) -> bool {
        if self.inner.borrow().state == State::Closed {
            return false;
        }
        report_error(&self.inner, message);
        true
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.borrow();
        f.debug_struct("Connection")
            .field("state", &state.state)
            .field("channels", &state.channels.len())
            .finish_non_exhaustive()
    }
}

/// Deliver everything in the outgoing queue to the handler. Re-entrant
/// calls return immediately; the outermost flush drains whatever they
/// queued up, preserving order.
pub(crate) fn flush(inner: &Rc<RefCell<ConnectionState>>) {
    {
        let mut state = inner.borrow_mut();
        if state.flushing {
            return;
        }
        state.flushing = true;
    }
    let monitor = Monitor::new(inner);
    loop {
        let next = {
            let mut state = inner.borrow_mut();
            match state.outgoing.pop_front() {
                Some(bytes) => Some((state.handler(), bytes)),
                None => {
                    state.flushing = false;
                    None
                }
            }
        };
        let Some((handler, bytes)) = next else { break };
        match handler.try_borrow_mut() {
            Ok(mut handler) => handler.on_data(&bytes),
            // the handler is in a callback higher up the stack; leave the
            // bytes queued, the outer call flushes them in order
            Err(_) => {
                let mut state = inner.borrow_mut();
                state.outgoing.push_front(bytes);
                state.flushing = false;
                return;
            }
        }
        if !monitor.valid() {
            return;
        }
    }
}

fn dispatch(inner: &Rc<RefCell<ConnectionState>>, frame: Frame) {
    #[cfg(feature = "tracing")]
    tracing::trace!(channel = frame.channel(), "RECV {:?}", frame);
    #[cfg(feature = "log")]
    log::trace!("RECV channel={} {:?}", frame.channel(), frame);

    match frame {
        Frame::Heartbeat { .. } => {
            // echo it back and tell the handler we heard from the peer
            let handler = {
                let mut state = inner.borrow_mut();
                let _ = state.send(&Frame::Heartbeat { channel: 0 });
                state.handler()
            };
            handler.borrow_mut().on_heartbeat();
        }
        Frame::Method {
            channel: 0,
            method: Method::Connection(method),
        } => on_connection_method(inner, method),
        Frame::Method { channel: 0, .. } => {
            report_error(inner, "channel-level frame on channel 0");
        }
        Frame::Method {
            channel: id,
            method,
        } => match lookup(inner, id) {
            Some(chan) => channel::dispatch_method(&chan, method),
            None => report_error(inner, &format!("frame for unknown channel {id}")),
        },
        Frame::Header {
            channel: id,
            header,
        } => match lookup(inner, id) {
            Some(chan) => channel::dispatch_header(&chan, header),
            None => report_error(inner, &format!("frame for unknown channel {id}")),
        },
        Frame::Body {
            channel: id,
            payload,
        } => match lookup(inner, id) {
            Some(chan) => channel::dispatch_body(&chan, &payload),
            None => report_error(inner, &format!("frame for unknown channel {id}")),
        },
    }
}

fn lookup(inner: &Rc<RefCell<ConnectionState>>, id: u16) -> Option<Rc<RefCell<ChannelState>>> {
    inner.borrow().channels.get(&id).cloned()
}

fn on_connection_method(inner: &Rc<RefCell<ConnectionState>>, method: wire::Method) {
    match method {
        wire::Method::Start(start) => on_start(inner, start),
        wire::Method::Tune(tune) => on_tune(inner, tune),
        wire::Method::OpenOk(_) => on_open_ok(inner),
        wire::Method::Close(close) => on_close(inner, close),
        wire::Method::CloseOk => on_close_ok(inner),
        // only PLAIN is implemented, so a SASL challenge is unexpected
        other => report_error(
            inner,
            &format!(
                "unexpected connection frame with method {}",
                other.method_id()
            ),
        ),
    }
}

fn on_start(inner: &Rc<RefCell<ConnectionState>>, start: wire::Start) {
    let handler = {
        let mut state = inner.borrow_mut();
        if state.state != State::Protocol {
            drop(state);
            report_error(inner, "unexpected connection.start");
            return;
        }
        state.state = State::Handshake;
        state.handler()
    };

    let mut client = Table::new();
    client.insert("product", "fe3o4-amqp");
    client.insert("version", env!("CARGO_PKG_VERSION"));
    client.insert("platform", "Rust");
    client.insert("information", "https://github.com/minghuaw/fe3o4-amqp");
    handler
        .borrow_mut()
        .on_properties(&start.server_properties, &mut client);

    let monitor = Monitor::new(inner);
    if !monitor.valid() {
        return;
    }

    let mut state = inner.borrow_mut();
    let response = state.login.sasl_plain();
    let _ = state.send(&Frame::Method {
        channel: 0,
        method: Method::Connection(wire::Method::StartOk(wire::StartOk {
            client_properties: client,
            mechanism: "PLAIN".to_owned(),
            response: Bytes::from(response),
            locale: "en_US".to_owned(),
        })),
    });
}

/// Two limits of which 0 means "no limit"; pick the smaller real one
fn negotiate(client: u32, server: u32) -> u32 {
    match (client, server) {
        (0, server) => server,
        (client, 0) => client,
        (client, server) => client.min(server),
    }
}

fn on_tune(inner: &Rc<RefCell<ConnectionState>>, tune: wire::Tune) {
    let (handler, suggested) = {
        let state = inner.borrow();
        if state.state != State::Handshake {
            drop(state);
            report_error(inner, "unexpected connection.tune");
            return;
        }
        (state.handler(), tune.heartbeat)
    };

    // the transport owns the timer, so it gets to pick the interval
    let heartbeat = handler.borrow_mut().on_negotiate(suggested);
    let monitor = Monitor::new(inner);
    if !monitor.valid() {
        return;
    }

    let mut state = inner.borrow_mut();
    // no local limits of our own, so the server's caps win outright;
    // a frame-max of 0 means unlimited and keeps the default
    state.channel_max = tune.channel_max;
    let frame_max = negotiate(0, tune.frame_max);
    if frame_max > 0 {
        state.max_frame = frame_max;
    }
    state.heartbeat = heartbeat;

    let _ = state.send(&Frame::Method {
        channel: 0,
        method: Method::Connection(wire::Method::TuneOk(wire::TuneOk {
            channel_max: tune.channel_max,
            frame_max: tune.frame_max,
            heartbeat,
        })),
    });
    let vhost = state.vhost.clone();
    let _ = state.send(&Frame::Method {
        channel: 0,
        method: Method::Connection(wire::Method::Open(wire::Open::new(vhost))),
    });
}

fn on_open_ok(inner: &Rc<RefCell<ConnectionState>>) {
    let handler = {
        let mut state = inner.borrow_mut();
        if state.state != State::Handshake {
            drop(state);
            report_error(inner, "unexpected connection.open-ok");
            return;
        }
        state.state = State::Connected;
        state.handler()
    };

    let monitor = Monitor::new(inner);
    handler.borrow_mut().on_ready();
    if !monitor.valid() {
        return;
    }

    // release everything that was waiting for the handshake, in order
    let mut state = inner.borrow_mut();
    while let Some(bytes) = state.queued.pop_front() {
        state.outgoing.push_back(bytes);
    }
}

fn on_close(inner: &Rc<RefCell<ConnectionState>>, close: wire::Close) {
    {
        let mut state = inner.borrow_mut();
        let _ = state.send(&Frame::Method {
            channel: 0,
            method: Method::Connection(wire::Method::CloseOk),
        });
    }
    let message = format!("{}: {}", close.reply_code, close.reply_text);
    report_error(inner, &message);
}

fn on_close_ok(inner: &Rc<RefCell<ConnectionState>>) {
    let handler = {
        let mut state = inner.borrow_mut();
        if state.state != State::Closing {
            drop(state);
            report_error(inner, "unexpected connection.close-ok");
            return;
        }
        state.state = State::Closed;
        state.handler()
    };
    handler.borrow_mut().on_closed();
}

/// Fail the connection: every channel fails its pending operations first,
/// then the handler's `on_error` fires.
pub(crate) fn report_error(inner: &Rc<RefCell<ConnectionState>>, message: &str) {
    {
        let mut state = inner.borrow_mut();
        if state.state == State::Closed {
            return;
        }
        state.state = State::Closed;
        state.queued.clear();
    }

    #[cfg(feature = "tracing")]
    tracing::error!("connection failure: {message}");
    #[cfg(feature = "log")]
    log::error!("connection failure: {message}");

    let monitor = Monitor::new(inner);
    loop {
        let chan = {
            let mut state = inner.borrow_mut();
            match state.channels.keys().next().copied() {
                Some(id) => state.channels.remove(&id),
                None => None,
            }
        };
        let Some(chan) = chan else { break };
        channel::report_error(&chan, message);
        if !monitor.valid() {
            return;
        }
    }

    let handler = inner.borrow().handler();
    handler.borrow_mut().on_error(message);
}

/// Allot a channel id and register the channel, or return 0 when the
/// channel-max has been exhausted. Id 0 is never handed out; released ids
/// become eligible again but the cursor keeps rolling forward.
pub(crate) fn add_channel(
    state: &mut ConnectionState,
    chan: Rc<RefCell<ChannelState>>,
) -> u16 {
    if state.channel_max > 0 && state.channels.len() >= state.channel_max as usize {
        return 0;
    }
    loop {
        if state.next_channel > 0 && !state.channels.contains_key(&state.next_channel) {
            break;
        }
        state.next_channel = state.next_channel.wrapping_add(1);
    }
    let id = state.next_channel;
    state.channels.insert(id, chan);
    state.next_channel = state.next_channel.wrapping_add(1);
    id
}

pub(crate) fn remove_channel(inner: &Rc<RefCell<ConnectionState>>, id: u16) {
    if id == 0 {
        return;
    }
    inner.borrow_mut().channels.remove(&id);
}
