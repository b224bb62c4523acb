//! A scripted broker for driving the engine without a socket
//!
//! The recording handler captures every byte the engine emits; the peer
//! decodes those bytes back into typed frames for assertions and feeds
//! broker-side frames into the parse loop.

use std::cell::RefCell;
use std::rc::Rc;

use bytes::{Bytes, BytesMut};
use fe3o4_amqp::types::constants::PROTOCOL_HEADER;
use fe3o4_amqp::types::frame::{connection as wire, decode_frame, encode_frame, Frame, Method};
use fe3o4_amqp::types::value::Table;
use fe3o4_amqp::{Connection, ConnectionHandler, Login};

#[derive(Debug, PartialEq, Eq)]
pub enum Event {
    Ready,
    Closed,
    Error(String),
    Heartbeat,
}

#[derive(Default)]
pub struct Record {
    pub data: BytesMut,
    pub events: Vec<Event>,
}

pub struct RecordingHandler {
    record: Rc<RefCell<Record>>,
    heartbeat: u16,
}

impl ConnectionHandler for RecordingHandler {
    fn on_data(&mut self, buffer: &[u8]) {
        self.record.borrow_mut().data.extend_from_slice(buffer);
    }

    fn on_negotiate(&mut self, _suggested: u16) -> u16 {
        self.heartbeat
    }

    fn on_ready(&mut self) {
        self.record.borrow_mut().events.push(Event::Ready);
    }

    fn on_error(&mut self, message: &str) {
        self.record
            .borrow_mut()
            .events
            .push(Event::Error(message.to_owned()));
    }

    fn on_closed(&mut self) {
        self.record.borrow_mut().events.push(Event::Closed);
    }

    fn on_heartbeat(&mut self) {
        self.record.borrow_mut().events.push(Event::Heartbeat);
    }
}

pub struct Peer {
    pub connection: Connection,
    pub record: Rc<RefCell<Record>>,
}

#[allow(dead_code)]
impl Peer {
    /// An engine that has sent its protocol header but seen nothing yet
    pub fn new() -> Peer {
        Peer::with_heartbeat(60)
    }

    pub fn with_heartbeat(heartbeat: u16) -> Peer {
        let record = Rc::new(RefCell::new(Record::default()));
        let handler = RecordingHandler {
            record: record.clone(),
            heartbeat,
        };
        let connection = Connection::new(handler, Login::default(), "/");
        let peer = Peer { connection, record };

        // the engine speaks first
        let header: Vec<u8> = peer.record.borrow_mut().data.split_to(8).to_vec();
        assert_eq!(header, PROTOCOL_HEADER);
        peer
    }

    /// An engine driven through the complete handshake
    pub fn connected() -> Peer {
        let peer = Peer::new();
        peer.deliver(start_frame());
        peer.deliver(tune_frame(2047, 131_072, 60));
        peer.deliver(open_ok_frame());
        peer.drain();
        assert_eq!(peer.take_events(), vec![Event::Ready]);
        assert!(peer.connection.connected());
        peer
    }

    /// Feed one broker frame into the engine
    pub fn deliver(&self, frame: Frame) -> usize {
        let mut buf = BytesMut::new();
        encode_frame(&frame, &mut buf).unwrap();
        self.connection.parse(&buf)
    }

    /// Feed raw bytes into the engine
    pub fn deliver_bytes(&self, bytes: &[u8]) -> usize {
        self.connection.parse(bytes)
    }

    /// Decode and drain every complete frame the engine has emitted
    pub fn drain(&self) -> Vec<Frame> {
        let mut frames = Vec::new();
        let mut record = self.record.borrow_mut();
        loop {
            match decode_frame(&record.data, 0).unwrap() {
                Some((frame, consumed)) => {
                    let _ = record.data.split_to(consumed);
                    frames.push(frame);
                }
                None => break,
            }
        }
        frames
    }

    pub fn take_events(&self) -> Vec<Event> {
        std::mem::take(&mut self.record.borrow_mut().events)
    }
}

pub fn start_frame() -> Frame {
    Frame::Method {
        channel: 0,
        method: Method::Connection(wire::Method::Start(wire::Start {
            version_major: 0,
            version_minor: 9,
            server_properties: Table::new(),
            mechanisms: Bytes::from_static(b"PLAIN"),
            locales: Bytes::from_static(b"en_US"),
        })),
    }
}

pub fn tune_frame(channel_max: u16, frame_max: u32, heartbeat: u16) -> Frame {
    Frame::Method {
        channel: 0,
        method: Method::Connection(wire::Method::Tune(wire::Tune {
            channel_max,
            frame_max,
            heartbeat,
        })),
    }
}

pub fn open_ok_frame() -> Frame {
    Frame::Method {
        channel: 0,
        method: Method::Connection(wire::Method::OpenOk(wire::OpenOk {
            known_hosts: String::new(),
        })),
    }
}
