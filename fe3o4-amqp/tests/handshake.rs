//! Connection handshake and parse loop behavior

mod common;

use bytes::BytesMut;
use common::{open_ok_frame, start_frame, tune_frame, Event, Peer};
use fe3o4_amqp::types::frame::{connection as wire, encode_frame, Frame, Method};

#[test]
fn handshake_emits_start_ok_tune_ok_and_open() {
    let peer = Peer::with_heartbeat(60);

    peer.deliver(start_frame());
    let frames = peer.drain();
    assert_eq!(frames.len(), 1);
    match &frames[0] {
        Frame::Method {
            channel: 0,
            method: Method::Connection(wire::Method::StartOk(start_ok)),
        } => {
            assert_eq!(start_ok.mechanism, "PLAIN");
            assert_eq!(&start_ok.response[..], b"\0guest\0guest");
            assert_eq!(start_ok.locale, "en_US");
            assert!(start_ok.client_properties.get("product").is_some());
        }
        other => panic!("expected start-ok, got {other:?}"),
    }

    peer.deliver(tune_frame(2047, 131_072, 60));
    let frames = peer.drain();
    assert_eq!(frames.len(), 2);
    match &frames[0] {
        Frame::Method {
            channel: 0,
            method: Method::Connection(wire::Method::TuneOk(tune_ok)),
        } => {
            assert_eq!(tune_ok.channel_max, 2047);
            assert_eq!(tune_ok.frame_max, 131_072);
            assert_eq!(tune_ok.heartbeat, 60);
        }
        other => panic!("expected tune-ok, got {other:?}"),
    }
    match &frames[1] {
        Frame::Method {
            channel: 0,
            method: Method::Connection(wire::Method::Open(open)),
        } => assert_eq!(open.vhost, "/"),
        other => panic!("expected open, got {other:?}"),
    }
    assert_eq!(peer.connection.max_frame(), 131_072);

    assert!(!peer.connection.connected());
    peer.deliver(open_ok_frame());
    assert!(peer.connection.connected());
    assert_eq!(peer.take_events(), vec![Event::Ready]);
}

#[test]
fn frames_sent_before_connected_are_queued_until_open_ok() {
    let peer = Peer::new();

    // a channel opened mid-handshake may not hit the wire yet
    let channel = fe3o4_amqp::Channel::new(&peer.connection);
    assert_eq!(channel.id(), 1);
    assert!(peer.drain().is_empty());

    peer.deliver(start_frame());
    peer.deliver(tune_frame(0, 131_072, 0));
    let handshake: Vec<_> = peer.drain();
    assert_eq!(handshake.len(), 3); // start-ok, tune-ok, open

    peer.deliver(open_ok_frame());
    let flushed = peer.drain();
    assert_eq!(flushed.len(), 1);
    assert!(matches!(
        flushed[0],
        Frame::Method {
            channel: 1,
            method: Method::Channel(_)
        }
    ));
}

#[test]
fn partial_frames_are_left_unconsumed() {
    let peer = Peer::connected();

    let mut buf = BytesMut::new();
    encode_frame(&common::start_frame(), &mut buf).unwrap();

    assert_eq!(peer.connection.expected(), 7);
    // nothing useful in less than a header
    assert_eq!(peer.deliver_bytes(&buf[..5]), 0);
    assert_eq!(peer.connection.expected(), 7);
    // with the header visible the engine knows the full frame size
    assert_eq!(peer.deliver_bytes(&buf[..10]), 0);
    assert_eq!(peer.connection.expected(), buf.len() as u32);
}

#[test]
fn heartbeats_are_echoed() {
    let peer = Peer::connected();
    peer.deliver(Frame::Heartbeat { channel: 0 });
    assert_eq!(peer.take_events(), vec![Event::Heartbeat]);
    let frames = peer.drain();
    assert_eq!(frames, vec![Frame::Heartbeat { channel: 0 }]);

    assert!(peer.connection.heartbeat());
    assert_eq!(peer.drain(), vec![Frame::Heartbeat { channel: 0 }]);
}

#[test]
fn bad_end_marker_kills_the_connection() {
    let peer = Peer::connected();
    let mut buf = BytesMut::new();
    encode_frame(&Frame::Heartbeat { channel: 0 }, &mut buf).unwrap();
    let last = buf.len() - 1;
    buf[last] = 0x42;

    peer.deliver_bytes(&buf);
    let events = peer.take_events();
    assert!(matches!(events.as_slice(), [Event::Error(_)]));
    assert!(!peer.connection.usable());
    // once dead, nothing is consumed any more
    assert_eq!(peer.deliver(Frame::Heartbeat { channel: 0 }), 0);
}

#[test]
fn oversized_frames_are_rejected() {
    let peer = Peer::connected();
    let max = peer.connection.max_frame();

    // a frame that claims a payload bigger than max-frame minus overhead
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&[3, 0, 1]);
    buf.extend_from_slice(&(max - 7).to_be_bytes());
    peer.deliver_bytes(&buf);

    let events = peer.take_events();
    assert!(matches!(events.as_slice(), [Event::Error(_)]));
}

#[test]
fn frames_for_unknown_channels_are_protocol_violations() {
    let peer = Peer::connected();
    peer.deliver(Frame::Method {
        channel: 9,
        method: Method::Channel(
            fe3o4_amqp::types::frame::channel::Method::OpenOk(
                fe3o4_amqp::types::frame::channel::OpenOk {
                    channel_id: bytes::Bytes::new(),
                },
            ),
        ),
    });
    let events = peer.take_events();
    assert!(matches!(events.as_slice(), [Event::Error(message)] if message.contains("unknown channel")));
}

#[test]
fn user_close_walks_channels_then_closes_the_connection() {
    let peer = Peer::connected();
    let channel = fe3o4_amqp::Channel::new(&peer.connection);
    peer.deliver(Frame::Method {
        channel: 1,
        method: Method::Channel(fe3o4_amqp::types::frame::channel::Method::OpenOk(
            fe3o4_amqp::types::frame::channel::OpenOk {
                channel_id: bytes::Bytes::new(),
            },
        )),
    });
    peer.drain();

    assert!(peer.connection.close());
    let frames = peer.drain();
    assert_eq!(frames.len(), 2);
    assert!(matches!(
        frames[0],
        Frame::Method {
            channel: 1,
            method: Method::Channel(wire_channel::Method::Close(_))
        }
    ));
    assert!(matches!(
        frames[1],
        Frame::Method {
            channel: 0,
            method: Method::Connection(wire::Method::Close(_))
        }
    ));
    assert!(!channel.usable());

    peer.deliver(Frame::Method {
        channel: 0,
        method: Method::Connection(wire::Method::CloseOk),
    });
    assert_eq!(peer.take_events(), vec![Event::Closed]);
}

use fe3o4_amqp::types::frame::channel as wire_channel;

#[test]
fn broker_close_is_confirmed_and_surfaced() {
    let peer = Peer::connected();
    peer.deliver(Frame::Method {
        channel: 0,
        method: Method::Connection(wire::Method::Close(wire::Close {
            reply_code: 320,
            reply_text: "CONNECTION_FORCED - shutting down".to_owned(),
            failing_class_id: 0,
            failing_method_id: 0,
        })),
    });

    let frames = peer.drain();
    assert!(matches!(
        frames.as_slice(),
        [Frame::Method {
            channel: 0,
            method: Method::Connection(wire::Method::CloseOk)
        }]
    ));
    let events = peer.take_events();
    assert!(
        matches!(events.as_slice(), [Event::Error(message)] if message.contains("CONNECTION_FORCED"))
    );
}

#[test]
fn transport_loss_fails_everything_with_connection_lost() {
    let peer = Peer::connected();
    let channel = fe3o4_amqp::Channel::new(&peer.connection);
    peer.drain();

    let seen = std::rc::Rc::new(std::cell::RefCell::new(String::new()));
    let seen2 = seen.clone();
    let _ = channel
        .declare_queue("q", 0, fe3o4_amqp::Table::new())
        .on_error(move |message| *seen2.borrow_mut() = message.to_owned());

    assert!(peer.connection.fail("connection lost"));
    assert_eq!(&*seen.borrow(), "connection lost");
    let events = peer.take_events();
    assert!(matches!(events.as_slice(), [Event::Error(message)] if message == "connection lost"));
    assert!(!peer.connection.fail("again"));
}
