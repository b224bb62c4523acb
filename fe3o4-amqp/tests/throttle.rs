//! Bounded in-flight publishing through the throttle

mod common;

use std::cell::RefCell;
use std::rc::Rc;

use bytes::Bytes;
use common::Peer;
use fe3o4_amqp::types::frame::{basic, channel as wire, confirm, Frame, Method};
use fe3o4_amqp::{Channel, Publisher, Reliable, Throttle};

fn open_channel(peer: &Peer) -> Channel {
    let channel = Channel::new(&peer.connection);
    peer.deliver(Frame::Method {
        channel: channel.id(),
        method: Method::Channel(wire::Method::OpenOk(wire::OpenOk {
            channel_id: Bytes::new(),
        })),
    });
    peer.drain();
    channel
}

fn select_ok(peer: &Peer) {
    peer.deliver(Frame::Method {
        channel: 1,
        method: Method::Confirm(confirm::Method::SelectOk),
    });
}

fn ack(delivery_tag: u64, multiple: bool) -> Frame {
    Frame::Method {
        channel: 1,
        method: Method::Basic(basic::Method::Ack(basic::Ack {
            delivery_tag,
            multiple,
        })),
    }
}

/// Count complete publish sequences in the emitted frames
fn published_bodies(frames: &[Frame]) -> Vec<Vec<u8>> {
    frames
        .iter()
        .filter_map(|frame| match frame {
            Frame::Body { payload, .. } => Some(payload.to_vec()),
            _ => None,
        })
        .collect()
}

#[test]
fn publishes_beyond_the_limit_are_queued() {
    let peer = Peer::connected();
    let channel = open_channel(&peer);
    let throttle = Throttle::new(&channel, 2);
    select_ok(&peer);
    peer.drain();

    let tags: Vec<u64> = ["m1", "m2", "m3", "m4", "m5"]
        .iter()
        .map(|name| throttle.publish("", "q1", 0, &(*name).into()))
        .collect();
    assert_eq!(tags, vec![1, 2, 3, 4, 5]);
    assert_eq!(throttle.queued(), 3);
    assert_eq!(throttle.unacknowledged(), 5);

    // only the first two made it to the wire
    assert_eq!(published_bodies(&peer.drain()), vec![b"m1".to_vec(), b"m2".to_vec()]);

    // a single ack frees one slot
    peer.deliver(ack(1, false));
    assert_eq!(published_bodies(&peer.drain()), vec![b"m3".to_vec()]);
    assert_eq!(throttle.queued(), 2);

    // a multiple ack frees the rest of the window
    peer.deliver(ack(3, true));
    assert_eq!(
        published_bodies(&peer.drain()),
        vec![b"m4".to_vec(), b"m5".to_vec()]
    );
    assert_eq!(throttle.queued(), 0);
    assert_eq!(throttle.unacknowledged(), 2);

    peer.deliver(ack(5, true));
    assert_eq!(throttle.unacknowledged(), 0);
}

#[test]
fn flush_ignores_the_limit() {
    let peer = Peer::connected();
    let channel = open_channel(&peer);
    let throttle = Throttle::new(&channel, 1);
    select_ok(&peer);
    peer.drain();

    for name in ["m1", "m2", "m3"] {
        throttle.publish("", "q1", 0, &name.into());
    }
    assert_eq!(throttle.queued(), 2);

    assert_eq!(throttle.flush(1), 1);
    assert_eq!(throttle.queued(), 1);
    assert_eq!(throttle.flush(0), 1);
    assert_eq!(throttle.queued(), 0);
    assert_eq!(
        published_bodies(&peer.drain()),
        vec![b"m1".to_vec(), b"m2".to_vec(), b"m3".to_vec()]
    );
}

#[test]
fn close_waits_until_queue_and_window_drain() {
    let peer = Peer::connected();
    let channel = open_channel(&peer);
    let throttle = Throttle::new(&channel, 1);
    select_ok(&peer);
    peer.drain();

    throttle.publish("", "q1", 0, &"m1".into());
    throttle.publish("", "q1", 0, &"m2".into());
    assert_eq!(throttle.queued(), 1);

    let closed = Rc::new(RefCell::new(false));
    let closed2 = closed.clone();
    let _ = throttle
        .close()
        .on_success(move || *closed2.borrow_mut() = true);

    // closing refuses new publishes
    assert_eq!(throttle.publish("", "q1", 0, &"m3".into()), 0);

    peer.deliver(ack(1, false));
    // the ack released the queued publish, not the channel close
    let frames = peer.drain();
    assert_eq!(published_bodies(&frames).len(), 1);
    assert!(!frames
        .iter()
        .any(|frame| matches!(frame, Frame::Method { method: Method::Channel(wire::Method::Close(_)), .. })));

    peer.deliver(ack(2, false));
    let frames = peer.drain();
    assert!(frames
        .iter()
        .any(|frame| matches!(frame, Frame::Method { method: Method::Channel(wire::Method::Close(_)), .. })));

    peer.deliver(Frame::Method {
        channel: 1,
        method: Method::Channel(wire::Method::CloseOk),
    });
    assert!(*closed.borrow());
}

#[test]
fn reliable_over_throttle_combines_callbacks_and_backpressure() {
    let peer = Peer::connected();
    let channel = open_channel(&peer);
    let reliable = Reliable::new(Throttle::new(&channel, 2));
    select_ok(&peer);
    peer.drain();

    let log = Rc::new(RefCell::new(Vec::new()));
    for name in ["m1", "m2", "m3"] {
        let on_ack = log.clone();
        let _ = reliable
            .publish("", "q1", 0, &name.into())
            .on_ack(move || on_ack.borrow_mut().push(name));
    }
    assert_eq!(reliable.base().queued(), 1);
    assert_eq!(published_bodies(&peer.drain()).len(), 2);

    // the per-message callback fires before the queue drains, so the ack
    // order is observable even while backpressure is in effect
    peer.deliver(ack(2, true));
    assert_eq!(&*log.borrow(), &["m1", "m2"]);
    assert_eq!(published_bodies(&peer.drain()), vec![b"m3".to_vec()]);

    peer.deliver(ack(3, false));
    assert_eq!(&*log.borrow(), &["m1", "m2", "m3"]);
    assert_eq!(reliable.unacknowledged(), 0);
}

#[test]
fn errors_clear_the_queue() {
    let peer = Peer::connected();
    let channel = open_channel(&peer);
    let throttle = Throttle::new(&channel, 1);
    select_ok(&peer);
    peer.drain();

    let errors = Rc::new(RefCell::new(Vec::new()));
    let errors2 = errors.clone();
    throttle.on_error(move |message| errors2.borrow_mut().push(message.to_owned()));

    throttle.publish("", "q1", 0, &"m1".into());
    throttle.publish("", "q1", 0, &"m2".into());
    assert_eq!(throttle.queued(), 1);

    peer.deliver(Frame::Method {
        channel: 1,
        method: Method::Channel(wire::Method::Close(wire::Close {
            reply_code: 406,
            reply_text: "PRECONDITION_FAILED".to_owned(),
            failing_class_id: 0,
            failing_method_id: 0,
        })),
    });

    assert_eq!(errors.borrow().len(), 1);
    assert_eq!(throttle.queued(), 0);
    assert_eq!(throttle.publish("", "q1", 0, &"m3".into()), 0);
}
