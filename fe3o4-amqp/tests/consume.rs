//! Consuming, fetching and returned messages, including reassembly edges

mod common;

use std::cell::RefCell;
use std::rc::Rc;

use bytes::Bytes;
use common::{Event, Peer};
use fe3o4_amqp::types::content::ContentHeader;
use fe3o4_amqp::types::frame::{basic, channel as wire, Frame, Method};
use fe3o4_amqp::types::properties::Properties;
use fe3o4_amqp::{flags, Channel, Table};

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

fn start_consumer(peer: &Peer, channel: &Channel) -> Rc<RefCell<Vec<(Vec<u8>, u64, bool)>>> {
    let received = Rc::new(RefCell::new(Vec::new()));
    let sink = received.clone();
    let _ = channel
        .consume("q1", "", 0, Table::new())
        .on_message(move |message, delivery_tag, redelivered| {
            sink.borrow_mut()
                .push((message.body().to_vec(), delivery_tag, redelivered));
        });
    peer.deliver(Frame::Method {
        channel: 1,
        method: Method::Basic(basic::Method::ConsumeOk(basic::ConsumeOk {
            consumer_tag: "ctag-1".to_owned(),
        })),
    });
    peer.drain();
    received
}

fn deliver_frame(delivery_tag: u64) -> Frame {
    Frame::Method {
        channel: 1,
        method: Method::Basic(basic::Method::Deliver(basic::Deliver {
            consumer_tag: "ctag-1".to_owned(),
            delivery_tag,
            redelivered: false,
            exchange: String::new(),
            routing_key: "q1".to_owned(),
        })),
    }
}

fn header(body_size: u64) -> Frame {
    Frame::Header {
        channel: 1,
        header: ContentHeader::basic(body_size, Properties::default()),
    }
}

fn body(payload: &str) -> Frame {
    Frame::Body {
        channel: 1,
        payload: Bytes::copy_from_slice(payload.as_bytes()),
    }
}

#[test]
fn consume_ok_reports_the_assigned_tag() {
    let peer = Peer::connected();
    let channel = open_channel(&peer);

    let tag = Rc::new(RefCell::new(String::new()));
    let tag2 = tag.clone();
    let _ = channel
        .consume("q1", "", 0, Table::new())
        .on_success(move |assigned| *tag2.borrow_mut() = assigned.to_owned());

    let frames = peer.drain();
    assert!(matches!(
        frames.as_slice(),
        [Frame::Method {
            channel: 1,
            method: Method::Basic(basic::Method::Consume(_))
        }]
    ));

    peer.deliver(Frame::Method {
        channel: 1,
        method: Method::Basic(basic::Method::ConsumeOk(basic::ConsumeOk {
            consumer_tag: "amq.ctag-xyz".to_owned(),
        })),
    });
    assert_eq!(&*tag.borrow(), "amq.ctag-xyz");
}

#[test]
fn fragmented_body_reassembles_to_one_message() {
    let peer = Peer::connected();
    let channel = open_channel(&peer);
    let received = start_consumer(&peer, &channel);

    peer.deliver(deliver_frame(7));
    peer.deliver(header(10));
    assert!(received.borrow().is_empty());
    peer.deliver(body("hello"));
    assert!(received.borrow().is_empty());
    peer.deliver(body(" wrld"));

    let received = received.borrow();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0], (b"hello wrld".to_vec(), 7, false));
    assert!(peer.connection.connected());
}

#[test]
fn streaming_hooks_see_every_chunk_without_a_message() {
    let peer = Peer::connected();
    let channel = open_channel(&peer);

    let log = Rc::new(RefCell::new(Vec::new()));
    let on_begin = log.clone();
    let on_size = log.clone();
    let on_data = log.clone();
    let on_complete = log.clone();
    let _ = channel
        .consume("q1", "", 0, Table::new())
        .on_begin(move || on_begin.borrow_mut().push("begin".to_owned()))
        .on_size(move |size| on_size.borrow_mut().push(format!("size {size}")))
        .on_data(move |chunk| {
            on_data
                .borrow_mut()
                .push(format!("data {}", chunk.len()))
        })
        .on_complete(move |tag, _| on_complete.borrow_mut().push(format!("complete {tag}")));
    peer.deliver(Frame::Method {
        channel: 1,
        method: Method::Basic(basic::Method::ConsumeOk(basic::ConsumeOk {
            consumer_tag: "ctag-1".to_owned(),
        })),
    });
    peer.drain();

    peer.deliver(deliver_frame(3));
    peer.deliver(header(10));
    peer.deliver(body("hello"));
    peer.deliver(body(" wrld"));

    assert_eq!(
        &*log.borrow(),
        &["begin", "size 10", "data 5", "data 5", "complete 3"]
    );
}

#[test]
fn zero_size_body_completes_on_the_header() {
    let peer = Peer::connected();
    let channel = open_channel(&peer);
    let received = start_consumer(&peer, &channel);

    peer.deliver(deliver_frame(8));
    peer.deliver(header(0));

    let received = received.borrow();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].0, b"");
}

#[test]
fn body_overrun_fails_the_channel() {
    let peer = Peer::connected();
    let channel = open_channel(&peer);
    let received = start_consumer(&peer, &channel);

    let errors = Rc::new(RefCell::new(Vec::new()));
    let errors2 = errors.clone();
    channel.on_error(move |message| errors2.borrow_mut().push(message.to_owned()));

    peer.deliver(deliver_frame(7));
    peer.deliver(header(10));
    // a single chunk bigger than the announced size
    peer.deliver(body("hello world"));

    assert!(received.borrow().is_empty());
    assert_eq!(errors.borrow().len(), 1);
    assert!(!channel.usable());
    assert_eq!(peer.connection.channels(), 0);
}

#[test]
fn stray_body_frame_after_completion_is_a_protocol_violation() {
    let peer = Peer::connected();
    let channel = open_channel(&peer);
    let received = start_consumer(&peer, &channel);

    peer.deliver(deliver_frame(7));
    peer.deliver(header(10));
    peer.deliver(body("hello"));
    peer.deliver(body(" worl"));
    // the message completed at exactly 10 bytes, the trailing byte is
    // outside any message
    peer.deliver(body("d"));

    assert_eq!(received.borrow().len(), 1);
    let events = peer.take_events();
    assert!(matches!(events.as_slice(), [Event::Error(_)]));
    assert!(!channel.usable());
}

#[test]
fn consumers_are_dispatched_by_tag_and_replaced_on_duplicates() {
    let peer = Peer::connected();
    let channel = open_channel(&peer);

    let first = Rc::new(RefCell::new(0));
    let second = Rc::new(RefCell::new(0));
    let first2 = first.clone();
    let second2 = second.clone();

    let _ = channel
        .consume("q1", "", 0, Table::new())
        .on_message(move |_, _, _| *first2.borrow_mut() += 1);
    peer.deliver(Frame::Method {
        channel: 1,
        method: Method::Basic(basic::Method::ConsumeOk(basic::ConsumeOk {
            consumer_tag: "ctag-1".to_owned(),
        })),
    });

    // the broker is authoritative: a second consume-ok with the same tag
    // replaces the first consumer
    let _ = channel
        .consume("q2", "", 0, Table::new())
        .on_message(move |_, _, _| *second2.borrow_mut() += 1);
    peer.deliver(Frame::Method {
        channel: 1,
        method: Method::Basic(basic::Method::ConsumeOk(basic::ConsumeOk {
            consumer_tag: "ctag-1".to_owned(),
        })),
    });
    peer.drain();

    peer.deliver(deliver_frame(1));
    peer.deliver(header(2));
    peer.deliver(body("ok"));

    assert_eq!(*first.borrow(), 0);
    assert_eq!(*second.borrow(), 1);
}

#[test]
fn cancel_removes_the_consumer() {
    let peer = Peer::connected();
    let channel = open_channel(&peer);
    let received = start_consumer(&peer, &channel);

    let cancelled = Rc::new(RefCell::new(String::new()));
    let cancelled2 = cancelled.clone();
    let _ = channel
        .cancel("ctag-1", 0)
        .on_success(move |tag| *cancelled2.borrow_mut() = tag.to_owned());
    peer.deliver(Frame::Method {
        channel: 1,
        method: Method::Basic(basic::Method::CancelOk(basic::CancelOk {
            consumer_tag: "ctag-1".to_owned(),
        })),
    });
    assert_eq!(&*cancelled.borrow(), "ctag-1");

    // a late delivery for the cancelled consumer is swallowed cleanly
    peer.deliver(deliver_frame(2));
    peer.deliver(header(2));
    peer.deliver(body("ok"));
    assert!(received.borrow().is_empty());
    assert!(peer.connection.connected());
}

#[test]
fn server_initiated_cancel_fires_the_hook() {
    let peer = Peer::connected();
    let channel = open_channel(&peer);

    let gone = Rc::new(RefCell::new(String::new()));
    let gone2 = gone.clone();
    let _ = channel
        .consume("q1", "", 0, Table::new())
        .on_cancelled(move |tag| *gone2.borrow_mut() = tag.to_owned());
    peer.deliver(Frame::Method {
        channel: 1,
        method: Method::Basic(basic::Method::ConsumeOk(basic::ConsumeOk {
            consumer_tag: "ctag-1".to_owned(),
        })),
    });
    peer.drain();

    peer.deliver(Frame::Method {
        channel: 1,
        method: Method::Basic(basic::Method::Cancel(basic::Cancel {
            consumer_tag: "ctag-1".to_owned(),
            nowait: false,
        })),
    });
    assert_eq!(&*gone.borrow(), "ctag-1");
    // the engine confirms the cancel back to the broker
    let frames = peer.drain();
    assert!(matches!(
        frames.as_slice(),
        [Frame::Method {
            channel: 1,
            method: Method::Basic(basic::Method::CancelOk(_))
        }]
    ));
}

#[test]
fn get_resolves_with_a_message_or_empty() {
    let peer = Peer::connected();
    let channel = open_channel(&peer);

    let outcome = Rc::new(RefCell::new(Vec::new()));
    let on_message = outcome.clone();
    let on_count = outcome.clone();
    let _ = channel
        .get("q1", flags::NOACK)
        .on_success(move |message, delivery_tag, _| {
            on_message
                .borrow_mut()
                .push(format!("message {:?} tag {delivery_tag}", message.body()));
        })
        .on_count(move |count| on_count.borrow_mut().push(format!("count {count}")));
    peer.drain();

    peer.deliver(Frame::Method {
        channel: 1,
        method: Method::Basic(basic::Method::GetOk(basic::GetOk {
            delivery_tag: 9,
            redelivered: false,
            exchange: String::new(),
            routing_key: "q1".to_owned(),
            message_count: 4,
        })),
    });
    peer.deliver(header(2));
    peer.deliver(body("ok"));
    assert_eq!(
        &*outcome.borrow(),
        &["count 4".to_owned(), format!("message {:?} tag 9", b"ok")]
    );

    let empty = Rc::new(RefCell::new(false));
    let empty2 = empty.clone();
    let _ = channel
        .get("q1", 0)
        .on_empty(move || *empty2.borrow_mut() = true);
    peer.drain();
    peer.deliver(Frame::Method {
        channel: 1,
        method: Method::Basic(basic::Method::GetEmpty(basic::GetEmpty {
            cluster_id: String::new(),
        })),
    });
    assert!(*empty.borrow());
}

#[test]
fn returned_messages_reach_the_bounce_callback() {
    let peer = Peer::connected();
    let channel = open_channel(&peer);

    let bounced = Rc::new(RefCell::new(Vec::new()));
    let bounced2 = bounced.clone();
    let _ = channel
        .on_returned()
        .on_returned(move |message, code, text| {
            bounced2
                .borrow_mut()
                .push((message.body().to_vec(), code, text.to_owned()));
        });

    assert!(channel.publish("ex", "nowhere", flags::MANDATORY, &"lost".into()));
    peer.drain();

    peer.deliver(Frame::Method {
        channel: 1,
        method: Method::Basic(basic::Method::Return(basic::Return {
            reply_code: 312,
            reply_text: "NO_ROUTE".to_owned(),
            exchange: "ex".to_owned(),
            routing_key: "nowhere".to_owned(),
        })),
    });
    peer.deliver(header(4));
    peer.deliver(body("lost"));

    let bounced = bounced.borrow();
    assert_eq!(bounced.len(), 1);
    assert_eq!(bounced[0], (b"lost".to_vec(), 312, "NO_ROUTE".to_owned()));
}

#[test]
fn publish_splits_bodies_at_the_max_frame_boundary() {
    let peer = Peer::connected();
    let channel = open_channel(&peer);

    let max_payload = (peer.connection.max_frame() - 8) as usize;
    let message = "x".repeat(max_payload * 2 + 10);
    assert!(channel.publish("", "q1", 0, &message.as_str().into()));

    let frames = peer.drain();
    assert_eq!(frames.len(), 5); // publish, header, three body chunks
    match &frames[1] {
        Frame::Header { header, .. } => assert_eq!(header.body_size, message.len() as u64),
        other => panic!("expected content header, got {other:?}"),
    }
    let sizes: Vec<usize> = frames[2..]
        .iter()
        .map(|frame| match frame {
            Frame::Body { payload, .. } => payload.len(),
            other => panic!("expected body frame, got {other:?}"),
        })
        .collect();
    assert_eq!(sizes, vec![max_payload, max_payload, 10]);
}
