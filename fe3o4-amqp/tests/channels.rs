//! Channel lifecycle, id allocation and the synchronous operations

mod common;

use std::cell::RefCell;
use std::rc::Rc;

use bytes::Bytes;
use common::{Event, Peer};
use fe3o4_amqp::types::frame::{basic, channel as wire, exchange, queue, tx, Frame, Method};
use fe3o4_amqp::{flags, Channel, ExchangeType, Table};

fn open_ok(channel: u16) -> Frame {
    Frame::Method {
        channel,
        method: Method::Channel(wire::Method::OpenOk(wire::OpenOk {
            channel_id: Bytes::new(),
        })),
    }
}

fn open_channel(peer: &Peer) -> Channel {
    let channel = Channel::new(&peer.connection);
    let id = channel.id();
    peer.deliver(open_ok(id));
    peer.drain();
    channel
}

#[test]
fn channel_open_fires_on_ready_once() {
    let peer = Peer::connected();
    let channel = Channel::new(&peer.connection);
    assert_eq!(channel.id(), 1);

    let frames = peer.drain();
    assert!(matches!(
        frames.as_slice(),
        [Frame::Method {
            channel: 1,
            method: Method::Channel(wire::Method::Open(_))
        }]
    ));

    let ready = Rc::new(RefCell::new(Vec::new()));
    let ready2 = ready.clone();
    channel.on_ready(move |id| ready2.borrow_mut().push(id));

    peer.deliver(open_ok(1));
    assert_eq!(&*ready.borrow(), &[1]);

    // registration after the fact fires immediately, but the original
    // callback has been consumed
    let late = Rc::new(RefCell::new(Vec::new()));
    let late2 = late.clone();
    channel.on_ready(move |id| late2.borrow_mut().push(id));
    assert_eq!(&*late.borrow(), &[1]);
    assert_eq!(&*ready.borrow(), &[1]);
}

#[test]
fn channel_ids_skip_zero_and_do_not_rewind() {
    let peer = Peer::connected();
    let first = Channel::new(&peer.connection);
    let second = Channel::new(&peer.connection);
    let third = Channel::new(&peer.connection);
    assert_eq!(
        (first.id(), second.id(), third.id()),
        (1, 2, 3)
    );
    peer.deliver(open_ok(1));
    peer.deliver(open_ok(2));
    peer.deliver(open_ok(3));
    peer.drain();

    // closing a channel frees its id, but the cursor keeps moving
    let _ = second.close();
    peer.deliver(Frame::Method {
        channel: 2,
        method: Method::Channel(wire::Method::CloseOk),
    });
    assert_eq!(peer.connection.channels(), 2);

    let fourth = Channel::new(&peer.connection);
    assert_eq!(fourth.id(), 4);
}

#[test]
fn channel_max_is_enforced() {
    let peer = Peer::new();
    peer.deliver(common::start_frame());
    peer.deliver(common::tune_frame(2, 131_072, 0));
    peer.deliver(common::open_ok_frame());
    peer.drain();
    peer.take_events();

    let first = Channel::new(&peer.connection);
    let second = Channel::new(&peer.connection);
    assert_eq!((first.id(), second.id()), (1, 2));

    let third = Channel::new(&peer.connection);
    assert_eq!(third.id(), 0);
    let seen = Rc::new(RefCell::new(String::new()));
    let seen2 = seen.clone();
    third.on_error(move |message| *seen2.borrow_mut() = message.to_owned());
    assert_eq!(&*seen.borrow(), "max number of channels reached");

    // operations on the stillborn channel fail synchronously
    let failed = Rc::new(RefCell::new(false));
    let failed2 = failed.clone();
    let _ = third
        .declare_queue("q", 0, Table::new())
        .on_error(move |_| *failed2.borrow_mut() = true);
    assert!(*failed.borrow());
}

#[test]
fn declare_queue_reports_name_and_counts() {
    let peer = Peer::connected();
    let channel = open_channel(&peer);

    let result = Rc::new(RefCell::new(None));
    let result2 = result.clone();
    let _ = channel
        .declare_queue("q1", flags::DURABLE, Table::new())
        .on_success(move |name, messages, consumers| {
            *result2.borrow_mut() = Some((name.to_owned(), messages, consumers));
        });

    let frames = peer.drain();
    match &frames[..] {
        [Frame::Method {
            channel: 1,
            method: Method::Queue(queue::Method::Declare(declare)),
        }] => {
            assert_eq!(declare.queue, "q1");
            assert!(declare.durable);
            assert!(!declare.passive);
        }
        other => panic!("expected queue.declare, got {other:?}"),
    }

    peer.deliver(Frame::Method {
        channel: 1,
        method: Method::Queue(queue::Method::DeclareOk(queue::DeclareOk {
            queue: "q1".to_owned(),
            message_count: 0,
            consumer_count: 0,
        })),
    });
    assert_eq!(*result.borrow(), Some(("q1".to_owned(), 0, 0)));
}

#[test]
fn replies_complete_deferreds_in_request_order() {
    let peer = Peer::connected();
    let channel = open_channel(&peer);

    let order = Rc::new(RefCell::new(Vec::new()));
    let first = order.clone();
    let second = order.clone();
    let third = order.clone();

    let _ = channel
        .declare_exchange("logs", ExchangeType::Fanout, 0, Table::new())
        .on_success(move || first.borrow_mut().push("exchange"));
    let _ = channel
        .declare_queue("q1", 0, Table::new())
        .on_success(move |_, _, _| second.borrow_mut().push("queue"));
    let _ = channel
        .bind_queue("logs", "q1", "", 0, Table::new())
        .on_success(move || third.borrow_mut().push("bind"));
    peer.drain();

    peer.deliver(Frame::Method {
        channel: 1,
        method: Method::Exchange(exchange::Method::DeclareOk),
    });
    peer.deliver(Frame::Method {
        channel: 1,
        method: Method::Queue(queue::Method::DeclareOk(queue::DeclareOk {
            queue: "q1".to_owned(),
            message_count: 0,
            consumer_count: 0,
        })),
    });
    peer.deliver(Frame::Method {
        channel: 1,
        method: Method::Queue(queue::Method::BindOk),
    });

    assert_eq!(&*order.borrow(), &["exchange", "queue", "bind"]);
}

#[test]
fn purge_and_delete_report_message_counts() {
    let peer = Peer::connected();
    let channel = open_channel(&peer);

    let purged = Rc::new(RefCell::new(0));
    let purged2 = purged.clone();
    let _ = channel
        .purge_queue("q1", 0)
        .on_success(move |count| *purged2.borrow_mut() = count);
    let deleted = Rc::new(RefCell::new(0));
    let deleted2 = deleted.clone();
    let _ = channel
        .remove_queue("q1", flags::IFEMPTY)
        .on_success(move |count| *deleted2.borrow_mut() = count);
    peer.drain();

    peer.deliver(Frame::Method {
        channel: 1,
        method: Method::Queue(queue::Method::PurgeOk(queue::PurgeOk { message_count: 7 })),
    });
    peer.deliver(Frame::Method {
        channel: 1,
        method: Method::Queue(queue::Method::DeleteOk(queue::DeleteOk { message_count: 3 })),
    });
    assert_eq!(*purged.borrow(), 7);
    assert_eq!(*deleted.borrow(), 3);
}

#[test]
fn nowait_operations_succeed_synchronously() {
    let peer = Peer::connected();
    let channel = open_channel(&peer);

    let done = Rc::new(RefCell::new(false));
    let done2 = done.clone();
    let _ = channel
        .declare_exchange("logs", ExchangeType::Topic, flags::NOWAIT, Table::new())
        .on_success(move || *done2.borrow_mut() = true);
    assert!(*done.borrow());

    // no reply is pending, so the next reply must not be misattributed
    let frames = peer.drain();
    assert_eq!(frames.len(), 1);
}

#[test]
fn transactions_toggle_channel_state() {
    let peer = Peer::connected();
    let channel = open_channel(&peer);
    assert!(!channel.in_transaction());

    let _ = channel.start_transaction();
    peer.deliver(Frame::Method {
        channel: 1,
        method: Method::Tx(tx::Method::SelectOk),
    });
    assert!(channel.in_transaction());

    let committed = Rc::new(RefCell::new(false));
    let committed2 = committed.clone();
    let _ = channel
        .commit_transaction()
        .on_success(move || *committed2.borrow_mut() = true);
    peer.deliver(Frame::Method {
        channel: 1,
        method: Method::Tx(tx::Method::CommitOk),
    });
    assert!(*committed.borrow());
}

#[test]
fn flow_controls_the_paused_flag() {
    let peer = Peer::connected();
    let channel = open_channel(&peer);

    let _ = channel.pause();
    peer.deliver(Frame::Method {
        channel: 1,
        method: Method::Channel(wire::Method::FlowOk(wire::FlowOk { active: false })),
    });
    assert!(channel.paused());

    let _ = channel.resume();
    peer.deliver(Frame::Method {
        channel: 1,
        method: Method::Channel(wire::Method::FlowOk(wire::FlowOk { active: true })),
    });
    assert!(!channel.paused());

    // the broker can also ask us to stop, which must be confirmed
    peer.drain();
    peer.deliver(Frame::Method {
        channel: 1,
        method: Method::Channel(wire::Method::Flow(wire::Flow { active: false })),
    });
    assert!(channel.paused());
    let frames = peer.drain();
    assert!(matches!(
        frames.as_slice(),
        [Frame::Method {
            channel: 1,
            method: Method::Channel(wire::Method::FlowOk(wire::FlowOk { active: false }))
        }]
    ));
}

#[test]
fn qos_and_recover_complete_like_any_synchronous_method() {
    let peer = Peer::connected();
    let channel = open_channel(&peer);

    let acked = Rc::new(RefCell::new(0));
    let qos_done = acked.clone();
    let recover_done = acked.clone();
    let _ = channel
        .set_qos(10, 0)
        .on_success(move || *qos_done.borrow_mut() += 1);
    let _ = channel
        .recover(flags::REQUEUE)
        .on_success(move || *recover_done.borrow_mut() += 10);
    peer.drain();

    peer.deliver(Frame::Method {
        channel: 1,
        method: Method::Basic(basic::Method::QosOk),
    });
    peer.deliver(Frame::Method {
        channel: 1,
        method: Method::Basic(basic::Method::RecoverOk),
    });
    assert_eq!(*acked.borrow(), 11);
}

#[test]
fn broker_channel_close_fails_pending_operations_in_order() {
    let peer = Peer::connected();
    let channel = open_channel(&peer);

    let errors = Rc::new(RefCell::new(Vec::new()));
    let first = errors.clone();
    let second = errors.clone();
    let _ = channel
        .declare_queue("q1", flags::PASSIVE, Table::new())
        .on_error(move |message| first.borrow_mut().push(format!("declare: {message}")));
    let _ = channel
        .bind_queue("logs", "q1", "", 0, Table::new())
        .on_error(move |message| second.borrow_mut().push(format!("bind: {message}")));

    let channel_errors = Rc::new(RefCell::new(Vec::new()));
    let channel_errors2 = channel_errors.clone();
    channel.on_error(move |message| channel_errors2.borrow_mut().push(message.to_owned()));
    peer.drain();

    peer.deliver(Frame::Method {
        channel: 1,
        method: Method::Channel(wire::Method::Close(wire::Close {
            reply_code: 404,
            reply_text: "NOT_FOUND - no queue 'q1'".to_owned(),
            failing_class_id: 50,
            failing_method_id: 10,
        })),
    });

    // the close is confirmed on the wire
    let frames = peer.drain();
    assert!(matches!(
        frames.as_slice(),
        [Frame::Method {
            channel: 1,
            method: Method::Channel(wire::Method::CloseOk)
        }]
    ));

    let errors = errors.borrow();
    assert_eq!(errors.len(), 2);
    assert!(errors[0].starts_with("declare: 404"));
    assert!(errors[1].starts_with("bind: 404"));
    assert_eq!(channel_errors.borrow().len(), 1);

    assert!(!channel.usable());
    assert_eq!(peer.connection.channels(), 0);
    // the connection itself survives a channel error
    assert!(peer.connection.connected());
    assert_eq!(peer.take_events(), vec![]);

    // and publishing on the dead channel fails synchronously
    let failed = Rc::new(RefCell::new(false));
    let failed2 = failed.clone();
    let _ = channel
        .declare_queue("other", 0, Table::new())
        .on_error(move |_| *failed2.borrow_mut() = true);
    assert!(*failed.borrow());
    assert!(!channel.publish("", "q1", 0, &"hi".into()));
}

#[test]
fn user_close_resolves_after_close_ok() {
    let peer = Peer::connected();
    let channel = open_channel(&peer);

    let closed = Rc::new(RefCell::new(false));
    let closed2 = closed.clone();
    let _ = channel.close().on_success(move || *closed2.borrow_mut() = true);
    assert!(!channel.usable());
    assert!(!*closed.borrow());

    peer.deliver(Frame::Method {
        channel: 1,
        method: Method::Channel(wire::Method::CloseOk),
    });
    assert!(*closed.borrow());
    assert_eq!(peer.connection.channels(), 0);
}

#[test]
fn unexpected_replies_are_protocol_violations() {
    let peer = Peer::connected();
    let _channel = open_channel(&peer);

    // nothing is pending, so a declare-ok is nonsense
    peer.deliver(Frame::Method {
        channel: 1,
        method: Method::Queue(queue::Method::DeclareOk(queue::DeclareOk {
            queue: "q1".to_owned(),
            message_count: 0,
            consumer_count: 0,
        })),
    });
    let events = peer.take_events();
    assert!(matches!(events.as_slice(), [Event::Error(_)]));
}
