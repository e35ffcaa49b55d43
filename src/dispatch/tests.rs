use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{Notify, mpsc};

use super::dispatcher::current_channel;
use super::{DispatchStats, Dispatcher, Handler, HandlerError, Verdict};
use crate::ack::AckTracker;
use crate::broker::MemoryBroker;
use crate::broker::client::{BrokerClient, Connection};
use crate::broker::message::{Message, MessageId};
use crate::channel::DeliveryChannel;

async fn connect(broker: &MemoryBroker) -> Arc<dyn Connection> {
    match broker.connect("memory://test").await {
        Ok(connection) => connection,
        Err(e) => panic!("connect failed: {e}"),
    }
}

fn ids(values: &[&str]) -> Vec<MessageId> {
    values.iter().map(|v| MessageId::from(*v)).collect()
}

/// Handler that reports every handled id and nacks the ids in `nack`.
fn recording_handler(
    nack: &'static [&'static str],
) -> (impl Handler, mpsc::UnboundedReceiver<MessageId>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = move |message: Message| {
        let tx = tx.clone();
        async move {
            let id = message.id().clone();
            let verdict = if nack.iter().any(|n| *n == id.as_str()) {
                Verdict::Nack
            } else {
                Verdict::Ack
            };
            let _ = tx.send(id);
            Ok::<_, HandlerError>(verdict)
        }
    };
    (handler, rx)
}

async fn expect_handled(rx: &mut mpsc::UnboundedReceiver<MessageId>, n: usize) -> Vec<MessageId> {
    let mut handled = Vec::new();
    for _ in 0..n {
        let id = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("handler was not invoked in time")
            .expect("handler channel closed");
        handled.push(id);
    }
    handled
}

#[tokio::test]
async fn test_ack_and_nack_scenario() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker).await;
    let tracker = Arc::new(AckTracker::new());
    let channel = Arc::new(DeliveryChannel::new("T"));
    let (handler, mut rx) = recording_handler(&["2"]);

    for (id, body) in [("1", "A"), ("2", "B"), ("3", "C")] {
        channel.enqueue(Message::new(id, "T", body)).unwrap();
    }

    let dispatcher = Dispatcher::start(channel, Arc::new(handler), tracker.clone(), connection);
    assert_eq!(expect_handled(&mut rx, 3).await, ids(&["1", "2", "3"]));

    dispatcher.stop();
    let stats = dispatcher.join().await;

    assert_eq!(tracker.pending_unacked(), ids(&["2"]));
    assert_eq!(broker.acknowledged(), ids(&["1", "3"]));
    assert_eq!(
        stats,
        DispatchStats {
            acked: 2,
            nacked: 1,
            failed: 0
        }
    );
}

#[tokio::test]
async fn test_handler_sees_fifo_order() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker).await;
    let channel = Arc::new(DeliveryChannel::new("T"));
    let (handler, mut rx) = recording_handler(&[]);

    let dispatcher = Dispatcher::start(
        channel.clone(),
        Arc::new(handler),
        Arc::new(AckTracker::new()),
        connection,
    );

    let expected: Vec<MessageId> = (0..20).map(|i| MessageId::from(i.to_string())).collect();
    for id in &expected {
        channel.enqueue(Message::new(id.clone(), "T", "x")).unwrap();
    }

    assert_eq!(expect_handled(&mut rx, expected.len()).await, expected);
    dispatcher.stop();
    dispatcher.join().await;
}

#[tokio::test]
async fn test_failing_and_panicking_handlers_do_not_stop_the_loop() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker).await;
    let tracker = Arc::new(AckTracker::new());
    let channel = Arc::new(DeliveryChannel::new("T"));
    let (tx, mut rx) = mpsc::unbounded_channel::<MessageId>();

    let handler = move |message: Message| {
        let tx = tx.clone();
        async move {
            let id = message.id().clone();
            let _ = tx.send(id.clone());
            match id.as_str() {
                "err" => Err(HandlerError::from("database unavailable")),
                "panic" => panic!("handler blew up"),
                _ => Ok(Verdict::Ack),
            }
        }
    };

    for id in ["err", "panic", "ok"] {
        channel.enqueue(Message::new(id, "T", "x")).unwrap();
    }

    let dispatcher = Dispatcher::start(channel, Arc::new(handler), tracker.clone(), connection);
    assert_eq!(expect_handled(&mut rx, 3).await, ids(&["err", "panic", "ok"]));

    dispatcher.stop();
    let stats = dispatcher.join().await;

    assert_eq!(stats.failed, 2);
    assert_eq!(stats.acked, 1);
    assert_eq!(tracker.pending_unacked(), ids(&["err", "panic"]));
    assert_eq!(broker.acknowledged(), ids(&["ok"]));
}

#[tokio::test]
async fn test_one_handler_in_flight_per_channel() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker).await;
    let channel = Arc::new(DeliveryChannel::new("T"));
    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));
    let (tx, mut rx) = mpsc::unbounded_channel::<MessageId>();

    let handler = {
        let in_flight = in_flight.clone();
        let max_seen = max_seen.clone();
        move |message: Message| {
            let in_flight = in_flight.clone();
            let max_seen = max_seen.clone();
            let tx = tx.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                let _ = tx.send(message.id().clone());
                Ok(Verdict::Ack)
            }
        }
    };

    for i in 0..10 {
        channel
            .enqueue(Message::new(i.to_string(), "T", "x"))
            .unwrap();
    }
    let dispatcher = Dispatcher::start(
        channel,
        Arc::new(handler),
        Arc::new(AckTracker::new()),
        connection,
    );
    expect_handled(&mut rx, 10).await;
    dispatcher.stop();
    dispatcher.join().await;

    assert_eq!(max_seen.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_stop_waits_for_running_handler() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker).await;
    let tracker = Arc::new(AckTracker::new());
    let channel = Arc::new(DeliveryChannel::new("T"));
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());

    let handler = {
        let started = started.clone();
        let release = release.clone();
        move |_message: Message| {
            let started = started.clone();
            let release = release.clone();
            async move {
                started.notify_one();
                release.notified().await;
                Ok(Verdict::Ack)
            }
        }
    };

    channel.enqueue(Message::new("1", "T", "x")).unwrap();
    channel.enqueue(Message::new("2", "T", "x")).unwrap();
    let dispatcher = Dispatcher::start(channel.clone(), Arc::new(handler), tracker.clone(), connection);

    started.notified().await;
    dispatcher.stop();
    assert!(dispatcher.is_stopped());

    // The handler is still running; nothing has been acknowledged yet.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(tracker.pending_unacked(), ids(&["1"]));

    release.notify_one();
    let stats = dispatcher.join().await;

    assert_eq!(stats.acked, 1);
    assert!(tracker.is_empty());
    assert_eq!(broker.acknowledged(), ids(&["1"]));
    // The second message was never started.
    assert_eq!(channel.len(), 1);
}

#[tokio::test]
async fn test_dispatcher_exits_when_channel_closes() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker).await;
    let channel = Arc::new(DeliveryChannel::new("T"));
    let (handler, _rx) = recording_handler(&[]);

    let dispatcher = Dispatcher::start(
        channel.clone(),
        Arc::new(handler),
        Arc::new(AckTracker::new()),
        connection,
    );
    channel.close();

    let stats = tokio::time::timeout(Duration::from_secs(2), dispatcher.join())
        .await
        .expect("dispatcher should exit after close");
    assert_eq!(stats, DispatchStats::default());
}

#[tokio::test]
async fn test_nack_of_abandoned_message_keeps_loop_running() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker).await;
    let channel = Arc::new(DeliveryChannel::new("T"));
    let tracker = Arc::new(AckTracker::new());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler = {
        let tracker = tracker.clone();
        move |message: Message| {
            let tracker = tracker.clone();
            let tx = tx.clone();
            async move {
                let id = message.id().clone();
                let verdict = if id.as_str() == "1" {
                    tracker.abandon(&id).unwrap();
                    Verdict::Nack
                } else {
                    Verdict::Ack
                };
                let _ = tx.send(id);
                Ok::<_, HandlerError>(verdict)
            }
        }
    };

    channel.enqueue(Message::new("1", "T", "A")).unwrap();
    channel.enqueue(Message::new("2", "T", "B")).unwrap();
    let dispatcher = Dispatcher::start(channel.clone(), Arc::new(handler), tracker.clone(), connection);
    assert_eq!(expect_handled(&mut rx, 2).await, ids(&["1", "2"]));

    channel.close();
    let stats = dispatcher.join().await;
    assert_eq!(
        stats,
        DispatchStats {
            acked: 1,
            nacked: 1,
            failed: 0
        }
    );
    assert!(tracker.is_empty());
    assert_eq!(broker.acknowledged(), ids(&["2"]));
}

#[tokio::test]
async fn test_current_channel_is_set_inside_handlers() {
    let broker = MemoryBroker::new();
    let connection = connect(&broker).await;
    let channel = Arc::new(DeliveryChannel::new("T"));
    assert_eq!(current_channel(), None);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler = move |_message: Message| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(current_channel());
            Ok::<_, HandlerError>(Verdict::Ack)
        }
    };
    let dispatcher = Dispatcher::start(
        channel.clone(),
        Arc::new(handler),
        Arc::new(AckTracker::new()),
        connection,
    );
    channel.enqueue(Message::new("1", "T", "A")).unwrap();

    let seen = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(seen, Some(channel.id()));

    dispatcher.stop();
    dispatcher.join().await;
}
