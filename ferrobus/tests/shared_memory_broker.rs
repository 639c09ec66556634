//! Shared-memory broker end-to-end tests.
//!
//! The master and its clients run in one process here; real deployments put
//! them in separate processes, which exercises the same region protocol.

#![cfg(unix)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use ferrobus::{BrokerType, BusMessage, BusMessageType, BusQueue, MessageBroker};
use serial_test::serial;

fn can_frame(can_id: u32, fill: u8) -> Arc<BusMessage> {
    let mut message = BusMessage::new(BusMessageType::CanDataFrame);
    message.set_can_id(can_id);
    message.set_data_bytes(&[fill; 8]);
    Arc::new(message)
}

fn wait_for(condition: impl Fn() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    condition()
}

#[test]
#[serial]
fn test_properties() {
    ferrobus::install_null_sink();
    ferrobus::reset_error_count();

    let mut broker = ferrobus::create_broker(BrokerType::SharedMemory);
    broker.set_name("BusMemProps");
    // Starting the broker makes this process the master; clients only
    // create publishers or subscribers against the region name.
    broker.start();
    assert!(broker.is_connected());

    // Ring-bound queues bind to the region directly and are not listed in
    // the broker registry.
    let publisher = broker.create_publisher();
    assert!(publisher.is_empty());
    assert_eq!(broker.nof_publishers(), 0);
    publisher.start();

    let subscriber = broker.create_subscriber();
    assert!(subscriber.is_empty());
    assert_eq!(broker.nof_subscribers(), 0);
    subscriber.start();

    std::thread::sleep(Duration::from_secs(1));
    publisher.stop();
    subscriber.stop();
    broker.stop();

    assert_eq!(ferrobus::error_count(), 0);
    ferrobus::clear_log_sink();
}

#[test]
#[serial]
fn test_one_in_one_out() {
    ferrobus::install_null_sink();
    ferrobus::reset_error_count();

    const MAX_MESSAGES: usize = 10_000;

    let mut broker = ferrobus::create_broker(BrokerType::SharedMemory);
    broker.set_name("BusMemTest");
    broker.start();

    let publisher = broker.create_publisher();
    publisher.start();
    let subscriber = broker.create_subscriber();
    subscriber.start();
    // Let the subscriber claim its read channel before traffic flows.
    std::thread::sleep(Duration::from_millis(100));

    for index in 0..MAX_MESSAGES {
        publisher.push(can_frame(123, index as u8));
    }

    assert!(wait_for(
        || subscriber.len() == MAX_MESSAGES,
        Duration::from_secs(10)
    ));
    assert_eq!(publisher.len(), 0);
    assert_eq!(subscriber.len(), MAX_MESSAGES);

    let first = subscriber.pop().expect("first message");
    assert_eq!(first.can_id(), 123);
    assert_eq!(first.data_bytes(), &[0u8; 8]);

    let mut last = None;
    while let Some(message) = subscriber.pop() {
        last = Some(message);
    }
    let last = last.expect("last message");
    assert_eq!(last.can_id(), 123);
    assert_eq!(last.data_bytes(), &[(MAX_MESSAGES - 1) as u8; 8]);

    publisher.stop();
    subscriber.stop();
    broker.stop();

    assert_eq!(ferrobus::error_count(), 0);
    ferrobus::clear_log_sink();
}

#[test]
#[serial]
fn test_ten_in_ten_out() {
    ferrobus::install_null_sink();
    ferrobus::reset_error_count();

    const PER_PUBLISHER: usize = 1_000;
    const PUBLISHERS: usize = 10;
    const SUBSCRIBERS: usize = 10;

    let mut broker = ferrobus::create_broker(BrokerType::SharedMemory);
    broker.set_name("BusMemTen");
    broker.start();

    let publishers: Vec<_> = (0..PUBLISHERS)
        .map(|_| {
            let publisher = broker.create_publisher();
            publisher.start();
            publisher
        })
        .collect();
    let subscribers: Vec<_> = (0..SUBSCRIBERS)
        .map(|_| {
            let subscriber = broker.create_subscriber();
            subscriber.start();
            subscriber
        })
        .collect();
    std::thread::sleep(Duration::from_millis(200));

    for (slot, publisher) in publishers.iter().enumerate() {
        for index in 0..PER_PUBLISHER {
            publisher.push(can_frame(slot as u32 + 1, index as u8));
        }
    }

    let expected = PUBLISHERS * PER_PUBLISHER;
    assert!(wait_for(
        || subscribers.iter().all(|sub| sub.len() == expected),
        Duration::from_secs(30)
    ));

    for publisher in &publishers {
        assert_eq!(publisher.len(), 0);
        publisher.stop();
    }
    for subscriber in &subscribers {
        assert_eq!(subscriber.len(), expected);
        subscriber.stop();
    }
    broker.stop();

    assert_eq!(ferrobus::error_count(), 0);
    ferrobus::clear_log_sink();
}
