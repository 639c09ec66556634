//! In-process broker end-to-end tests.

use std::sync::Arc;
use std::time::Duration;

use ferrobus::{BusMessage, BusMessageType, BusQueue, InProcessBroker, MessageBroker};
use serial_test::serial;

fn wait_for(condition: impl Fn() -> bool, timeout: Duration) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    condition()
}

#[test]
#[serial]
fn test_single_producer_single_consumer() {
    ferrobus::install_null_sink();
    ferrobus::reset_error_count();

    const MAX_MESSAGES: usize = 100_000;

    let mut broker = InProcessBroker::new();
    let publisher = broker.create_publisher();
    let subscriber = broker.create_subscriber();
    assert_eq!(broker.nof_publishers(), 1);
    assert_eq!(broker.nof_subscribers(), 1);

    broker.start();
    assert!(broker.is_connected());

    for _ in 0..MAX_MESSAGES {
        publisher.push(Arc::new(BusMessage::new(BusMessageType::Unknown)));
    }

    assert!(wait_for(
        || subscriber.len() == MAX_MESSAGES,
        Duration::from_secs(30)
    ));
    broker.stop();

    assert_eq!(publisher.len(), 0);
    assert_eq!(subscriber.len(), MAX_MESSAGES);
    assert_eq!(ferrobus::error_count(), 0);
    ferrobus::clear_log_sink();
}

#[test]
#[serial]
fn test_fan_out_to_multiple_subscribers() {
    ferrobus::install_null_sink();
    ferrobus::reset_error_count();

    const PUBLISHERS: usize = 3;
    const SUBSCRIBERS: usize = 4;
    const PER_PUBLISHER: usize = 1_000;

    let mut broker = InProcessBroker::new();
    let publishers: Vec<_> = (0..PUBLISHERS).map(|_| broker.create_publisher()).collect();
    let subscribers: Vec<_> = (0..SUBSCRIBERS)
        .map(|_| broker.create_subscriber())
        .collect();
    broker.start();

    for publisher in &publishers {
        for _ in 0..PER_PUBLISHER {
            publisher.push(Arc::new(BusMessage::new(BusMessageType::Unknown)));
        }
    }

    let expected = PUBLISHERS * PER_PUBLISHER;
    assert!(wait_for(
        || subscribers.iter().all(|sub| sub.len() == expected),
        Duration::from_secs(30)
    ));
    broker.stop();

    for publisher in &publishers {
        assert_eq!(publisher.len(), 0);
    }
    for subscriber in &subscribers {
        assert_eq!(subscriber.len(), expected);
    }
    assert_eq!(ferrobus::error_count(), 0);
    ferrobus::clear_log_sink();
}

#[test]
#[serial]
fn test_subscribers_share_the_message_handle() {
    ferrobus::install_null_sink();
    ferrobus::reset_error_count();

    let mut broker = InProcessBroker::new();
    let publisher = broker.create_publisher();
    let first = broker.create_subscriber();
    let second = broker.create_subscriber();
    broker.start();

    let mut message = BusMessage::new(BusMessageType::CanDataFrame);
    message.set_can_id(77);
    publisher.push(Arc::new(message));

    let received_first = first
        .pop_wait(Duration::from_secs(5))
        .expect("first subscriber got the message");
    let received_second = second
        .pop_wait(Duration::from_secs(5))
        .expect("second subscriber got the message");
    broker.stop();

    // Fan-out shares one handle instead of copying the message.
    assert!(Arc::ptr_eq(&received_first, &received_second));
    assert_eq!(received_first.can_id(), 77);
    assert_eq!(ferrobus::error_count(), 0);
    ferrobus::clear_log_sink();
}
