//! Simulate broker tests: the heap ring and its arbitration.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ferrobus::{BrokerType, BusMessage, BusMessageType, BusQueue, MessageBroker, SimulateBroker};
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

    let mut broker = ferrobus::create_broker(BrokerType::Simulate);
    broker.set_name("SimTest");
    broker.start();
    assert!(broker.is_connected());

    let publisher = broker.create_publisher();
    assert!(publisher.is_empty());
    assert_eq!(broker.nof_publishers(), 1);
    publisher.start();

    let subscriber = broker.create_subscriber();
    assert!(subscriber.is_empty());
    assert_eq!(broker.nof_subscribers(), 1);
    subscriber.start();

    std::thread::sleep(Duration::from_millis(500));
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

    let mut broker = SimulateBroker::new();
    broker.set_name("SimTest");
    broker.start();

    let publisher = broker.create_publisher();
    publisher.start();
    let subscriber = broker.create_subscriber();
    subscriber.start();

    for index in 0..MAX_MESSAGES {
        publisher.push(can_frame(123, index as u8));
    }

    assert!(wait_for(
        || subscriber.len() == MAX_MESSAGES,
        Duration::from_secs(60)
    ));

    assert_eq!(publisher.len(), 0);
    assert_eq!(subscriber.len(), MAX_MESSAGES);

    let first = subscriber.pop().expect("first message");
    assert_eq!(first.can_id(), 123);
    assert_eq!(first.data_bytes(), &[0u8; 8]);

    broker.stop();
    assert_eq!(ferrobus::error_count(), 0);
    ferrobus::clear_log_sink();
}

#[test]
#[serial]
fn test_stall_reclaim_after_ten_seconds() {
    ferrobus::install_null_sink();
    ferrobus::reset_error_count();

    let mut broker = SimulateBroker::new();
    broker.set_name("SimStall");
    broker.start();

    // The subscriber claims a read channel at creation but is never
    // started, so it cannot consume: the lagging-reader case.
    let _paused_subscriber = broker.create_subscriber();

    let publisher = broker.create_publisher();
    publisher.start();

    // Push well past the ring capacity so the publisher raises buffer-full.
    for index in 0..2_000u32 {
        publisher.push(can_frame(55, index as u8));
    }
    assert!(wait_for(|| broker.buffer_full(), Duration::from_secs(10)));
    let full_at = Instant::now();
    let queued_at_full = publisher.len();

    // The master must reclaim the ring between 10 and ~12 seconds later,
    // dropping the paused subscriber's unread records with a logged error.
    assert!(wait_for(
        || ferrobus::error_count() > 0,
        Duration::from_secs(15)
    ));
    let stalled_for = full_at.elapsed();
    assert!(
        stalled_for >= Duration::from_secs(9),
        "reclaimed after {stalled_for:?}"
    );

    // Producers resume from offset 0 after the forced reset.
    assert!(wait_for(
        || publisher.len() < queued_at_full,
        Duration::from_secs(5)
    ));

    broker.stop();
    ferrobus::clear_log_sink();
}
