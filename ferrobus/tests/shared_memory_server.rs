//! Shared-memory server/client (TX/RX split) end-to-end tests.

#![cfg(unix)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
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
fn test_full_duplex_between_server_and_client() -> Result<()> {
    ferrobus::install_null_sink();
    ferrobus::reset_error_count();

    const MAX_MESSAGES: usize = 1_000;

    let mut server = ferrobus::create_broker(BrokerType::SharedMemoryServer);
    server.set_name("BusSrvTest");
    server.start();
    assert!(server.is_connected());

    let mut client = ferrobus::create_broker(BrokerType::SharedMemoryClient);
    client.set_name("BusSrvTest");
    client.start();
    assert!(client.is_connected());

    // Server → clients travels on the TX ring.
    let server_publisher = server.create_publisher();
    server_publisher.start();
    let client_subscriber = client.create_subscriber();
    client_subscriber.start();

    // Clients → server travels on the RX ring.
    let client_publisher = client.create_publisher();
    client_publisher.start();
    let server_subscriber = server.create_subscriber();
    server_subscriber.start();

    std::thread::sleep(Duration::from_millis(200));

    for index in 0..MAX_MESSAGES {
        server_publisher.push(can_frame(100, index as u8));
        client_publisher.push(can_frame(200, index as u8));
    }

    assert!(wait_for(
        || client_subscriber.len() == MAX_MESSAGES && server_subscriber.len() == MAX_MESSAGES,
        Duration::from_secs(30)
    ));

    assert_eq!(server_publisher.len(), 0);
    assert_eq!(client_publisher.len(), 0);

    let to_client = client_subscriber.pop().context("client received nothing")?;
    assert_eq!(to_client.can_id(), 100);
    let to_server = server_subscriber.pop().context("server received nothing")?;
    assert_eq!(to_server.can_id(), 200);

    server_publisher.stop();
    server_subscriber.stop();
    client_publisher.stop();
    client_subscriber.stop();
    client.stop();
    server.stop();

    assert_eq!(ferrobus::error_count(), 0);
    ferrobus::clear_log_sink();
    Ok(())
}

#[test]
#[serial]
fn test_client_waits_for_missing_server() {
    ferrobus::install_null_sink();
    ferrobus::reset_error_count();

    // No server region exists under this name: the client queues must keep
    // retrying without ever reporting errors through the counter twice.
    let mut client = ferrobus::create_broker(BrokerType::SharedMemoryClient);
    client.set_name("BusSrvMissing");
    client.start();

    let subscriber = client.create_subscriber();
    subscriber.start();
    std::thread::sleep(Duration::from_millis(300));
    assert!(subscriber.is_empty());

    subscriber.stop();
    client.stop();

    // The first failed open logs once; the operable latch suppresses the
    // repeats while the region stays missing.
    assert!(ferrobus::error_count() <= 1);
    ferrobus::clear_log_sink();
}
