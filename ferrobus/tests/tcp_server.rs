//! TCP server/client end-to-end tests.

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
fn test_client_to_server_and_back() -> Result<()> {
    ferrobus::install_null_sink();
    ferrobus::reset_error_count();

    const MAX_MESSAGES: usize = 1_000;

    let mut server = ferrobus::create_broker(BrokerType::TcpServer);
    server.set_name("TcpSrvTest");
    server.set_address("127.0.0.1");
    server.set_port(42615);
    server.start();
    assert!(server.is_connected());

    let mut client = ferrobus::create_broker(BrokerType::TcpClient);
    client.set_name("TcpCliTest");
    client.set_address("127.0.0.1");
    client.set_port(42615);
    let client_publisher = client.create_publisher();
    let client_subscriber = client.create_subscriber();
    client.start();
    assert!(client.is_connected());

    // The accept loop registers one queue pair per connection.
    assert!(wait_for(
        || server.nof_publishers() == 1 && server.nof_subscribers() == 1,
        Duration::from_secs(10)
    ));

    // Client → server lands in the server's common fan-in queue.
    let server_inbox = server.create_subscriber();
    for index in 0..MAX_MESSAGES {
        client_publisher.push(can_frame(321, index as u8));
    }
    assert!(wait_for(
        || server_inbox.len() == MAX_MESSAGES,
        Duration::from_secs(30)
    ));
    let received = server_inbox.pop().context("server received nothing")?;
    assert_eq!(received.can_id(), 321);
    assert_eq!(received.data_bytes(), &[0u8; 8]);

    // Server → client: the common fan-out queue reaches every client.
    let server_outbox = server.create_publisher();
    for index in 0..MAX_MESSAGES {
        server_outbox.push(can_frame(654, index as u8));
    }
    assert!(wait_for(
        || client_subscriber.len() == MAX_MESSAGES,
        Duration::from_secs(30)
    ));
    let echoed = client_subscriber.pop().context("client received nothing")?;
    assert_eq!(echoed.can_id(), 654);

    client.stop();
    server.stop();

    assert_eq!(ferrobus::error_count(), 0);
    ferrobus::clear_log_sink();
    Ok(())
}

#[test]
#[serial]
fn test_client_retries_until_server_appears() {
    ferrobus::install_null_sink();
    ferrobus::reset_error_count();

    let mut client = ferrobus::create_broker(BrokerType::TcpClient);
    client.set_address("127.0.0.1");
    client.set_port(42616);
    let client_publisher = client.create_publisher();
    let client_subscriber = client.create_subscriber();
    client.start();
    // Nothing is listening yet.
    assert!(!client.is_connected());

    let mut server = ferrobus::create_broker(BrokerType::TcpServer);
    server.set_address("127.0.0.1");
    server.set_port(42616);
    server.start();

    // The retry-wait is 5 seconds; the client must latch connected after
    // the next attempt.
    assert!(wait_for(|| client.is_connected(), Duration::from_secs(15)));

    client_publisher.push(can_frame(42, 7));
    let server_inbox = server.create_subscriber();
    assert!(wait_for(|| !server_inbox.is_empty(), Duration::from_secs(10)));
    assert!(client_subscriber.is_empty());

    client.stop();
    server.stop();
    ferrobus::clear_log_sink();
}
