//! TCP client broker.
//!
//! Resolves the configured target, connects, and runs two overlapping
//! tasks: the read task pushes every received frame into all registered
//! subscribers, the send task drains the registered publishers onto the
//! socket, idling 10 ms when there is nothing to send. Any failure closes
//! the socket and enters a 5 second retry wait before resolving again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::broker::{BrokerCore, BusQueue, DirectQueue, MessageBroker, Registry};
use crate::logsink::{bus_error, bus_info};
use crate::tcp::{encode_frame, Reactor};

const SEND_IDLE: Duration = Duration::from_millis(10);
const RETRY_WAIT: Duration = Duration::from_secs(5);
const CONNECT_WAIT_SLICES: usize = 20;
const CONNECT_WAIT_SLICE: Duration = Duration::from_millis(100);
const DEFAULT_ADDRESS: &str = "127.0.0.1";

/// TCP client broker.
pub struct TcpMessageClient {
    core: BrokerCore,
    reactor: Option<Reactor>,
}

impl TcpMessageClient {
    pub fn new() -> Self {
        Self {
            core: BrokerCore::new(),
            reactor: None,
        }
    }
}

impl Default for TcpMessageClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBroker for TcpMessageClient {
    fn core(&self) -> &BrokerCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut BrokerCore {
        &mut self.core
    }

    fn create_publisher(&mut self) -> Arc<dyn BusQueue> {
        let publisher: Arc<dyn BusQueue> = Arc::new(DirectQueue::new());
        self.core.registry().add_publisher(publisher.clone());
        publisher
    }

    fn create_subscriber(&mut self) -> Arc<dyn BusQueue> {
        let subscriber: Arc<dyn BusQueue> = Arc::new(DirectQueue::new());
        self.core.registry().add_subscriber(subscriber.clone());
        subscriber
    }

    fn start(&mut self) {
        self.stop();
        if self.address().is_empty() {
            self.set_address(DEFAULT_ADDRESS);
        }

        let reactor = match Reactor::spawn("tcp-client") {
            Ok(reactor) => reactor,
            Err(err) => {
                bus_error!(
                    "Failed to start the client. Name: {}, Error: {err}",
                    self.name()
                );
                return;
            }
        };

        let address = self.address();
        let port = self.port();
        let registry = self.core.registry().clone();
        let connected = self.core.connected_flag().clone();
        reactor.spawn_task(client_task(address, port, registry, connected));
        self.reactor = Some(reactor);

        // Give the first connect attempt a moment, the way the transports
        // are usually started right before traffic flows.
        for _ in 0..CONNECT_WAIT_SLICES {
            if self.is_connected() {
                break;
            }
            std::thread::sleep(CONNECT_WAIT_SLICE);
        }
    }

    fn stop(&mut self) {
        self.core.set_connected(false);
        if let Some(mut reactor) = self.reactor.take() {
            reactor.stop();
        }
    }
}

impl Drop for TcpMessageClient {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn client_task(
    address: String,
    port: u16,
    registry: Arc<Registry>,
    connected: Arc<AtomicBool>,
) {
    loop {
        let target = format!("{address}:{port}");
        let endpoints: Vec<std::net::SocketAddr> = match tokio::net::lookup_host(target.as_str()).await
        {
            Ok(endpoints) => endpoints.collect(),
            Err(err) => {
                bus_error!("Lookup error. Host: {target}, Error: {err}");
                tokio::time::sleep(RETRY_WAIT).await;
                continue;
            }
        };

        let mut stream = None;
        for endpoint in endpoints {
            match TcpStream::connect(endpoint).await {
                Ok(connection) => {
                    stream = Some(connection);
                    break;
                }
                Err(err) => {
                    bus_error!("Connect error. Error: {err}");
                }
            }
        }
        let Some(stream) = stream else {
            connected.store(false, Ordering::Relaxed);
            tokio::time::sleep(RETRY_WAIT).await;
            continue;
        };

        connected.store(true, Ordering::Relaxed);
        let (read_half, write_half) = stream.into_split();

        // Run both directions until either side fails, then close and retry.
        tokio::select! {
            _ = read_task(read_half, &registry) => {}
            _ = send_task(write_half, &registry) => {}
        }

        connected.store(false, Ordering::Relaxed);
        tokio::time::sleep(RETRY_WAIT).await;
    }
}

async fn read_task(mut read_half: OwnedReadHalf, registry: &Registry) {
    let mut size_data = [0u8; 4];
    loop {
        match read_half.read_exact(&mut size_data).await {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                bus_info!("Connection closed by remote");
                return;
            }
            Err(err) => {
                bus_error!("Reading size error. Error: {err}");
                return;
            }
        }

        let length = u32::from_le_bytes(size_data) as usize;
        if length == 0 {
            continue;
        }

        let mut message_data = vec![0u8; length];
        if let Err(err) = read_half.read_exact(&mut message_data).await {
            bus_error!("Read message data error. Error: {err}");
            return;
        }

        for subscriber in registry.subscribers() {
            subscriber.push_raw(&message_data);
        }
    }
}

async fn send_task(mut write_half: OwnedWriteHalf, registry: &Registry) {
    loop {
        let mut idle = true;
        for publisher in registry.publishers() {
            while let Some(message) = publisher.pop() {
                if message.size() == 0 {
                    continue;
                }
                let Some(frame) = encode_frame(&message) else {
                    continue;
                };
                if let Err(err) = write_half.write_all(&frame).await {
                    bus_error!("Send message data error. Error: {err}");
                    return;
                }
                idle = false;
            }
        }
        if idle {
            tokio::time::sleep(SEND_IDLE).await;
        }
    }
}
