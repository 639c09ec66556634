//! TCP broker: cross-host clients bridged into the in-host ring.
//!
//! Composes the shared-memory broker with an accept loop. Every accepted
//! client gets a connection whose queue pair binds straight to the shared
//! ring: frames from the client are published into the ring, and everything
//! broadcast on the ring is mirrored back out to the client.

use std::net::TcpListener as StdTcpListener;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpListener;

use crate::broker::{BrokerCore, BusQueue, MessageBroker};
use crate::logsink::bus_error;
use crate::shm::{SharedMemoryBroker, SharedMemoryQueue};
use crate::tcp::connection::TcpConnection;
use crate::tcp::server::bind_target;
use crate::tcp::Reactor;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(2);

/// Broker that accepts TCP clients and mirrors them into the shared ring.
pub struct TcpMessageBroker {
    shm: SharedMemoryBroker,
    connections: Arc<Mutex<Vec<TcpConnection>>>,
    reactor: Option<Reactor>,
}

impl TcpMessageBroker {
    pub fn new() -> Self {
        Self {
            shm: SharedMemoryBroker::new(),
            connections: Arc::new(Mutex::new(Vec::new())),
            reactor: None,
        }
    }
}

impl Default for TcpMessageBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBroker for TcpMessageBroker {
    fn core(&self) -> &BrokerCore {
        self.shm.core()
    }

    fn core_mut(&mut self) -> &mut BrokerCore {
        self.shm.core_mut()
    }

    /// Publisher into the in-host ring, exactly as the shared-memory broker
    /// hands out.
    fn create_publisher(&mut self) -> Arc<dyn BusQueue> {
        self.shm.create_publisher()
    }

    /// Subscriber on the in-host ring, exactly as the shared-memory broker
    /// hands out.
    fn create_subscriber(&mut self) -> Arc<dyn BusQueue> {
        self.shm.create_subscriber()
    }

    fn start(&mut self) {
        self.stop();
        if self.name().is_empty() {
            return;
        }

        // The in-host ring first, the TCP side bridges into it.
        self.shm.start();

        let (bind_address, port) = bind_target(&self.address(), self.port());
        let listener = match StdTcpListener::bind((bind_address.as_str(), port)) {
            Ok(listener) => listener,
            Err(err) => {
                bus_error!(
                    "Failed to start the server. Name: {}, Error: {err}",
                    self.name()
                );
                self.core().set_connected(false);
                return;
            }
        };
        if let Err(err) = listener.set_nonblocking(true) {
            bus_error!(
                "Failed to start the server. Name: {}, Error: {err}",
                self.name()
            );
            self.core().set_connected(false);
            return;
        }

        let reactor = match Reactor::spawn("tcp-broker") {
            Ok(reactor) => reactor,
            Err(err) => {
                bus_error!(
                    "Failed to start the server. Name: {}, Error: {err}",
                    self.name()
                );
                self.core().set_connected(false);
                return;
            }
        };

        {
            let connections = self.connections.clone();
            let name = self.name();
            reactor.spawn_task(async move {
                let listener = match TcpListener::from_std(listener) {
                    Ok(listener) => listener,
                    Err(err) => {
                        bus_error!("Failed to start the server. Name: {name}, Error: {err}");
                        return;
                    }
                };
                loop {
                    match listener.accept().await {
                        Ok((stream, _peer)) => {
                            // The connection's queues bind straight to the
                            // shared ring, not to the registry.
                            let publisher: Arc<dyn BusQueue> =
                                Arc::new(SharedMemoryQueue::new(&name, true));
                            let subscriber: Arc<dyn BusQueue> =
                                Arc::new(SharedMemoryQueue::new(&name, false));
                            let connection =
                                TcpConnection::spawn(stream, publisher, subscriber, None);
                            connections.lock().push(connection);
                        }
                        Err(err) => {
                            bus_error!("Accept error. Name: {name}, Error: {err}");
                        }
                    }
                }
            });
        }

        {
            let connections = self.connections.clone();
            reactor.spawn_task(async move {
                loop {
                    tokio::time::sleep(CLEANUP_INTERVAL).await;
                    connections.lock().retain(|connection| !connection.is_closed());
                }
            });
        }

        self.reactor = Some(reactor);
        self.core().set_connected(true);
    }

    fn stop(&mut self) {
        self.core().set_connected(false);
        if let Some(mut reactor) = self.reactor.take() {
            reactor.stop();
        }
        self.connections.lock().clear();
        self.shm.stop();
    }
}

impl Drop for TcpMessageBroker {
    fn drop(&mut self) {
        self.stop();
    }
}
