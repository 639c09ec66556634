//! Standalone TCP fan-in/fan-out server.
//!
//! The server keeps two user-facing queues: publishers push into the common
//! `tx_queue` and subscribers pop from the common `rx_queue`. Accepted
//! connections contribute a per-connection queue pair, registered in the
//! broker registry; the message thread fans `tx_queue` out to every
//! per-connection send side and drains every per-connection read side into
//! `rx_queue`.

use std::net::TcpListener as StdTcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpListener;

use crate::broker::{BrokerCore, BusQueue, DirectQueue, MessageBroker, Registry};
use crate::logsink::bus_error;
use crate::tcp::connection::TcpConnection;
use crate::tcp::Reactor;

const MESSAGE_WAIT: Duration = Duration::from_millis(10);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(2);

/// Bind target per the address convention: "" or "0.0.0.0" binds every
/// interface, anything else binds loopback only.
pub(crate) fn bind_target(address: &str, port: u16) -> (String, u16) {
    if address.is_empty() || address == "0.0.0.0" {
        ("0.0.0.0".to_string(), port)
    } else {
        ("127.0.0.1".to_string(), port)
    }
}

/// TCP server broker.
pub struct TcpMessageServer {
    core: BrokerCore,
    tx_queue: Arc<dyn BusQueue>,
    rx_queue: Arc<dyn BusQueue>,
    connections: Arc<Mutex<Vec<TcpConnection>>>,
    reactor: Option<Reactor>,
    stop_threads: Arc<AtomicBool>,
    message_thread: Option<JoinHandle<()>>,
}

impl TcpMessageServer {
    pub fn new() -> Self {
        let tx_queue: Arc<dyn BusQueue> = Arc::new(DirectQueue::new());
        let rx_queue: Arc<dyn BusQueue> = Arc::new(DirectQueue::new());
        tx_queue.start();
        rx_queue.start();

        Self {
            core: BrokerCore::new(),
            tx_queue,
            rx_queue,
            connections: Arc::new(Mutex::new(Vec::new())),
            reactor: None,
            stop_threads: Arc::new(AtomicBool::new(false)),
            message_thread: None,
        }
    }

    fn message_loop(
        registry: &Registry,
        tx_queue: &Arc<dyn BusQueue>,
        rx_queue: &Arc<dyn BusQueue>,
        stop: &AtomicBool,
    ) {
        while !stop.load(Ordering::Relaxed) {
            tx_queue.empty_wait(MESSAGE_WAIT);
            while let Some(message) = tx_queue.pop() {
                for subscriber in registry.subscribers() {
                    subscriber.push(message.clone());
                }
            }
            for publisher in registry.publishers() {
                while let Some(message) = publisher.pop() {
                    rx_queue.push(message);
                }
            }
        }
    }
}

impl Default for TcpMessageServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBroker for TcpMessageServer {
    fn core(&self) -> &BrokerCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut BrokerCore {
        &mut self.core
    }

    /// The common fan-out queue; everything pushed here goes to every
    /// connected client.
    fn create_publisher(&mut self) -> Arc<dyn BusQueue> {
        self.tx_queue.clone()
    }

    /// The common fan-in queue; everything any client sends ends up here.
    fn create_subscriber(&mut self) -> Arc<dyn BusQueue> {
        self.rx_queue.clone()
    }

    fn start(&mut self) {
        self.stop();
        self.stop_threads.store(false, Ordering::Relaxed);

        let (bind_address, port) = bind_target(&self.address(), self.port());
        let listener = match StdTcpListener::bind((bind_address.as_str(), port)) {
            Ok(listener) => listener,
            Err(err) => {
                bus_error!(
                    "Failed to start the server. Name: {}, Error: {err}",
                    self.name()
                );
                return;
            }
        };
        if let Err(err) = listener.set_nonblocking(true) {
            bus_error!(
                "Failed to start the server. Name: {}, Error: {err}",
                self.name()
            );
            return;
        }

        let reactor = match Reactor::spawn("tcp-server") {
            Ok(reactor) => reactor,
            Err(err) => {
                bus_error!(
                    "Failed to start the server. Name: {}, Error: {err}",
                    self.name()
                );
                return;
            }
        };

        // Accept loop: each connection gets a registered queue pair.
        {
            let registry = self.core.registry().clone();
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
                            let publisher: Arc<dyn BusQueue> = Arc::new(DirectQueue::new());
                            let subscriber: Arc<dyn BusQueue> = Arc::new(DirectQueue::new());
                            registry.add_publisher(publisher.clone());
                            registry.add_subscriber(subscriber.clone());

                            let connection = TcpConnection::spawn(
                                stream,
                                publisher,
                                subscriber,
                                Some(registry.clone()),
                            );
                            connections.lock().push(connection);
                        }
                        Err(err) => {
                            bus_error!("Accept error. Name: {name}, Error: {err}");
                        }
                    }
                }
            });
        }

        // Cleanup sweep: reap connections whose socket is gone.
        {
            let connections = self.connections.clone();
            reactor.spawn_task(async move {
                loop {
                    tokio::time::sleep(CLEANUP_INTERVAL).await;
                    connections.lock().retain(|connection| !connection.is_closed());
                }
            });
        }

        // Message thread: tx fan-out and per-connection fan-in.
        {
            let registry = self.core.registry().clone();
            let tx_queue = self.tx_queue.clone();
            let rx_queue = self.rx_queue.clone();
            let stop = self.stop_threads.clone();
            self.message_thread = Some(std::thread::spawn(move || {
                TcpMessageServer::message_loop(&registry, &tx_queue, &rx_queue, &stop);
            }));
        }

        self.reactor = Some(reactor);
        self.core.set_connected(true);
    }

    fn stop(&mut self) {
        self.core.set_connected(false);
        self.stop_threads.store(true, Ordering::Relaxed);

        if let Some(message_thread) = self.message_thread.take() {
            let _ = message_thread.join();
        }
        if let Some(mut reactor) = self.reactor.take() {
            reactor.stop();
        }
        self.connections.lock().clear();
    }
}

impl Drop for TcpMessageServer {
    fn drop(&mut self) {
        self.stop();
        self.tx_queue.stop();
        self.rx_queue.stop();
    }
}
