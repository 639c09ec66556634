//! Common broker contract and the in-process broker.
//!
//! A broker owns the transport: worker threads, the publisher/subscriber
//! registry, and the lifecycle. Publishers are queues the user pushes into
//! and the transport drains; subscribers are queues the transport fills and
//! the user pops from. All broker variants share the same contract, the
//! differences are in how messages travel between the two sides.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::message::MessageHandle;
use crate::queue::MessageQueue;

/// Broadcast sweep interval of the in-process broker.
const SWEEP_INTERVAL: Duration = Duration::from_millis(10);

/// A publisher or subscriber endpoint bound to a broker.
///
/// The concrete type decides what `start`/`stop` do: a plain queue only
/// resets itself, transport-bound queues also run a worker thread that moves
/// messages to or from the wire.
pub trait BusQueue: Send + Sync {
    /// The underlying message FIFO.
    fn queue(&self) -> &MessageQueue;

    /// Start the endpoint (reset the FIFO, launch any transport worker).
    fn start(&self);

    /// Stop the endpoint and any transport worker.
    fn stop(&self);

    fn push(&self, message: MessageHandle) {
        self.queue().push(message);
    }

    fn push_front(&self, message: MessageHandle) {
        self.queue().push_front(message);
    }

    fn push_raw(&self, message_buffer: &[u8]) {
        self.queue().push_raw(message_buffer);
    }

    fn pop(&self) -> Option<MessageHandle> {
        self.queue().pop()
    }

    fn pop_wait(&self, rel_time: Duration) -> Option<MessageHandle> {
        self.queue().pop_wait(rel_time)
    }

    fn empty_wait(&self, rel_time: Duration) {
        self.queue().empty_wait(rel_time)
    }

    fn len(&self) -> usize {
        self.queue().len()
    }

    fn is_empty(&self) -> bool {
        self.queue().is_empty()
    }

    fn message_size(&self) -> u32 {
        self.queue().message_size()
    }

    fn clear(&self) {
        self.queue().clear()
    }
}

/// Queue without a transport worker of its own.
///
/// The in-process broker and the TCP server hand these out; the broker's own
/// workers move the messages.
#[derive(Debug, Default)]
pub struct DirectQueue {
    queue: MessageQueue,
}

impl DirectQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BusQueue for DirectQueue {
    fn queue(&self) -> &MessageQueue {
        &self.queue
    }

    fn start(&self) {
        self.queue.start();
    }

    fn stop(&self) {
        self.queue.stop();
    }
}

/// Per-broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Shared-region name for the memory transports, display name otherwise.
    pub name: String,
    /// Ring buffer size in bytes for the heap ring; the shared-memory rings
    /// are fixed at 16 000 bytes.
    pub memory_size: u32,
    /// TCP bind or connect address. For servers, "" or "0.0.0.0" binds all
    /// interfaces and any other value binds loopback only.
    pub address: String,
    /// TCP port. The conventional range for this library is 42611..42710.
    pub port: u16,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            memory_size: 16_000,
            address: String::new(),
            port: 0,
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    publishers: Vec<Arc<dyn BusQueue>>,
    subscribers: Vec<Arc<dyn BusQueue>>,
}

/// Publisher/subscriber lists, mutated under a single mutex.
#[derive(Default)]
pub struct Registry {
    inner: Mutex<RegistryInner>,
}

impl Registry {
    pub fn add_publisher(&self, publisher: Arc<dyn BusQueue>) {
        self.inner.lock().publishers.push(publisher);
    }

    pub fn add_subscriber(&self, subscriber: Arc<dyn BusQueue>) {
        self.inner.lock().subscribers.push(subscriber);
    }

    pub fn remove_publisher(&self, publisher: &Arc<dyn BusQueue>) {
        self.inner
            .lock()
            .publishers
            .retain(|queue| !Arc::ptr_eq(queue, publisher));
    }

    pub fn remove_subscriber(&self, subscriber: &Arc<dyn BusQueue>) {
        self.inner
            .lock()
            .subscribers
            .retain(|queue| !Arc::ptr_eq(queue, subscriber));
    }

    pub fn nof_publishers(&self) -> usize {
        self.inner.lock().publishers.len()
    }

    pub fn nof_subscribers(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    /// Snapshot of the publisher list.
    pub fn publishers(&self) -> Vec<Arc<dyn BusQueue>> {
        self.inner.lock().publishers.clone()
    }

    /// Snapshot of the subscriber list.
    pub fn subscribers(&self) -> Vec<Arc<dyn BusQueue>> {
        self.inner.lock().subscribers.clone()
    }

    pub fn start_all(&self) {
        let inner = self.inner.lock();
        for queue in inner.publishers.iter().chain(inner.subscribers.iter()) {
            queue.start();
        }
    }

    pub fn stop_all(&self) {
        let inner = self.inner.lock();
        for queue in inner.publishers.iter().chain(inner.subscribers.iter()) {
            queue.stop();
        }
    }
}

/// State every broker variant carries: configuration, connection flag and
/// the endpoint registry.
pub struct BrokerCore {
    config: BrokerConfig,
    connected: Arc<AtomicBool>,
    registry: Arc<Registry>,
}

impl BrokerCore {
    pub fn new() -> Self {
        Self::with_config(BrokerConfig::default())
    }

    pub fn with_config(config: BrokerConfig) -> Self {
        Self {
            config,
            connected: Arc::new(AtomicBool::new(false)),
            registry: Arc::new(Registry::default()),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut BrokerConfig {
        &mut self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn connected_flag(&self) -> &Arc<AtomicBool> {
        &self.connected
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }
}

impl Default for BrokerCore {
    fn default() -> Self {
        Self::new()
    }
}

/// Common lifecycle and registry operations of every broker variant.
pub trait MessageBroker: Send {
    /// Accessor for the shared broker state.
    fn core(&self) -> &BrokerCore;

    /// Mutable accessor for the shared broker state.
    fn core_mut(&mut self) -> &mut BrokerCore;

    /// Create a producer-side queue.
    fn create_publisher(&mut self) -> Arc<dyn BusQueue>;

    /// Create a consumer-side queue.
    fn create_subscriber(&mut self) -> Arc<dyn BusQueue>;

    /// Start the transport workers.
    fn start(&mut self);

    /// Stop the transport workers and join them. Double-stop is a no-op.
    fn stop(&mut self);

    fn name(&self) -> String {
        self.core().config().name.clone()
    }

    fn set_name(&mut self, name: &str) {
        self.core_mut().config_mut().name = name.to_string();
    }

    fn memory_size(&self) -> u32 {
        self.core().config().memory_size
    }

    fn set_memory_size(&mut self, size: u32) {
        self.core_mut().config_mut().memory_size = size;
    }

    fn address(&self) -> String {
        self.core().config().address.clone()
    }

    fn set_address(&mut self, address: &str) {
        self.core_mut().config_mut().address = address.to_string();
    }

    fn port(&self) -> u16 {
        self.core().config().port
    }

    fn set_port(&mut self, port: u16) {
        self.core_mut().config_mut().port = port;
    }

    fn is_connected(&self) -> bool {
        self.core().is_connected()
    }

    fn detach_publisher(&mut self, publisher: &Arc<dyn BusQueue>) {
        self.core().registry().remove_publisher(publisher);
    }

    fn detach_subscriber(&mut self, subscriber: &Arc<dyn BusQueue>) {
        self.core().registry().remove_subscriber(subscriber);
    }

    fn nof_publishers(&self) -> usize {
        self.core().registry().nof_publishers()
    }

    fn nof_subscribers(&self) -> usize {
        self.core().registry().nof_subscribers()
    }
}

/// Broker that broadcasts inside one process.
///
/// A single worker sweeps the registered publishers, drains each one and
/// copies every popped handle into every registered subscriber, then sleeps
/// 10 ms before the next sweep.
#[derive(Default)]
pub struct InProcessBroker {
    core: BrokerCore,
    stop_worker: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl InProcessBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn broadcast_loop(registry: &Registry, stop_worker: &AtomicBool) {
        while !stop_worker.load(Ordering::Relaxed) {
            for publisher in registry.publishers() {
                if stop_worker.load(Ordering::Relaxed) {
                    break;
                }
                while let Some(message) = publisher.pop() {
                    if stop_worker.load(Ordering::Relaxed) {
                        break;
                    }
                    for subscriber in registry.subscribers() {
                        subscriber.push(message.clone());
                    }
                }
            }
            std::thread::sleep(SWEEP_INTERVAL);
        }
    }
}

impl MessageBroker for InProcessBroker {
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

        self.stop_worker.store(false, Ordering::Relaxed);
        let registry = self.core.registry().clone();
        let stop_worker = self.stop_worker.clone();
        self.worker = Some(std::thread::spawn(move || {
            InProcessBroker::broadcast_loop(&registry, &stop_worker);
        }));
        self.core.set_connected(true);
    }

    fn stop(&mut self) {
        self.core.set_connected(false);
        self.stop_worker.store(true, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        self.stop_worker.store(false, Ordering::Relaxed);
    }
}

impl Drop for InProcessBroker {
    fn drop(&mut self) {
        self.stop();
    }
}
