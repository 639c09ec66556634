//! Shared-memory server/client split with separate TX and RX rings.
//!
//! One region carries two independent rings: the TX ring is written by the
//! server's publishers and read by client subscribers, the RX ring is the
//! mirror. The server owns the region and runs one stall watchdog per ring;
//! the client broker only names the region and hands out queues.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::broker::{BrokerCore, BusQueue, MessageBroker};
use crate::logsink::{bus_error, bus_info};
use crate::queue::MessageQueue;
use crate::shm::layout::RawRing;
use crate::shm::region::{server_region_size, Region};

const MASTER_TICK: Duration = Duration::from_millis(10);
const FULL_TICK: Duration = Duration::from_millis(1);
const POLL_INTERVAL: Duration = Duration::from_millis(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_NAME: &str = "BusMessageServer";

struct TxRxShared {
    queue: MessageQueue,
    name: String,
    channel: AtomicUsize,
    stop_worker: AtomicBool,
    operable: AtomicBool,
    /// Operate on the TX ring when true, on the RX ring otherwise.
    tx_ring: bool,
    publisher: bool,
}

impl TxRxShared {
    fn stopping(&self) -> bool {
        self.stop_worker.load(Ordering::Relaxed)
    }

    fn ring<'a>(&self, region: &'a Region) -> &'a RawRing {
        let shm = region.server_region();
        if self.tx_ring {
            &shm.tx
        } else {
            &shm.rx
        }
    }

    fn connect(&self) -> Option<Region> {
        let result = Region::open(&self.name, server_region_size()).and_then(|region| {
            if region.server_region().initialized() {
                Ok(region)
            } else {
                Err(crate::error::BusError::SharedMemory(format!(
                    "shared memory not initialized. Name: {}",
                    self.name
                )))
            }
        });

        match result {
            Ok(region) => {
                if !self.operable.load(Ordering::Relaxed) {
                    bus_info!("Shared memory connected. Name: {}", self.name);
                    self.operable.store(true, Ordering::Relaxed);
                }
                Some(region)
            }
            Err(err) => {
                if self.operable.load(Ordering::Relaxed) {
                    bus_error!(
                        "Cannot connect to shared memory. Name: {}, Error: {err}",
                        self.name
                    );
                    self.operable.store(false, Ordering::Relaxed);
                }
                None
            }
        }
    }

    fn publisher_task(&self) {
        let mut region: Option<Region> = None;
        while !self.stopping() {
            if region.is_none() {
                region = self.connect();
            }
            let Some(current) = region.as_ref() else {
                std::thread::sleep(RETRY_INTERVAL);
                continue;
            };
            let ring = self.ring(current);

            if ring.buffer_full() {
                std::thread::sleep(POLL_INTERVAL);
                continue;
            }

            self.queue.empty_wait(POLL_INTERVAL);
            let Some(message) = self.queue.pop() else {
                continue;
            };

            let sent = {
                let _guard = ring.lock();
                ring.publisher_poll(&message)
            };
            if !sent {
                // The ring flagged full; hand the message back.
                self.queue.push_front(message);
            }
        }
    }

    fn subscriber_task(&self) {
        let mut region: Option<Region> = None;
        let mut message_buffer = Vec::new();
        while !self.stopping() {
            if region.is_none() {
                region = self.connect();
            }
            let Some(current) = region.as_ref() else {
                std::thread::sleep(RETRY_INTERVAL);
                continue;
            };
            let ring = self.ring(current);

            if self.channel.load(Ordering::Relaxed) == 0 {
                {
                    let _guard = ring.lock();
                    ring.get_channel(&self.channel);
                }
                if self.channel.load(Ordering::Relaxed) == 0 {
                    std::thread::sleep(RETRY_INTERVAL);
                    continue;
                }
            }

            let mut more = true;
            while more && !self.stopping() {
                more = {
                    let _guard = ring.lock();
                    ring.subscriber_poll(&self.channel, &self.operable, &mut message_buffer)
                };
                if more && !message_buffer.is_empty() {
                    self.queue.push_raw(&message_buffer);
                }
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        if let Some(current) = region.as_ref() {
            self.ring(current).release_channel(&self.channel);
        }
    }
}

/// Queue bound to one ring of a server/client region.
pub struct TxRxQueue {
    shared: Arc<TxRxShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TxRxQueue {
    pub(crate) fn new(name: &str, tx_ring: bool, publisher: bool) -> Self {
        Self {
            shared: Arc::new(TxRxShared {
                queue: MessageQueue::new(),
                name: name.to_string(),
                channel: AtomicUsize::new(0),
                stop_worker: AtomicBool::new(false),
                operable: AtomicBool::new(false),
                tx_ring,
                publisher,
            }),
            worker: Mutex::new(None),
        }
    }
}

impl BusQueue for TxRxQueue {
    fn queue(&self) -> &MessageQueue {
        &self.shared.queue
    }

    fn start(&self) {
        self.stop();
        if self.shared.name.is_empty() {
            bus_error!("The shared memory has no name. Invalid use of function.");
            return;
        }

        self.shared.queue.start();
        self.shared.stop_worker.store(false, Ordering::Relaxed);
        self.shared.operable.store(true, Ordering::Relaxed);

        let shared = self.shared.clone();
        let handle = std::thread::spawn(move || {
            if shared.publisher {
                shared.publisher_task();
            } else {
                shared.subscriber_task();
            }
        });
        *self.worker.lock() = Some(handle);
    }

    fn stop(&self) {
        self.shared.stop_worker.store(true, Ordering::Relaxed);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        self.shared.operable.store(false, Ordering::Relaxed);
        self.shared.queue.stop();
        self.shared.stop_worker.store(false, Ordering::Relaxed);
    }
}

impl Drop for TxRxQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Server side of the TX/RX split: owns the region and both watchdogs.
pub struct SharedMemoryServer {
    core: BrokerCore,
    region: Option<Arc<Region>>,
    stop_watchdogs: Arc<AtomicBool>,
    watchdogs: Vec<JoinHandle<()>>,
}

impl SharedMemoryServer {
    pub fn new() -> Self {
        Self {
            core: BrokerCore::new(),
            region: None,
            stop_watchdogs: Arc::new(AtomicBool::new(false)),
            watchdogs: Vec::new(),
        }
    }

    fn spawn_watchdog(&mut self, region: Arc<Region>, tx_ring: bool) {
        let stop = self.stop_watchdogs.clone();
        let label = if tx_ring { "TX buffer" } else { "RX buffer" };
        self.watchdogs.push(std::thread::spawn(move || {
            let mut stall_deadline = None;
            while !stop.load(Ordering::Relaxed) {
                let shm = region.server_region();
                let ring = if tx_ring { &shm.tx } else { &shm.rx };
                let tick = if ring.buffer_full() { FULL_TICK } else { MASTER_TICK };
                std::thread::sleep(tick);
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                ring.arbitrate(&mut stall_deadline, label);
            }
        }));
    }
}

impl Default for SharedMemoryServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBroker for SharedMemoryServer {
    fn core(&self) -> &BrokerCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut BrokerCore {
        &mut self.core
    }

    /// Server publishers write the TX ring.
    fn create_publisher(&mut self) -> Arc<dyn BusQueue> {
        Arc::new(TxRxQueue::new(&self.name(), true, true))
    }

    /// Server subscribers read the RX ring.
    fn create_subscriber(&mut self) -> Arc<dyn BusQueue> {
        Arc::new(TxRxQueue::new(&self.name(), false, false))
    }

    fn start(&mut self) {
        self.stop();
        if self.name().is_empty() {
            self.set_name(DEFAULT_NAME);
        }
        let name = self.name();

        let region = match Region::create(&name, server_region_size()) {
            Ok(region) => Arc::new(region),
            Err(err) => {
                bus_error!("Failed to create the shared memory. Name: {name}, Error: {err}");
                return;
            }
        };

        {
            let shm = region.server_region();
            {
                let _guard = shm.tx.lock();
                shm.tx.init();
            }
            {
                let _guard = shm.rx.lock();
                shm.rx.init();
            }
            shm.set_initialized();
        }
        bus_info!("Shared memory initialized. Name: {name}");

        self.stop_watchdogs.store(false, Ordering::Relaxed);
        self.spawn_watchdog(region.clone(), true);
        self.spawn_watchdog(region.clone(), false);

        self.region = Some(region);
        self.core.set_connected(true);
    }

    fn stop(&mut self) {
        self.core.set_connected(false);

        self.stop_watchdogs.store(true, Ordering::Relaxed);
        for watchdog in self.watchdogs.drain(..) {
            let _ = watchdog.join();
        }
        self.stop_watchdogs.store(false, Ordering::Relaxed);

        self.region = None;
    }
}

impl Drop for SharedMemoryServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Client side of the TX/RX split: maps the server's region by name.
pub struct SharedMemoryClient {
    core: BrokerCore,
}

impl SharedMemoryClient {
    pub fn new() -> Self {
        Self {
            core: BrokerCore::new(),
        }
    }
}

impl Default for SharedMemoryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBroker for SharedMemoryClient {
    fn core(&self) -> &BrokerCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut BrokerCore {
        &mut self.core
    }

    /// Client publishers write the RX ring.
    fn create_publisher(&mut self) -> Arc<dyn BusQueue> {
        Arc::new(TxRxQueue::new(&self.name(), false, true))
    }

    /// Client subscribers read the TX ring.
    fn create_subscriber(&mut self) -> Arc<dyn BusQueue> {
        Arc::new(TxRxQueue::new(&self.name(), true, false))
    }

    fn start(&mut self) {
        self.stop();
        if self.name().is_empty() {
            self.set_name(DEFAULT_NAME);
        }
        self.core.set_connected(true);
    }

    fn stop(&mut self) {
        self.core.set_connected(false);
    }
}
