//! Shared-memory broadcast broker (the master process side).
//!
//! The master creates the named region, initializes the ring and runs the
//! stall watchdog. Publishers and subscribers — local or in foreign
//! processes — open the region by name and take part in the ring protocol;
//! they bind directly to the region and are deliberately not added to the
//! broker's registry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::broker::{BrokerCore, BusQueue, MessageBroker};
use crate::logsink::{bus_error, bus_info};
use crate::shm::queue::SharedMemoryQueue;
use crate::shm::region::{broker_region_size, Region};

const MASTER_TICK: Duration = Duration::from_millis(10);
const FULL_TICK: Duration = Duration::from_millis(1);
const DEFAULT_NAME: &str = "BusMessageMaster";

/// Master of a named shared-memory ring.
pub struct SharedMemoryBroker {
    core: BrokerCore,
    region: Option<Arc<Region>>,
    stop_master: Arc<AtomicBool>,
    master: Option<JoinHandle<()>>,
}

impl SharedMemoryBroker {
    pub fn new() -> Self {
        Self {
            core: BrokerCore::new(),
            region: None,
            stop_master: Arc::new(AtomicBool::new(false)),
            master: None,
        }
    }
}

impl Default for SharedMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBroker for SharedMemoryBroker {
    fn core(&self) -> &BrokerCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut BrokerCore {
        &mut self.core
    }

    /// Create a publisher bound to the region by name.
    ///
    /// The queue is not added to the broker registry; it participates in the
    /// ring protocol directly.
    fn create_publisher(&mut self) -> Arc<dyn BusQueue> {
        Arc::new(SharedMemoryQueue::new(&self.name(), true))
    }

    /// Create a subscriber bound to the region by name, see
    /// [`create_publisher`](Self::create_publisher).
    fn create_subscriber(&mut self) -> Arc<dyn BusQueue> {
        Arc::new(SharedMemoryQueue::new(&self.name(), false))
    }

    fn start(&mut self) {
        self.stop();
        if self.name().is_empty() {
            self.set_name(DEFAULT_NAME);
        }
        let name = self.name();

        let region = match Region::create(&name, broker_region_size()) {
            Ok(region) => Arc::new(region),
            Err(err) => {
                bus_error!("Failed to create the shared memory. Name: {name}, Error: {err}");
                return;
            }
        };

        {
            let shm = region.broker_region();
            let _guard = shm.ring.lock();
            shm.ring.init();
            shm.set_initialized();
        }
        bus_info!("Shared memory initialized. Name: {name}");

        self.stop_master.store(false, Ordering::Relaxed);
        let master_region = region.clone();
        let stop_master = self.stop_master.clone();
        self.master = Some(std::thread::spawn(move || {
            let mut stall_deadline = None;
            while !stop_master.load(Ordering::Relaxed) {
                let ring = &master_region.broker_region().ring;
                // React quickly while the ring is full so the reset lands
                // as soon as the readers catch up.
                let tick = if ring.buffer_full() { FULL_TICK } else { MASTER_TICK };
                std::thread::sleep(tick);
                if stop_master.load(Ordering::Relaxed) {
                    break;
                }
                ring.arbitrate(&mut stall_deadline, "Buffer");
            }
        }));

        self.region = Some(region);
        self.core.set_connected(true);
    }

    fn stop(&mut self) {
        self.core.set_connected(false);

        self.stop_master.store(true, Ordering::Relaxed);
        if let Some(master) = self.master.take() {
            let _ = master.join();
        }
        self.stop_master.store(false, Ordering::Relaxed);

        // Dropping the owner mapping removes the region name.
        self.region = None;
    }
}

impl Drop for SharedMemoryBroker {
    fn drop(&mut self) {
        self.stop();
    }
}
