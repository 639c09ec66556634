//! Publisher/subscriber queues bound to the broadcast shared-memory ring.
//!
//! The queues live in any process, including ones foreign to the master.
//! Each worker runs a small state machine: `WaitOnSharedMemory` until the
//! named region exists and is initialized, then `HandleMessages`; any
//! failure falls back to waiting with a 1 second reopen retry. The
//! `operable` latch suppresses duplicate error logs while the region is
//! down.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::broker::BusQueue;
use crate::logsink::{bus_error, bus_info};
use crate::queue::MessageQueue;
use crate::shm::region::{broker_region_size, Region};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(1);

pub(crate) struct ShmQueueShared {
    queue: MessageQueue,
    name: String,
    channel: AtomicUsize,
    stop_worker: AtomicBool,
    operable: AtomicBool,
    publisher: bool,
}

impl ShmQueueShared {
    fn stopping(&self) -> bool {
        self.stop_worker.load(Ordering::Relaxed)
    }

    /// Open the named region and check the master has initialized it.
    fn connect(&self) -> Option<Region> {
        let result = Region::open(&self.name, broker_region_size()).and_then(|region| {
            if region.broker_region().initialized() {
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
            let ring = &current.broker_region().ring;

            if ring.buffer_full() {
                std::thread::sleep(POLL_INTERVAL);
                continue;
            }

            self.queue.empty_wait(POLL_INTERVAL);
            if self.queue.is_empty() {
                continue;
            }

            while !self.stopping() && !self.queue.is_empty() && !ring.buffer_full() {
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
            let ring = &current.broker_region().ring;

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

        if let Some(region) = region.as_ref() {
            region.broker_region().ring.release_channel(&self.channel);
        }
    }
}

/// Queue connected to a [`SharedMemoryBroker`](crate::shm::SharedMemoryBroker)
/// region by name.
pub struct SharedMemoryQueue {
    shared: Arc<ShmQueueShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SharedMemoryQueue {
    pub(crate) fn new(name: &str, publisher: bool) -> Self {
        Self {
            shared: Arc::new(ShmQueueShared {
                queue: MessageQueue::new(),
                name: name.to_string(),
                channel: AtomicUsize::new(0),
                stop_worker: AtomicBool::new(false),
                operable: AtomicBool::new(false),
                publisher,
            }),
            worker: Mutex::new(None),
        }
    }
}

impl BusQueue for SharedMemoryQueue {
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

impl Drop for SharedMemoryQueue {
    fn drop(&mut self) {
        self.stop();
    }
}
