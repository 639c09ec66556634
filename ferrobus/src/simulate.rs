//! In-process reference implementation of the broadcast ring.
//!
//! The simulate broker runs the same channel arbitration as the
//! shared-memory broker, but the ring lives in a heap buffer, so it needs no
//! OS resources. It doubles as a test double and as the executable
//! description of the ring protocol: one write channel at index 0, read
//! channels 1..255, length-prefixed records, buffer-full arbitration by a
//! master task with a 10 second stall reclaim.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::broker::{BrokerCore, BusQueue, MessageBroker};
use crate::little_endian::LittleBuffer;
use crate::logsink::{bus_error, bus_info};
use crate::queue::MessageQueue;

pub(crate) const CHANNEL_COUNT: usize = 256;
pub(crate) const LENGTH_PREFIX_SIZE: u32 = 4;

/// How long the master lets a full ring wait for lagging readers before it
/// forcibly reclaims the buffer.
pub(crate) const STALL_TIMEOUT: Duration = Duration::from_secs(10);

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const MASTER_TICK: Duration = Duration::from_secs(1);
const RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Read or write cursor of one ring participant.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Channel {
    pub used: bool,
    pub queue_index: u32,
}

struct RingState {
    channels: [Channel; CHANNEL_COUNT],
    buffer: Vec<u8>,
}

/// Heap ring shared by the broker, its queues and the master task.
pub(crate) struct SimulateRing {
    state: Mutex<RingState>,
    buffer_full: AtomicBool,
    full_event: Condvar,
    event_lock: Mutex<()>,
}

impl SimulateRing {
    fn new() -> Self {
        Self {
            state: Mutex::new(RingState {
                channels: [Channel::default(); CHANNEL_COUNT],
                buffer: Vec::new(),
            }),
            buffer_full: AtomicBool::new(false),
            full_event: Condvar::new(),
            event_lock: Mutex::new(()),
        }
    }

    pub fn buffer_full(&self) -> bool {
        self.buffer_full.load(Ordering::Relaxed)
    }

    /// Move the head message of `queue` into the ring.
    ///
    /// Raises the buffer-full flag and notifies the master when the record
    /// does not fit.
    fn publisher_poll(&self, queue: &MessageQueue) {
        if self.buffer_full() {
            return;
        }

        let mut state = self.state.lock();

        let message_size = queue.message_size();
        let write_index = state.channels[0].queue_index;
        let mut bytes_left = state.buffer.len() as i64;
        bytes_left -= write_index as i64;
        bytes_left -= message_size as i64;
        bytes_left -= LENGTH_PREFIX_SIZE as i64;

        if bytes_left < 0 {
            self.buffer_full.store(true, Ordering::Relaxed);
            self.full_event.notify_all();
            return;
        }

        let Some(message) = queue.pop() else {
            bus_error!("Popped an empty message. Internal error");
            return;
        };

        let mut message_buffer = Vec::new();
        message.to_raw(&mut message_buffer);
        if message_buffer.len() != message_size as usize {
            bus_error!(
                "Mismatching message sizes ({}/{message_size}). Internal error",
                message_buffer.len()
            );
            return;
        }

        let mut index = write_index as usize;
        let length = LittleBuffer::new(message_size);
        state.buffer[index..index + LENGTH_PREFIX_SIZE as usize]
            .copy_from_slice(length.as_bytes());
        index += LENGTH_PREFIX_SIZE as usize;

        state.buffer[index..index + message_buffer.len()].copy_from_slice(&message_buffer);
        index += message_buffer.len();

        state.channels[0].queue_index = index as u32;
    }

    /// Copy the next unread record for `channel` into the subscriber queue.
    ///
    /// Returns false when there is nothing to read or the cursor had to be
    /// recovered. Any bound violation snaps the read cursor to the write
    /// cursor, dropping the partial record.
    fn subscriber_poll(&self, channel: &AtomicUsize, queue: &MessageQueue) -> bool {
        let out_index = channel.load(Ordering::Relaxed);
        if out_index == 0 {
            bus_error!("Invalid subscriber channel index. Index: {out_index}");
            return false;
        }

        let mut message_buffer = Vec::new();
        {
            let mut state = self.state.lock();
            let in_channel = state.channels[0];
            let out_channel = state.channels[out_index];

            if !out_channel.used {
                // The ring was reinitialized behind our back.
                bus_error!("Channel suddenly unused. Channel: {out_index}");
                channel.store(0, Ordering::Relaxed);
                return false;
            }

            if in_channel.queue_index < out_channel.queue_index {
                bus_error!(
                    "Invalid channel indexes. Channel: {out_index}, Index: {}/{}",
                    in_channel.queue_index,
                    out_channel.queue_index
                );
                state.channels[out_index].queue_index = in_channel.queue_index;
                return false;
            }

            if in_channel.queue_index == out_channel.queue_index {
                // Nothing to read
                return false;
            }

            let mut read_index = out_channel.queue_index as usize;
            if read_index + LENGTH_PREFIX_SIZE as usize > state.buffer.len() {
                bus_error!(
                    "Length out-of-bound. Index: {read_index}/{}",
                    state.buffer.len()
                );
                state.channels[out_index].queue_index = in_channel.queue_index;
                return false;
            }

            let length: LittleBuffer<u32> = match LittleBuffer::from_slice(&state.buffer, read_index)
            {
                Ok(length) => length,
                Err(err) => {
                    bus_error!("Length read failure. Error: {err}");
                    state.channels[out_index].queue_index = in_channel.queue_index;
                    return false;
                }
            };
            read_index += LENGTH_PREFIX_SIZE as usize;
            let message_length = length.value() as usize;

            if read_index + message_length > state.buffer.len() {
                bus_error!(
                    "Data out-of-bound. Index: {read_index}, Length: {message_length}, Size: {}",
                    state.buffer.len()
                );
                state.channels[out_index].queue_index = in_channel.queue_index;
                return false;
            }

            message_buffer.extend_from_slice(&state.buffer[read_index..read_index + message_length]);
            state.channels[out_index].queue_index = (read_index + message_length) as u32;
        }

        if !message_buffer.is_empty() {
            queue.push_raw(&message_buffer);
        }
        true
    }

    /// Allocate a free read channel, or leave `channel` at 0 when all 255
    /// slots are taken.
    fn get_channel(&self, channel: &AtomicUsize) {
        let mut state = self.state.lock();
        for index in 1..CHANNEL_COUNT {
            if state.channels[index].used {
                continue;
            }
            state.channels[index].used = true;
            // Subscribe from the current write position.
            state.channels[index].queue_index = state.channels[0].queue_index;
            channel.store(index, Ordering::Relaxed);
            return;
        }
        bus_error!("No free subscriber channel, all {} slots used", CHANNEL_COUNT - 1);
    }

    fn release_channel(&self, channel: &AtomicUsize) {
        let index = channel.swap(0, Ordering::Relaxed);
        if index != 0 {
            let mut state = self.state.lock();
            state.channels[index].used = false;
        }
    }

    /// Master arbitration step: reclaim the ring when every reader has
    /// caught up, or after the stall timeout while the ring is full.
    fn handle_buffer_full(&self, stall_deadline: &mut Option<Instant>) {
        let mut state = self.state.lock();

        let write_index = state.channels[0].queue_index;
        let all_caught_up = state
            .channels
            .iter()
            .filter(|channel| channel.used)
            .all(|channel| channel.queue_index == write_index);

        if all_caught_up {
            Self::reset_channels(&mut state);
            self.buffer_full.store(false, Ordering::Relaxed);
            *stall_deadline = None;
        } else if self.buffer_full() {
            let now = Instant::now();
            match stall_deadline {
                None => *stall_deadline = Some(now + STALL_TIMEOUT),
                Some(deadline) if now > *deadline => {
                    bus_error!("Buffer full (10s) timeout occurred. Resetting");
                    Self::reset_channels(&mut state);
                    self.buffer_full.store(false, Ordering::Relaxed);
                    *stall_deadline = None;
                }
                Some(_) => {}
            }
        }
    }

    fn reset_channels(state: &mut RingState) {
        for channel in state.channels.iter_mut() {
            channel.queue_index = 0;
        }
    }

    fn master_loop(&self, stop_master: &AtomicBool) {
        let mut stall_deadline = None;
        while !stop_master.load(Ordering::Relaxed) {
            if !self.buffer_full() {
                let mut event = self.event_lock.lock();
                let _ = self.full_event.wait_for(&mut event, MASTER_TICK);
            } else {
                // While the ring is full, re-check rapidly so the reset
                // lands as soon as the readers catch up.
                std::thread::sleep(Duration::from_millis(1));
            }
            if stop_master.load(Ordering::Relaxed) {
                break;
            }
            self.handle_buffer_full(&mut stall_deadline);
        }
    }
}

struct SimulateShared {
    queue: MessageQueue,
    ring: Arc<SimulateRing>,
    channel: AtomicUsize,
    stop_worker: AtomicBool,
    publisher: bool,
}

impl SimulateShared {
    fn stopping(&self) -> bool {
        self.stop_worker.load(Ordering::Relaxed)
    }

    fn publisher_task(&self) {
        while !self.stopping() {
            while !self.ring.buffer_full() && !self.queue.is_empty() && !self.stopping() {
                self.ring.publisher_poll(&self.queue);
                std::thread::yield_now();
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn subscriber_task(&self) {
        while !self.stopping() {
            if self.channel.load(Ordering::Relaxed) == 0 {
                self.ring.get_channel(&self.channel);
                if self.channel.load(Ordering::Relaxed) == 0 {
                    std::thread::sleep(RETRY_INTERVAL);
                    continue;
                }
            }

            while self.ring.subscriber_poll(&self.channel, &self.queue) && !self.stopping() {
                std::thread::yield_now();
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

/// Publisher or subscriber queue bound to a [`SimulateBroker`] ring.
pub struct SimulateQueue {
    shared: Arc<SimulateShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SimulateQueue {
    fn new(ring: Arc<SimulateRing>, publisher: bool) -> Self {
        Self {
            shared: Arc::new(SimulateShared {
                queue: MessageQueue::new(),
                ring,
                channel: AtomicUsize::new(0),
                stop_worker: AtomicBool::new(false),
                publisher,
            }),
            worker: Mutex::new(None),
        }
    }

    /// Stop and join the worker thread, keeping any channel allocation.
    fn join_worker(&self) {
        self.shared.stop_worker.store(true, Ordering::Relaxed);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        self.shared.stop_worker.store(false, Ordering::Relaxed);
    }
}

impl BusQueue for SimulateQueue {
    fn queue(&self) -> &MessageQueue {
        &self.shared.queue
    }

    fn start(&self) {
        self.join_worker();

        self.shared.queue.start();
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
        self.join_worker();
        if !self.shared.publisher {
            self.shared.ring.release_channel(&self.shared.channel);
        }
        self.shared.queue.stop();
    }
}

impl Drop for SimulateQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Broker over the heap ring.
pub struct SimulateBroker {
    core: BrokerCore,
    ring: Arc<SimulateRing>,
    stop_master: Arc<AtomicBool>,
    master: Option<JoinHandle<()>>,
}

impl SimulateBroker {
    pub fn new() -> Self {
        Self {
            core: BrokerCore::new(),
            ring: Arc::new(SimulateRing::new()),
            stop_master: Arc::new(AtomicBool::new(false)),
            master: None,
        }
    }

    /// True while the ring is full and publishers are blocked.
    pub fn buffer_full(&self) -> bool {
        self.ring.buffer_full()
    }
}

impl Default for SimulateBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBroker for SimulateBroker {
    fn core(&self) -> &BrokerCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut BrokerCore {
        &mut self.core
    }

    fn create_publisher(&mut self) -> Arc<dyn BusQueue> {
        let publisher: Arc<dyn BusQueue> = Arc::new(SimulateQueue::new(self.ring.clone(), true));
        self.core.registry().add_publisher(publisher.clone());
        publisher
    }

    fn create_subscriber(&mut self) -> Arc<dyn BusQueue> {
        let subscriber = Arc::new(SimulateQueue::new(self.ring.clone(), false));
        // The read channel is claimed up front; the worker keeps it for as
        // long as the queue runs.
        self.ring.get_channel(&subscriber.shared.channel);
        let subscriber: Arc<dyn BusQueue> = subscriber;
        self.core.registry().add_subscriber(subscriber.clone());
        subscriber
    }

    fn start(&mut self) {
        self.stop();

        if self.memory_size() < 1_000 {
            bus_info!("Very small memory allocated. Memory: {}", self.memory_size());
            self.set_memory_size(0x10000);
        }

        {
            let mut state = self.ring.state.lock();
            // Rewind the cursors but keep channel allocations made before
            // the broker started.
            for channel in state.channels.iter_mut() {
                channel.queue_index = 0;
            }
            let memory_size = self.core.config().memory_size as usize;
            state.buffer.clear();
            state.buffer.resize(memory_size, 0);

            // Index 0 is the write channel, shared by all publishers.
            state.channels[0].used = true;
        }
        self.ring.buffer_full.store(false, Ordering::Relaxed);

        self.stop_master.store(false, Ordering::Relaxed);
        let ring = self.ring.clone();
        let stop_master = self.stop_master.clone();
        self.master = Some(std::thread::spawn(move || {
            ring.master_loop(&stop_master);
        }));

        self.core.registry().start_all();
        self.core.set_connected(true);
    }

    fn stop(&mut self) {
        self.core.set_connected(false);
        self.core.registry().stop_all();

        self.stop_master.store(true, Ordering::Relaxed);
        self.ring.full_event.notify_all();
        if let Some(master) = self.master.take() {
            let _ = master.join();
        }
        self.stop_master.store(false, Ordering::Relaxed);
    }
}

impl Drop for SimulateBroker {
    fn drop(&mut self) {
        self.stop();
    }
}
