//! In-region layout of the shared-memory rings.
//!
//! Everything placed in the mapped region is an atomic, so any process can
//! access the bytes without undefined behavior. Consistency of the channel
//! cursors and the payload area is guarded by a per-ring spinlock word; the
//! interprocess condition variable of the buffer-full protocol is realized
//! as the full flag plus short polling (publishers and the master at 10 ms,
//! well inside the 1 s wake ceiling of the original condition loop).

use std::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::time::Instant;

use crate::little_endian::LittleBuffer;
use crate::logsink::bus_error;
use crate::message::BusMessage;
use crate::simulate::STALL_TIMEOUT;

pub(crate) const CHANNEL_COUNT: usize = 256;
pub(crate) const RING_BUFFER_SIZE: usize = 16_000;
const LENGTH_PREFIX_SIZE: usize = 4;

/// Cursor pair of one ring participant. Channel 0 is the write channel.
#[repr(C)]
pub(crate) struct RawChannel {
    used: AtomicU32,
    queue_index: AtomicU32,
}

/// One broadcast ring: lock word, full flag, channel array and payload area.
#[repr(C)]
pub(crate) struct RawRing {
    lock: AtomicU32,
    buffer_full: AtomicU32,
    channels: [RawChannel; CHANNEL_COUNT],
    buffer: [AtomicU8; RING_BUFFER_SIZE],
}

/// Region of the broadcast broker: init flag plus one ring.
#[repr(C)]
pub(crate) struct RawRegion {
    initialized: AtomicU32,
    pub ring: RawRing,
}

/// Region of the server/client split: init flag plus TX and RX rings.
#[repr(C)]
pub(crate) struct RawServerRegion {
    initialized: AtomicU32,
    pub tx: RawRing,
    pub rx: RawRing,
}

impl RawRegion {
    pub fn initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire) != 0
    }

    pub fn set_initialized(&self) {
        self.initialized.store(1, Ordering::Release);
    }
}

impl RawServerRegion {
    pub fn initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire) != 0
    }

    pub fn set_initialized(&self) {
        self.initialized.store(1, Ordering::Release);
    }
}

/// Scoped hold of a ring's spinlock word.
pub(crate) struct RingGuard<'a> {
    ring: &'a RawRing,
}

impl Drop for RingGuard<'_> {
    fn drop(&mut self) {
        self.ring.lock.store(0, Ordering::Release);
    }
}

impl RawRing {
    /// Take the ring lock. Critical sections only copy bytes, so contention
    /// is short; spin a little, then yield.
    pub fn lock(&self) -> RingGuard<'_> {
        let mut spins = 0u32;
        while self
            .lock
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spins += 1;
            if spins < 64 {
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
        RingGuard { ring: self }
    }

    pub fn buffer_full(&self) -> bool {
        self.buffer_full.load(Ordering::Relaxed) != 0
    }

    pub fn set_buffer_full(&self, full: bool) {
        self.buffer_full.store(full as u32, Ordering::Relaxed);
    }

    pub fn channel_used(&self, index: usize) -> bool {
        self.channels[index].used.load(Ordering::Relaxed) != 0
    }

    pub fn set_channel_used(&self, index: usize, used: bool) {
        self.channels[index]
            .used
            .store(used as u32, Ordering::Relaxed);
    }

    pub fn channel_index(&self, index: usize) -> u32 {
        self.channels[index].queue_index.load(Ordering::Relaxed)
    }

    pub fn set_channel_index(&self, index: usize, queue_index: u32) {
        self.channels[index]
            .queue_index
            .store(queue_index, Ordering::Relaxed);
    }

    fn write_bytes(&self, offset: usize, source: &[u8]) {
        for (position, byte) in source.iter().enumerate() {
            self.buffer[offset + position].store(*byte, Ordering::Relaxed);
        }
    }

    fn read_bytes(&self, offset: usize, length: usize, dest: &mut Vec<u8>) {
        dest.clear();
        dest.reserve(length);
        for position in 0..length {
            dest.push(self.buffer[offset + position].load(Ordering::Relaxed));
        }
    }

    fn read_length_prefix(&self, offset: usize) -> u32 {
        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        for (position, byte) in prefix.iter_mut().enumerate() {
            *byte = self.buffer[offset + position].load(Ordering::Relaxed);
        }
        u32::from_le_bytes(prefix)
    }

    /// Reset the ring to its post-create state. Caller holds the lock.
    pub fn init(&self) {
        for index in 0..CHANNEL_COUNT {
            self.set_channel_used(index, false);
            self.set_channel_index(index, 0);
        }
        // Index 0 is the write channel, shared by all publishers.
        self.set_channel_used(0, true);
        self.set_buffer_full(false);
    }

    /// Append one length-prefixed record. Caller holds the lock.
    ///
    /// Returns false without consuming the message when the record does not
    /// fit; the full flag is raised in that case.
    pub fn publisher_poll(&self, message: &BusMessage) -> bool {
        let message_size = message.size();
        let write_index = self.channel_index(0);

        let mut bytes_left = RING_BUFFER_SIZE as i64;
        bytes_left -= write_index as i64;
        bytes_left -= message_size as i64;
        bytes_left -= LENGTH_PREFIX_SIZE as i64;

        if bytes_left < 0 {
            self.set_buffer_full(true);
            return false;
        }

        let mut message_buffer = Vec::new();
        message.to_raw(&mut message_buffer);
        if message_buffer.len() != message_size as usize {
            bus_error!(
                "Mismatching message sizes ({}/{message_size}). Internal error",
                message_buffer.len()
            );
            return false;
        }

        let mut index = write_index as usize;
        self.write_bytes(index, LittleBuffer::new(message_size).as_bytes());
        index += LENGTH_PREFIX_SIZE;
        self.write_bytes(index, &message_buffer);
        index += message_buffer.len();
        self.set_channel_index(0, index as u32);
        true
    }

    /// Copy the next unread record for `channel` into `message_buffer`.
    /// Caller holds the lock.
    ///
    /// Returns false when there is nothing to read or the cursor had to be
    /// recovered; bound violations snap the read cursor to the write cursor
    /// and drop the partial record.
    pub fn subscriber_poll(
        &self,
        channel: &AtomicUsize,
        operable: &std::sync::atomic::AtomicBool,
        message_buffer: &mut Vec<u8>,
    ) -> bool {
        message_buffer.clear();

        let out_index = channel.load(Ordering::Relaxed);
        if out_index == 0 {
            bus_error!("Invalid subscriber channel index. Index: {out_index}");
            return false;
        }

        if !self.channel_used(out_index) {
            // The master reinitialized the region behind our back; get a
            // fresh channel.
            bus_error!("Channel suddenly unused. Channel: {out_index}");
            channel.store(0, Ordering::Relaxed);
            operable.store(false, Ordering::Relaxed);
            return false;
        }

        let in_index = self.channel_index(0);
        let read_index = self.channel_index(out_index);

        if in_index < read_index {
            bus_error!(
                "Invalid channel indexes. Channel: {out_index}, Index: {in_index}/{read_index}"
            );
            self.set_channel_index(out_index, in_index);
            return false;
        }

        if in_index == read_index {
            // No message to read
            return false;
        }

        let mut read_index = read_index as usize;
        if read_index + LENGTH_PREFIX_SIZE > RING_BUFFER_SIZE {
            bus_error!("Length out-of-bound. Index: {read_index}/{RING_BUFFER_SIZE}");
            self.set_channel_index(out_index, in_index);
            return false;
        }

        let message_length = self.read_length_prefix(read_index) as usize;
        read_index += LENGTH_PREFIX_SIZE;

        if read_index + message_length > RING_BUFFER_SIZE {
            bus_error!(
                "Data out-of-bound. Index: {read_index}, Length: {message_length}, Size: {RING_BUFFER_SIZE}"
            );
            self.set_channel_index(out_index, in_index);
            return false;
        }

        self.read_bytes(read_index, message_length, message_buffer);
        self.set_channel_index(out_index, (read_index + message_length) as u32);
        true
    }

    /// Allocate a free read channel, leaving `channel` at 0 when all 255
    /// slots are taken. Caller holds the lock.
    pub fn get_channel(&self, channel: &AtomicUsize) {
        for index in 1..CHANNEL_COUNT {
            if self.channel_used(index) {
                continue;
            }
            self.set_channel_used(index, true);
            // Subscribe from the current write position.
            self.set_channel_index(index, self.channel_index(0));
            channel.store(index, Ordering::Relaxed);
            return;
        }
        bus_error!(
            "No free subscriber channel, all {} slots used",
            CHANNEL_COUNT - 1
        );
    }

    /// Hand a read channel back. Takes the lock itself.
    pub fn release_channel(&self, channel: &AtomicUsize) {
        let index = channel.swap(0, Ordering::Relaxed);
        if index != 0 {
            let _guard = self.lock();
            self.set_channel_used(index, false);
        }
    }

    /// One master arbitration step: reclaim the ring when every used read
    /// channel has caught up with the writer, or after the stall timeout
    /// while the ring is full. Takes the lock itself.
    pub fn arbitrate(&self, stall_deadline: &mut Option<Instant>, label: &str) {
        let _guard = self.lock();

        let write_index = self.channel_index(0);
        let all_caught_up = (0..CHANNEL_COUNT)
            .filter(|index| self.channel_used(*index))
            .all(|index| self.channel_index(index) == write_index);

        if all_caught_up {
            self.reset_channels();
            *stall_deadline = None;
        } else if self.buffer_full() {
            let now = Instant::now();
            match stall_deadline {
                None => *stall_deadline = Some(now + STALL_TIMEOUT),
                Some(deadline) if now > *deadline => {
                    bus_error!("{label} full (10s) timeout occurred. Resetting");
                    self.reset_channels();
                    *stall_deadline = None;
                }
                Some(_) => {}
            }
        }
    }

    fn reset_channels(&self) {
        for index in 0..CHANNEL_COUNT {
            self.set_channel_index(index, 0);
        }
        self.set_buffer_full(false);
    }
}
