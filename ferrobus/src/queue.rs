//! Thread-safe FIFO of bus messages.
//!
//! The queue is the primitive every transport builds on: producers push
//! owned message handles, transport workers drain them into the wire, and
//! subscriber workers push decoded messages back in for the consumer to pop.
//! The size counter is mirrored in an atomic so it can be observed without
//! taking the lock.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;

use crate::logsink::bus_error;
use crate::message::{BusMessage, BusMessageType, MessageHandle};

/// Thread-safe message FIFO with timed waits.
#[derive(Debug, Default)]
pub struct MessageQueue {
    queue: Mutex<VecDeque<MessageHandle>>,
    queue_size: AtomicUsize,
    not_empty: Condvar,
    async_not_empty: Notify,
    stopped: AtomicBool,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message and wake one waiter.
    pub fn push(&self, message: MessageHandle) {
        {
            let mut queue = self.queue.lock();
            queue.push_back(message);
            self.queue_size.store(queue.len(), Ordering::Relaxed);
        }
        self.not_empty.notify_one();
        self.async_not_empty.notify_one();
    }

    /// Prepend a message, used when a transport hands back a message it
    /// could not deliver because the downstream was full.
    pub fn push_front(&self, message: MessageHandle) {
        {
            let mut queue = self.queue.lock();
            queue.push_front(message);
            self.queue_size.store(queue.len(), Ordering::Relaxed);
        }
        self.not_empty.notify_one();
        self.async_not_empty.notify_one();
    }

    /// Decode a raw frame and append the resulting message.
    ///
    /// The frame is dropped with a logged error when the type tag is unknown
    /// or the message does not deserialize to a valid value.
    pub fn push_raw(&self, message_buffer: &[u8]) {
        let tag = match BusMessage::peek_type(message_buffer) {
            Ok(tag) => tag,
            Err(err) => {
                bus_error!("Unreadable message header. Error: {err}");
                return;
            }
        };

        let Some(message_type) = BusMessageType::from_u16(tag) else {
            bus_error!("Unknown message header type {tag}");
            return;
        };

        let mut message = BusMessage::new(message_type);
        message.from_raw(message_buffer);
        if !message.valid() {
            // from_raw already logged the reason
            return;
        }
        self.push(MessageHandle::new(message));
    }

    /// Remove and return the oldest message, or `None` when empty.
    pub fn pop(&self) -> Option<MessageHandle> {
        let mut queue = self.queue.lock();
        let message = queue.pop_front();
        self.queue_size.store(queue.len(), Ordering::Relaxed);
        message
    }

    /// Wait up to `rel_time` for a message, then pop.
    pub fn pop_wait(&self, rel_time: Duration) -> Option<MessageHandle> {
        let deadline = Instant::now() + rel_time;
        let mut queue = self.queue.lock();
        while queue.is_empty() && !self.stopped.load(Ordering::Relaxed) {
            if self.not_empty.wait_until(&mut queue, deadline).timed_out() {
                break;
            }
        }
        let message = queue.pop_front();
        self.queue_size.store(queue.len(), Ordering::Relaxed);
        message
    }

    /// Async counterpart of [`pop_wait`](Self::pop_wait), used by the TCP
    /// write tasks so a wait never blocks the reactor.
    pub async fn pop_wait_async(&self, rel_time: Duration) -> Option<MessageHandle> {
        if let Some(message) = self.pop() {
            return Some(message);
        }
        let _ = tokio::time::timeout(rel_time, self.async_not_empty.notified()).await;
        self.pop()
    }

    /// Wait up to `rel_time` for the queue to become non-empty without
    /// dequeuing anything.
    pub fn empty_wait(&self, rel_time: Duration) {
        let deadline = Instant::now() + rel_time;
        let mut queue = self.queue.lock();
        while queue.is_empty() && !self.stopped.load(Ordering::Relaxed) {
            if self.not_empty.wait_until(&mut queue, deadline).timed_out() {
                break;
            }
        }
    }

    /// Current number of queued messages, readable without the lock.
    pub fn len(&self) -> usize {
        self.queue_size.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serialized size of the head message, or 0 when empty.
    pub fn message_size(&self) -> u32 {
        let queue = self.queue.lock();
        queue.front().map_or(0, |message| message.size())
    }

    /// Reset the queue to empty and re-arm the waits.
    pub fn start(&self) {
        self.stopped.store(false, Ordering::Relaxed);
        self.clear();
    }

    /// Wake any waiters. The contents are retained for inspection; callers
    /// that reuse the queue call [`clear`](Self::clear) next.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
        self.not_empty.notify_all();
        self.async_not_empty.notify_waiters();
    }

    /// Drop all queued messages.
    pub fn clear(&self) {
        let mut queue = self.queue.lock();
        queue.clear();
        self.queue_size.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{BusMessage, BusMessageType};
    use std::sync::Arc;
    use std::time::Instant;

    fn unit_message() -> MessageHandle {
        Arc::new(BusMessage::new(BusMessageType::Unknown))
    }

    #[test]
    fn test_push_pop_identity() {
        let queue = MessageQueue::new();
        let message = unit_message();
        queue.push(message.clone());
        assert_eq!(queue.len(), 1);

        let popped = queue.pop().expect("one message queued");
        assert!(Arc::ptr_eq(&popped, &message));
        assert_eq!(queue.len(), 0);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_push_front_reorders() {
        let queue = MessageQueue::new();
        let first = unit_message();
        let second = unit_message();
        queue.push(first.clone());
        queue.push_front(second.clone());

        assert!(Arc::ptr_eq(&queue.pop().expect("head"), &second));
        assert!(Arc::ptr_eq(&queue.pop().expect("tail"), &first));
    }

    #[test]
    fn test_pop_wait_times_out_when_empty() {
        let queue = MessageQueue::new();
        let started = Instant::now();
        assert!(queue.pop_wait(Duration::from_millis(50)).is_none());
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(45));
        assert!(elapsed < Duration::from_secs(2));
    }

    #[test]
    fn test_pop_wait_sees_concurrent_push() {
        let queue = Arc::new(MessageQueue::new());
        let producer_queue = queue.clone();
        let producer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer_queue.push(unit_message());
        });

        let message = queue.pop_wait(Duration::from_secs(5));
        assert!(message.is_some());
        producer.join().expect("producer finished");
    }

    #[test]
    fn test_push_raw_round_trip() {
        crate::logsink::install_null_sink();
        let queue = MessageQueue::new();

        let mut msg = BusMessage::new(BusMessageType::CanDataFrame);
        msg.set_message_id(123);
        msg.set_data_bytes(&[1, 2, 3]);
        let mut raw = Vec::new();
        msg.to_raw(&mut raw);

        queue.push_raw(&raw);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.message_size(), msg.size());

        let received = queue.pop().expect("decoded message queued");
        assert_eq!(received.can_id(), 123);
        assert_eq!(received.data_bytes(), &[1, 2, 3]);
    }

    #[test]
    fn test_push_raw_drops_unknown_type() {
        crate::logsink::install_null_sink();
        let queue = MessageQueue::new();

        let mut raw = Vec::new();
        BusMessage::new(BusMessageType::Unknown).to_raw(&mut raw);
        raw[0] = 0xEE; // unknown tag
        queue.push_raw(&raw);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_start_resets_and_stop_wakes() {
        let queue = Arc::new(MessageQueue::new());
        queue.push(unit_message());
        queue.start();
        assert!(queue.is_empty());

        let waiter_queue = queue.clone();
        let waiter = std::thread::spawn(move || {
            // Must return promptly once stop() broadcasts.
            waiter_queue.empty_wait(Duration::from_secs(30));
        });
        std::thread::sleep(Duration::from_millis(20));
        queue.stop();
        queue.push(unit_message());
        waiter.join().expect("waiter woke up");
    }
}
