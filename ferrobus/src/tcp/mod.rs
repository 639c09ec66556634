//! TCP transports.
//!
//! Every record on the wire is a 4-byte little-endian length prefix followed
//! by exactly that many bytes of a serialized bus message — the same framing
//! the shared rings use. Each server, client and broker owns a single
//! reactor thread running a current-thread tokio runtime; the handler tasks
//! never block it for more than the queue wait slices.

mod broker;
mod client;
mod connection;
mod server;

pub use broker::TcpMessageBroker;
pub use client::TcpMessageClient;
pub use server::TcpMessageServer;

use std::sync::Arc;
use std::thread::JoinHandle;

use bytes::{BufMut, BytesMut};
use tokio::sync::Notify;

use crate::error::BusResult;
use crate::logsink::bus_trace;
use crate::message::BusMessage;

/// Length-prefix a serialized message for the wire.
///
/// Returns `None` when the message refuses to serialize; the caller drops
/// it (serialization already logged the reason).
pub(crate) fn encode_frame(message: &BusMessage) -> Option<BytesMut> {
    let mut raw = Vec::new();
    message.to_raw(&mut raw);
    if !message.valid() {
        return None;
    }

    let mut frame = BytesMut::with_capacity(4 + raw.len());
    frame.put_u32_le(raw.len() as u32);
    frame.put_slice(&raw);
    Some(frame)
}

/// One reactor thread driving a current-thread tokio runtime.
///
/// Tasks are spawned from the owning broker thread; stopping notifies the
/// runtime out of its parked state and drops it, cancelling every task.
pub(crate) struct Reactor {
    handle: tokio::runtime::Handle,
    shutdown: Arc<Notify>,
    thread: Option<JoinHandle<()>>,
}

impl Reactor {
    pub fn spawn(name: &str) -> BusResult<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        let shutdown = Arc::new(Notify::new());

        let park = shutdown.clone();
        let thread_name = format!("{name}-reactor");
        let thread = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                runtime.block_on(async move {
                    park.notified().await;
                });
                bus_trace!("Stopped reactor thread {thread_name}");
            })?;

        Ok(Self {
            handle,
            shutdown,
            thread: Some(thread),
        })
    }

    pub fn spawn_task<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(task);
    }

    pub fn stop(&mut self) {
        self.shutdown.notify_one();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.stop();
    }
}
