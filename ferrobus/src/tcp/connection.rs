//! One accepted TCP connection.
//!
//! A connection owns the socket halves and a pair of queues supplied by the
//! hosting broker: everything read off the socket is pushed raw into the
//! publisher queue, and everything arriving in the subscriber queue is
//! length-framed and written to the socket. Either task marks the
//! connection closed on EOF or error; the broker's sweep reaps it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::broker::{BusQueue, Registry};
use crate::logsink::{bus_error, bus_info};
use crate::tcp::encode_frame;

const SEND_WAIT: Duration = Duration::from_millis(100);

pub(crate) struct TcpConnection {
    publisher: Arc<dyn BusQueue>,
    subscriber: Arc<dyn BusQueue>,
    /// Registry the queues were attached to, if any; they are detached when
    /// the connection goes away.
    registry: Option<Arc<Registry>>,
    closed: Arc<AtomicBool>,
}

impl TcpConnection {
    /// Take ownership of an accepted socket and launch the read/write tasks.
    ///
    /// Must be called from within the broker's reactor, which is where every
    /// accept loop runs.
    pub fn spawn(
        stream: TcpStream,
        publisher: Arc<dyn BusQueue>,
        subscriber: Arc<dyn BusQueue>,
        registry: Option<Arc<Registry>>,
    ) -> Self {
        publisher.start();
        subscriber.start();

        let closed = Arc::new(AtomicBool::new(false));
        let (read_half, write_half) = stream.into_split();

        tokio::spawn(read_task(read_half, publisher.clone(), closed.clone()));
        tokio::spawn(write_task(write_half, subscriber.clone(), closed.clone()));

        Self {
            publisher,
            subscriber,
            registry,
            closed,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Relaxed);
        self.publisher.stop();
        self.subscriber.stop();
        if let Some(registry) = self.registry.take() {
            registry.remove_publisher(&self.publisher);
            registry.remove_subscriber(&self.subscriber);
        }
    }
}

async fn read_task(
    mut read_half: OwnedReadHalf,
    publisher: Arc<dyn BusQueue>,
    closed: Arc<AtomicBool>,
) {
    let mut size_data = [0u8; 4];
    while !closed.load(Ordering::Relaxed) {
        match read_half.read_exact(&mut size_data).await {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                bus_info!("Connection closed by remote");
                break;
            }
            Err(err) => {
                bus_error!("Message size error. Error: {err}");
                break;
            }
        }

        let length = u32::from_le_bytes(size_data) as usize;
        if length == 0 {
            continue;
        }

        let mut message_data = vec![0u8; length];
        if let Err(err) = read_half.read_exact(&mut message_data).await {
            bus_error!("Read message error. Error: {err}");
            break;
        }
        publisher.push_raw(&message_data);
    }
    closed.store(true, Ordering::Relaxed);
}

async fn write_task(
    mut write_half: OwnedWriteHalf,
    subscriber: Arc<dyn BusQueue>,
    closed: Arc<AtomicBool>,
) {
    while !closed.load(Ordering::Relaxed) {
        let Some(message) = subscriber.queue().pop_wait_async(SEND_WAIT).await else {
            continue;
        };
        let Some(frame) = encode_frame(&message) else {
            continue;
        };
        if let Err(err) = write_half.write_all(&frame).await {
            bus_error!("Send message error. Error: {err}");
            break;
        }
    }
    closed.store(true, Ordering::Relaxed);
}
