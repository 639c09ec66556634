//! # ferrobus — message bus library
//!
//! Fans out framed bus messages (chiefly CAN data frames) from one or more
//! producers to one or more consumers through pluggable transports:
//!
//! * **In-process** — [`InProcessBroker`], a broadcast loop over plain
//!   queues.
//! * **Cross-process** — [`SharedMemoryBroker`] and the
//!   [`SharedMemoryServer`]/[`SharedMemoryClient`] split, a multi-reader
//!   broadcast ring in a named shared-memory region with a master process
//!   arbitrating buffer-full reclaim.
//! * **Cross-host** — [`TcpMessageBroker`], [`TcpMessageServer`] and
//!   [`TcpMessageClient`], length-framed TCP streams with auto-reconnect.
//!
//! Every transport moves the same wire format: an 18-byte little-endian
//! message header plus a type-specific payload, length-prefixed on the wire
//! and in the rings. Delivery is best-effort broadcast; a ring that stays
//! full for 10 seconds is forcibly reclaimed at the cost of the slow
//! subscribers' unread records.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use ferrobus::{BrokerType, BusMessage, BusMessageType, BusQueue, MessageBroker};
//!
//! let mut broker = ferrobus::create_broker(BrokerType::SharedMemory);
//! broker.set_name("BusMessageMaster");
//! broker.start();
//!
//! let publisher = broker.create_publisher();
//! publisher.start();
//! let subscriber = broker.create_subscriber();
//! subscriber.start();
//!
//! let mut frame = BusMessage::new(BusMessageType::CanDataFrame);
//! frame.set_can_id(123);
//! frame.set_data_bytes(&[1, 2, 3, 4]);
//! publisher.push(Arc::new(frame));
//!
//! if let Some(received) = subscriber.pop_wait(Duration::from_secs(1)) {
//!     println!("{}", received.to_text(0));
//! }
//!
//! subscriber.stop();
//! publisher.stop();
//! broker.stop();
//! ```

pub mod broker;
pub mod can;
pub mod error;
pub mod factory;
pub mod little_endian;
pub mod logsink;
pub mod message;
pub mod queue;
pub mod shm;
pub mod simulate;
pub mod tcp;

pub use broker::{BrokerConfig, BusQueue, DirectQueue, InProcessBroker, MessageBroker};
pub use can::{CanDataFrame, CAN_DATA_FRAME_SIZE, DLC_TO_LENGTH, EXTENDED_ID_BIT};
pub use error::{BusError, BusResult};
pub use factory::{create_broker, BrokerType};
pub use little_endian::LittleBuffer;
pub use logsink::{
    clear_log_sink, error_count, install_console_sink, install_null_sink, reset_error_count,
    set_log_sink, LogLocation, LogSeverity,
};
pub use message::{BusMessage, BusMessageType, MessageHandle, MessagePayload, HEADER_SIZE};
pub use queue::MessageQueue;
pub use shm::{SharedMemoryBroker, SharedMemoryClient, SharedMemoryQueue, SharedMemoryServer};
pub use simulate::{SimulateBroker, SimulateQueue};
pub use tcp::{TcpMessageBroker, TcpMessageClient, TcpMessageServer};
