//! Shared-memory transports.
//!
//! Two variants share the ring protocol of the [simulate
//! broker](crate::simulate::SimulateBroker):
//!
//! * [`SharedMemoryBroker`] — one broadcast ring, one writer cursor and up
//!   to 255 reader cursors, arbitrated by the master process.
//! * [`SharedMemoryServer`]/[`SharedMemoryClient`] — two rings (TX and RX)
//!   in one region for a full-duplex in-host split.

pub(crate) mod layout;
pub(crate) mod region;

mod broker;
mod queue;
mod server;

pub use broker::SharedMemoryBroker;
pub use queue::SharedMemoryQueue;
pub use server::{SharedMemoryClient, SharedMemoryServer, TxRxQueue};
