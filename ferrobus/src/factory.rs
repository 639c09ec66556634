//! Broker factory.

use crate::broker::MessageBroker;
use crate::shm::{SharedMemoryBroker, SharedMemoryClient, SharedMemoryServer};
use crate::simulate::SimulateBroker;
use crate::tcp::{TcpMessageBroker, TcpMessageClient, TcpMessageServer};

/// Broker variants the factory can construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerType {
    /// Heap-ring reference transport, no OS resources.
    Simulate,
    /// Shared-memory broadcast ring with a master process.
    SharedMemory,
    /// Server side of the shared-memory TX/RX split.
    SharedMemoryServer,
    /// Client side of the shared-memory TX/RX split.
    SharedMemoryClient,
    /// TCP accept loop bridged into the shared-memory ring.
    Tcp,
    /// Standalone TCP fan-in/fan-out server.
    TcpServer,
    /// TCP client with auto-reconnect.
    TcpClient,
}

/// Construct a broker of the requested variant.
pub fn create_broker(broker_type: BrokerType) -> Box<dyn MessageBroker> {
    match broker_type {
        BrokerType::Simulate => Box::new(SimulateBroker::new()),
        BrokerType::SharedMemory => Box::new(SharedMemoryBroker::new()),
        BrokerType::SharedMemoryServer => Box::new(SharedMemoryServer::new()),
        BrokerType::SharedMemoryClient => Box::new(SharedMemoryClient::new()),
        BrokerType::Tcp => Box::new(TcpMessageBroker::new()),
        BrokerType::TcpServer => Box::new(TcpMessageServer::new()),
        BrokerType::TcpClient => Box::new(TcpMessageClient::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_variant_constructs() {
        let types = [
            BrokerType::Simulate,
            BrokerType::SharedMemory,
            BrokerType::SharedMemoryServer,
            BrokerType::SharedMemoryClient,
            BrokerType::Tcp,
            BrokerType::TcpServer,
            BrokerType::TcpClient,
        ];
        for broker_type in types {
            let broker = create_broker(broker_type);
            assert!(!broker.is_connected());
            assert_eq!(broker.nof_publishers(), 0);
            assert_eq!(broker.nof_subscribers(), 0);
        }
    }
}
