//! Broker boundary: the topic operations the engine needs, and an in-memory
//! implementation for tests/dev.

pub mod broker;
pub mod error;
pub mod in_memory;

pub use broker::Broker;
pub use error::BrokerError;
pub use in_memory::InMemoryBroker;
