#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker command error: {0}")]
    Command(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Commit/release of a record the broker does not consider in flight.
    #[error("record {offset} on {topic} is not in flight")]
    NotInFlight { topic: String, offset: String },

    /// Internal lock poisoning (in-memory broker).
    #[error("broker state poisoned")]
    Poisoned,
}
