use crate::ledger::LedgerError;

/// Errors surfaced by the relay core to its callers.
///
/// Transient transport failures are absorbed by the dispatcher's retry
/// path; the variants here are the ones an application has to act on.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("no viable route to {destination}")]
    NoViableRoute { destination: String },

    #[error("invalid ttl {ttl}: messages must be injected with ttl >= 1")]
    InvalidTtl { ttl: u32 },

    #[error("queue full: item {rejected} rejected")]
    QueueFull { rejected: u64 },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("node is shut down")]
    Shutdown,
}

impl From<rmp_serde::encode::Error> for MeshError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        MeshError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for MeshError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        MeshError::Deserialization(e.to_string())
    }
}
