use collector_common::{ErrorKind, ReportableError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolManagerError {
    #[error("pool {0:?} not found")]
    NotFound(String),
    #[error("global connection ceiling exceeded: {requested} requested, {ceiling} allowed")]
    OverGlobalLimit { requested: u32, ceiling: u32 },
    #[error("circuit open for pool {0:?}")]
    CircuitOpen(String),
    #[error("pool {0:?} at max_open capacity")]
    PoolExhausted(String),
    #[error("pool manager is shutting down")]
    ShuttingDown,
}

impl ReportableError for PoolManagerError {
    fn kind(&self) -> ErrorKind {
        match self {
            PoolManagerError::NotFound(_) => ErrorKind::Upstream,
            PoolManagerError::OverGlobalLimit { .. } => ErrorKind::Resource,
            PoolManagerError::CircuitOpen(_) => ErrorKind::Transient,
            PoolManagerError::PoolExhausted(_) => ErrorKind::Resource,
            PoolManagerError::ShuttingDown => ErrorKind::Fatal,
        }
    }

    fn metric_label(&self) -> Option<String> {
        Some(
            match self {
                PoolManagerError::NotFound(_) => "pool.not_found",
                PoolManagerError::OverGlobalLimit { .. } => "pool.over_global_limit",
                PoolManagerError::CircuitOpen(_) => "pool.circuit_open",
                PoolManagerError::PoolExhausted(_) => "pool.exhausted",
                PoolManagerError::ShuttingDown => "pool.shutting_down",
            }
            .to_owned(),
        )
    }
}
