//! Queue error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue at capacity ({0} messages)")]
    AtCapacity(usize),

    #[error("Message not in flight: {0}")]
    NotInFlight(String),

    #[error("Queue is shut down")]
    ShutDown,
}
