//! Application-level error type shared by the binary entrypoints.

use thiserror::Error;

use crate::config::AppConfigError;
use crate::engines::EngineError;
use crate::events::PublishError;
use crate::pipeline::PipelineError;
use crate::queue::QueueError;
use crate::server::ServerError;
use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    ConfigLoad(#[from] AppConfigError),
    #[error(transparent)]
    Server(#[from] ServerError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}
