use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("invalid configuration: {0}")]
    Config(#[source] serde_json::Error),

    #[error("Docker API error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("gRPC transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("gRPC call failed: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("filesystem watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("container not found: {0}")]
    ContainerNotFound(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, WorkerError>;
