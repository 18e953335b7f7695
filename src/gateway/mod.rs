//! Request orchestration between the HTTP front and the drive

pub mod drive;
pub mod tee;

pub use drive::DriveGateway;

use crate::graph::ByteStream;

/// Errors surfaced to HTTP handlers
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The account or the remote drive cannot serve the request right now
    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

/// Content of an opened file
pub enum FileBody {
    /// Served from the local content cache
    Cached { file: tokio::fs::File, len: u64 },
    /// Streamed from the remote drive, copied into the cache on the way
    Remote {
        headers: Vec<(String, String)>,
        content_length: Option<u64>,
        body: ByteStream,
    },
}
