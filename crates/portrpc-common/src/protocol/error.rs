use thiserror::Error;

use crate::payload::CodecError;
use crate::protocol::version::Version;

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("my version is {ours}, got {theirs}: version is not compatible")]
    IncompatibleVersion { ours: Version, theirs: Version },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("listener is closed")]
    ListenerClosed,

    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("Server error: {0}")]
    Server(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl From<hyper::http::Error> for RpcError {
    fn from(err: hyper::http::Error) -> Self {
        RpcError::Transport(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
