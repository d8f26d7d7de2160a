//! Error types for the transport and orchestrator layer.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("core: {0}")]
    Core(#[from] chainsync_core::ChainError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transport: {0}")]
    Transport(String),
    #[error("handshake rejected: {0}")]
    Handshake(String),
    #[error("peer lost: {0}")]
    PeerLost(String),
    #[error("message pool misuse: {0}")]
    PoolMisuse(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("channel closed")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, NetError>;
