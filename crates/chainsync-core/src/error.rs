use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("truncated input")]
    Truncated,
    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),
    #[error("unknown definition: {0}")]
    UnknownDefinition(u64),
    #[error("corrupt block at offset {offset}: {detail}")]
    CorruptBlock { offset: u64, detail: String },
    #[error("corrupt chain: {0}")]
    CorruptChain(String),
    #[error("stripe exhausted for scope '{0}'")]
    StripeExhausted(String),
    #[error("id {id} out of range for scope '{scope}'")]
    OutOfRange { scope: String, id: u64 },
    #[error("no stripes configured for scope '{0}'")]
    UnknownScope(String),
    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ChainError>;

impl ChainError {
    /// True when the error only means "not enough bytes yet" and the caller
    /// may retry once more input arrives.
    pub fn is_truncated(&self) -> bool {
        matches!(self, ChainError::Truncated)
    }
}
