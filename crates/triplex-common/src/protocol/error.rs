use thiserror::Error;

#[derive(Error, Debug)]
pub enum TriplexError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("message too large: {0} bytes (max {1} bytes)")]
    Oversized(usize, usize),

    #[error("timeout after {0}ms")]
    Timeout(u64),

    #[error("signature longer than {0} bytes")]
    SignatureTooLong(usize),

    #[error("unknown service type {0}")]
    UnknownService(u32),

    #[error("registration rejected by broker")]
    RegistrationRejected,

    #[error("connection error: {0}")]
    Connection(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TriplexError>;
