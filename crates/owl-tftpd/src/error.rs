use thiserror::Error;

#[derive(Error, Debug)]
pub enum TftpError {
    #[error("TFTP error: {0}")]
    Tftp(String),
    #[error("Dispatcher error: {0}")]
    Dispatcher(#[from] DispatcherError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, TftpError>;

/// Why an incoming datagram is not a usable RRQ/WRQ.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestError {
    #[error("request exceeds the maximum request size")]
    MaxSizeExceeded,
    #[error("packet is not a read or write request")]
    NotARequest,
    #[error("invalid filename")]
    InvalidFilename,
    #[error("invalid transfer mode")]
    InvalidMode,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeError {
    #[error("filename and mode do not fit in a request packet")]
    TruncatedFilename,
}

#[derive(Error, Debug)]
pub enum DispatcherError {
    #[error("submission queue full ({0} operations in flight)")]
    QueueFull(usize),
    #[error("runtime failure: {0}")]
    Runtime(#[from] std::io::Error),
    #[error("completion queue closed")]
    Closed,
}
