use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShareError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("malformed discovery datagram: {0}")]
    MalformedDatagram(String),

    #[error("peer does not have {0}")]
    NotOnPeer(String),

    #[error("invalid peer address {0}")]
    InvalidAddress(String),

    #[error("unable to parse int: {0}")]
    ParseInt(#[from] std::num::ParseIntError),

    #[error("unknown command {0:?}")]
    UnknownCommand(String),
}

pub type ShareResult<T> = std::result::Result<T, ShareError>;
