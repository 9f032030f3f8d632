use thiserror::Error;

/// Failures reported by the link layer through transport callbacks
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectFailed(String),

    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("notification subscription failed: {0}")]
    NotifyFailed(String),

    #[error("not connected")]
    NotConnected,
}

/// Why a session operation did not complete
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("{step}: no response in time")]
    Timeout { step: &'static str },

    #[error("{step}: refused by the band")]
    Rejected { step: &'static str },

    #[error("malformed packet: {0}")]
    Malformed(String),

    #[error("unknown opcode {0:#08x}")]
    UnknownOpcode(u32),

    #[error("session is not authenticated")]
    NotAuthenticated,
}
