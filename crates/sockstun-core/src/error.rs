use thiserror::Error;

/// Errors produced by the forwarding engine.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("invalid proxy URI: {0}")]
    InvalidProxyUri(String),

    #[error("unsupported proxy scheme: {0}")]
    UnsupportedScheme(String),

    #[error("failed to listen on local socket {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to dial {addr} through proxy: {reason}")]
    Dial { addr: String, reason: String },

    #[error("dial to {0} cancelled")]
    DialCancelled(String),

    #[error("worker task failed: {0}")]
    Worker(String),
}

pub type TunnelResult<T> = Result<T, TunnelError>;
