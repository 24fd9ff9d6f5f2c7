use thiserror::Error;

/// A type alias for handling `Result`s with `Error`
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that terminate a task's cycle. Logged with device id and SSRC by
/// the owning task; the session observes the transport loss and reacts.
#[derive(Error, Debug)]
pub enum Error {
    /// SIP framing or header parsing failed.
    #[error("sip parse: {0}")]
    SipParse(#[from] gblink_sip_core::Error),

    /// A message that makes no sense for the current transaction state.
    #[error("sip protocol: {0}")]
    SipProtocol(String),

    /// TCP read/write failure or orderly EOF.
    #[error("network: {0}")]
    Network(String),

    /// PS decoding failed beyond recovery (handler failure).
    #[error("ps decode: {0}")]
    PsDecode(#[from] gblink_ps_core::Error),

    /// Frame-level media failure that escaped the muxer.
    #[error("media: {0}")]
    Media(#[from] gblink_media_core::Error),

    /// A read deadline expired.
    #[error("timeout: {0}")]
    Timeout(&'static str),

    /// The task was interrupted; exits silently.
    #[error("cancelled")]
    Cancelled,
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Network(err.to_string())
    }
}
