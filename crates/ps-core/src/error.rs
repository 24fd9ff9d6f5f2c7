use thiserror::Error;

/// A type alias for handling `Result`s with `Error`
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while demultiplexing a PS stream.
///
/// Every variant except [`Error::Handler`] is a decode error, which the
/// recoverable wrapper consumes by entering recover mode. A handler error is
/// a true failure and is always propagated to the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The stream ended inside a fixed-size structure.
    #[error("need {needed} bytes, only {left} left")]
    NeedMoreBytes { needed: usize, left: usize },

    /// The next bytes are not a `00 00 01 xx` start code.
    #[error("bad start code 0x{code:08x}")]
    BadStartCode { code: u32 },

    /// A start code with a stream id this demuxer does not understand.
    #[error("unknown stream id 0x{sid:02x}")]
    UnknownStreamId { sid: u8 },

    /// Pack header marker bits do not match MPEG-2 PS.
    #[error("bad pack header")]
    BadPackHeader,

    /// PES header marker bits or lengths are inconsistent.
    #[error("bad pes header for stream 0x{sid:02x}")]
    BadPesHeader { sid: u8 },

    /// The downstream message handler failed.
    #[error("handler: {0}")]
    Handler(String),
}

impl Error {
    /// Whether this error is recoverable by resynchronising on the next
    /// pack header. Handler failures are not.
    pub fn is_decode(&self) -> bool {
        !matches!(self, Error::Handler(_))
    }
}
