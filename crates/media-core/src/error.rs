use thiserror::Error;

use gblink_ps_core::PsCodec;

/// A type alias for handling `Result`s with `Error`
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from frame demuxing and RTMP publication.
#[derive(Error, Debug)]
pub enum Error {
    /// Annex-B input without any `00 00 01` start code.
    #[error("no annex-b start code at the read position")]
    AnnexbPrefix,

    /// A NAL unit too short to classify or mux.
    #[error("nal unit too short: {0} bytes")]
    NalTooShort(usize),

    /// ADTS input shorter than the fixed header.
    #[error("adts header too short: {0} bytes")]
    AdtsTooShort(usize),

    /// Bytes that are not an ADTS frame.
    #[error("not an adts frame")]
    AdtsSync,

    /// The declared ADTS frame length exceeds the available bytes, or is
    /// smaller than its own header.
    #[error("adts frame truncated: need {needed}, have {have}")]
    AdtsTruncated { needed: usize, have: usize },

    /// Sequence header requested for a reserved AAC object type.
    #[error("invalid aac object type")]
    AacObject,

    /// Neither a sampling frequency index nor a usable FLV sound rate.
    #[error("invalid aac sampling rate")]
    AacSampleRate,

    /// A codec the muxer cannot publish.
    #[error("unsupported codec {0:?}")]
    UnsupportedCodec(PsCodec),

    /// The output URL is not `rtmp://host[:port]/app/stream`.
    #[error("invalid rtmp url: {0}")]
    RtmpUrl(String),

    /// Handshake or session failure reported by the RTMP layer.
    #[error("rtmp session: {0}")]
    Rtmp(String),

    /// Socket failure while talking to the RTMP server.
    #[error("rtmp i/o: {0}")]
    Io(String),

    /// The RTMP server did not answer in time.
    #[error("rtmp timeout")]
    Timeout,
}

impl Error {
    /// Whether this is a per-frame input problem. Such errors drop one
    /// message and are counted, never failing the stream.
    pub fn is_media_frame(&self) -> bool {
        matches!(
            self,
            Error::AnnexbPrefix
                | Error::NalTooShort(_)
                | Error::AdtsTooShort(_)
                | Error::AdtsSync
                | Error::AdtsTruncated { .. }
                | Error::AacObject
                | Error::AacSampleRate
                | Error::UnsupportedCodec(_)
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout
    }
}
