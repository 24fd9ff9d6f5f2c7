use thiserror::Error;

/// A type alias for handling `Result`s with `Error`
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from SIP framing and message parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The start line is not a SIP request or response line.
    #[error("invalid start line: {0}")]
    InvalidStartLine(String),

    /// A method outside the GB28181 profile.
    #[error("unsupported method: {0}")]
    UnsupportedMethod(String),

    /// A header exists but could not be parsed.
    #[error("invalid {name} header: {value}")]
    InvalidHeader { name: &'static str, value: String },

    /// A header the profile requires is absent.
    #[error("missing required header: {0}")]
    MissingHeader(&'static str),

    /// Headers grew beyond any sane SIP message size.
    #[error("message too large: {0} bytes without header terminator")]
    TooLarge(usize),

    /// Malformed header section.
    #[error("sip parse error: {0}")]
    Parse(String),
}
