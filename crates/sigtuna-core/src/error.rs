#![forbid(unsafe_code)]

/// Errors produced by the Sigtuna XML Security library.
///
/// Transform, primitive and parser failures are wrapped into
/// [`Error::Signature`] or [`Error::Encryption`] at the Reference and
/// XmlCipher boundaries with the cause folded into the message.  A
/// reference whose digest does not match is *not* an error; it is a
/// `false` validation result.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("XML parsing error: {0}")]
    XmlParse(String),

    #[error("marshaling error: {0}")]
    Marshal(String),

    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("algorithm registry already initialized: {0}")]
    AlreadyInitialized(String),

    #[error("transform error: {0}")]
    Transform(String),

    #[error("canonicalization error: {0}")]
    Canonicalization(String),

    #[error("digest error: {0}")]
    Digest(String),

    #[error("signature error: {0}")]
    Signature(String),

    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("key resolution error: {0}")]
    KeyResolution(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid URI reference: {0}")]
    InvalidUri(String),

    #[error("base64 decode error: {0}")]
    Base64(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
