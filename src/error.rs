use thiserror::Error as ThisError;

/// Errors returned by the public API.
///
/// Decode/framing failures observed by the event loop do not surface
/// through this type — they manifest as the owning `Connection`
/// transitioning to `Closing`, which the caller observes by the connection
/// disappearing from the loop's sweep rather than through a `Result`.
#[derive(Debug, ThisError)]
#[non_exhaustive]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("framing error: {0}")]
    Framing(String),

    #[error("invalid BAR registration: {0}")]
    InvalidBar(String),

    #[error("invalid PCI BDF string: {0}")]
    InvalidBdf(String),

    #[error("CRC check failed")]
    Crc,

    #[error("no free completion tag available")]
    TagsExhausted,

    #[error("connection closed")]
    Closed,
}
