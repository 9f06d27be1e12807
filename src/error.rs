/// Errors raised by the bridge engine.
///
/// Channel level faults are fatal and escalate to the process owner, every
/// other variant is confined to the request/response cycle that raised it.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A serial link could not be opened.
    #[error("Cannot open {role} link '{device}': {reason}")]
    ChannelOpen {
        role: &'static str,
        device: String,
        reason: String,
    },
    /// The master link reached end of stream.
    #[error("Channel closed unexpectedly")]
    ChannelClosed,
    /// Read failure on a link.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Write or flush failure on the named link.
    #[error("Cannot write to {0} link")]
    Write(&'static str, #[source] std::io::Error),
    /// A master poll too short or with an unusable address field.
    #[error("Malformed master request: {0}")]
    MalformedRequest(String),
    /// Slave address outside the protocol range.
    #[error("Address {0} is outside 0..=31")]
    InvalidAddress(u8),
    /// Every query attempt ended without a usable reply.
    #[error("No response from slave after {0} attempt(s)")]
    SlaveNoResponse(u32),
    /// Slave bytes that are not printable ASCII.
    #[error("Slave response is not printable ASCII")]
    SlaveDecode,
    /// Slave frame with neither a response nor a command marker.
    #[error("Unexpected slave response marker {0:?}")]
    SlaveFormat(char),
    /// Frame checksum differs from the computed one.
    #[error("Invalid checksum - calculated={calculated:04X} received={received:04X}")]
    ChecksumMismatch { calculated: u16, received: u16 },
    /// Slave payload too short to translate.
    #[error("Slave payload has {0} hex characters, at least {1} required")]
    TranslationUnderflow(usize, usize),
    /// Non-hex character in a numeric field.
    #[error("Invalid hex data at offset {0}")]
    InvalidHex(usize),
    /// Translation table rejected at startup.
    #[error("Invalid mapping table: {0}")]
    InvalidMapping(String),
    /// Configuration value out of range or unreadable.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// True for faults the bridge cannot recover from by retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ChannelClosed | Error::Io(_) | Error::Write(..)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
