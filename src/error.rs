//! Error taxonomy for the channel codec.
//!
//! Structural variants carry the offsets involved so a malformed or truncated
//! APK can be diagnosed from the message alone. Absence variants
//! ([`Error::is_absence`]) describe a file that simply has no channel data and
//! are turned into `Ok(None)` by the public read functions.

use std::path::PathBuf;

use thiserror::Error;

/// Crate-wide result type.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("read of {width} bytes at offset {offset} is out of range (length {len})")]
    OutOfRange { offset: u64, width: u64, len: u64 },

    #[error("End of Central Directory record not found in {file_size} bytes")]
    ZipFormatNotFound { file_size: u64 },

    #[error(
        "central directory at {cd_start} (size {cd_size}) is inconsistent with EOCD at {eocd_offset}: {reason}"
    )]
    ZipFormatInconsistent {
        cd_start: u64,
        cd_size: u64,
        eocd_offset: u64,
        reason: &'static str,
    },

    #[error("APK Signing Block size {size} out of range for block ending at {end}")]
    SignatureBlockOutOfRange { end: u64, size: u64 },

    #[error("APK Signing Block at {start}: size in header {header} != size in footer {footer}")]
    SignatureBlockSizeMismatch { start: u64, header: u64, footer: u64 },

    #[error("magic {magic:?} not found")]
    MagicNotFound { magic: &'static str },

    #[error(
        "APK Signing Block [{start}, {end}) does not end where the central directory starts ({expected_end})"
    )]
    LocatorDisagreement { start: u64, end: u64, expected_end: u64 },

    #[error("Signing Block entry at {offset} truncated: {remaining} bytes left for the length field")]
    EntryTruncated { offset: u64, remaining: u64 },

    #[error("Signing Block entry at {offset} declares length {length}, only {available} bytes available")]
    EntryLengthOutOfRange {
        offset: u64,
        length: u64,
        available: u64,
    },

    #[error("no Signing Block entry with id {id:#010x}")]
    EntryNotFound { id: u32 },

    #[error("no channel record in entry value")]
    ChannelRecordNotFound,

    #[error("no legacy market trailer")]
    LegacyTrailerNotFound,

    #[error("file already carries market {existing:?}, use the original release file")]
    AlreadyTagged { existing: String },

    #[error("market name is empty")]
    EmptyMarket,

    #[error("ZIP comment would grow to {length} bytes (limit 65535)")]
    CommentTooLong { length: usize },

    #[error("{} reads back market {found:?}, expected {expected:?}", path.display())]
    VerifyFailed {
        path: PathBuf,
        expected: String,
        found: Option<String>,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for conditions meaning "no channel data here" rather than a broken file.
    pub fn is_absence(&self) -> bool {
        matches!(
            self,
            Error::MagicNotFound { .. }
                | Error::EntryNotFound { .. }
                | Error::ChannelRecordNotFound
                | Error::LegacyTrailerNotFound
        )
    }

    /// True for failures while discovering or walking the APK Signing Block.
    ///
    /// A reader configured with a fallback scheme moves on to the legacy
    /// trailer after any of these.
    pub fn is_block_discovery(&self) -> bool {
        matches!(
            self,
            Error::SignatureBlockOutOfRange { .. }
                | Error::SignatureBlockSizeMismatch { .. }
                | Error::MagicNotFound { .. }
                | Error::LocatorDisagreement { .. }
                | Error::EntryTruncated { .. }
                | Error::EntryLengthOutOfRange { .. }
                | Error::EntryNotFound { .. }
                | Error::ChannelRecordNotFound
        )
    }
}
