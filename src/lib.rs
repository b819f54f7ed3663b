//! # apkchannel
//!
//! Embed and recover a channel/market record in an already-signed APK
//! without re-signing it.
//!
//! Two schemes are supported:
//!
//! - **v2**: an ID-value entry inside the APK Signing Block, which sits
//!   between the ZIP entries and the Central Directory. Read-only here; the
//!   entry-value encoders are provided for external block writers.
//! - **legacy**: the market name appended to the ZIP comment behind a
//!   `!ZXK!` marker. Readable and writable, but only valid for v1 (JAR)
//!   signed files.
//!
//! ## Features
//!
//! - Self-consistent End of Central Directory search over comments up to 65535 bytes
//! - Three Signing Block locators tried in a configurable order
//! - `KvSeparated` and `MagicFramed` entry-value framings
//! - Batch generation with read-back verification
//! - Command line tool behind the `cli` feature (on by default)
//!
//! ## Example
//!
//! ```rust,no_run
//! use apkchannel::{CodecConfig, RawApk, Scheme, read_channel};
//!
//! fn main() -> apkchannel::Result<()> {
//!     let apk = RawApk::open("app-release.apk".as_ref())?;
//!     let config = CodecConfig::default();
//!
//!     match read_channel(apk.as_bytes(), Scheme::V2ThenLegacy, &config)? {
//!         Some(read) => println!("{}", read.record),
//!         None => println!("no market info"),
//!     }
//!     Ok(())
//! }
//! ```

use std::fs::File;
use std::path::Path;

pub mod batch;
pub mod block;
pub mod channel;
pub mod config;
pub mod error;
pub mod legacy;
pub mod reader;
pub mod view;
pub mod zip;

#[cfg(test)]
mod testutil;

pub use batch::{
    GenerateOptions, GenerateReport, NoPackageInfo, PackageInfo, PackageInspector, copy_file,
    generate, parse_markets,
};
pub use block::{SigningBlock, SigningBlockRange, Strategy, TlvEntry};
pub use channel::{ChannelRecord, WireFraming};
pub use config::CodecConfig;
pub use error::{Error, Result};
pub use legacy::{write_legacy, write_legacy_file};
pub use reader::{ChannelRead, Scheme, inspect, read_channel, read_channel_file};
pub use view::{ByteView, Endian};
pub use zip::{EocdRecord, ZipSections};

// ============================================================================
// Input
// ============================================================================

#[derive(Debug)]
enum Backing {
    Mapped(memmap2::Mmap),
    Owned(Vec<u8>),
}

/// The whole APK as one immutable byte buffer.
///
/// Every decode step borrows views into it; nothing is copied.
#[derive(Debug)]
pub struct RawApk {
    backing: Backing,
}

impl RawApk {
    /// Memory-map `path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be opened or mapped.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        if file.metadata()?.len() == 0 {
            // zero-length mappings are rejected on some platforms
            return Ok(Self::from_vec(Vec::new()));
        }
        // SAFETY: the map is read-only; callers must not truncate the source
        // while it is open.
        let mmap = unsafe { memmap2::Mmap::map(&file)? };
        Ok(Self {
            backing: Backing::Mapped(mmap),
        })
    }

    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            backing: Backing::Owned(bytes),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match &self.backing {
            Backing::Mapped(mmap) => &mmap[..],
            Backing::Owned(bytes) => bytes.as_slice(),
        }
    }

    pub fn len(&self) -> u64 {
        self.as_bytes().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }

    pub fn view(&self, endian: Endian) -> ByteView<'_> {
        ByteView::new(self.as_bytes(), endian)
    }
}

impl AsRef<[u8]> for RawApk {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_files_and_handles_empty_ones() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.apk");
        std::fs::write(&path, b"PK\x05\x06").unwrap();

        let apk = RawApk::open(&path).unwrap();
        assert_eq!(apk.as_bytes(), b"PK\x05\x06");
        assert_eq!(apk.len(), 4);

        let empty = dir.path().join("empty.apk");
        std::fs::write(&empty, b"").unwrap();
        let apk = RawApk::open(&empty).unwrap();
        assert!(apk.is_empty());
        assert!(matches!(
            read_channel(apk.as_bytes(), Scheme::V2ThenLegacy, &CodecConfig::default()),
            Err(Error::ZipFormatNotFound { file_size: 0 })
        ));
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            RawApk::open(&dir.path().join("missing.apk")),
            Err(Error::Io(_))
        ));
    }

    #[test]
    fn in_memory_buffer_reads_like_a_file() {
        let apk = RawApk::from_vec(testutil::ZipBuilder::new().entry("a", b"x").build());
        let sections = zip::locate_sections(&apk.view(Endian::Little)).unwrap();
        assert_eq!(sections.central_dir_record_count, 1);
    }
}
