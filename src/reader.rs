//! Channel lookup across both schemes.

use std::fmt;
use std::path::Path;

use tracing::debug;

use crate::RawApk;
use crate::block::{self, Located, SigningBlock, SigningBlockRange, Strategy};
use crate::channel::{ChannelRecord, WireFraming, decode_value};
use crate::config::CodecConfig;
use crate::error::Result;
use crate::legacy::read_trailer;
use crate::view::ByteView;
use crate::zip::{ZipSections, locate_sections};

/// Which channel schemes to consult, and in what order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
pub enum Scheme {
    /// Signing Block entry only.
    V2,
    /// ZIP comment trailer only.
    Legacy,
    /// Signing Block entry, then the comment trailer.
    #[default]
    V2ThenLegacy,
    /// Comment trailer, then the Signing Block entry.
    LegacyThenV2,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Scheme::V2 => "v2",
            Scheme::Legacy => "legacy",
            Scheme::V2ThenLegacy => "v2-then-legacy",
            Scheme::LegacyThenV2 => "legacy-then-v2",
        })
    }
}

/// A decoded channel record and where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRead {
    pub record: ChannelRecord,
    pub framing: WireFraming,
    /// Block strategy that found it; `None` for the legacy trailer.
    pub strategy: Option<Strategy>,
}

impl ChannelRead {
    pub fn channel(&self, key: &str) -> Option<&str> {
        self.record.get(key)
    }
}

// ============================================================================
// Reading
// ============================================================================

/// Read the channel record from `apk` using `scheme`.
///
/// Returns `Ok(None)` when the consulted schemes find no channel data. With a
/// fallback scheme, a damaged Signing Block defers to the legacy trailer and
/// its error is only returned when the trailer is absent too.
///
/// # Errors
///
/// ZIP structure errors are always returned; they leave nothing to fall back
/// to.
pub fn read_channel(apk: &[u8], scheme: Scheme, config: &CodecConfig) -> Result<Option<ChannelRead>> {
    match scheme {
        Scheme::V2 => read_v2(apk, config),
        Scheme::Legacy => read_legacy(apk, config),
        Scheme::V2ThenLegacy => match read_v2(apk, config) {
            Ok(Some(read)) => Ok(Some(read)),
            Ok(None) => read_legacy(apk, config),
            Err(err) if err.is_block_discovery() => {
                debug!(%err, "signing block unusable, trying legacy trailer");
                read_legacy(apk, config)?.map_or(Err(err), |read| Ok(Some(read)))
            }
            Err(err) => Err(err),
        },
        Scheme::LegacyThenV2 => match read_legacy(apk, config)? {
            Some(read) => Ok(Some(read)),
            None => read_v2(apk, config),
        },
    }
}

/// [`read_channel`] on a file, memory-mapped for the duration of the read.
pub fn read_channel_file(
    path: &Path,
    scheme: Scheme,
    config: &CodecConfig,
) -> Result<Option<ChannelRead>> {
    let apk = RawApk::open(path)?;
    read_channel(apk.as_bytes(), scheme, config)
}

/// Read the channel entry from the APK Signing Block.
///
/// Strategies run in configured order and the first one yielding a decodable
/// record wins. A strategy that finds nothing is skipped quietly; a strategy
/// that finds damaged data is skipped too, and its error is returned only if
/// no later strategy succeeds.
///
/// Bytes between the Central Directory and the EOCD record fail the read with
/// [`crate::Error::ZipFormatInconsistent`] whichever strategies are configured.
pub fn read_v2(apk: &[u8], config: &CodecConfig) -> Result<Option<ChannelRead>> {
    let view = ByteView::new(apk, config.endian);
    let sections = locate_sections(&view)?;
    sections.require_abutting()?;

    let mut first_error = None;
    for &strategy in &config.strategies {
        match read_with(strategy, &view, &sections, config) {
            Ok(read) => {
                debug!(%strategy, framing = %read.framing, "decoded channel record");
                return Ok(Some(read));
            }
            Err(err) if err.is_absence() => {
                debug!(%strategy, %err, "no channel data");
            }
            Err(err) if err.is_block_discovery() => {
                debug!(%strategy, %err, "strategy failed");
                first_error.get_or_insert(err);
            }
            Err(err) => return Err(err),
        }
    }

    first_error.map_or(Ok(None), Err)
}

/// Read the legacy comment trailer into a record keyed by the configured
/// channel key.
pub fn read_legacy(apk: &[u8], config: &CodecConfig) -> Result<Option<ChannelRead>> {
    match read_trailer(&ByteView::new(apk, config.endian)) {
        Ok(trailer) => Ok(Some(ChannelRead {
            record: ChannelRecord::with_channel(&config.channel_key, trailer.market()),
            framing: WireFraming::LegacyTrailer,
            strategy: None,
        })),
        Err(err) if err.is_absence() => Ok(None),
        Err(err) => Err(err),
    }
}

fn read_with(
    strategy: Strategy,
    view: &ByteView<'_>,
    sections: &ZipSections<'_>,
    config: &CodecConfig,
) -> Result<ChannelRead> {
    let value = match block::locate(strategy, view, sections, config)? {
        Located::Block(block) => block.find(config.block_id)?.value,
        Located::Value { value, .. } => value,
    };
    let (record, framing) = decode_value(value, &config.framings, config.endian)?;
    Ok(ChannelRead {
        record,
        framing,
        strategy: Some(strategy),
    })
}

// ============================================================================
// Inspection
// ============================================================================

/// What one strategy found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Found {
    Block(SigningBlockRange),
    Value { offset: u64, len: u64 },
}

#[derive(Debug)]
pub struct Attempt {
    pub strategy: Strategy,
    pub outcome: Result<Found>,
}

/// Signing Block entry header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryInfo {
    pub id: u32,
    pub offset: u64,
    pub len: u64,
}

/// Structural report on one file.
#[derive(Debug)]
pub struct Inspection<'a> {
    pub sections: ZipSections<'a>,
    /// Every configured strategy, in order.
    pub attempts: Vec<Attempt>,
    /// Structural and magic-scan locators run against each other.
    pub cross_check: Result<SigningBlockRange>,
    /// Entries of the first block found; a malformed entry ends the list.
    pub entries: Vec<Result<EntryInfo>>,
}

/// Run every configured strategy and list the Signing Block entries.
///
/// # Errors
///
/// Only ZIP structure errors; strategy failures are part of the report.
pub fn inspect<'a>(apk: &'a [u8], config: &CodecConfig) -> Result<Inspection<'a>> {
    let view = ByteView::new(apk, config.endian);
    let sections = locate_sections(&view)?;

    let mut attempts = Vec::with_capacity(config.strategies.len());
    let mut first_block: Option<SigningBlock<'a>> = None;
    for &strategy in &config.strategies {
        let outcome = block::locate(strategy, &view, &sections, config).map(|located| match located {
            Located::Block(block) => {
                first_block.get_or_insert(block);
                Found::Block(block.range)
            }
            Located::Value { offset, value } => Found::Value {
                offset,
                len: value.len() as u64,
            },
        });
        attempts.push(Attempt { strategy, outcome });
    }

    let entries = first_block
        .map(|block| {
            block
                .entries()
                .map(|entry| {
                    entry.map(|entry| EntryInfo {
                        id: entry.id,
                        offset: entry.offset,
                        len: entry.value.len() as u64,
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(Inspection {
        sections,
        attempts,
        cross_check: block::cross_validate(&view, &sections),
        entries,
    })
}
