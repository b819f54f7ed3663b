//! APK Signing Block discovery and entry iteration.
//!
//! Layout of the block, which sits directly before the Central Directory:
//!
//! ```text
//! @+0         u64   size of block, excluding this field
//! @+8         pairs u64 length, u32 id, (length - 4) value bytes, repeated
//! @-24        u64   size of block, same as @+0
//! @-16        16    "APK Sig Block 42"
//! ```

use tracing::{debug, trace};

use crate::channel::unwrap_magic_framed;
use crate::config::CodecConfig;
use crate::error::{Error, Result};
use crate::view::ByteView;
use crate::zip::ZipSections;

// ============================================================================
// Constants
// ============================================================================

/// Magic closing every APK Signing Block.
pub const APK_SIG_BLOCK_MAGIC: &str = "APK Sig Block 42";

/// Smallest possible block: two size fields and the magic.
pub const APK_SIG_BLOCK_MIN_SIZE: u64 = 32;

/// Entry id of the Signature Scheme v2 signer block.
pub const APK_SIGNATURE_SCHEME_V2_BLOCK_ID: u32 = 0x7109_871a;

/// Magic this tool places at the start of its own entry value.
pub const PLUGIN_BLOCK_MAGIC: &str = "Packer Ng Sig V2";

const FOOTER_SIZE: u64 = 24;
const SIZE_FIELD: u64 = 8;
const ENTRY_HEADER_SIZE: u64 = SIZE_FIELD + 4;

// ============================================================================
// Data Structures
// ============================================================================

/// Byte range of a validated APK Signing Block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigningBlockRange {
    /// Offset of the leading size field.
    pub start: u64,
    /// Offset one past the magic; the Central Directory starts here.
    pub end: u64,
    pub size_in_header: u64,
    pub size_in_footer: u64,
}

impl SigningBlockRange {
    /// Bounds of the ID-value pairs between the header and the footer.
    pub fn payload_bounds(&self) -> (u64, u64) {
        (self.start + SIZE_FIELD, self.end - FOOTER_SIZE)
    }
}

/// Strategies for finding the block, tried in the configured order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
pub enum Strategy {
    /// Follow the footer directly before the Central Directory.
    Structural,
    /// Reverse-search the file for the v2 magic.
    MagicScan,
    /// Reverse-search the file tail for this tool's own entry magic.
    PluginMagicScan,
}

impl Strategy {
    pub const DEFAULT_ORDER: [Strategy; 3] = [
        Strategy::Structural,
        Strategy::MagicScan,
        Strategy::PluginMagicScan,
    ];
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Strategy::Structural => "structural",
            Strategy::MagicScan => "magic-scan",
            Strategy::PluginMagicScan => "plugin-magic-scan",
        })
    }
}

/// A located Signing Block with access to its entries.
#[derive(Debug, Clone, Copy)]
pub struct SigningBlock<'a> {
    pub range: SigningBlockRange,
    payload: ByteView<'a>,
}

/// One ID-value pair from the block payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlvEntry<'a> {
    pub id: u32,
    /// Absolute offset of the entry's length field.
    pub offset: u64,
    pub value: &'a [u8],
}

/// What a strategy found.
#[derive(Debug, Clone, Copy)]
pub enum Located<'a> {
    Block(SigningBlock<'a>),
    /// A self-delimiting channel value found without its enclosing block.
    Value { offset: u64, value: &'a [u8] },
}

// ============================================================================
// Locator
// ============================================================================

/// Run one strategy.
///
/// # Arguments
///
/// * `view` - The whole file
/// * `sections` - ZIP bounds of the same file
/// * `config` - Supplies the channel entry id and scan window for
///   [`Strategy::PluginMagicScan`]
pub fn locate<'a>(
    strategy: Strategy,
    view: &ByteView<'a>,
    sections: &ZipSections<'_>,
    config: &CodecConfig,
) -> Result<Located<'a>> {
    let located = match strategy {
        Strategy::Structural => Located::Block(SigningBlock::new(
            view,
            locate_structural(view, sections)?,
        )?),
        Strategy::MagicScan => {
            Located::Block(SigningBlock::new(view, locate_by_magic(view, sections)?)?)
        }
        Strategy::PluginMagicScan => {
            let (offset, value) =
                locate_plugin_value(view, config.block_id, config.plugin_scan_window)?;
            Located::Value { offset, value }
        }
    };
    debug!(%strategy, "located signing data");
    Ok(located)
}

/// Find the block from the footer directly preceding the Central Directory.
pub fn locate_structural(
    view: &ByteView<'_>,
    sections: &ZipSections<'_>,
) -> Result<SigningBlockRange> {
    sections.require_abutting()?;

    let end = sections.central_dir_start;
    if end < APK_SIG_BLOCK_MIN_SIZE {
        trace!(end, "too small for an APK Signing Block");
        return Err(Error::MagicNotFound {
            magic: APK_SIG_BLOCK_MAGIC,
        });
    }
    range_ending_at(view, end)
}

/// Reverse-search for the v2 magic and derive the block from that footer.
///
/// The last occurrence is used, so magic bytes inside an entry's contents
/// cannot shadow the real footer, which sits after all of them.
///
/// The derived end must coincide with the Central Directory start; a block
/// found anywhere else is reported as [`Error::LocatorDisagreement`].
pub fn locate_by_magic(
    view: &ByteView<'_>,
    sections: &ZipSections<'_>,
) -> Result<SigningBlockRange> {
    let magic_offset = view
        .rfind(APK_SIG_BLOCK_MAGIC.as_bytes(), 0)
        .ok_or(Error::MagicNotFound {
            magic: APK_SIG_BLOCK_MAGIC,
        })?;
    let end = magic_offset + APK_SIG_BLOCK_MAGIC.len() as u64;
    if end < APK_SIG_BLOCK_MIN_SIZE {
        return Err(Error::SignatureBlockOutOfRange { end, size: 0 });
    }

    let range = range_ending_at(view, end)?;
    if range.end != sections.central_dir_start {
        return Err(Error::LocatorDisagreement {
            start: range.start,
            end: range.end,
            expected_end: sections.central_dir_start,
        });
    }
    Ok(range)
}

/// Reverse-search the last `window` bytes for [`PLUGIN_BLOCK_MAGIC`].
///
/// The hit is taken as the start of a magic-framed entry value. When the
/// 12-byte entry header right before it carries `block_id` and a length that
/// fits in the file, that length delimits the value. Otherwise the frame's own
/// leading and trailing u32 lengths must agree and delimit it. This recovers
/// the channel value even when the surrounding block is damaged or its magic
/// is missing. Returns the absolute offset of the value and its bytes.
///
/// The last hit in the window wins, so a value appended later shadows an
/// earlier one.
///
/// # Errors
///
/// [`Error::MagicNotFound`] when the window holds no magic, and
/// [`Error::ChannelRecordNotFound`] when neither the entry header nor the
/// frame lengths delimit a value.
pub fn locate_plugin_value<'a>(
    view: &ByteView<'a>,
    block_id: u32,
    window: u64,
) -> Result<(u64, &'a [u8])> {
    let from = view.len().saturating_sub(window);
    let offset = view
        .rfind(PLUGIN_BLOCK_MAGIC.as_bytes(), from)
        .ok_or(Error::MagicNotFound {
            magic: PLUGIN_BLOCK_MAGIC,
        })?;

    if let Some(value) = value_from_entry_header(view, offset, block_id) {
        return Ok((offset, value));
    }

    let rest = view.bytes(offset, view.len() - offset)?;
    let payload = unwrap_magic_framed(rest, view.endian()).ok_or_else(|| {
        trace!(offset, "plugin magic without a consistent frame");
        Error::ChannelRecordNotFound
    })?;
    let width = PLUGIN_BLOCK_MAGIC.len() + 4 + payload.len() + 4;
    Ok((offset, &rest[..width]))
}

/// The entry value starting at `offset`, if the entry header before it
/// belongs to `block_id` and its length stays inside the file.
fn value_from_entry_header<'a>(
    view: &ByteView<'a>,
    offset: u64,
    block_id: u32,
) -> Option<&'a [u8]> {
    let header = offset.checked_sub(ENTRY_HEADER_SIZE)?;
    let length = view.u64(header).ok()?;
    let id = view.u32(header + SIZE_FIELD).ok()?;
    if id != block_id {
        trace!(offset, id, block_id, "plugin magic outside the channel entry");
        return None;
    }
    let value = view.bytes(offset, length.checked_sub(4)?).ok();
    if value.is_none() {
        trace!(offset, length, "plugin entry length out of range");
    }
    value
}

/// Run both block strategies and insist that they agree.
pub fn cross_validate(
    view: &ByteView<'_>,
    sections: &ZipSections<'_>,
) -> Result<SigningBlockRange> {
    let structural = locate_structural(view, sections)?;
    let scanned = match locate_by_magic(view, sections) {
        Ok(range) => range,
        Err(Error::LocatorDisagreement { start, end, .. }) => {
            return Err(Error::LocatorDisagreement {
                start,
                end,
                expected_end: structural.end,
            });
        }
        Err(err) => return Err(err),
    };

    if scanned != structural {
        return Err(Error::LocatorDisagreement {
            start: scanned.start,
            end: scanned.end,
            expected_end: structural.end,
        });
    }
    Ok(structural)
}

/// Validate the footer ending at `end` and the header it points to.
fn range_ending_at(view: &ByteView<'_>, end: u64) -> Result<SigningBlockRange> {
    let footer = end - FOOTER_SIZE;
    if view.bytes(footer + SIZE_FIELD, 16)? != APK_SIG_BLOCK_MAGIC.as_bytes() {
        trace!(end, "no APK Signing Block magic before central directory");
        return Err(Error::MagicNotFound {
            magic: APK_SIG_BLOCK_MAGIC,
        });
    }

    let size_in_footer = view.u64(footer)?;
    if size_in_footer < FOOTER_SIZE || size_in_footer > i64::MAX as u64 - SIZE_FIELD {
        return Err(Error::SignatureBlockOutOfRange {
            end,
            size: size_in_footer,
        });
    }

    let start = end
        .checked_sub(size_in_footer + SIZE_FIELD)
        .ok_or(Error::SignatureBlockOutOfRange {
            end,
            size: size_in_footer,
        })?;

    let size_in_header = view.u64(start)?;
    if size_in_header != size_in_footer {
        return Err(Error::SignatureBlockSizeMismatch {
            start,
            header: size_in_header,
            footer: size_in_footer,
        });
    }

    trace!(start, end, size = size_in_footer, "validated APK Signing Block");
    Ok(SigningBlockRange {
        start,
        end,
        size_in_header,
        size_in_footer,
    })
}

// ============================================================================
// Entries
// ============================================================================

impl<'a> SigningBlock<'a> {
    /// Slice the payload of a validated range out of the file.
    pub fn new(view: &ByteView<'a>, range: SigningBlockRange) -> Result<Self> {
        let (start, end) = range.payload_bounds();
        Ok(Self {
            range,
            payload: view.slice(start, end)?,
        })
    }

    /// Iterate the entries in file order.
    ///
    /// Iteration stops after the first malformed entry, which is yielded as
    /// an error.
    pub fn entries(&self) -> Entries<'a> {
        Entries {
            payload: self.payload,
            base: self.range.start + SIZE_FIELD,
            position: 0,
            done: false,
        }
    }

    /// The first entry with `id`.
    ///
    /// # Errors
    ///
    /// [`Error::EntryNotFound`] if no entry has that id, or the error of a
    /// malformed entry met before it.
    pub fn find(&self, id: u32) -> Result<TlvEntry<'a>> {
        for entry in self.entries() {
            let entry = entry?;
            if entry.id == id {
                return Ok(entry);
            }
        }
        Err(Error::EntryNotFound { id })
    }
}

/// Iterator over the ID-value pairs of a [`SigningBlock`].
#[derive(Debug, Clone)]
pub struct Entries<'a> {
    payload: ByteView<'a>,
    base: u64,
    position: u64,
    done: bool,
}

impl<'a> Entries<'a> {
    fn read_entry(&mut self) -> Result<TlvEntry<'a>> {
        let offset = self.base + self.position;
        let remaining = self.payload.len() - self.position;
        if remaining < SIZE_FIELD {
            return Err(Error::EntryTruncated { offset, remaining });
        }

        let length = self.payload.u64(self.position)?;
        let available = remaining - SIZE_FIELD;
        if length < 4 || length > available {
            return Err(Error::EntryLengthOutOfRange {
                offset,
                length,
                available,
            });
        }

        let id = self.payload.u32(self.position + SIZE_FIELD)?;
        let value = self.payload.bytes(self.position + SIZE_FIELD + 4, length - 4)?;
        self.position += SIZE_FIELD + length;
        Ok(TlvEntry { id, offset, value })
    }
}

impl<'a> Iterator for Entries<'a> {
    type Item = Result<TlvEntry<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.position >= self.payload.len() {
            return None;
        }
        let entry = self.read_entry();
        if entry.is_err() {
            self.done = true;
        }
        Some(entry)
    }
}

// ============================================================================
// Tests
// ============================================================================
