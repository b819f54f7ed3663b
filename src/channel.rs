//! Channel record and the entry-value framings it travels in.

use std::fmt;

use tracing::trace;

use crate::block::PLUGIN_BLOCK_MAGIC;
use crate::error::{Error, Result};
use crate::view::{ByteView, Endian};

/// Separates a key from its value (U+2218 RING OPERATOR).
pub const SEP_KV: char = '\u{2218}';

/// Terminates each key/value pair (U+2219 BULLET OPERATOR).
pub const SEP_LINE: char = '\u{2219}';

/// Key holding the channel/market identifier.
pub const CHANNEL_KEY: &str = "CHANNEL";

/// Wire formats a channel record can be found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
pub enum WireFraming {
    /// Market bytes, u16 length and `!ZXK!` after the ZIP comment.
    LegacyTrailer,
    /// `key∘value∙` pairs filling a Signing Block entry value.
    KvSeparated,
    /// Magic, u32 length, [`WireFraming::KvSeparated`] payload, u32 length.
    MagicFramed,
}

impl fmt::Display for WireFraming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WireFraming::LegacyTrailer => "legacy-trailer",
            WireFraming::KvSeparated => "kv-separated",
            WireFraming::MagicFramed => "magic-framed",
        })
    }
}

// ============================================================================
// ChannelRecord
// ============================================================================

/// String fields with unique keys, kept in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelRecord {
    fields: Vec<(String, String)>,
}

impl ChannelRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// A record holding only `channel` under `key`.
    pub fn with_channel(key: &str, channel: &str) -> Self {
        let mut record = Self::new();
        record.insert(key, channel);
        record
    }

    /// Set `key`, keeping its original position if it already exists.
    /// Returns the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        let key = key.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.fields.push((key, value));
                None
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ChannelRecord {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut record = Self::new();
        for (k, v) in iter {
            record.insert(k, v);
        }
        record
    }
}

impl fmt::Display for ChannelRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (k, v)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{k}={v}")?;
        }
        Ok(())
    }
}

// ============================================================================
// KvSeparated
// ============================================================================

/// Encode as `key∘value∙` pairs in insertion order.
pub fn encode_kv(record: &ChannelRecord) -> String {
    let mut out = String::new();
    for (k, v) in record.iter() {
        out.push_str(k);
        out.push(SEP_KV);
        out.push_str(v);
        out.push(SEP_LINE);
    }
    out
}

/// Parse `key∘value∙` pairs.
///
/// Blank lines and lines that do not split into exactly one key and one
/// value are skipped. Returns `None` when nothing usable remains.
pub fn decode_kv(text: &str) -> Option<ChannelRecord> {
    let record: ChannelRecord = text
        .split(SEP_LINE)
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let mut parts = line.split(SEP_KV);
            match (parts.next(), parts.next(), parts.next()) {
                (Some(k), Some(v), None) if !k.is_empty() && !v.is_empty() => Some((k, v)),
                _ => None,
            }
        })
        .collect();
    (!record.is_empty()).then_some(record)
}

// ============================================================================
// MagicFramed
// ============================================================================

/// Wrap `payload` as magic, u32 length, payload, u32 length.
pub fn encode_magic_framed(payload: &[u8], endian: Endian) -> Result<Vec<u8>> {
    let len = u32::try_from(payload.len()).map_err(|_| Error::OutOfRange {
        offset: 0,
        width: payload.len() as u64,
        len: u64::from(u32::MAX),
    })?;

    let mut out = Vec::with_capacity(PLUGIN_BLOCK_MAGIC.len() + payload.len() + 8);
    out.extend_from_slice(PLUGIN_BLOCK_MAGIC.as_bytes());
    out.extend_from_slice(&endian.u32_bytes(len));
    out.extend_from_slice(payload);
    out.extend_from_slice(&endian.u32_bytes(len));
    Ok(out)
}

/// The payload of a magic-framed value, if its magic and both length
/// fields check out. Bytes after the trailing length are ignored.
pub fn unwrap_magic_framed(value: &[u8], endian: Endian) -> Option<&[u8]> {
    let view = ByteView::new(value, endian);
    let magic_len = PLUGIN_BLOCK_MAGIC.len() as u64;

    if view.bytes(0, magic_len).ok()? != PLUGIN_BLOCK_MAGIC.as_bytes() {
        return None;
    }
    let leading = view.u32(magic_len).ok()?;
    if leading == 0 {
        return None;
    }
    let payload = view.bytes(magic_len + 4, u64::from(leading)).ok()?;
    let trailing = view.u32(magic_len + 4 + u64::from(leading)).ok()?;
    if trailing != leading {
        trace!(leading, trailing, "magic-framed length fields disagree");
        return None;
    }
    Some(payload)
}

// ============================================================================
// Decoding
// ============================================================================

/// Decode an entry value with the first framing in `framings` whose
/// structural checks pass.
///
/// [`WireFraming::LegacyTrailer`] never applies to entry values and is
/// skipped.
///
/// # Errors
///
/// [`Error::ChannelRecordNotFound`] when no framing matches or the matching
/// framing carries no usable pairs.
pub fn decode_value(
    value: &[u8],
    framings: &[WireFraming],
    endian: Endian,
) -> Result<(ChannelRecord, WireFraming)> {
    for &framing in framings {
        match framing {
            WireFraming::MagicFramed => {
                if let Some(payload) = unwrap_magic_framed(value, endian) {
                    let text =
                        std::str::from_utf8(payload).map_err(|_| Error::ChannelRecordNotFound)?;
                    let record = decode_kv(text).ok_or(Error::ChannelRecordNotFound)?;
                    return Ok((record, framing));
                }
            }
            WireFraming::KvSeparated => {
                if let Some(record) = std::str::from_utf8(value).ok().and_then(decode_kv) {
                    return Ok((record, framing));
                }
            }
            WireFraming::LegacyTrailer => {}
        }
    }
    Err(Error::ChannelRecordNotFound)
}
