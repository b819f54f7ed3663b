//! Legacy channel scheme: the market name appended to the ZIP comment.
//!
//! ```text
//! ... EOCD (comment length patched) | original comment | market | u16 n | "!ZXK!"
//! ```
//!
//! Signing Scheme v2 hashes the EOCD record, so a file tagged this way only
//! verifies under v1 (JAR) signing.

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::view::{ByteView, Endian};
use crate::zip::find_eocd;
use crate::{RawApk, copy_file};

/// Magic closing a legacy trailer.
pub const LEGACY_MAGIC: &[u8; 5] = b"!ZXK!";

/// Prefix written before the market name by the oldest tool versions.
pub const LEGACY_MARKET_PREFIX: &str = "MARKET=";

const LENGTH_FIELD: u64 = 2;
const TRAILER_OVERHEAD: u64 = LENGTH_FIELD + LEGACY_MAGIC.len() as u64;

/// A decoded legacy trailer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyTrailer {
    /// Offset of the first market byte.
    pub offset: u64,
    /// Market name as stored, including any `MARKET=` prefix.
    pub raw: String,
}

impl LegacyTrailer {
    /// The market name with the old `MARKET=` prefix removed.
    pub fn market(&self) -> &str {
        self.raw
            .strip_prefix(LEGACY_MARKET_PREFIX)
            .unwrap_or(&self.raw)
    }
}

/// The edits that turn an untagged file into a tagged one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrailerPatch {
    /// Offset of the EOCD comment length field.
    pub comment_length_offset: u64,
    /// Encoded new comment length.
    pub comment_length: [u8; 2],
    /// Bytes to append at end of file.
    pub trailer: Vec<u8>,
}

// ============================================================================
// Reading
// ============================================================================

/// Decode the trailer at the end of `view`.
///
/// # Errors
///
/// [`Error::LegacyTrailerNotFound`] unless the magic, the length and the
/// declared ZIP comment all agree. EOCD lookup failures propagate.
pub fn read_trailer(view: &ByteView<'_>) -> Result<LegacyTrailer> {
    let len = view.len();
    if len < TRAILER_OVERHEAD {
        return Err(Error::LegacyTrailerNotFound);
    }

    let magic_offset = len - LEGACY_MAGIC.len() as u64;
    if view.bytes(magic_offset, LEGACY_MAGIC.len() as u64)? != LEGACY_MAGIC {
        trace!("no legacy magic at end of file");
        return Err(Error::LegacyTrailerNotFound);
    }

    let market_length = u64::from(view.u16(len - TRAILER_OVERHEAD)?);
    let offset = (len - TRAILER_OVERHEAD)
        .checked_sub(market_length)
        .filter(|_| market_length > 0)
        .ok_or(Error::LegacyTrailerNotFound)?;

    let eocd = find_eocd(view)?;
    if market_length + TRAILER_OVERHEAD > u64::from(eocd.comment_length) {
        debug!(
            market_length,
            comment_length = eocd.comment_length,
            "legacy trailer is not inside the zip comment"
        );
        return Err(Error::LegacyTrailerNotFound);
    }

    Ok(LegacyTrailer {
        offset,
        raw: view.chars(offset, market_length)?.into_owned(),
    })
}

/// The market name of a tagged file, `None` when it carries no trailer.
pub fn read_market(bytes: &[u8], endian: Endian) -> Result<Option<String>> {
    match read_trailer(&ByteView::new(bytes, endian)) {
        Ok(trailer) => Ok(Some(trailer.market().to_owned())),
        Err(err) if err.is_absence() => Ok(None),
        Err(err) => Err(err),
    }
}

// ============================================================================
// Writing
// ============================================================================

/// Encode `market`, its length and the magic.
///
/// # Errors
///
/// [`Error::EmptyMarket`] for an empty name, [`Error::CommentTooLong`] when
/// the name does not fit the u16 length field.
pub fn encode_trailer(market: &str, endian: Endian) -> Result<Vec<u8>> {
    if market.is_empty() {
        return Err(Error::EmptyMarket);
    }
    let length = u16::try_from(market.len()).map_err(|_| Error::CommentTooLong {
        length: market.len() + TRAILER_OVERHEAD as usize,
    })?;

    let mut trailer = Vec::with_capacity(market.len() + TRAILER_OVERHEAD as usize);
    trailer.extend_from_slice(market.as_bytes());
    trailer.extend_from_slice(&endian.u16_bytes(length));
    trailer.extend_from_slice(LEGACY_MAGIC);
    Ok(trailer)
}

/// Work out how to tag `view` with `market`.
///
/// # Errors
///
/// [`Error::AlreadyTagged`] if a trailer already decodes,
/// [`Error::CommentTooLong`] if the grown comment would not fit, plus the
/// errors of [`encode_trailer`] and [`find_eocd`].
pub fn plan_trailer(view: &ByteView<'_>, market: &str) -> Result<TrailerPatch> {
    let trailer = encode_trailer(market, view.endian())?;

    match read_trailer(view) {
        Ok(existing) => {
            return Err(Error::AlreadyTagged {
                existing: existing.market().to_owned(),
            });
        }
        Err(err) if err.is_absence() => {}
        Err(err) => return Err(err),
    }

    let eocd = find_eocd(view)?;
    let new_length = usize::from(eocd.comment_length) + trailer.len();
    let comment_length = u16::try_from(new_length)
        .map_err(|_| Error::CommentTooLong { length: new_length })?;

    Ok(TrailerPatch {
        comment_length_offset: eocd.comment_length_offset(),
        comment_length: view.endian().u16_bytes(comment_length),
        trailer,
    })
}

/// Return a tagged copy of `bytes`.
pub fn write_legacy(bytes: &[u8], market: &str, endian: Endian) -> Result<Vec<u8>> {
    let patch = plan_trailer(&ByteView::new(bytes, endian), market)?;

    let mut out = Vec::with_capacity(bytes.len() + patch.trailer.len());
    out.extend_from_slice(bytes);
    let at = patch.comment_length_offset as usize;
    out[at..at + 2].copy_from_slice(&patch.comment_length);
    out.extend_from_slice(&patch.trailer);
    Ok(out)
}

/// Copy `src` to `dst` and tag the copy in place. `src` is never modified.
///
/// # Arguments
///
/// * `src` - Untagged APK
/// * `dst` - Output path; parent directories are created
/// * `market` - Market name to embed
pub fn write_legacy_file(src: &Path, dst: &Path, market: &str, endian: Endian) -> Result<()> {
    let patch = {
        let apk = RawApk::open(src)?;
        plan_trailer(&apk.view(endian), market)?
    };

    copy_file(src, dst)?;
    let mut file = OpenOptions::new().write(true).open(dst)?;
    file.seek(SeekFrom::Start(patch.comment_length_offset))?;
    file.write_all(&patch.comment_length)?;
    file.seek(SeekFrom::End(0))?;
    file.write_all(&patch.trailer)?;
    file.flush()?;

    debug!(dst = %dst.display(), market, "wrote legacy trailer");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ZipBuilder;

    fn zip() -> Vec<u8> {
        ZipBuilder::new().entry("classes.dex", &[7u8; 300]).build()
    }

    #[test]
    fn write_then_read_returns_market() {
        let source = zip();
        let tagged = write_legacy(&source, "M", Endian::Little).unwrap();

        assert_eq!(read_market(&tagged, Endian::Little).unwrap().as_deref(), Some("M"));
        assert!(tagged.ends_with(b"M\x01\x00!ZXK!"));
        assert_eq!(tagged.len(), source.len() + 8);
    }

    #[test]
    fn only_comment_length_and_tail_change() {
        let source = ZipBuilder::new().entry("a", b"x").comment(b"built by ci").build();
        let eocd = source.len() - 22 - 11;
        let tagged = write_legacy(&source, "Huawei", Endian::Little).unwrap();

        assert_eq!(tagged[..eocd + 20], source[..eocd + 20]);
        assert_eq!(u16::from_le_bytes([tagged[eocd + 20], tagged[eocd + 21]]), 11 + 2 + 6 + 5);
        assert_eq!(tagged[eocd + 22..source.len()], source[eocd + 22..]);

        let trailer = read_trailer(&ByteView::le(&tagged)).unwrap();
        assert_eq!(trailer.offset, source.len() as u64);
        assert_eq!(trailer.market(), "Huawei");
    }

    #[test]
    fn second_write_is_already_tagged() {
        let tagged = write_legacy(&zip(), "M", Endian::Little).unwrap();

        assert!(matches!(
            write_legacy(&tagged, "N", Endian::Little),
            Err(Error::AlreadyTagged { existing }) if existing == "M"
        ));
    }

    #[test]
    fn rejects_empty_and_oversized_markets() {
        assert!(matches!(write_legacy(&zip(), "", Endian::Little), Err(Error::EmptyMarket)));

        let source = ZipBuilder::new().comment(&vec![b'c'; 65_000]).build();
        let market = "m".repeat(600);
        assert!(matches!(
            write_legacy(&source, &market, Endian::Little),
            Err(Error::CommentTooLong { length: 65_607 })
        ));
    }

    #[test]
    fn untagged_file_has_no_market() {
        assert_eq!(read_market(&zip(), Endian::Little).unwrap(), None);
    }

    #[test]
    fn trailer_must_sit_inside_the_comment() {
        // trailer bytes present but the comment length was never patched
        let mut source = zip();
        source.extend_from_slice(&encode_trailer("M", Endian::Little).unwrap());

        // the appended bytes also break the EOCD search
        assert!(read_market(&source, Endian::Little).is_err());

        // the same bytes at the end of a genuine comment do decode
        let comment = [b"xM".as_slice(), &1u16.to_le_bytes(), LEGACY_MAGIC].concat();
        let ok = ZipBuilder::new().comment(&comment).build();
        assert_eq!(read_market(&ok, Endian::Little).unwrap().as_deref(), Some("M"));

        // market byte would have to come from the EOCD record itself
        let short = [1u16.to_le_bytes().as_slice(), LEGACY_MAGIC].concat();
        let short = ZipBuilder::new().comment(&short).build();
        assert_eq!(read_market(&short, Endian::Little).unwrap(), None);

        let zero = [0u16.to_le_bytes().as_slice(), LEGACY_MAGIC].concat();
        let empty = ZipBuilder::new().comment(&zero).build();
        assert_eq!(read_market(&empty, Endian::Little).unwrap(), None);
    }

    #[test]
    fn strips_oldest_market_prefix() {
        let tagged = write_legacy(&zip(), "MARKET=Amazon", Endian::Little).unwrap();
        assert_eq!(read_market(&tagged, Endian::Little).unwrap().as_deref(), Some("Amazon"));
    }

    #[test]
    fn file_write_leaves_source_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("app.apk");
        let dst = dir.path().join("out/nested/app-M.apk");
        let source = zip();
        std::fs::write(&src, &source).unwrap();

        write_legacy_file(&src, &dst, "GooglePlay", Endian::Little).unwrap();

        assert_eq!(std::fs::read(&src).unwrap(), source);
        let written = std::fs::read(&dst).unwrap();
        assert_eq!(written, write_legacy(&source, "GooglePlay", Endian::Little).unwrap());
    }
}
