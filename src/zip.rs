//! End of Central Directory discovery and ZIP section bounds.

use tracing::trace;

use crate::error::{Error, Result};
use crate::view::ByteView;

// ============================================================================
// Constants
// ============================================================================

/// End of Central Directory signature (0x06054b50)
pub const EOCD_SIGNATURE: u32 = 0x0605_4b50;

/// Size of the EOCD record without its comment.
pub const EOCD_MIN_SIZE: u64 = 22;

/// The comment length is a u16 field.
pub const MAX_COMMENT_SIZE: u64 = 0xffff;

const EOCD_RECORD_COUNT_OFFSET: u64 = 10;
const EOCD_CD_SIZE_OFFSET: u64 = 12;
const EOCD_CD_OFFSET_OFFSET: u64 = 16;
const EOCD_COMMENT_LENGTH_OFFSET: u64 = 20;

// ============================================================================
// Data Structures
// ============================================================================

/// The End of Central Directory record together with its trailing comment.
#[derive(Debug, Clone, Copy)]
pub struct EocdRecord<'a> {
    /// Absolute offset of the signature.
    pub offset: u64,

    /// Declared comment length; always equals the bytes left after the record.
    pub comment_length: u16,

    /// Record bytes from the signature to end of file.
    pub bytes: &'a [u8],
}

impl<'a> EocdRecord<'a> {
    /// The comment bytes following the fixed 22-byte header.
    pub fn comment(&self) -> &'a [u8] {
        &self.bytes[EOCD_MIN_SIZE as usize..]
    }

    /// Absolute offset of the 2-byte comment length field.
    pub fn comment_length_offset(&self) -> u64 {
        self.offset + EOCD_COMMENT_LENGTH_OFFSET
    }
}

/// Central Directory bounds as declared by the EOCD record.
#[derive(Debug, Clone, Copy)]
pub struct ZipSections<'a> {
    pub central_dir_start: u64,
    pub central_dir_size: u64,
    pub central_dir_record_count: u16,
    pub eocd: EocdRecord<'a>,
}

impl ZipSections<'_> {
    pub fn central_dir_end(&self) -> u64 {
        self.central_dir_start + self.central_dir_size
    }

    /// Whether bytes sit between the end of the Central Directory and the EOCD.
    pub fn has_gap(&self) -> bool {
        self.central_dir_end() != self.eocd.offset
    }

    /// Fails with [`Error::ZipFormatInconsistent`] unless the Central
    /// Directory ends exactly where the EOCD record starts.
    pub fn require_abutting(&self) -> Result<()> {
        if self.has_gap() {
            return Err(self.inconsistent(
                "central directory is not immediately followed by the EOCD record",
            ));
        }
        Ok(())
    }

    fn inconsistent(&self, reason: &'static str) -> Error {
        Error::ZipFormatInconsistent {
            cd_start: self.central_dir_start,
            cd_size: self.central_dir_size,
            eocd_offset: self.eocd.offset,
            reason,
        }
    }
}

// ============================================================================
// Locator
// ============================================================================

/// Find the End of Central Directory record.
///
/// The signature may legally appear inside the comment, so every candidate
/// comment length from 0 to `min(65535, len - 22)` is tried in increasing
/// order. A candidate is accepted only if the record found there declares
/// exactly that comment length; the shortest consistent interpretation wins.
///
/// # Errors
///
/// [`Error::ZipFormatNotFound`] for files shorter than 22 bytes or when no
/// candidate is self-consistent.
pub fn find_eocd<'a>(view: &ByteView<'a>) -> Result<EocdRecord<'a>> {
    let file_size = view.len();
    if file_size < EOCD_MIN_SIZE {
        return Err(Error::ZipFormatNotFound { file_size });
    }

    let max_comment_size = MAX_COMMENT_SIZE.min(file_size - EOCD_MIN_SIZE);
    let empty_comment_offset = file_size - EOCD_MIN_SIZE;

    for expected_comment_length in 0..=max_comment_size {
        let offset = empty_comment_offset - expected_comment_length;
        if view.u32(offset)? != EOCD_SIGNATURE {
            continue;
        }

        let comment_length = view.u16(offset + EOCD_COMMENT_LENGTH_OFFSET)?;
        if u64::from(comment_length) != expected_comment_length {
            trace!(
                offset,
                comment_length, expected_comment_length, "rejecting EOCD candidate"
            );
            continue;
        }

        return Ok(EocdRecord {
            offset,
            comment_length,
            bytes: view.bytes(offset, file_size - offset)?,
        });
    }

    Err(Error::ZipFormatNotFound { file_size })
}

/// Locate the EOCD record and read the Central Directory bounds from it.
///
/// # Errors
///
/// Anything [`find_eocd`] returns, plus [`Error::ZipFormatInconsistent`] when
/// the Central Directory would start or end past the EOCD record.
pub fn locate_sections<'a>(view: &ByteView<'a>) -> Result<ZipSections<'a>> {
    let eocd = find_eocd(view)?;
    let record = ByteView::new(eocd.bytes, view.endian());

    let sections = ZipSections {
        central_dir_start: u64::from(record.u32(EOCD_CD_OFFSET_OFFSET)?),
        central_dir_size: u64::from(record.u32(EOCD_CD_SIZE_OFFSET)?),
        central_dir_record_count: record.u16(EOCD_RECORD_COUNT_OFFSET)?,
        eocd,
    };

    if sections.central_dir_start > eocd.offset {
        return Err(sections.inconsistent("central directory starts after the EOCD record"));
    }
    if sections.central_dir_end() > eocd.offset {
        return Err(sections.inconsistent("central directory overruns the EOCD record"));
    }

    trace!(
        cd_start = sections.central_dir_start,
        cd_size = sections.central_dir_size,
        records = sections.central_dir_record_count,
        eocd = eocd.offset,
        "located zip sections"
    );
    Ok(sections)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{ZipBuilder, EOCD_SIGNATURE_BYTES};

    #[test]
    fn rejects_files_shorter_than_an_eocd_record() {
        for len in [0usize, 1, 4, 21] {
            let data = vec![0u8; len];
            assert!(matches!(
                find_eocd(&ByteView::le(&data)),
                Err(Error::ZipFormatNotFound { file_size }) if file_size == len as u64
            ));
        }
    }

    #[test]
    fn rejects_files_without_a_signature() {
        let data = vec![0x41u8; 4096];
        assert!(matches!(
            locate_sections(&ByteView::le(&data)),
            Err(Error::ZipFormatNotFound { .. })
        ));
    }

    #[test]
    fn recovers_comment_lengths_across_the_whole_range() {
        for comment_length in [0usize, 1, 2, 21, 22, 23, 255, 4096, 65534, 65535] {
            let comment = vec![b'c'; comment_length];
            let zip = ZipBuilder::new().comment(&comment).build();
            let view = ByteView::le(&zip);

            let eocd = find_eocd(&view).unwrap();
            assert_eq!(usize::from(eocd.comment_length), comment_length);
            assert_eq!(eocd.offset, (zip.len() - 22 - comment_length) as u64);
            assert_eq!(eocd.comment(), &comment[..]);
        }
    }

    #[test]
    fn spoofed_signature_in_comment_is_ignored() {
        // A fake record near the end of the comment whose declared comment
        // length does not match its position.
        let mut comment = vec![b' '; 64];
        let fake = comment.len() - 30;
        comment[fake..fake + 4].copy_from_slice(&EOCD_SIGNATURE_BYTES);
        comment[fake + 20..fake + 22].copy_from_slice(&999u16.to_le_bytes());

        let zip = ZipBuilder::new().comment(&comment).build();
        let eocd = find_eocd(&ByteView::le(&zip)).unwrap();

        assert_eq!(eocd.comment_length, 64);
        assert_eq!(eocd.offset, (zip.len() - 22 - 64) as u64);
    }

    #[test]
    fn self_consistent_spoof_wins_as_the_shortest_interpretation() {
        let mut comment = vec![b' '; 40];
        let fake = comment.len() - 22;
        comment[fake..fake + 4].copy_from_slice(&EOCD_SIGNATURE_BYTES);
        // comment length 0, placed exactly 22 bytes before the end
        comment[fake + 20..fake + 22].copy_from_slice(&0u16.to_le_bytes());

        let zip = ZipBuilder::new().comment(&comment).build();
        let eocd = find_eocd(&ByteView::le(&zip)).unwrap();

        assert_eq!(eocd.comment_length, 0);
        assert_eq!(eocd.offset, (zip.len() - 22) as u64);
    }

    #[test]
    fn reads_central_directory_bounds() {
        let zip = ZipBuilder::new().entry("a.txt", b"hello").entry("b.txt", b"world").build();
        let sections = locate_sections(&ByteView::le(&zip)).unwrap();

        assert_eq!(sections.central_dir_record_count, 2);
        assert_eq!(sections.central_dir_end(), sections.eocd.offset);
        assert!(!sections.has_gap());
        assert!(sections.require_abutting().is_ok());
        assert_eq!(&zip[sections.central_dir_start as usize..][..4], b"PK\x01\x02");
    }

    #[test]
    fn central_directory_overrunning_eocd_is_inconsistent() {
        let mut zip = ZipBuilder::new().entry("a.txt", b"hello").build();
        let eocd = zip.len() - 22;
        zip[eocd + 12..eocd + 16].copy_from_slice(&10_000u32.to_le_bytes());

        assert!(matches!(
            locate_sections(&ByteView::le(&zip)),
            Err(Error::ZipFormatInconsistent { reason, .. }) if reason.contains("overruns")
        ));
    }

    #[test]
    fn central_directory_starting_after_eocd_is_inconsistent() {
        let mut zip = ZipBuilder::new().entry("a.txt", b"hello").build();
        let eocd = zip.len() - 22;
        zip[eocd + 16..eocd + 20].copy_from_slice(&(eocd as u32 + 1).to_le_bytes());

        assert!(matches!(
            locate_sections(&ByteView::le(&zip)),
            Err(Error::ZipFormatInconsistent { reason, .. }) if reason.contains("starts after")
        ));
    }

    #[test]
    fn gap_before_eocd_is_reported() {
        let mut zip = ZipBuilder::new().entry("a.txt", b"hello").build();
        let eocd = zip.len() - 22;
        let cd_size = u32::from_le_bytes(zip[eocd + 12..eocd + 16].try_into().unwrap());
        zip[eocd + 12..eocd + 16].copy_from_slice(&(cd_size - 4).to_le_bytes());

        let sections = locate_sections(&ByteView::le(&zip)).unwrap();
        assert!(sections.has_gap());
        assert!(matches!(
            sections.require_abutting(),
            Err(Error::ZipFormatInconsistent { .. })
        ));
    }
}
