//! Synthetic ZIP / APK fixtures shared by the unit tests.

use crate::block::APK_SIG_BLOCK_MAGIC;

pub(crate) const EOCD_SIGNATURE_BYTES: [u8; 4] = [0x50, 0x4B, 0x05, 0x06];

const LOCAL_FILE_HEADER_SIGNATURE: [u8; 4] = [0x50, 0x4B, 0x03, 0x04];
const CENTRAL_DIR_HEADER_SIGNATURE: [u8; 4] = [0x50, 0x4B, 0x01, 0x02];

/// Builds a STORED-only ZIP, optionally with an APK Signing Block between
/// the entry data and the central directory.
#[derive(Default)]
pub(crate) struct ZipBuilder {
    entries: Vec<(String, Vec<u8>)>,
    block: Option<Vec<u8>>,
    comment: Vec<u8>,
}

impl ZipBuilder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn entry(mut self, name: &str, data: &[u8]) -> Self {
        self.entries.push((name.to_owned(), data.to_vec()));
        self
    }

    pub(crate) fn comment(mut self, comment: &[u8]) -> Self {
        self.comment = comment.to_vec();
        self
    }

    /// Insert a well-formed signing block holding `entries`.
    pub(crate) fn signing_block(self, entries: &[(u32, &[u8])]) -> Self {
        self.raw_block(signing_block(entries))
    }

    /// Insert arbitrary bytes where the signing block goes.
    pub(crate) fn raw_block(mut self, block: Vec<u8>) -> Self {
        self.block = Some(block);
        self
    }

    pub(crate) fn build(self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut cd = Vec::new();

        for (name, data) in &self.entries {
            let local_offset = out.len() as u32;
            let name_len = name.len() as u16;
            let size = data.len() as u32;

            out.extend_from_slice(&LOCAL_FILE_HEADER_SIGNATURE);
            out.extend_from_slice(&20u16.to_le_bytes()); // version needed
            out.extend_from_slice(&0u16.to_le_bytes()); // flags
            out.extend_from_slice(&0u16.to_le_bytes()); // stored
            out.extend_from_slice(&[0u8; 4]); // time, date
            out.extend_from_slice(&0u32.to_le_bytes()); // crc
            out.extend_from_slice(&size.to_le_bytes());
            out.extend_from_slice(&size.to_le_bytes());
            out.extend_from_slice(&name_len.to_le_bytes());
            out.extend_from_slice(&0u16.to_le_bytes());
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(data);

            cd.extend_from_slice(&CENTRAL_DIR_HEADER_SIGNATURE);
            cd.extend_from_slice(&20u16.to_le_bytes()); // version made by
            cd.extend_from_slice(&20u16.to_le_bytes()); // version needed
            cd.extend_from_slice(&0u16.to_le_bytes());
            cd.extend_from_slice(&0u16.to_le_bytes());
            cd.extend_from_slice(&[0u8; 4]);
            cd.extend_from_slice(&0u32.to_le_bytes());
            cd.extend_from_slice(&size.to_le_bytes());
            cd.extend_from_slice(&size.to_le_bytes());
            cd.extend_from_slice(&name_len.to_le_bytes());
            cd.extend_from_slice(&0u16.to_le_bytes()); // extra
            cd.extend_from_slice(&0u16.to_le_bytes()); // comment
            cd.extend_from_slice(&0u16.to_le_bytes()); // disk
            cd.extend_from_slice(&0u16.to_le_bytes()); // internal attrs
            cd.extend_from_slice(&0u32.to_le_bytes()); // external attrs
            cd.extend_from_slice(&local_offset.to_le_bytes());
            cd.extend_from_slice(name.as_bytes());
        }

        if let Some(block) = &self.block {
            out.extend_from_slice(block);
        }

        let cd_offset = out.len() as u32;
        let cd_size = cd.len() as u32;
        let count = self.entries.len() as u16;
        out.extend_from_slice(&cd);

        out.extend_from_slice(&EOCD_SIGNATURE_BYTES);
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&count.to_le_bytes());
        out.extend_from_slice(&count.to_le_bytes());
        out.extend_from_slice(&cd_size.to_le_bytes());
        out.extend_from_slice(&cd_offset.to_le_bytes());
        out.extend_from_slice(&(self.comment.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.comment);
        out
    }
}

/// Encode an APK Signing Block: size, `(length, id, value)` pairs, size, magic.
pub(crate) fn signing_block(entries: &[(u32, &[u8])]) -> Vec<u8> {
    let mut pairs = Vec::new();
    for (id, value) in entries {
        pairs.extend_from_slice(&(value.len() as u64 + 4).to_le_bytes());
        pairs.extend_from_slice(&id.to_le_bytes());
        pairs.extend_from_slice(value);
    }

    let size = pairs.len() as u64 + 24;
    let mut block = Vec::with_capacity(size as usize + 8);
    block.extend_from_slice(&size.to_le_bytes());
    block.extend_from_slice(&pairs);
    block.extend_from_slice(&size.to_le_bytes());
    block.extend_from_slice(APK_SIG_BLOCK_MAGIC.as_bytes());
    block
}
