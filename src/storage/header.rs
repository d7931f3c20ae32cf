//! # Page File Header
//!
//! Every page file begins with a header occupying the first bytes of page 1
//! (page 0 is reserved and never materialized). The header identifies the
//! file, carries the page and freed-page counters, the consistency flag and
//! the CRC32C checksum over the data pages.
//!
//! ## Layout (little-endian, 64 bytes)
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  ---------------------------------------------
//! 0       8     identifier: four 16-bit characters 'H','A','R','E'
//! 8       4     file-type discriminant
//! 12      1     format version
//! 13      1     consistency flag (0x00 = OK, 0xFF = CHECK)
//! 14      8     page count (including the header page)
//! 22      4     freed-page count
//! 26      8     CRC32C checksum over data pages
//! 34      8     freelist head page id (0 = empty)
//! 42      22    reserved
//! ```
//!
//! The header is rewritten on commit and on clean close; `consistency = OK`
//! holds exactly when the file was cleanly closed. A file that opens with
//! `CHECK` goes through a recovery scan before use.

use crate::config::FILE_HEADER_SIZE;
use crate::storage::page::PageId;
use crate::zerocopy_accessors;
use crc::{Crc, CRC_32_ISCSI};
use eyre::{ensure, Result};
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// CRC32C (Castagnoli), the checksum polynomial the header stores.
pub const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Four 16-bit identifier characters: 'H', 'A', 'R', 'E'.
pub const FILE_MAGIC: [u16; 4] = [0x0048, 0x0041, 0x0052, 0x0045];

pub const FORMAT_VERSION: u8 = 1;

pub const CONSISTENCY_OK: u8 = 0x00;
pub const CONSISTENCY_CHECK: u8 = 0xFF;

/// What a page file stores; persisted as the header discriminant.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    FixedColumn = 1,
    VariableColumn = 2,
    HashIndex = 3,
    VaSignature = 4,
}

impl FileType {
    pub fn from_u32(v: u32) -> Result<Self> {
        Ok(match v {
            1 => FileType::FixedColumn,
            2 => FileType::VariableColumn,
            3 => FileType::HashIndex,
            4 => FileType::VaSignature,
            other => eyre::bail!("unknown file type discriminant: {}", other),
        })
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct FileHeader {
    magic: [U16; 4],
    file_type: U32,
    version: u8,
    consistency: u8,
    pages: U64,
    freed: U32,
    checksum: U64,
    freelist_head: U64,
    reserved: [u8; 22],
}

const _: () = assert!(std::mem::size_of::<FileHeader>() == FILE_HEADER_SIZE);

impl FileHeader {
    pub fn new(file_type: FileType) -> Self {
        Self {
            magic: FILE_MAGIC.map(U16::new),
            file_type: U32::new(file_type as u32),
            version: FORMAT_VERSION,
            consistency: CONSISTENCY_CHECK,
            pages: U64::new(1),
            freed: U32::new(0),
            checksum: U64::new(0),
            freelist_head: U64::new(0),
            reserved: [0u8; 22],
        }
    }

    /// Parses and verifies the identifier and version. An identifier
    /// mismatch is fatal regardless of the consistency flag.
    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        ensure!(
            bytes.len() >= FILE_HEADER_SIZE,
            "buffer too small for FileHeader: {} < {}",
            bytes.len(),
            FILE_HEADER_SIZE
        );
        let header = Self::ref_from_bytes(&bytes[..FILE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse FileHeader: {:?}", e))?;
        ensure!(
            header.magic.map(|c| c.get()) == FILE_MAGIC,
            "invalid file identifier (not a hare page file)"
        );
        ensure!(
            header.version == FORMAT_VERSION,
            "unsupported format version: {} (expected {})",
            header.version,
            FORMAT_VERSION
        );
        Ok(header)
    }

    pub fn file_type_of(&self) -> Result<FileType> {
        FileType::from_u32(self.file_type.get())
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn consistency_ok(&self) -> bool {
        self.consistency == CONSISTENCY_OK
    }

    pub fn set_consistency(&mut self, ok: bool) {
        self.consistency = if ok { CONSISTENCY_OK } else { CONSISTENCY_CHECK };
    }

    pub fn freelist_head_page(&self) -> Option<PageId> {
        match self.freelist_head.get() {
            0 => None,
            id => Some(id),
        }
    }

    pub fn set_freelist_head_page(&mut self, head: Option<PageId>) {
        self.freelist_head = U64::new(head.unwrap_or(0));
    }

    zerocopy_accessors! {
        pages: u64,
        freed: u32,
        checksum: u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::IntoBytes;

    #[test]
    fn header_size_is_64() {
        assert_eq!(std::mem::size_of::<FileHeader>(), 64);
    }

    #[test]
    fn magic_bytes_spell_hare() {
        let header = FileHeader::new(FileType::FixedColumn);
        let bytes = header.as_bytes();
        assert_eq!(&bytes[..8], &[b'H', 0, b'A', 0, b'R', 0, b'E', 0]);
    }

    #[test]
    fn field_offsets_match_layout() {
        let mut header = FileHeader::new(FileType::VariableColumn);
        header.set_pages(0x1122_3344_5566_7788);
        header.set_freed(0xAABB_CCDD);
        header.set_checksum(0x0102_0304_0506_0708);
        header.set_freelist_head_page(Some(9));

        let bytes = header.as_bytes();
        assert_eq!(&bytes[8..12], &2u32.to_le_bytes());
        assert_eq!(bytes[12], FORMAT_VERSION);
        assert_eq!(bytes[13], CONSISTENCY_CHECK);
        assert_eq!(&bytes[14..22], &0x1122_3344_5566_7788u64.to_le_bytes());
        assert_eq!(&bytes[22..26], &0xAABB_CCDDu32.to_le_bytes());
        assert_eq!(&bytes[26..34], &0x0102_0304_0506_0708u64.to_le_bytes());
        assert_eq!(&bytes[34..42], &9u64.to_le_bytes());
    }

    #[test]
    fn roundtrip() {
        let mut header = FileHeader::new(FileType::HashIndex);
        header.set_pages(17);
        header.set_freed(3);
        header.set_consistency(true);

        let bytes = header.as_bytes().to_vec();
        let parsed = FileHeader::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.file_type_of().unwrap(), FileType::HashIndex);
        assert_eq!(parsed.pages(), 17);
        assert_eq!(parsed.freed(), 3);
        assert!(parsed.consistency_ok());
    }

    #[test]
    fn rejects_foreign_identifier() {
        let mut bytes = [0u8; 64];
        bytes[..8].copy_from_slice(b"NOTHARE!");
        assert!(FileHeader::from_bytes(&bytes).is_err());
    }

    #[test]
    fn rejects_future_version() {
        let header = FileHeader::new(FileType::FixedColumn);
        let mut bytes = header.as_bytes().to_vec();
        bytes[12] = 99;
        assert!(FileHeader::from_bytes(&bytes).is_err());
    }
}
