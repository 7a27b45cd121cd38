//! Binary framing of a single record.
//!
//! Every record is self-describing: the payload size appears in both the
//! header and the footer so a file can be scanned forwards or backwards,
//! and the checksum follows the payload so writers can hash while streaming.
//!
//! ## Record Structure
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Header (9 bytes)                                            │
//! │  - Magic: "ZaET" (4 bytes)                                   │
//! │  - Data Size: u32 BE (4 bytes)                               │
//! │  - Flags: u8 (1 byte), bit 0 = corrupted                     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Data (Data Size bytes, < 512 KiB)                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Footer (20 bytes)                                           │
//! │  - CRC32 of Data: u32 BE (4 bytes)                           │
//! │  - Reserved: zero (8 bytes)                                  │
//! │  - Data Size: u32 BE (4 bytes)                               │
//! │  - Magic: "TEaZ" (4 bytes)                                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use crate::error::{Result, ZangetsuError};
use crate::record::checksum::Checksum;

/// Magic bytes opening every record: "ZaET"
pub const HEADER_MAGIC: [u8; 4] = *b"ZaET";

/// Magic bytes closing every record: "TEaZ"
pub const FOOTER_MAGIC: [u8; 4] = *b"TEaZ";

/// Header size in bytes.
pub const HEADER_SIZE: usize = 9;

/// Footer size in bytes.
pub const FOOTER_SIZE: usize = 20;

/// Bytes a record occupies on disk in addition to its payload.
pub const RECORD_OVERHEAD: usize = HEADER_SIZE + FOOTER_SIZE;

/// Exclusive upper bound on payload size (512 KiB).
pub const MAX_DATA_SIZE: usize = 512 * 1024;

const RESERVED_SIZE: usize = 8;

/// Per-record flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct RecordFlags(u8);

impl RecordFlags {
    /// Payload is marked unusable; framing is intact.
    pub const CORRUPTED: RecordFlags = RecordFlags(0b0000_0001);

    /// No flags set.
    pub fn empty() -> Self {
        Self(0)
    }

    /// Creates flags from the raw header byte.
    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Returns the raw header byte.
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Returns flags with the corruption bit set or cleared.
    pub fn with_corrupted(self, corrupted: bool) -> Self {
        if corrupted {
            Self(self.0 | Self::CORRUPTED.0)
        } else {
            Self(self.0 & !Self::CORRUPTED.0)
        }
    }

    /// Whether the corruption bit is set.
    pub fn is_corrupted(self) -> bool {
        self.0 & Self::CORRUPTED.0 != 0
    }
}

/// Decoded record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Payload length in bytes.
    pub data_size: u32,
    /// Flag bits.
    pub flags: RecordFlags,
}

impl RecordHeader {
    /// Total on-disk size of the record this header opens.
    pub fn record_size(&self) -> u64 {
        record_size(self.data_size as usize)
    }
}

/// Decoded record footer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordFooter {
    /// Stored payload checksum.
    pub checksum: Checksum,
    /// Repeated payload length.
    pub data_size: u32,
}

/// Returns the total on-disk size of a record with the given payload length.
pub fn record_size(data_size: usize) -> u64 {
    (RECORD_OVERHEAD + data_size) as u64
}

/// Fails with [`ZangetsuError::TooLarge`] unless `data_size < MAX_DATA_SIZE`.
pub fn validate_data_size(data_size: usize) -> Result<()> {
    if data_size >= MAX_DATA_SIZE {
        return Err(ZangetsuError::TooLarge {
            size: data_size as u64,
            max: MAX_DATA_SIZE as u64,
        });
    }
    Ok(())
}

/// Encodes the header and footer framing a payload of `data_size` bytes.
///
/// The payload itself is written by the caller between the two buffers.
///
/// # Errors
///
/// Returns [`ZangetsuError::TooLarge`] if the payload is 512 KiB or more.
pub fn encode(
    data_size: usize,
    flags: RecordFlags,
    checksum: Checksum,
) -> Result<([u8; HEADER_SIZE], [u8; FOOTER_SIZE])> {
    validate_data_size(data_size)?;
    let size = (data_size as u32).to_be_bytes();

    let mut header = [0u8; HEADER_SIZE];
    header[0..4].copy_from_slice(&HEADER_MAGIC);
    header[4..8].copy_from_slice(&size);
    header[8] = flags.bits();

    let mut footer = [0u8; FOOTER_SIZE];
    footer[0..4].copy_from_slice(&checksum.to_be_bytes());
    // footer[4..12] stays zero (reserved)
    footer[12..16].copy_from_slice(&size);
    footer[16..20].copy_from_slice(&FOOTER_MAGIC);

    Ok((header, footer))
}

/// Decodes and validates a record header.
///
/// # Errors
///
/// Returns [`ZangetsuError::CorruptedRecord`] on a short buffer, a magic
/// mismatch, or a declared size at or above the maximum.
pub fn decode_header(buf: &[u8]) -> Result<RecordHeader> {
    if buf.len() < HEADER_SIZE {
        return Err(ZangetsuError::CorruptedRecord(format!(
            "short header: {} bytes",
            buf.len()
        )));
    }
    if buf[0..4] != HEADER_MAGIC {
        return Err(ZangetsuError::CorruptedRecord(format!(
            "invalid header magic {:?}; offset may not point at a record",
            &buf[0..4]
        )));
    }

    let data_size = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    if data_size as usize >= MAX_DATA_SIZE {
        return Err(ZangetsuError::CorruptedRecord(format!(
            "declared data size {} exceeds maximum",
            data_size
        )));
    }

    Ok(RecordHeader {
        data_size,
        flags: RecordFlags::from_bits(buf[8]),
    })
}

/// Decodes a footer and validates it against the payload it closes.
///
/// # Errors
///
/// Returns [`ZangetsuError::CorruptedRecord`] if the checksum, the repeated
/// size, or the footer magic does not match.
pub fn decode_footer(buf: &[u8], data: &[u8]) -> Result<RecordFooter> {
    if buf.len() < FOOTER_SIZE {
        return Err(ZangetsuError::CorruptedRecord(format!(
            "short footer: {} bytes",
            buf.len()
        )));
    }

    let stored = Checksum::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let actual = Checksum::of(data);
    if stored != actual {
        return Err(ZangetsuError::CorruptedRecord(format!(
            "checksum mismatch: expected {:08x}, got {:08x}",
            stored.value(),
            actual.value()
        )));
    }

    let size_at = 4 + RESERVED_SIZE;
    let data_size = u32::from_be_bytes([
        buf[size_at],
        buf[size_at + 1],
        buf[size_at + 2],
        buf[size_at + 3],
    ]);
    if data_size as usize != data.len() {
        return Err(ZangetsuError::CorruptedRecord(format!(
            "footer size {} does not match header size {}",
            data_size,
            data.len()
        )));
    }

    if buf[16..20] != FOOTER_MAGIC {
        return Err(ZangetsuError::CorruptedRecord(format!(
            "invalid footer magic {:?}",
            &buf[16..20]
        )));
    }

    Ok(RecordFooter {
        checksum: stored,
        data_size,
    })
}
