//! On-disk record format.
//!
//! - [`checksum`]: CRC32 over streamed payload chunks
//! - [`codec`]: header/footer framing and validation

pub mod checksum;
pub mod codec;

pub use checksum::{Checksum, ChecksumHasher};
pub use codec::{
    decode_footer, decode_header, encode, record_size, RecordFlags, RecordFooter, RecordHeader,
    FOOTER_SIZE, HEADER_SIZE, MAX_DATA_SIZE, RECORD_OVERHEAD,
};
