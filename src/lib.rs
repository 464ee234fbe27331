
#[macro_use] extern crate bitflags;

mod error;
mod header;
mod static_table;
pub mod decoder;
pub mod encoder;
pub mod huffman;
pub mod integer;

pub use decoder::{DecodeIo, Decoder, HeaderTable, TableEntry};
pub use encoder::{Encoder, HeaderIndex};
pub use error::{
    DecoderError, EncoderError, HuffmanDecoderError, IntegerDecodingError, QpackError, QpackResult,
};
pub use header::{EncodeFlag, Header, HeaderFlag, HeaderSet};
pub use static_table::{find_static, static_entry, STATIC_TABLE_SIZE};

/// 默认的动态表的最大容量
pub const DEFAULT_DYN_TABLE_SIZE: usize = 4_096;

/// 默认的允许阻塞的流的最大数量
pub const DEFAULT_MAX_RISKED_STREAMS: usize = 100;

/// Protocol upper bound on the dynamic table capacity.
pub const MAX_DYN_TABLE_SIZE: usize = (1 << 30) - 1;

/// Protocol upper bound on the blocked-stream allowance.
pub const MAX_MAX_RISKED_STREAMS: usize = (1 << 16) - 1;

/// Absolute ids are assigned from a 62-bit counter and are never reused.
pub const MAX_ABS_ID: u64 = (1 << 62) - 1;

pub const MAX_QUIC_STREAM_ID: u64 = (1 << 62) - 1;

/// Per-entry bookkeeping cost added to the name and value lengths
/// (RFC 7541, Section 4.1).
pub const DYNAMIC_ENTRY_OVERHEAD: usize = 32;

/// A prefix integer still unterminated after this many bytes overflows.
pub const UINT64_ENC_SZ: usize = 10;
