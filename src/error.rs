// Copyright 2022 - 2023 Wenmeng See the COPYRIGHT
// file at the top-level directory of this distribution.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.
//
// Author: tickbh
// -----
// Created Date: 2024/05/06 09:41:12

use std::{fmt, result};

/// Represents all errors that can be encountered while decoding an
/// integer.
#[derive(PartialEq)]
#[derive(Copy)]
#[derive(Clone)]
#[derive(Debug)]
pub enum IntegerDecodingError {
    /// The encoded representation keeps producing continuation bytes past
    /// the point where any value this protocol allows could terminate.
    TooManyOctets,
    /// The accumulated value does not fit into 64 bits.
    ValueTooLarge,
}

/// Represents all errors that can be encountered while decoding a
/// Huffman-encoded octet string.
#[derive(PartialEq)]
#[derive(Copy)]
#[derive(Clone)]
#[derive(Debug)]
pub enum HuffmanDecoderError {
    /// If EOS is ever found in the string, it causes an error.
    EOSInString,
    /// Any padding that does not correspond to the most significant bits of
    /// EOS, or padding of 8 or more bits, MUST be interpreted as an error.
    InvalidPadding,
}

/// Errors raised while decoding header blocks or the peer's encoder stream.
#[derive(PartialEq)]
#[derive(Copy)]
#[derive(Clone)]
#[derive(Debug)]
pub enum DecoderError {
    /// A reference to a table entry that was already evicted or was never
    /// inserted.
    HeaderIndexOutOfBounds,
    /// The size of the dynamic table can never be allowed to exceed the max
    /// size mandated to the decoder by the configuration.
    InvalidMaxDynamicSize,
    /// More streams would block on missing insertions than the configured
    /// limit allows.
    TooManyBlockedStreams,
    /// The header block ended in the middle of an instruction.
    TruncatedBlock,
    /// The stream is not known to the decoder.
    UnknownStream,
    /// The transport reported a fatal condition while reading a block.
    ReadFailure,
    /// Construction with limits outside the protocol bounds.
    InvalidLimit,
}

/// Errors raised by the encoder and by parsing the peer's decoder stream.
#[derive(PartialEq)]
#[derive(Copy)]
#[derive(Clone)]
#[derive(Debug)]
pub enum EncoderError {
    /// The encoder-stream output buffer is too small; retry with more room.
    NoEncBuf,
    /// The header-block output buffer is too small; retry with more room.
    NoHdrBuf,
    /// `start_header` while a header block is already open.
    HeaderInProgress,
    /// `encode`/`end_header` without an open header block.
    NoHeaderInProgress,
    /// Capacity or risk limit outside the protocol bounds.
    InvalidLimit,
    /// The peer acknowledged a header block the encoder never emitted.
    UnknownHeaderAck,
    /// Table state synchronize past the actual number of insertions.
    AckedUnknownInserts,
    /// A stream id above the QUIC limit.
    InvalidStreamId,
}

#[derive(PartialEq)]
#[derive(Copy)]
#[derive(Clone)]
#[derive(Debug)]
pub enum QpackError {
    Integer(IntegerDecodingError),
    Huffman(HuffmanDecoderError),
    Decoder(DecoderError),
    Encoder(EncoderError),
}

impl QpackError {
    #[inline]
    fn description_str(&self) -> &'static str {
        match self {
            QpackError::Integer(IntegerDecodingError::TooManyOctets) => "integer encoding too long",
            QpackError::Integer(IntegerDecodingError::ValueTooLarge) => "integer overflows 64 bits",
            QpackError::Huffman(HuffmanDecoderError::EOSInString) => "eos in huffman string",
            QpackError::Huffman(HuffmanDecoderError::InvalidPadding) => "invalid huffman padding",
            QpackError::Decoder(DecoderError::HeaderIndexOutOfBounds) => "header index out of bounds",
            QpackError::Decoder(DecoderError::InvalidMaxDynamicSize) => "dynamic table size over limit",
            QpackError::Decoder(DecoderError::TooManyBlockedStreams) => "too many blocked streams",
            QpackError::Decoder(DecoderError::TruncatedBlock) => "truncated header block",
            QpackError::Decoder(DecoderError::UnknownStream) => "unknown stream",
            QpackError::Decoder(DecoderError::ReadFailure) => "header block read failure",
            QpackError::Decoder(DecoderError::InvalidLimit) => "limit outside protocol bounds",
            QpackError::Encoder(EncoderError::NoEncBuf) => "encoder stream buffer too small",
            QpackError::Encoder(EncoderError::NoHdrBuf) => "header block buffer too small",
            QpackError::Encoder(EncoderError::HeaderInProgress) => "header already in progress",
            QpackError::Encoder(EncoderError::NoHeaderInProgress) => "no header in progress",
            QpackError::Encoder(EncoderError::InvalidLimit) => "limit outside protocol bounds",
            QpackError::Encoder(EncoderError::UnknownHeaderAck) => "ack for unknown header block",
            QpackError::Encoder(EncoderError::AckedUnknownInserts) => "ack past insert count",
            QpackError::Encoder(EncoderError::InvalidStreamId) => "stream id over quic limit",
        }
    }

    /// 可以通过扩大缓存重试的错误, 并非连接失败
    pub fn is_transient(&self) -> bool {
        match self {
            QpackError::Encoder(EncoderError::NoEncBuf) => true,
            QpackError::Encoder(EncoderError::NoHdrBuf) => true,
            _ => false,
        }
    }
}

impl fmt::Display for QpackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description_str())
    }
}

impl From<IntegerDecodingError> for QpackError {
    fn from(e: IntegerDecodingError) -> Self {
        QpackError::Integer(e)
    }
}

impl From<HuffmanDecoderError> for QpackError {
    fn from(e: HuffmanDecoderError) -> Self {
        QpackError::Huffman(e)
    }
}

impl From<DecoderError> for QpackError {
    fn from(e: DecoderError) -> Self {
        QpackError::Decoder(e)
    }
}

impl From<EncoderError> for QpackError {
    fn from(e: EncoderError) -> Self {
        QpackError::Encoder(e)
    }
}

pub type QpackResult<T> = result::Result<T, QpackError>;
