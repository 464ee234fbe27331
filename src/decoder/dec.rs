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
// Created Date: 2024/05/09 08:54:21

use std::cmp::{min, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::mem;

use algorithm::buf::Binary;

use super::table::{HeaderTable, TableEntry};
use crate::huffman::{HuffDec, HuffmanDecoder};
use crate::integer::{encode_int_nocheck, int_len, IntDecoder};
use crate::static_table::static_binary;
use crate::{
    DecoderError, Header, HeaderSet, QpackResult, MAX_DYN_TABLE_SIZE, MAX_MAX_RISKED_STREAMS,
};

/// The seam between the decoder and the QUIC transport. Header-block bytes
/// are pulled on demand so a blocked stream leaves its bytes buffered in
/// the transport; decoder-stream bytes are pushed out as they are
/// produced.
pub trait DecodeIo {
    /// Reads more header-block bytes for `stream_id` into `dst`.
    /// `Ok(0)` means no bytes are available right now.
    fn read_block(&mut self, stream_id: u64, dst: &mut [u8]) -> QpackResult<usize>;
    /// Tells the transport whether the decoder wants more block bytes.
    fn wantread_block(&mut self, stream_id: u64, on: bool);
    /// Delivers a completely decoded header block.
    fn block_done(&mut self, stream_id: u64, headers: HeaderSet);
    /// Writes bytes onto the decoder-to-encoder stream.
    fn write_decoder(&mut self, buf: &[u8]) -> QpackResult<()>;
}

/// Resumable reader for one length-prefixed string body. The output buffer
/// grows geometrically while the Huffman decoder reports a full
/// destination.
#[derive(Debug)]
struct StrReader {
    huffman: Option<HuffmanDecoder>,
    buf: Vec<u8>,
    off: usize,
    len: usize,
    nread: usize,
}

impl StrReader {
    fn new(len: usize, is_huffman: bool) -> StrReader {
        let buf = if is_huffman {
            vec![0; len + len / 2]
        } else {
            vec![0; len]
        };
        StrReader {
            huffman: if is_huffman {
                Some(HuffmanDecoder::new())
            } else {
                None
            },
            buf,
            off: 0,
            len,
            nread: 0,
        }
    }

    /// Consumes wire bytes from `src`; `Ok(true)` when the whole string
    /// has been decoded.
    fn read(&mut self, src: &mut &[u8]) -> QpackResult<bool> {
        match &mut self.huffman {
            Some(huffman) => loop {
                let take = min(src.len(), self.len - self.nread);
                let fin = self.nread + take == self.len;
                match huffman.decode(&src[..take], &mut self.buf[self.off..], fin)? {
                    HuffDec::Done { n_src, n_dst } => {
                        *src = &src[n_src..];
                        self.nread += n_src;
                        self.off += n_dst;
                        return Ok(true);
                    }
                    HuffDec::EndSrc { n_src, n_dst } => {
                        *src = &src[n_src..];
                        self.nread += n_src;
                        self.off += n_dst;
                        return Ok(false);
                    }
                    HuffDec::EndDst { n_src, n_dst } => {
                        *src = &src[n_src..];
                        self.nread += n_src;
                        self.off += n_dst;
                        let grown = self.buf.len() * 2;
                        self.buf.resize(grown, 0);
                    }
                }
            },
            None => {
                let take = min(src.len(), self.len - self.off);
                self.buf[self.off..self.off + take].copy_from_slice(&src[..take]);
                self.off += take;
                *src = &src[take..];
                Ok(self.off == self.len)
            }
        }
    }

    fn take(mut self) -> Vec<u8> {
        self.buf.truncate(self.off);
        self.buf
    }
}

#[derive(Debug)]
enum NameRef {
    Stat(u64),
    Dyn(TableEntry),
}

/// Parser state of one header block; every variant holds the resumable
/// decoder it was suspended in, so input may stop at any byte.
#[derive(Debug)]
enum Phase {
    ReadLargestRef(IntDecoder),
    BeginBaseIdx,
    ReadBaseIdx { sign: bool, int: IntDecoder },
    Next,
    Indexed { is_static: bool, int: IntDecoder },
    IndexedPostBase { int: IntDecoder },
    NameRefIdx { never: bool, is_static: bool, int: IntDecoder },
    PostBaseNameRefIdx { never: bool, int: IntDecoder },
    NameRefBeginVal { never: bool, name: NameRef },
    NameRefValLen { never: bool, name: NameRef, is_huffman: bool, int: IntDecoder },
    NameRefVal { never: bool, name: NameRef, val: StrReader },
    LitNameLen { never: bool, is_huffman: bool, int: IntDecoder },
    LitName { never: bool, name: StrReader },
    LitBeginVal { never: bool, name: Vec<u8> },
    LitValLen { never: bool, name: Vec<u8>, is_huffman: bool, int: IntDecoder },
    LitVal { never: bool, name: Vec<u8>, val: StrReader },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ReadStatus {
    Done,
    Need,
    Blocked,
}

#[derive(Debug)]
struct BlockReadCtx {
    stream_id: u64,
    /// Wire bytes of the block not yet pulled from the transport.
    remaining: usize,
    largest_ref: u64,
    base_index: u64,
    have_largest_ref: bool,
    blocked: bool,
    headers: HeaderSet,
    lr_min_sz: usize,
    lr_nread: usize,
    phase: Phase,
}

impl BlockReadCtx {
    fn new(stream_id: u64, block_size: usize, lr_min_sz: usize) -> BlockReadCtx {
        BlockReadCtx {
            stream_id,
            remaining: block_size,
            largest_ref: 0,
            base_index: 0,
            have_largest_ref: false,
            blocked: false,
            headers: HeaderSet::new(),
            lr_min_sz,
            lr_nread: 0,
            phase: Phase::ReadLargestRef(IntDecoder::new()),
        }
    }

    /// Until the largest reference is known, pull only as many bytes as
    /// its smallest possible encoding, then single bytes; a block that
    /// turns out to be blocked then never strands parsed-ahead input.
    fn max_to_read(&self) -> usize {
        if self.have_largest_ref {
            self.remaining
        } else {
            let sz = if self.lr_min_sz > self.lr_nread {
                self.lr_min_sz - self.lr_nread
            } else {
                1
            };
            min(sz, self.remaining)
        }
    }

    fn push_nameref(&mut self, name: NameRef, value: Vec<u8>, never: bool) {
        let value = Binary::from(value);
        let header = match name {
            NameRef::Stat(idx) => match static_binary(idx) {
                Some((name, _)) => Header::new(name, value, never),
                None => return,
            },
            NameRef::Dyn(entry) => Header::new(entry.name.clone(), value, never),
        };
        self.headers.push(header);
    }

    fn push_literal(&mut self, name: Vec<u8>, value: Vec<u8>, never: bool) {
        self.headers
            .push(Header::new(Binary::from(name), Binary::from(value), never));
    }
}

#[derive(Debug)]
enum EncPhase {
    Next,
    InsNameRefIdx { is_static: bool, int: IntDecoder },
    InsNameRefBeginVal { name: Binary },
    InsNameRefValLen { name: Binary, is_huffman: bool, int: IntDecoder },
    InsNameRefVal { name: Binary, val: StrReader },
    InsLitNameLen { is_huffman: bool, int: IntDecoder },
    InsLitName { name: StrReader },
    InsLitBeginVal { name: Vec<u8> },
    InsLitValLen { name: Vec<u8>, is_huffman: bool, int: IntDecoder },
    InsLitVal { name: Vec<u8>, val: StrReader },
    Duplicate { int: IntDecoder },
    SizeUpdate { int: IntDecoder },
}

/// QPACK decoder: one per connection. Header blocks arrive per stream via
/// `header_in`/`header_read`, the peer's encoder stream via
/// `enc_stream_in`; decoded header sets and decoder-stream bytes leave
/// through the [`DecodeIo`] callbacks.
pub struct Decoder<IO> {
    io: IO,
    table: HeaderTable,
    max_risked_streams: usize,
    blocks: HashMap<u64, BlockReadCtx>,
    blocked: BinaryHeap<Reverse<(u64, u64)>>,
    n_blocked: usize,
    enc_phase: EncPhase,
    pending_synch: u64,
}

impl<IO: DecodeIo> Decoder<IO> {
    pub fn new(max_dyn_size: usize, max_risked_streams: usize, io: IO) -> QpackResult<Decoder<IO>> {
        if max_dyn_size > MAX_DYN_TABLE_SIZE || max_risked_streams > MAX_MAX_RISKED_STREAMS {
            return Err(DecoderError::InvalidLimit.into());
        }
        Ok(Decoder {
            io,
            table: HeaderTable::new(max_dyn_size),
            max_risked_streams,
            blocks: HashMap::new(),
            blocked: BinaryHeap::new(),
            n_blocked: 0,
            enc_phase: EncPhase::Next,
            pending_synch: 0,
        })
    }

    pub fn io(&self) -> &IO {
        &self.io
    }

    pub fn io_mut(&mut self) -> &mut IO {
        &mut self.io
    }

    pub fn ins_count(&self) -> u64 {
        self.table.ins_count()
    }

    pub fn table(&self) -> &HeaderTable {
        &self.table
    }

    pub fn blocked_count(&self) -> usize {
        self.n_blocked
    }

    pub fn set_max_capacity(&mut self, max_capacity: usize) -> QpackResult<()> {
        if max_capacity > MAX_DYN_TABLE_SIZE {
            return Err(DecoderError::InvalidLimit.into());
        }
        self.table.set_max_capacity(max_capacity);
        Ok(())
    }

    /// Starts decoding a `block_size`-byte header block on `stream_id`,
    /// synchronously draining whatever the transport already has.
    pub fn header_in(&mut self, stream_id: u64, block_size: usize) -> QpackResult<()> {
        let ctx = BlockReadCtx::new(
            stream_id,
            block_size,
            int_len(self.table.del_count(), 8),
        );
        self.run_block(ctx)
    }

    /// Continues a suspended header block after the transport signalled
    /// more bytes (or a wake-up after blocking).
    pub fn header_read(&mut self, stream_id: u64) -> QpackResult<()> {
        let ctx = match self.blocks.remove(&stream_id) {
            Some(mut ctx) => {
                if ctx.blocked {
                    // Still waiting on insertions.
                    self.blocks.insert(stream_id, ctx);
                    return Ok(());
                }
                ctx.blocked = false;
                ctx
            }
            None => return Err(DecoderError::UnknownStream.into()),
        };
        self.run_block(ctx)
    }

    /// Abandons any in-progress block on the stream and tells the peer
    /// with a Stream Cancellation instruction.
    pub fn cancel_stream(&mut self, stream_id: u64) -> QpackResult<()> {
        if let Some(ctx) = self.blocks.remove(&stream_id) {
            if ctx.blocked {
                self.n_blocked -= 1;
            }
            self.write_stream_cancel(stream_id)?;
        }
        Ok(())
    }

    fn run_block(&mut self, mut ctx: BlockReadCtx) -> QpackResult<()> {
        match self.drive_block(&mut ctx)? {
            ReadStatus::Done => {
                log::trace!(
                    "qpack: block done stream={} headers={}",
                    ctx.stream_id,
                    ctx.headers.len()
                );
                if ctx.largest_ref > 0 {
                    self.write_header_ack(ctx.stream_id)?;
                }
                let headers = mem::take(&mut ctx.headers);
                self.io.block_done(ctx.stream_id, headers);
                Ok(())
            }
            ReadStatus::Need => {
                self.io.wantread_block(ctx.stream_id, true);
                self.blocks.insert(ctx.stream_id, ctx);
                Ok(())
            }
            ReadStatus::Blocked => {
                if self.n_blocked >= self.max_risked_streams {
                    return Err(DecoderError::TooManyBlockedStreams.into());
                }
                log::trace!(
                    "qpack: stream {} blocked on insert {}",
                    ctx.stream_id,
                    ctx.largest_ref
                );
                ctx.blocked = true;
                self.n_blocked += 1;
                self.blocked
                    .push(Reverse((ctx.largest_ref, ctx.stream_id)));
                self.io.wantread_block(ctx.stream_id, false);
                self.blocks.insert(ctx.stream_id, ctx);
                Ok(())
            }
        }
    }

    fn drive_block(&mut self, ctx: &mut BlockReadCtx) -> QpackResult<ReadStatus> {
        while ctx.remaining > 0 {
            let mut buf = vec![0u8; ctx.max_to_read()];
            let nread = self.io.read_block(ctx.stream_id, &mut buf)?;
            if nread == 0 {
                return Ok(ReadStatus::Need);
            }
            if nread > buf.len() {
                return Err(DecoderError::ReadFailure.into());
            }
            ctx.remaining -= nread;
            match Self::parse_block(&self.table, ctx, &buf[..nread])? {
                ReadStatus::Need => {
                    if ctx.remaining == 0 {
                        return Err(DecoderError::TruncatedBlock.into());
                    }
                }
                status => return Ok(status),
            }
        }
        Ok(ReadStatus::Done)
    }

    fn parse_block(
        table: &HeaderTable,
        ctx: &mut BlockReadCtx,
        src: &[u8],
    ) -> QpackResult<ReadStatus> {
        let mut src = src;
        loop {
            if src.is_empty() {
                break;
            }
            match mem::replace(&mut ctx.phase, Phase::Next) {
                Phase::ReadLargestRef(mut int) => {
                    let before = src.len();
                    let done = int.decode(&mut src, 8)?;
                    ctx.lr_nread += before - src.len();
                    match done {
                        Some(value) => {
                            ctx.largest_ref = value;
                            ctx.have_largest_ref = true;
                            ctx.phase = Phase::BeginBaseIdx;
                            if value > table.ins_count() {
                                return Ok(ReadStatus::Blocked);
                            }
                        }
                        None => ctx.phase = Phase::ReadLargestRef(int),
                    }
                }
                Phase::BeginBaseIdx => {
                    ctx.phase = Phase::ReadBaseIdx {
                        sign: src[0] & 0x80 != 0,
                        int: IntDecoder::new(),
                    };
                }
                Phase::ReadBaseIdx { sign, mut int } => match int.decode(&mut src, 7)? {
                    Some(value) => {
                        let base = if sign {
                            ctx.largest_ref.checked_sub(value)
                        } else {
                            ctx.largest_ref.checked_add(value)
                        };
                        ctx.base_index = match base {
                            Some(v) => v,
                            None => return Err(DecoderError::HeaderIndexOutOfBounds.into()),
                        };
                        ctx.phase = Phase::Next;
                    }
                    None => ctx.phase = Phase::ReadBaseIdx { sign, int },
                },
                Phase::Next => {
                    let b = src[0];
                    ctx.phase = if b & 0x80 != 0 {
                        Phase::Indexed {
                            is_static: b & 0x40 != 0,
                            int: IntDecoder::new(),
                        }
                    } else if b & 0x40 != 0 {
                        Phase::NameRefIdx {
                            never: b & 0x20 != 0,
                            is_static: b & 0x10 != 0,
                            int: IntDecoder::new(),
                        }
                    } else if b & 0x20 != 0 {
                        Phase::LitNameLen {
                            never: b & 0x10 != 0,
                            is_huffman: b & 0x08 != 0,
                            int: IntDecoder::new(),
                        }
                    } else if b & 0x10 != 0 {
                        Phase::IndexedPostBase {
                            int: IntDecoder::new(),
                        }
                    } else {
                        Phase::PostBaseNameRefIdx {
                            never: b & 0x08 != 0,
                            int: IntDecoder::new(),
                        }
                    };
                }
                Phase::Indexed { is_static, mut int } => match int.decode(&mut src, 6)? {
                    Some(value) => {
                        if is_static {
                            match static_binary(value) {
                                Some((name, val)) => ctx.headers.push(Header::new(name, val, false)),
                                None => return Err(DecoderError::HeaderIndexOutOfBounds.into()),
                            }
                        } else {
                            match table.get_abs(value) {
                                Some(entry) => ctx.headers.push(Header::new(
                                    entry.name.clone(),
                                    entry.value.clone(),
                                    false,
                                )),
                                None => return Err(DecoderError::HeaderIndexOutOfBounds.into()),
                            }
                        }
                        ctx.phase = Phase::Next;
                    }
                    None => ctx.phase = Phase::Indexed { is_static, int },
                },
                Phase::IndexedPostBase { mut int } => match int.decode(&mut src, 4)? {
                    Some(value) => {
                        let abs = match ctx.base_index.checked_add(value) {
                            Some(v) => v,
                            None => return Err(DecoderError::HeaderIndexOutOfBounds.into()),
                        };
                        match table.get_abs(abs) {
                            Some(entry) => ctx.headers.push(Header::new(
                                entry.name.clone(),
                                entry.value.clone(),
                                false,
                            )),
                            None => return Err(DecoderError::HeaderIndexOutOfBounds.into()),
                        }
                        ctx.phase = Phase::Next;
                    }
                    None => ctx.phase = Phase::IndexedPostBase { int },
                },
                Phase::NameRefIdx {
                    never,
                    is_static,
                    mut int,
                } => match int.decode(&mut src, 4)? {
                    Some(value) => {
                        let name = if is_static {
                            if static_binary(value).is_none() {
                                return Err(DecoderError::HeaderIndexOutOfBounds.into());
                            }
                            NameRef::Stat(value)
                        } else {
                            let abs = match ctx.base_index.checked_sub(value) {
                                Some(v) => v,
                                None => return Err(DecoderError::HeaderIndexOutOfBounds.into()),
                            };
                            match table.get_abs(abs) {
                                Some(entry) => NameRef::Dyn(entry.clone()),
                                None => return Err(DecoderError::HeaderIndexOutOfBounds.into()),
                            }
                        };
                        ctx.phase = Phase::NameRefBeginVal { never, name };
                    }
                    None => {
                        ctx.phase = Phase::NameRefIdx {
                            never,
                            is_static,
                            int,
                        }
                    }
                },
                Phase::PostBaseNameRefIdx { never, mut int } => match int.decode(&mut src, 3)? {
                    Some(value) => {
                        let abs = ctx
                            .base_index
                            .checked_add(value)
                            .and_then(|v| v.checked_add(1));
                        let abs = match abs {
                            Some(v) if v <= ctx.largest_ref => v,
                            _ => return Err(DecoderError::HeaderIndexOutOfBounds.into()),
                        };
                        match table.get_abs(abs) {
                            Some(entry) => {
                                ctx.phase = Phase::NameRefBeginVal {
                                    never,
                                    name: NameRef::Dyn(entry.clone()),
                                }
                            }
                            None => return Err(DecoderError::HeaderIndexOutOfBounds.into()),
                        }
                    }
                    None => ctx.phase = Phase::PostBaseNameRefIdx { never, int },
                },
                Phase::NameRefBeginVal { never, name } => {
                    ctx.phase = Phase::NameRefValLen {
                        never,
                        name,
                        is_huffman: src[0] & 0x80 != 0,
                        int: IntDecoder::new(),
                    };
                }
                Phase::NameRefValLen {
                    never,
                    name,
                    is_huffman,
                    mut int,
                } => match int.decode(&mut src, 7)? {
                    Some(value) => {
                        if value == 0 {
                            ctx.push_nameref(name, Vec::new(), never);
                            ctx.phase = Phase::Next;
                        } else {
                            ctx.phase = Phase::NameRefVal {
                                never,
                                name,
                                val: StrReader::new(value as usize, is_huffman),
                            };
                        }
                    }
                    None => {
                        ctx.phase = Phase::NameRefValLen {
                            never,
                            name,
                            is_huffman,
                            int,
                        }
                    }
                },
                Phase::NameRefVal {
                    never,
                    name,
                    mut val,
                } => {
                    if val.read(&mut src)? {
                        ctx.push_nameref(name, val.take(), never);
                        ctx.phase = Phase::Next;
                    } else {
                        ctx.phase = Phase::NameRefVal { never, name, val };
                    }
                }
                Phase::LitNameLen {
                    never,
                    is_huffman,
                    mut int,
                } => match int.decode(&mut src, 3)? {
                    Some(value) => {
                        if value == 0 {
                            ctx.phase = Phase::LitBeginVal {
                                never,
                                name: Vec::new(),
                            };
                        } else {
                            ctx.phase = Phase::LitName {
                                never,
                                name: StrReader::new(value as usize, is_huffman),
                            };
                        }
                    }
                    None => {
                        ctx.phase = Phase::LitNameLen {
                            never,
                            is_huffman,
                            int,
                        }
                    }
                },
                Phase::LitName { never, mut name } => {
                    if name.read(&mut src)? {
                        ctx.phase = Phase::LitBeginVal {
                            never,
                            name: name.take(),
                        };
                    } else {
                        ctx.phase = Phase::LitName { never, name };
                    }
                }
                Phase::LitBeginVal { never, name } => {
                    ctx.phase = Phase::LitValLen {
                        never,
                        name,
                        is_huffman: src[0] & 0x80 != 0,
                        int: IntDecoder::new(),
                    };
                }
                Phase::LitValLen {
                    never,
                    name,
                    is_huffman,
                    mut int,
                } => match int.decode(&mut src, 7)? {
                    Some(value) => {
                        if value == 0 {
                            ctx.push_literal(name, Vec::new(), never);
                            ctx.phase = Phase::Next;
                        } else {
                            ctx.phase = Phase::LitVal {
                                never,
                                name,
                                val: StrReader::new(value as usize, is_huffman),
                            };
                        }
                    }
                    None => {
                        ctx.phase = Phase::LitValLen {
                            never,
                            name,
                            is_huffman,
                            int,
                        }
                    }
                },
                Phase::LitVal {
                    never,
                    name,
                    mut val,
                } => {
                    if val.read(&mut src)? {
                        ctx.push_literal(name, val.take(), never);
                        ctx.phase = Phase::Next;
                    } else {
                        ctx.phase = Phase::LitVal { never, name, val };
                    }
                }
            }
        }

        if ctx.remaining > 0 {
            Ok(ReadStatus::Need)
        } else {
            match ctx.phase {
                Phase::Next => Ok(ReadStatus::Done),
                _ => Err(DecoderError::TruncatedBlock.into()),
            }
        }
    }

    /// Consumes bytes of the peer's encoder stream, applying insert,
    /// duplicate and set-capacity instructions. Instructions resume across
    /// arbitrarily fragmented input.
    pub fn enc_stream_in(&mut self, buf: &[u8]) -> QpackResult<()> {
        let mut src = buf;
        loop {
            if src.is_empty() {
                break;
            }
            match mem::replace(&mut self.enc_phase, EncPhase::Next) {
                EncPhase::Next => {
                    let b = src[0];
                    self.enc_phase = if b & 0x80 != 0 {
                        EncPhase::InsNameRefIdx {
                            is_static: b & 0x40 != 0,
                            int: IntDecoder::new(),
                        }
                    } else if b & 0x40 != 0 {
                        EncPhase::InsLitNameLen {
                            is_huffman: b & 0x20 != 0,
                            int: IntDecoder::new(),
                        }
                    } else if b & 0x20 != 0 {
                        EncPhase::SizeUpdate {
                            int: IntDecoder::new(),
                        }
                    } else {
                        EncPhase::Duplicate {
                            int: IntDecoder::new(),
                        }
                    };
                }
                EncPhase::InsNameRefIdx { is_static, mut int } => match int.decode(&mut src, 6)? {
                    Some(value) => {
                        let name = if is_static {
                            match static_binary(value) {
                                Some((name, _)) => name,
                                None => return Err(DecoderError::HeaderIndexOutOfBounds.into()),
                            }
                        } else {
                            match self.table.get_rel(value) {
                                Some(entry) => entry.name.clone(),
                                None => return Err(DecoderError::HeaderIndexOutOfBounds.into()),
                            }
                        };
                        self.enc_phase = EncPhase::InsNameRefBeginVal { name };
                    }
                    None => self.enc_phase = EncPhase::InsNameRefIdx { is_static, int },
                },
                EncPhase::InsNameRefBeginVal { name } => {
                    self.enc_phase = EncPhase::InsNameRefValLen {
                        name,
                        is_huffman: src[0] & 0x80 != 0,
                        int: IntDecoder::new(),
                    };
                }
                EncPhase::InsNameRefValLen {
                    name,
                    is_huffman,
                    mut int,
                } => match int.decode(&mut src, 7)? {
                    Some(value) => {
                        self.check_insert_len(value)?;
                        if value == 0 {
                            self.push_entry(TableEntry::new(name, Binary::new()))?;
                        } else {
                            self.enc_phase = EncPhase::InsNameRefVal {
                                name,
                                val: StrReader::new(value as usize, is_huffman),
                            };
                        }
                    }
                    None => {
                        self.enc_phase = EncPhase::InsNameRefValLen {
                            name,
                            is_huffman,
                            int,
                        }
                    }
                },
                EncPhase::InsNameRefVal { name, mut val } => {
                    if val.read(&mut src)? {
                        let value = Binary::from(val.take());
                        self.push_entry(TableEntry::new(name, value))?;
                    } else {
                        self.enc_phase = EncPhase::InsNameRefVal { name, val };
                    }
                }
                EncPhase::InsLitNameLen {
                    is_huffman,
                    mut int,
                } => match int.decode(&mut src, 5)? {
                    Some(value) => {
                        self.check_insert_len(value)?;
                        if value == 0 {
                            self.enc_phase = EncPhase::InsLitBeginVal { name: Vec::new() };
                        } else {
                            self.enc_phase = EncPhase::InsLitName {
                                name: StrReader::new(value as usize, is_huffman),
                            };
                        }
                    }
                    None => self.enc_phase = EncPhase::InsLitNameLen { is_huffman, int },
                },
                EncPhase::InsLitName { mut name } => {
                    if name.read(&mut src)? {
                        self.enc_phase = EncPhase::InsLitBeginVal { name: name.take() };
                    } else {
                        self.enc_phase = EncPhase::InsLitName { name };
                    }
                }
                EncPhase::InsLitBeginVal { name } => {
                    self.enc_phase = EncPhase::InsLitValLen {
                        name,
                        is_huffman: src[0] & 0x80 != 0,
                        int: IntDecoder::new(),
                    };
                }
                EncPhase::InsLitValLen {
                    name,
                    is_huffman,
                    mut int,
                } => match int.decode(&mut src, 7)? {
                    Some(value) => {
                        self.check_insert_len(value)?;
                        if value == 0 {
                            self.push_entry(TableEntry::new(Binary::from(name), Binary::new()))?;
                        } else {
                            self.enc_phase = EncPhase::InsLitVal {
                                name,
                                val: StrReader::new(value as usize, is_huffman),
                            };
                        }
                    }
                    None => {
                        self.enc_phase = EncPhase::InsLitValLen {
                            name,
                            is_huffman,
                            int,
                        }
                    }
                },
                EncPhase::InsLitVal { name, mut val } => {
                    if val.read(&mut src)? {
                        let value = Binary::from(val.take());
                        self.push_entry(TableEntry::new(Binary::from(name), value))?;
                    } else {
                        self.enc_phase = EncPhase::InsLitVal { name, val };
                    }
                }
                EncPhase::Duplicate { mut int } => match int.decode(&mut src, 5)? {
                    Some(value) => {
                        let entry = match self.table.get_rel(value) {
                            Some(entry) => entry.clone(),
                            None => return Err(DecoderError::HeaderIndexOutOfBounds.into()),
                        };
                        self.push_entry(entry)?;
                    }
                    None => self.enc_phase = EncPhase::Duplicate { int },
                },
                EncPhase::SizeUpdate { mut int } => match int.decode(&mut src, 5)? {
                    Some(value) => {
                        if value > self.table.max_capacity() as u64 {
                            return Err(DecoderError::InvalidMaxDynamicSize.into());
                        }
                        log::trace!("qpack: set capacity {}", value);
                        self.table.update_cur_max_capacity(value as usize);
                    }
                    None => self.enc_phase = EncPhase::SizeUpdate { int },
                },
            }
        }

        if self.pending_synch > 0 {
            let count = self.pending_synch;
            self.pending_synch = 0;
            self.write_table_synch(count)?;
        }
        self.process_blocked();
        Ok(())
    }

    /// Rejects an insert string that cannot fit the table even at the
    /// maximum Huffman compression of 30 wire bits per output byte,
    /// before any of its body is buffered.
    fn check_insert_len(&self, len: u64) -> QpackResult<()> {
        if len > self.table.cur_max_capacity() as u64 * 4 {
            return Err(DecoderError::InvalidMaxDynamicSize.into());
        }
        Ok(())
    }

    fn push_entry(&mut self, entry: TableEntry) -> QpackResult<()> {
        if entry.cost() > self.table.cur_max_capacity() {
            return Err(DecoderError::InvalidMaxDynamicSize.into());
        }
        let abs_id = self.table.push(entry);
        log::trace!("qpack: decoder insert {}", abs_id);
        self.pending_synch += 1;
        Ok(())
    }

    /// Wakes every blocked stream whose required insert count has been
    /// reached.
    fn process_blocked(&mut self) {
        while let Some(&Reverse((largest_ref, stream_id))) = self.blocked.peek() {
            if largest_ref > self.table.ins_count() {
                break;
            }
            self.blocked.pop();
            if let Some(ctx) = self.blocks.get_mut(&stream_id) {
                if ctx.blocked && ctx.largest_ref == largest_ref {
                    ctx.blocked = false;
                    self.n_blocked -= 1;
                    self.io.wantread_block(stream_id, true);
                }
            }
        }
    }

    fn write_header_ack(&mut self, stream_id: u64) -> QpackResult<()> {
        let mut buf = [0u8; 12];
        buf[0] = 0x80;
        let n = encode_int_nocheck(&mut buf, stream_id, 7);
        self.io.write_decoder(&buf[..n])
    }

    fn write_table_synch(&mut self, count: u64) -> QpackResult<()> {
        let mut buf = [0u8; 12];
        buf[0] = 0;
        let n = encode_int_nocheck(&mut buf, count, 6);
        self.io.write_decoder(&buf[..n])
    }

    fn write_stream_cancel(&mut self, stream_id: u64) -> QpackResult<()> {
        let mut buf = [0u8; 12];
        buf[0] = 0x40;
        let n = encode_int_nocheck(&mut buf, stream_id, 6);
        self.io.write_decoder(&buf[..n])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::QpackError;
    use algorithm::buf::Bt;

    #[derive(Default)]
    struct TestIo {
        blocks: HashMap<u64, Vec<u8>>,
        wantread: HashMap<u64, bool>,
        done: Vec<(u64, HeaderSet)>,
        dec_stream: Vec<u8>,
    }

    impl DecodeIo for TestIo {
        fn read_block(&mut self, stream_id: u64, dst: &mut [u8]) -> QpackResult<usize> {
            let buf = match self.blocks.get_mut(&stream_id) {
                Some(v) => v,
                None => return Ok(0),
            };
            let n = min(dst.len(), buf.len());
            dst[..n].copy_from_slice(&buf[..n]);
            buf.drain(..n);
            Ok(n)
        }

        fn wantread_block(&mut self, stream_id: u64, on: bool) {
            self.wantread.insert(stream_id, on);
        }

        fn block_done(&mut self, stream_id: u64, headers: HeaderSet) {
            self.done.push((stream_id, headers));
        }

        fn write_decoder(&mut self, buf: &[u8]) -> QpackResult<()> {
            self.dec_stream.extend_from_slice(buf);
            Ok(())
        }
    }

    fn new_decoder(max_dyn: usize, risked: usize) -> Decoder<TestIo> {
        Decoder::new(max_dyn, risked, TestIo::default()).unwrap()
    }

    /// Insert-without-name-reference with plain strings.
    fn ins_lit(name: &[u8], value: &[u8]) -> Vec<u8> {
        let mut out = vec![0u8; 64];
        out[0] = 0x40;
        let mut n = encode_int_nocheck(&mut out, name.len() as u64, 5);
        out[n..n + name.len()].copy_from_slice(name);
        n += name.len();
        out[n] = 0;
        n += encode_int_nocheck(&mut out[n..], value.len() as u64, 7);
        out[n..n + value.len()].copy_from_slice(value);
        out.truncate(n + value.len());
        out
    }

    #[test]
    fn test_insert_without_nameref() {
        let mut dec = new_decoder(256, 1);
        dec.enc_stream_in(&ins_lit(b"x-foo", b"bar")).unwrap();
        assert_eq!(dec.ins_count(), 1);
        let entry = dec.table().get_abs(1).unwrap();
        assert_eq!(entry.name.chunk(), b"x-foo");
        assert_eq!(entry.value.chunk(), b"bar");
        // One insert acknowledged with table state synchronize.
        assert_eq!(dec.io().dec_stream, vec![0x01]);
    }

    #[test]
    fn test_insert_fragmented() {
        let mut dec = new_decoder(256, 1);
        let bytes = ins_lit(b"x-longer-name", b"some-longer-value");
        for b in bytes {
            dec.enc_stream_in(&[b]).unwrap();
        }
        assert_eq!(dec.ins_count(), 1);
        let entry = dec.table().get_abs(1).unwrap();
        assert_eq!(entry.name.chunk(), b"x-longer-name");
        assert_eq!(entry.value.chunk(), b"some-longer-value");
    }

    #[test]
    fn test_insert_with_static_nameref() {
        let mut dec = new_decoder(256, 1);
        // Name from static entry 1 (:authority), value "www".
        let mut buf = vec![0u8; 16];
        buf[0] = 0x80 | 0x40;
        let mut n = encode_int_nocheck(&mut buf, 1, 6);
        buf[n] = 0;
        n += encode_int_nocheck(&mut buf[n..], 3, 7);
        buf.truncate(n);
        buf.extend_from_slice(b"www");
        dec.enc_stream_in(&buf).unwrap();
        let entry = dec.table().get_abs(1).unwrap();
        assert_eq!(entry.name.chunk(), b":authority");
        assert_eq!(entry.value.chunk(), b"www");
    }

    #[test]
    fn test_duplicate() {
        let mut dec = new_decoder(256, 1);
        dec.enc_stream_in(&ins_lit(b"x-foo", b"bar")).unwrap();
        // Duplicate relative index 0 (the newest entry).
        dec.enc_stream_in(&[0x00]).unwrap();
        assert_eq!(dec.ins_count(), 2);
        let entry = dec.table().get_abs(2).unwrap();
        assert_eq!(entry.name.chunk(), b"x-foo");
        // A dangling duplicate index is fatal.
        let mut dec = new_decoder(256, 1);
        assert!(dec.enc_stream_in(&[0x05]).is_err());
    }

    #[test]
    fn test_size_update() {
        let mut dec = new_decoder(256, 1);
        dec.enc_stream_in(&ins_lit(b"x-foo", b"bar")).unwrap();
        // 001xxxxx with capacity 0 flushes the table.
        dec.enc_stream_in(&[0x20]).unwrap();
        assert_eq!(dec.table().len(), 0);
        assert_eq!(dec.table().cur_max_capacity(), 0);

        // Raising the capacity past the configured limit is fatal.
        let mut buf = vec![0u8; 16];
        buf[0] = 0x20;
        let n = encode_int_nocheck(&mut buf, 512, 5);
        assert_eq!(
            dec.enc_stream_in(&buf[..n]),
            Err(QpackError::Decoder(DecoderError::InvalidMaxDynamicSize))
        );
    }

    #[test]
    fn test_blocked_then_woken() {
        let mut dec = new_decoder(256, 1);
        // Prefix: required insert count 1, delta 1 negative; then
        // post-base index 1. The insert has not arrived yet.
        dec.io_mut().blocks.insert(4, vec![0x01, 0x81, 0x11]);
        dec.header_in(4, 3).unwrap();
        assert_eq!(dec.blocked_count(), 1);
        assert_eq!(dec.io().wantread.get(&4), Some(&false));
        assert!(dec.io().done.is_empty());

        dec.enc_stream_in(&ins_lit(b"x-foo", b"bar")).unwrap();
        assert_eq!(dec.blocked_count(), 0);
        assert_eq!(dec.io().wantread.get(&4), Some(&true));

        dec.header_read(4).unwrap();
        assert_eq!(dec.io().done.len(), 1);
        let (stream, headers) = &dec.io().done[0];
        assert_eq!(*stream, 4);
        assert_eq!(headers[0].name(), b"x-foo");
        assert_eq!(headers[0].value(), b"bar");
        // Synchronize for the insert, then the header ack for stream 4.
        assert_eq!(dec.io().dec_stream, vec![0x01, 0x84]);
    }

    #[test]
    fn test_too_many_blocked() {
        let mut dec = new_decoder(256, 0);
        dec.io_mut().blocks.insert(4, vec![0x01, 0x81, 0x11]);
        assert_eq!(
            dec.header_in(4, 3),
            Err(QpackError::Decoder(DecoderError::TooManyBlockedStreams))
        );
    }

    #[test]
    fn test_cancel_stream() {
        let mut dec = new_decoder(256, 1);
        dec.io_mut().blocks.insert(4, vec![0x01, 0x81, 0x11]);
        dec.header_in(4, 3).unwrap();
        assert_eq!(dec.blocked_count(), 1);
        dec.cancel_stream(4).unwrap();
        assert_eq!(dec.blocked_count(), 0);
        // Stream cancellation instruction on the decoder stream.
        assert_eq!(dec.io().dec_stream, vec![0x44]);
        // A later insert must not wake the cancelled stream.
        dec.enc_stream_in(&ins_lit(b"x-foo", b"bar")).unwrap();
        assert!(dec.io().done.is_empty());
    }

    #[test]
    fn test_reference_to_evicted_is_fatal() {
        let mut dec = new_decoder(40, 1);
        dec.enc_stream_in(&ins_lit(b"x-foo", b"ba1")).unwrap();
        dec.enc_stream_in(&ins_lit(b"x-foo", b"ba2")).unwrap();
        assert_eq!(dec.table().del_count(), 1);
        // Indexed dynamic with absolute id 1, which was evicted.
        dec.io_mut().blocks.insert(4, vec![0x02, 0x01, 0x81]);
        assert_eq!(
            dec.header_in(4, 3),
            Err(QpackError::Decoder(DecoderError::HeaderIndexOutOfBounds))
        );
    }

    #[test]
    fn test_truncated_block_is_fatal() {
        let mut dec = new_decoder(256, 1);
        // Literal header cut off in the middle of its name.
        dec.io_mut().blocks.insert(4, vec![0x00, 0x00, 0x23, b'x']);
        assert_eq!(
            dec.header_in(4, 4),
            Err(QpackError::Decoder(DecoderError::TruncatedBlock))
        );
    }
}
