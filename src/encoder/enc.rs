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
// Created Date: 2024/05/08 09:21:34

use super::index::HeaderIndex;
use crate::huffman::encode_string;
use crate::integer::{encode_int, IntDecoder};
use crate::static_table::find_static;
use crate::{
    EncodeFlag, EncoderError, QpackResult, DYNAMIC_ENTRY_OVERHEAD, MAX_ABS_ID,
    MAX_DYN_TABLE_SIZE, MAX_MAX_RISKED_STREAMS, MAX_QUIC_STREAM_ID,
};

#[derive(Debug, Clone, Copy, PartialEq)]
enum TableType {
    Stat,
    Dyn,
}

#[derive(Debug, Clone, Copy)]
struct SearchResult {
    found: bool,
    table: TableType,
    entry_id: u64,
    value_match: bool,
}

impl SearchResult {
    fn miss() -> SearchResult {
        SearchResult {
            found: false,
            table: TableType::Stat,
            entry_id: 0,
            value_match: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum EncAction {
    None,
    InsNameRef,
    InsLit,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum HeaAction {
    IndexedNew,
    IndexedStat,
    IndexedDyn,
    LitWithNameStat,
    LitWithNameDyn,
    LitWithNameNew,
    Lit,
}

#[derive(Debug, Clone, Copy)]
struct EncodeProgram {
    enc: EncAction,
    hea: HeaAction,
    insert: bool,
    ref_found: bool,
    ref_new: bool,
}

/// Factors at play:
///
/// - Found or not found
/// - Table: static or dynamic
/// - Value matched or not
/// - Index: yes/no
/// - Risk blocking: yes/no
///
/// Effects: the encoder-stream instruction (if any), the header-block
/// representation, whether a new dynamic entry is inserted, and which
/// entries the header block ends up referencing.
fn encode_program(esr: &SearchResult, index: bool, risk: bool) -> EncodeProgram {
    let prog = |enc, hea, insert, ref_found, ref_new| EncodeProgram {
        enc,
        hea,
        insert,
        ref_found,
        ref_new,
    };
    match (esr.found, esr.table, esr.value_match, index, risk) {
        (false, _, _, false, _) => prog(EncAction::None, HeaAction::Lit, false, false, false),
        (false, _, _, true, false) => prog(EncAction::InsLit, HeaAction::Lit, true, false, false),
        (false, _, _, true, true) => {
            prog(EncAction::InsLit, HeaAction::IndexedNew, true, false, true)
        }
        (true, TableType::Stat, false, false, _) => {
            prog(EncAction::None, HeaAction::LitWithNameStat, false, false, false)
        }
        (true, TableType::Stat, false, true, false) => prog(
            EncAction::InsNameRef,
            HeaAction::LitWithNameStat,
            true,
            false,
            false,
        ),
        (true, TableType::Stat, false, true, true) => prog(
            EncAction::InsNameRef,
            HeaAction::IndexedNew,
            true,
            false,
            true,
        ),
        (true, TableType::Stat, true, _, _) => {
            prog(EncAction::None, HeaAction::IndexedStat, false, false, false)
        }
        (true, TableType::Dyn, false, false, _) => {
            prog(EncAction::None, HeaAction::LitWithNameDyn, false, true, false)
        }
        (true, TableType::Dyn, false, true, _) => prog(
            EncAction::InsNameRef,
            HeaAction::LitWithNameNew,
            true,
            true,
            true,
        ),
        (true, TableType::Dyn, true, _, _) => {
            prog(EncAction::None, HeaAction::IndexedDyn, false, true, false)
        }
    }
}

#[derive(Debug)]
struct HeaderInfo {
    stream_id: u64,
    seqno: u32,
    min_id: u64,
    max_id: u64,
    at_risk: bool,
    /// Absolute ids this block references, released on ack or cancel.
    refs: Vec<u64>,
}

#[derive(Debug)]
struct OpenHeader {
    hinfo: HeaderInfo,
    base_idx: u64,
    n_risked: usize,
    others_at_risk: bool,
    use_dynamic: bool,
    search_cutoff: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum DecOp {
    HeaderAck,
    TableSynch,
    StreamCancel,
}

#[derive(Debug, Default)]
struct DecStreamState {
    op: Option<(DecOp, u8)>,
    int: IntDecoder,
}

/// QPACK encoder: one per connection, fed headers block by block and the
/// peer's decoder stream as it arrives.
#[derive(Debug)]
pub struct Encoder {
    index: HeaderIndex,
    max_risked_streams: usize,
    cur_streams_at_risk: usize,
    /// Largest insertion the peer is known to have received.
    max_acked_id: u64,
    hinfos: Vec<HeaderInfo>,
    cur_header: Option<OpenHeader>,
    dec_stream: DecStreamState,
}

impl Encoder {
    pub fn new(max_dyn_size: usize, max_risked_streams: usize) -> QpackResult<Encoder> {
        if max_dyn_size > MAX_DYN_TABLE_SIZE || max_risked_streams > MAX_MAX_RISKED_STREAMS {
            return Err(EncoderError::InvalidLimit.into());
        }
        Ok(Encoder {
            index: HeaderIndex::new(max_dyn_size),
            max_risked_streams,
            cur_streams_at_risk: 0,
            max_acked_id: 0,
            hinfos: Vec::new(),
            cur_header: None,
            dec_stream: DecStreamState::default(),
        })
    }

    pub fn current_size(&self) -> usize {
        self.index.current_size()
    }

    pub fn max_capacity(&self) -> usize {
        self.index.max_capacity()
    }

    pub fn ins_count(&self) -> u64 {
        self.index.ins_count()
    }

    pub fn max_acked_id(&self) -> u64 {
        self.max_acked_id
    }

    pub fn streams_at_risk(&self) -> usize {
        self.cur_streams_at_risk
    }

    pub fn set_max_capacity(&mut self, max_capacity: usize) -> QpackResult<()> {
        if max_capacity > MAX_DYN_TABLE_SIZE {
            return Err(EncoderError::InvalidLimit.into());
        }
        self.index.set_max_capacity(max_capacity);
        Ok(())
    }

    /// Opens a header block for `(stream_id, seqno)`. Only one block may
    /// be open at a time.
    pub fn start_header(&mut self, stream_id: u64, seqno: u32) -> QpackResult<()> {
        if self.cur_header.is_some() {
            return Err(EncoderError::HeaderInProgress.into());
        }
        if stream_id > MAX_QUIC_STREAM_ID {
            return Err(EncoderError::InvalidStreamId.into());
        }
        let others_at_risk = seqno != 0
            && self
                .hinfos
                .iter()
                .any(|h| h.stream_id == stream_id && h.at_risk);
        self.cur_header = Some(OpenHeader {
            hinfo: HeaderInfo {
                stream_id,
                seqno,
                min_id: 0,
                max_id: 0,
                at_risk: false,
                refs: Vec::new(),
            },
            base_idx: self.index.ins_count(),
            n_risked: 0,
            others_at_risk,
            use_dynamic: self.index.max_capacity() > 0,
            search_cutoff: 0,
        });
        Ok(())
    }

    /// Encodes one header into the open block. Bytes for the encoder
    /// stream go to `enc_buf`, bytes for the header block to `hdr_buf`;
    /// the return value is `(enc_len, hdr_len)`. `NoEncBuf`/`NoHdrBuf`
    /// are transient: nothing was committed and the caller retries with a
    /// larger buffer.
    pub fn encode(
        &mut self,
        enc_buf: &mut [u8],
        hdr_buf: &mut [u8],
        name: &[u8],
        value: &[u8],
        flags: EncodeFlag,
    ) -> QpackResult<(usize, usize)> {
        let mut open = match self.cur_header.take() {
            Some(v) => v,
            None => return Err(EncoderError::NoHeaderInProgress.into()),
        };
        let ret = self.encode_one(&mut open, enc_buf, hdr_buf, name, value, flags);
        self.cur_header = Some(open);
        ret
    }

    fn encode_one(
        &mut self,
        open: &mut OpenHeader,
        enc_buf: &mut [u8],
        hdr_buf: &mut [u8],
        name: &[u8],
        value: &[u8],
        flags: EncodeFlag,
    ) -> QpackResult<(usize, usize)> {
        // Encoding always outputs at least one byte to the header block.
        if hdr_buf.is_empty() {
            return Err(EncoderError::NoHdrBuf.into());
        }
        let no_index = flags.contains(EncodeFlag::NO_INDEX);

        let mut index = !no_index
            && open.use_dynamic
            && self.index.ins_count() < MAX_ABS_ID;
        if index {
            let cost = DYNAMIC_ENTRY_OVERHEAD + name.len() + value.len();
            match self.index.can_evict_at_least(cost) {
                Some(cutoff) => {
                    if cutoff > open.search_cutoff {
                        open.search_cutoff = cutoff;
                    }
                }
                None => index = false,
            }
        }

        let risk = open.n_risked > 0
            || open.others_at_risk
            || self.cur_streams_at_risk < self.max_risked_streams;

        let esr = self.find_entry(open, risk, name, value);
        let prog = encode_program(&esr, index, risk);
        log::trace!(
            "qpack: encode {:?} found={} index={} risk={}",
            prog.hea,
            esr.found,
            index,
            risk
        );

        let enc_sz = match prog.enc {
            EncAction::InsNameRef => {
                if enc_buf.is_empty() {
                    return Err(EncoderError::NoEncBuf.into());
                }
                let id = match esr.table {
                    TableType::Stat => {
                        enc_buf[0] = 0x80 | 0x40;
                        esr.entry_id
                    }
                    TableType::Dyn => {
                        enc_buf[0] = 0x80;
                        self.index.ins_count() - esr.entry_id
                    }
                };
                let n = match encode_int(enc_buf, id, 6) {
                    Some(n) => n,
                    None => return Err(EncoderError::NoEncBuf.into()),
                };
                let m = match encode_string(&mut enc_buf[n..], 7, value) {
                    Some(m) => m,
                    None => return Err(EncoderError::NoEncBuf.into()),
                };
                n + m
            }
            EncAction::InsLit => {
                if enc_buf.is_empty() {
                    return Err(EncoderError::NoEncBuf.into());
                }
                enc_buf[0] = 0x40;
                let n = match encode_string(enc_buf, 5, name) {
                    Some(n) => n,
                    None => return Err(EncoderError::NoEncBuf.into()),
                };
                let m = match encode_string(&mut enc_buf[n..], 7, value) {
                    Some(m) => m,
                    None => return Err(EncoderError::NoEncBuf.into()),
                };
                n + m
            }
            EncAction::None => 0,
        };

        let hdr_sz = self.write_representation(open, &prog, &esr, hdr_buf, value, name, no_index)?;

        if prog.insert {
            let new_id = self.index.insert(name, value);
            if prog.ref_new {
                self.index.ref_entry(new_id);
                open.hinfo.refs.push(new_id);
                open.hinfo.max_id = new_id;
                if open.hinfo.min_id == 0 || open.hinfo.min_id > new_id {
                    open.hinfo.min_id = new_id;
                }
                open.n_risked += 1;
            }
        }
        if prog.ref_found {
            self.index.ref_entry(esr.entry_id);
            open.hinfo.refs.push(esr.entry_id);
            if self.max_acked_id < esr.entry_id {
                open.n_risked += 1;
            }
            if open.hinfo.min_id == 0 || open.hinfo.min_id > esr.entry_id {
                open.hinfo.min_id = esr.entry_id;
            }
            if open.hinfo.max_id < esr.entry_id {
                open.hinfo.max_id = esr.entry_id;
            }
        }

        Ok((enc_sz, hdr_sz))
    }

    fn write_representation(
        &self,
        open: &OpenHeader,
        prog: &EncodeProgram,
        esr: &SearchResult,
        hdr_buf: &mut [u8],
        value: &[u8],
        name: &[u8],
        no_index: bool,
    ) -> QpackResult<usize> {
        let nobuf = || crate::QpackError::Encoder(EncoderError::NoHdrBuf);
        match prog.hea {
            HeaAction::IndexedStat => {
                hdr_buf[0] = 0x80 | 0x40;
                encode_int(hdr_buf, esr.entry_id, 6).ok_or_else(nobuf)
            }
            HeaAction::IndexedNew | HeaAction::IndexedDyn => {
                let id = if prog.hea == HeaAction::IndexedNew {
                    self.index.ins_count() + 1
                } else {
                    esr.entry_id
                };
                if id > open.base_idx {
                    // Post-base index.
                    hdr_buf[0] = 0x10;
                    encode_int(hdr_buf, id - open.base_idx, 4).ok_or_else(nobuf)
                } else {
                    hdr_buf[0] = 0x80;
                    encode_int(hdr_buf, id, 6).ok_or_else(nobuf)
                }
            }
            HeaAction::Lit => {
                hdr_buf[0] = 0x20 | ((no_index as u8) << 4);
                let n = encode_string(hdr_buf, 3, name).ok_or_else(nobuf)?;
                let m = encode_string(&mut hdr_buf[n..], 7, value).ok_or_else(nobuf)?;
                Ok(n + m)
            }
            HeaAction::LitWithNameStat => {
                hdr_buf[0] = 0x40 | ((no_index as u8) << 5) | 0x10;
                let n = encode_int(hdr_buf, esr.entry_id, 4).ok_or_else(nobuf)?;
                let m = encode_string(&mut hdr_buf[n..], 7, value).ok_or_else(nobuf)?;
                Ok(n + m)
            }
            HeaAction::LitWithNameDyn | HeaAction::LitWithNameNew => {
                let id = if prog.hea == HeaAction::LitWithNameNew {
                    self.index.ins_count() + 1
                } else {
                    esr.entry_id
                };
                let n = if id > open.base_idx {
                    // Post-base name reference.
                    hdr_buf[0] = (no_index as u8) << 3;
                    encode_int(hdr_buf, id - open.base_idx - 1, 3).ok_or_else(nobuf)?
                } else {
                    hdr_buf[0] = 0x40 | ((no_index as u8) << 5);
                    encode_int(hdr_buf, open.base_idx - id, 4).ok_or_else(nobuf)?
                };
                let m = encode_string(&mut hdr_buf[n..], 7, value).ok_or_else(nobuf)?;
                Ok(n + m)
            }
        }
    }

    fn find_entry(&self, open: &OpenHeader, risk: bool, name: &[u8], value: &[u8]) -> SearchResult {
        let (static_id, val_matched) = find_static(name, value);
        if !open.use_dynamic {
            if static_id > 0 {
                return SearchResult {
                    found: true,
                    table: TableType::Stat,
                    entry_id: static_id as u64,
                    value_match: val_matched,
                };
            }
            return SearchResult::miss();
        }

        if static_id > 0 && val_matched {
            return SearchResult {
                found: true,
                table: TableType::Stat,
                entry_id: static_id as u64,
                value_match: true,
            };
        }

        let (name_hash, nameval_hash) = self.index.hash_pair(name, value);
        if let Some(id) = self.index.find_nameval(
            name,
            value,
            nameval_hash,
            risk,
            self.max_acked_id,
            open.search_cutoff,
        ) {
            return SearchResult {
                found: true,
                table: TableType::Dyn,
                entry_id: id,
                value_match: true,
            };
        }

        if static_id > 0 {
            return SearchResult {
                found: true,
                table: TableType::Stat,
                entry_id: static_id as u64,
                value_match: false,
            };
        }

        if let Some(id) =
            self.index
                .find_name(name, name_hash, risk, self.max_acked_id, open.search_cutoff)
        {
            return SearchResult {
                found: true,
                table: TableType::Dyn,
                entry_id: id,
                value_match: false,
            };
        }

        SearchResult::miss()
    }

    /// Closes the open block and writes its prefix: the required insert
    /// count with an 8-bit prefix, then the signed delta to the base with
    /// a 7-bit prefix. A block with no dynamic references is `00 00`.
    pub fn end_header(&mut self, buf: &mut [u8]) -> QpackResult<usize> {
        let open = match self.cur_header.take() {
            Some(v) => v,
            None => return Err(EncoderError::NoHeaderInProgress.into()),
        };
        match Self::write_prefix(&open, buf) {
            Ok(n) => {
                self.commit_header(open);
                Ok(n)
            }
            Err(e) => {
                self.cur_header = Some(open);
                Err(e)
            }
        }
    }

    fn write_prefix(open: &OpenHeader, buf: &mut [u8]) -> QpackResult<usize> {
        if open.hinfo.max_id > 0 {
            if buf.is_empty() {
                return Err(EncoderError::NoHdrBuf.into());
            }
            buf[0] = 0;
            let n = match encode_int(buf, open.hinfo.max_id, 8) {
                Some(n) => n,
                None => return Err(EncoderError::NoHdrBuf.into()),
            };
            if n >= buf.len() {
                return Err(EncoderError::NoHdrBuf.into());
            }
            let (sign, diff) = if open.base_idx >= open.hinfo.max_id {
                (0u8, open.base_idx - open.hinfo.max_id)
            } else {
                (0x80, open.hinfo.max_id - open.base_idx)
            };
            buf[n] = sign;
            let m = match encode_int(&mut buf[n..], diff, 7) {
                Some(m) => m,
                None => return Err(EncoderError::NoHdrBuf.into()),
            };
            Ok(n + m)
        } else {
            if buf.len() < 2 {
                return Err(EncoderError::NoHdrBuf.into());
            }
            buf[0] = 0;
            buf[1] = 0;
            Ok(2)
        }
    }

    fn commit_header(&mut self, open: OpenHeader) {
        let mut hinfo = open.hinfo;
        if hinfo.max_id > 0 {
            hinfo.at_risk = open.n_risked > 0;
            if hinfo.at_risk && !open.others_at_risk {
                self.cur_streams_at_risk += 1;
            }
            self.hinfos.push(hinfo);
        }
    }

    /// Consumes bytes from the peer's decoder stream: header acks, table
    /// state synchronize and stream cancellations, resuming mid-integer
    /// across packet boundaries.
    pub fn decoder_stream_in(&mut self, buf: &[u8]) -> QpackResult<()> {
        let mut src = buf;
        while !src.is_empty() {
            if self.dec_stream.op.is_none() {
                let b = src[0];
                let op = if b & 0x80 != 0 {
                    (DecOp::HeaderAck, 7)
                } else if b & 0x40 != 0 {
                    (DecOp::StreamCancel, 6)
                } else {
                    (DecOp::TableSynch, 6)
                };
                self.dec_stream.op = Some(op);
                self.dec_stream.int = IntDecoder::new();
            }
            let (op, prefix_bits) = match self.dec_stream.op {
                Some(v) => v,
                None => return Ok(()),
            };
            match self.dec_stream.int.decode(&mut src, prefix_bits)? {
                Some(value) => {
                    self.dec_stream.op = None;
                    match op {
                        DecOp::HeaderAck => self.proc_header_ack(value)?,
                        DecOp::TableSynch => self.proc_table_synch(value)?,
                        DecOp::StreamCancel => self.proc_stream_cancel(value)?,
                    }
                }
                None => return Ok(()),
            }
        }
        Ok(())
    }

    fn release_hinfo(&mut self, hinfo: &HeaderInfo) {
        for &id in hinfo.refs.iter() {
            self.index.unref_entry(id);
        }
    }

    fn settle_stream_risk(&mut self, stream_id: u64, was_at_risk: bool) {
        if was_at_risk
            && !self
                .hinfos
                .iter()
                .any(|h| h.stream_id == stream_id && h.at_risk)
        {
            self.cur_streams_at_risk = self.cur_streams_at_risk.saturating_sub(1);
        }
    }

    fn proc_header_ack(&mut self, stream_id: u64) -> QpackResult<()> {
        if stream_id > MAX_QUIC_STREAM_ID {
            return Err(EncoderError::InvalidStreamId.into());
        }
        let mut found: Option<usize> = None;
        for (i, h) in self.hinfos.iter().enumerate() {
            if h.stream_id == stream_id {
                match found {
                    Some(j) if self.hinfos[j].seqno <= h.seqno => {}
                    _ => found = Some(i),
                }
            }
        }
        let idx = match found {
            Some(v) => v,
            None => return Err(EncoderError::UnknownHeaderAck.into()),
        };
        let hinfo = self.hinfos.remove(idx);
        log::trace!(
            "qpack: header ack stream={} seqno={} max_id={}",
            hinfo.stream_id,
            hinfo.seqno,
            hinfo.max_id
        );
        self.release_hinfo(&hinfo);
        if hinfo.max_id > self.max_acked_id {
            self.max_acked_id = hinfo.max_id;
        }
        self.settle_stream_risk(stream_id, hinfo.at_risk);
        self.index.remove_overflow();
        Ok(())
    }

    fn proc_table_synch(&mut self, count: u64) -> QpackResult<()> {
        if count > MAX_ABS_ID {
            return Err(EncoderError::AckedUnknownInserts.into());
        }
        let new_acked = match self.max_acked_id.checked_add(count) {
            Some(v) => v,
            None => return Err(EncoderError::AckedUnknownInserts.into()),
        };
        if new_acked > self.index.ins_count() {
            return Err(EncoderError::AckedUnknownInserts.into());
        }
        self.max_acked_id = new_acked;
        Ok(())
    }

    fn proc_stream_cancel(&mut self, stream_id: u64) -> QpackResult<()> {
        if stream_id > MAX_QUIC_STREAM_ID {
            return Err(EncoderError::InvalidStreamId.into());
        }
        log::trace!("qpack: stream cancel {}", stream_id);
        let mut was_at_risk = false;
        let mut i = 0;
        while i < self.hinfos.len() {
            if self.hinfos[i].stream_id == stream_id {
                let hinfo = self.hinfos.remove(i);
                was_at_risk |= hinfo.at_risk;
                self.release_hinfo(&hinfo);
            } else {
                i += 1;
            }
        }
        self.settle_stream_risk(stream_id, was_at_risk);
        self.index.remove_overflow();
        Ok(())
    }
}
