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
// Created Date: 2024/05/06 11:22:31

use super::table::{DECODE_TABLES, FLAG_ACCEPTED, FLAG_FAIL, FLAG_SYM};
use crate::{HuffmanDecoderError, QpackResult};

/// Outcome of one `decode` call. Counts are what was consumed from `src`
/// and written to `dst` by this call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HuffDec {
    /// All of `src` consumed and the string may end here.
    Done { n_src: usize, n_dst: usize },
    /// `src` exhausted mid-symbol; feed more bytes later.
    EndSrc { n_src: usize, n_dst: usize },
    /// `dst` is full; grow it and call again with the unconsumed source.
    EndDst { n_src: usize, n_dst: usize },
}

/// Streaming Huffman decoder over the 4-bit-nibble DFA.
///
/// Resumable in both directions: across source chunks and across
/// destination buffers. A fresh value starts a new string.
#[derive(Debug, Default, Clone)]
pub struct HuffmanDecoder {
    state: u8,
    eos: bool,
    resume: u8,
}

impl HuffmanDecoder {
    pub fn new() -> HuffmanDecoder {
        HuffmanDecoder::default()
    }

    fn dec4(&mut self, nibble: u8, dst: &mut [u8], n_dst: &mut usize) -> QpackResult<()> {
        let el = DECODE_TABLES[self.state as usize][nibble as usize];
        if el.flags & FLAG_FAIL != 0 {
            return Err(HuffmanDecoderError::EOSInString.into());
        }
        if el.flags & FLAG_SYM != 0 {
            dst[*n_dst] = el.sym;
            *n_dst += 1;
        }
        self.state = el.state;
        self.eos = el.flags & FLAG_ACCEPTED != 0;
        Ok(())
    }

    /// Decodes `src` into `dst`. `fin` marks the last chunk of the encoded
    /// string; only then is the padding validated.
    pub fn decode(&mut self, src: &[u8], dst: &mut [u8], fin: bool) -> QpackResult<HuffDec> {
        let mut n_src = 0;
        let mut n_dst = 0;

        if self.resume == 0 {
            self.state = 0;
            self.eos = true;
        }
        // 2 and 3 mean the current byte was only partially processed when
        // the destination filled up: its high (2) or low (3) nibble is
        // still pending.
        let mut low_pending = self.resume == 3;
        self.resume = 1;

        while n_src < src.len() {
            let b = src[n_src];
            if !low_pending {
                if n_dst == dst.len() {
                    self.resume = 2;
                    return Ok(HuffDec::EndDst { n_src, n_dst });
                }
                self.dec4(b >> 4, dst, &mut n_dst)?;
            }
            if n_dst == dst.len() {
                self.resume = 3;
                return Ok(HuffDec::EndDst { n_src, n_dst });
            }
            self.dec4(b & 0x0f, dst, &mut n_dst)?;
            low_pending = false;
            n_src += 1;
        }

        if fin {
            if self.eos {
                Ok(HuffDec::Done { n_src, n_dst })
            } else {
                Err(HuffmanDecoderError::InvalidPadding.into())
            }
        } else {
            Ok(HuffDec::EndSrc { n_src, n_dst })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::huffman::encoder::{encode, encoded_len};
    use crate::QpackError;

    fn decode_all(src: &[u8]) -> QpackResult<Vec<u8>> {
        let mut dec = HuffmanDecoder::new();
        let mut out = vec![0u8; src.len() * 2 + 8];
        match dec.decode(src, &mut out, true)? {
            HuffDec::Done { n_dst, .. } => {
                out.truncate(n_dst);
                Ok(out)
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_roundtrip() {
        for s in [
            &b"www.example.com"[..],
            b"no-cache",
            b"",
            b"custom-key",
            b"gzip, deflate",
            b"Mon, 21 Oct 2013 20:13:21 GMT",
            &[0u8, 1, 2, 0xff, 0xfe, 0x80][..],
        ] {
            let mut enc = vec![0u8; encoded_len(s)];
            encode(s, &mut enc);
            assert_eq!(decode_all(&enc).unwrap(), s);
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let s = b"Mon, 21 Oct 2013 20:13:21 GMT";
        let mut enc = vec![0u8; encoded_len(s)];
        encode(s, &mut enc);

        let mut dec = HuffmanDecoder::new();
        let mut out = vec![0u8; 64];
        let mut written = 0;
        for (i, b) in enc.iter().enumerate() {
            let fin = i == enc.len() - 1;
            match dec.decode(std::slice::from_ref(b), &mut out[written..], fin).unwrap() {
                HuffDec::Done { n_dst, .. } | HuffDec::EndSrc { n_dst, .. } => written += n_dst,
                HuffDec::EndDst { .. } => panic!("buffer was large enough"),
            }
        }
        assert_eq!(&out[..written], s);
    }

    #[test]
    fn test_grow_destination() {
        let s = b"accept-encoding";
        let mut enc = vec![0u8; encoded_len(s)];
        encode(s, &mut enc);

        let mut dec = HuffmanDecoder::new();
        let mut out = vec![0u8; 2];
        let mut n_src_total = 0;
        let mut n_dst_total = 0;
        loop {
            match dec
                .decode(&enc[n_src_total..], &mut out[n_dst_total..], true)
                .unwrap()
            {
                HuffDec::Done { n_dst, .. } => {
                    n_dst_total += n_dst;
                    break;
                }
                HuffDec::EndDst { n_src, n_dst } => {
                    n_src_total += n_src;
                    n_dst_total += n_dst;
                    out.resize(out.len() * 2, 0);
                }
                HuffDec::EndSrc { .. } => panic!("src was complete"),
            }
        }
        assert_eq!(&out[..n_dst_total], s);
    }

    #[test]
    fn test_eos_in_string() {
        // Thirty-plus one bits: EOS followed by padding.
        let bad = [0xff, 0xff, 0xff, 0xff];
        assert_eq!(
            decode_all(&bad),
            Err(QpackError::Huffman(HuffmanDecoderError::EOSInString))
        );
    }

    #[test]
    fn test_bad_padding() {
        // '0' is five zero bits; zero padding is not an EOS prefix.
        let bad = [0x00];
        assert_eq!(
            decode_all(&bad),
            Err(QpackError::Huffman(HuffmanDecoderError::InvalidPadding))
        );
    }
}
