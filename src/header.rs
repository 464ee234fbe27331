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
// Created Date: 2024/05/07 10:05:27

use std::fmt;

use algorithm::buf::{Binary, Bt};

bitflags! {
    /// Flags preserved on a decoded header.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct HeaderFlag: u8 {
        /// Intermediaries must reproduce this header as a literal and
        /// never index it.
        const NEVER_INDEX = 0x1;
    }
}

bitflags! {
    /// Per-call flags for `Encoder::encode`.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct EncodeFlag: u8 {
        /// Force a literal representation and mark it never-index.
        const NO_INDEX = 0x1;
    }
}

/// One decoded header. Name and value may share storage with the dynamic
/// table; the shared buffer keeps that storage alive even after the entry
/// is evicted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub name: Binary,
    pub value: Binary,
    pub flags: HeaderFlag,
}

impl Header {
    pub fn new(name: Binary, value: Binary, never_index: bool) -> Header {
        Header {
            name,
            value,
            flags: if never_index {
                HeaderFlag::NEVER_INDEX
            } else {
                HeaderFlag::empty()
            },
        }
    }

    pub fn name(&self) -> &[u8] {
        self.name.chunk()
    }

    pub fn value(&self) -> &[u8] {
        self.value.chunk()
    }

    pub fn is_never_index(&self) -> bool {
        self.flags.contains(HeaderFlag::NEVER_INDEX)
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}",
            String::from_utf8_lossy(self.name.chunk()),
            String::from_utf8_lossy(self.value.chunk())
        )
    }
}

/// The ordered result of decoding one header block.
pub type HeaderSet = Vec<Header>;
