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
// Created Date: 2024/05/07 09:12:40

use algorithm::buf::Binary;
use lazy_static::lazy_static;

pub const STATIC_TABLE_SIZE: usize = 61;

/// The fixed static table. Header names are ascii lower-case on the wire,
/// so lookups need no case folding.
static STATIC_TABLE: [(&str, &str); STATIC_TABLE_SIZE] = [
    (":authority", ""),
    (":method", "GET"),
    (":method", "POST"),
    (":path", "/"),
    (":path", "/index.html"),
    (":scheme", "http"),
    (":scheme", "https"),
    (":status", "200"),
    (":status", "204"),
    (":status", "206"),
    (":status", "304"),
    (":status", "400"),
    (":status", "404"),
    (":status", "500"),
    ("accept-charset", ""),
    ("accept-encoding", "gzip, deflate"),
    ("accept-language", ""),
    ("accept-ranges", ""),
    ("accept", ""),
    ("access-control-allow-origin", ""),
    ("age", ""),
    ("allow", ""),
    ("authorization", ""),
    ("cache-control", ""),
    ("content-disposition", ""),
    ("content-encoding", ""),
    ("content-language", ""),
    ("content-length", ""),
    ("content-location", ""),
    ("content-range", ""),
    ("content-type", ""),
    ("cookie", ""),
    ("date", ""),
    ("etag", ""),
    ("expect", ""),
    ("expires", ""),
    ("from", ""),
    ("host", ""),
    ("if-match", ""),
    ("if-modified-since", ""),
    ("if-none-match", ""),
    ("if-range", ""),
    ("if-unmodified-since", ""),
    ("last-modified", ""),
    ("link", ""),
    ("location", ""),
    ("max-forwards", ""),
    ("proxy-authenticate", ""),
    ("proxy-authorization", ""),
    ("range", ""),
    ("referer", ""),
    ("refresh", ""),
    ("retry-after", ""),
    ("server", ""),
    ("set-cookie", ""),
    ("strict-transport-security", ""),
    ("transfer-encoding", ""),
    ("user-agent", ""),
    ("vary", ""),
    ("via", ""),
    ("www-authenticate", ""),
];

/// Returns the entry for a 1-based static table id.
pub fn static_entry(id: u64) -> Option<(&'static str, &'static str)> {
    if id >= 1 && id <= STATIC_TABLE_SIZE as u64 {
        Some(STATIC_TABLE[id as usize - 1])
    } else {
        None
    }
}

lazy_static! {
    static ref STATIC_BINARY: Vec<(Binary, Binary)> = {
        let mut m = Vec::with_capacity(STATIC_TABLE_SIZE);
        for (name, value) in STATIC_TABLE.iter() {
            m.push((
                Binary::from(name.as_bytes().to_vec()),
                Binary::from(value.as_bytes().to_vec()),
            ));
        }
        m
    };
}

/// Shared-buffer view of a 1-based static entry, so decoded headers can
/// borrow static text without copying it per header.
pub(crate) fn static_binary(id: u64) -> Option<(Binary, Binary)> {
    if id >= 1 && id <= STATIC_TABLE_SIZE as u64 {
        let (name, value) = &STATIC_BINARY[id as usize - 1];
        Some((name.clone(), value.clone()))
    } else {
        None
    }
}

/// Candidate row for a full name+value match, keyed on the first byte of
/// the value.
fn value_candidate(value: &[u8]) -> Option<usize> {
    match value.first()? {
        b'G' => Some(1),
        b'P' => Some(2),
        b'/' => match value.len() {
            1 => Some(3),
            11 => Some(4),
            _ => None,
        },
        b'h' => match value.len() {
            4 => Some(5),
            5 => Some(6),
            _ => None,
        },
        b'2' if value.len() == 3 => match value[2] {
            b'0' => Some(7),
            b'4' => Some(8),
            b'6' => Some(9),
            _ => None,
        },
        b'3' => Some(10),
        b'4' if value.len() == 3 => match value[2] {
            b'0' => Some(11),
            b'4' => Some(12),
            _ => None,
        },
        b'5' => Some(13),
        b'g' => Some(15),
        _ => None,
    }
}

/// Candidate row for a name-only match, keyed on the first byte and the
/// length of the name.
fn name_candidate(name: &[u8]) -> Option<usize> {
    match name[0] {
        b':' => match name[1] {
            b'a' => Some(0),
            b'm' => Some(1),
            b'p' => Some(3),
            b's' => {
                if name[2] == b'c' {
                    Some(5)
                } else {
                    Some(7)
                }
            }
            _ => None,
        },
        b'a' => match name.len() {
            3 => Some(20),
            5 => Some(21),
            6 => Some(18),
            13 => {
                if name[1] == b'u' {
                    Some(22)
                } else {
                    Some(17)
                }
            }
            14 => Some(14),
            15 => {
                if name[7] == b'l' {
                    Some(16)
                } else {
                    Some(15)
                }
            }
            27 => Some(19),
            _ => None,
        },
        b'c' => match name.len() {
            6 => Some(31),
            12 => Some(30),
            13 => {
                if name[1] == b'a' {
                    Some(23)
                } else {
                    Some(29)
                }
            }
            14 => Some(27),
            16 => match name[9] {
                b'n' => Some(25),
                b'a' => Some(26),
                b'o' => Some(28),
                _ => None,
            },
            19 => Some(24),
            _ => None,
        },
        b'd' => Some(32),
        b'e' => match name.len() {
            4 => Some(33),
            6 => Some(34),
            7 => Some(35),
            _ => None,
        },
        b'f' => Some(36),
        b'h' => Some(37),
        b'i' => match name.len() {
            8 => {
                if name[3] == b'm' {
                    Some(38)
                } else {
                    Some(41)
                }
            }
            13 => Some(40),
            17 => Some(39),
            19 => Some(42),
            _ => None,
        },
        b'l' => match name.len() {
            4 => Some(44),
            8 => Some(45),
            13 => Some(43),
            _ => None,
        },
        b'm' => Some(46),
        b'p' => {
            if name.len() == 18 {
                Some(47)
            } else {
                Some(48)
            }
        }
        b'r' => {
            if name.len() >= 5 {
                match name[4] {
                    b'e' => {
                        if name.len() == 5 {
                            Some(49)
                        } else {
                            Some(51)
                        }
                    }
                    b'r' => Some(50),
                    b'y' => Some(52),
                    _ => None,
                }
            } else {
                None
            }
        }
        b's' => match name.len() {
            6 => Some(53),
            10 => Some(54),
            25 => Some(55),
            _ => None,
        },
        b't' => Some(56),
        b'u' => Some(57),
        b'v' => {
            if name.len() == 4 {
                Some(58)
            } else {
                Some(59)
            }
        }
        b'w' => Some(60),
        _ => None,
    }
}

/// Looks `(name, value)` up in the static table. Returns the 1-based id
/// and whether the value matched too, or `(0, false)` when neither a
/// name+value nor a name-only row matches.
pub fn find_static(name: &[u8], value: &[u8]) -> (u16, bool) {
    if name.len() < 3 {
        return (0, false);
    }

    if let Some(i) = value_candidate(value) {
        let (n, v) = STATIC_TABLE[i];
        if n.len() == name.len() && v.as_bytes() == value && n.as_bytes() == name {
            return (i as u16 + 1, true);
        }
    }

    if let Some(i) = name_candidate(name) {
        let (n, _) = STATIC_TABLE[i];
        if n.len() == name.len() && n.as_bytes() == name {
            return (i as u16 + 1, false);
        }
    }

    (0, false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_name_found() {
        // Several rows share a name; the lookup may return any row with
        // the right name when only the name matches.
        for (name, _) in STATIC_TABLE.iter() {
            let (id, matched) = find_static(name.as_bytes(), b"zzz-no-such-value");
            assert!(id > 0, "name {}", name);
            assert!(!matched);
            assert_eq!(STATIC_TABLE[id as usize - 1].0, *name);
        }
    }

    #[test]
    fn test_value_matches() {
        for (i, (name, value)) in STATIC_TABLE.iter().enumerate() {
            if value.is_empty() {
                continue;
            }
            let (id, matched) = find_static(name.as_bytes(), value.as_bytes());
            assert!(matched, "value {}", value);
            assert_eq!(id as usize, i + 1);
        }
    }

    #[test]
    fn test_misses() {
        assert_eq!(find_static(b"x-custom", b"zzz"), (0, false));
        assert_eq!(find_static(b"no", b""), (0, false));
        assert_eq!(find_static(b":status", b"201"), (7 + 1, false));
        assert_eq!(find_static(b"age", b"3600"), (20 + 1, false));
    }
}
