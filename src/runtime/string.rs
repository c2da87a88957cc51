//! String objects.
//!
//! Short strings live in an inline buffer, longer ones on the heap. The hash
//! code is computed on demand and cached; from then on the string is frozen
//! because hash tables may hold it as a key.
use std::io::Cursor;

/// Strings up to this many bytes need no separate buffer.
pub const INLINE_LEN: usize = 15;

enum StrData {
    Inline { len: u8, buf: [u8; INLINE_LEN] },
    Heap(Vec<u8>),
}

pub struct StrObj {
    data: StrData,
    hash: Option<u32>,
    interned: bool,
}

impl StrObj {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let data = if bytes.len() <= INLINE_LEN {
            let mut buf = [0u8; INLINE_LEN];
            buf[..bytes.len()].copy_from_slice(bytes);
            StrData::Inline {
                len: bytes.len() as u8,
                buf,
            }
        } else {
            StrData::Heap(bytes.to_vec())
        };
        Self {
            data,
            hash: None,
            interned: false,
        }
    }

    pub(crate) fn interned(bytes: &[u8]) -> Self {
        let mut s = Self::from_bytes(bytes);
        s.interned = true;
        s.hash_code();
        s
    }

    pub fn as_bytes(&self) -> &[u8] {
        match &self.data {
            StrData::Inline { len, buf } => &buf[..*len as usize],
            StrData::Heap(v) => v,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_interned(&self) -> bool {
        self.interned
    }

    pub fn is_hashed(&self) -> bool {
        self.hash.is_some()
    }

    pub fn hash_code(&mut self) -> u32 {
        match self.hash {
            Some(h) => h,
            None => {
                let h = hash_bytes(self.as_bytes());
                self.hash = Some(h);
                h
            }
        }
    }

    /// Overwrites one byte. Fails once the string has been hashed.
    pub fn set_byte(&mut self, at: usize, byte: u8) -> Result<(), &'static str> {
        if self.hash.is_some() {
            return Err("cannot change immutable string");
        }
        let slot = match &mut self.data {
            StrData::Inline { len, buf } => buf[..*len as usize].get_mut(at),
            StrData::Heap(v) => v.get_mut(at),
        };
        match slot {
            Some(b) => {
                *b = byte;
                Ok(())
            }
            None => Err("string index out of bounds"),
        }
    }

    #[cfg(test)]
    fn heap_bytes(&self) -> usize {
        match &self.data {
            StrData::Inline { .. } => 0,
            StrData::Heap(v) => v.capacity(),
        }
    }
}

pub fn hash_bytes(bytes: &[u8]) -> u32 {
    // Reading from an in-memory cursor cannot fail.
    murmur3::murmur3_32(&mut Cursor::new(bytes), 0).unwrap_or(0)
}

pub fn hash_number(n: f64) -> u32 {
    let n = if n == 0.0 { 0.0 } else { n };
    hash_bytes(&n.to_bits().to_le_bytes())
}

/// Parses the numeric syntax accepted in numeric context: optional sign,
/// decimal digits with optional fraction and exponent, or a `0x` hex literal.
pub fn parse_num(bytes: &[u8]) -> Option<f64> {
    let (neg, body) = match bytes.first() {
        Some(b'-') => (true, &bytes[1..]),
        Some(b'+') => (false, &bytes[1..]),
        _ => (false, bytes),
    };
    if body.is_empty() {
        return None;
    }

    let value = if body.len() > 2 && body[0] == b'0' && (body[1] == b'x' || body[1] == b'X') {
        let mut v = 0f64;
        for &c in &body[2..] {
            v = v * 16.0 + (c as char).to_digit(16)? as f64;
        }
        v
    } else {
        let mut i = 0;
        let digits = |i: &mut usize| {
            let start = *i;
            while *i < body.len() && body[*i].is_ascii_digit() {
                *i += 1;
            }
            *i - start
        };
        let mut mantissa = digits(&mut i);
        if i < body.len() && body[i] == b'.' {
            i += 1;
            mantissa += digits(&mut i);
        }
        if mantissa == 0 {
            return None;
        }
        if i < body.len() && (body[i] == b'e' || body[i] == b'E') {
            i += 1;
            if i < body.len() && (body[i] == b'-' || body[i] == b'+') {
                i += 1;
            }
            if digits(&mut i) == 0 {
                return None;
            }
        }
        if i != body.len() {
            return None;
        }
        std::str::from_utf8(body).ok()?.parse::<f64>().ok()?
    };

    Some(if neg { -value } else { value })
}

pub fn format_num(n: f64) -> String {
    if n.is_nan() {
        "nan".to_owned()
    } else if n.is_infinite() {
        if n > 0.0 { "inf" } else { "-inf" }.to_owned()
    } else {
        format!("{}", n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_and_heap_strings() {
        let short = StrObj::from_bytes(b"hello");
        assert_eq!(short.as_bytes(), b"hello");
        assert_eq!(short.heap_bytes(), 0);

        let long = StrObj::from_bytes(b"a considerably longer string");
        assert_eq!(long.len(), 28);
        assert!(long.heap_bytes() >= 28);
    }

    #[test]
    fn hashing_freezes_the_string() {
        let mut s = StrObj::from_bytes(b"abc");
        s.set_byte(0, b'x').unwrap();
        assert_eq!(s.as_bytes(), b"xbc");
        let h = s.hash_code();
        assert_eq!(h, hash_bytes(b"xbc"));
        assert!(s.set_byte(0, b'y').is_err());
        assert!(StrObj::from_bytes(b"ab").set_byte(5, 0).is_err());
    }

    #[test]
    fn numeric_strings() {
        assert_eq!(parse_num(b"10"), Some(10.0));
        assert_eq!(parse_num(b"-2.5e2"), Some(-250.0));
        assert_eq!(parse_num(b"0x1f"), Some(31.0));
        assert_eq!(parse_num(b".5"), Some(0.5));
        assert_eq!(parse_num(b""), None);
        assert_eq!(parse_num(b"1e"), None);
        assert_eq!(parse_num(b"12abc"), None);
        assert_eq!(parse_num(b"inf"), None);
        assert_eq!(parse_num(b" 1"), None);
    }

    #[test]
    fn number_formatting() {
        assert_eq!(format_num(3.0), "3");
        assert_eq!(format_num(-0.25), "-0.25");
        assert_eq!(format_num(f64::INFINITY), "inf");
        assert_eq!(hash_number(0.0), hash_number(-0.0));
    }
}
