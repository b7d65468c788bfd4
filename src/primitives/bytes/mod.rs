#![forbid(unsafe_code)]
//! Order-preserving encoders, varints, and a checked reader shared by the
//! engine file formats and the index key encoding.

pub mod ord {
    //! Order-preserving encoders for numeric keys.

    use crate::types::{DuskError, Result};

    const SIGN_BIT: u64 = 1 << 63;

    /// Appends a big-endian u64 so byte order matches numeric order.
    pub fn push_u64(out: &mut Vec<u8>, v: u64) {
        out.extend_from_slice(&v.to_be_bytes());
    }

    /// Reads a big-endian u64 from the front of `src`.
    pub fn read_u64(src: &[u8]) -> Result<u64> {
        let head: [u8; 8] = src
            .get(..8)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| DuskError::Corruption("ordered u64 truncated".into()))?;
        Ok(u64::from_be_bytes(head))
    }

    /// Appends an i64 with the sign bit flipped so negatives sort first.
    pub fn push_i64(out: &mut Vec<u8>, v: i64) {
        push_u64(out, (v as u64) ^ SIGN_BIT);
    }

    /// Reads an i64 written by [`push_i64`].
    pub fn read_i64(src: &[u8]) -> Result<i64> {
        Ok((read_u64(src)? ^ SIGN_BIT) as i64)
    }

    /// Appends an f64 so that byte order matches numeric order (NaN sorts last).
    pub fn push_f64(out: &mut Vec<u8>, v: f64) {
        let bits = v.to_bits();
        let encoded = if v.is_nan() {
            u64::MAX
        } else if bits & SIGN_BIT != 0 {
            !bits
        } else {
            bits ^ SIGN_BIT
        };
        push_u64(out, encoded);
    }

    /// Reads an f64 written by [`push_f64`].
    pub fn read_f64(src: &[u8]) -> Result<f64> {
        let encoded = read_u64(src)?;
        if encoded == u64::MAX {
            return Ok(f64::NAN);
        }
        let bits = if encoded & SIGN_BIT != 0 {
            encoded ^ SIGN_BIT
        } else {
            !encoded
        };
        Ok(f64::from_bits(bits))
    }
}

pub mod var {
    //! Unsigned varints used by the checkpoint and journal formats.

    use crate::types::{DuskError, Result};

    /// Appends `v` as an unsigned LEB128 varint.
    pub fn encode_u64(mut v: u64, out: &mut Vec<u8>) {
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                out.push(byte);
                return;
            }
            out.push(byte | 0x80);
        }
    }

    /// Decodes a varint starting at `*off`, advancing the offset.
    pub fn decode_u64(src: &[u8], off: &mut usize) -> Result<u64> {
        let mut result = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = *src
                .get(*off)
                .ok_or_else(|| DuskError::Corruption("varint truncated".into()))?;
            *off += 1;
            let payload = u64::from(byte & 0x7f);
            if shift == 63 && payload > 1 {
                return Err(DuskError::Corruption("varint overflows u64".into()));
            }
            result |= payload << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
            if shift > 63 {
                return Err(DuskError::Corruption("varint too long".into()));
            }
        }
    }

    /// Appends a varint length followed by the bytes.
    pub fn encode_bytes(bytes: &[u8], out: &mut Vec<u8>) {
        encode_u64(bytes.len() as u64, out);
        out.extend_from_slice(bytes);
    }
}

pub mod buf {
    //! Slice reader that reports truncation as corruption instead of panicking.

    use super::var;
    use crate::types::{DuskError, Result};

    /// Forward-only reader over a byte slice.
    #[derive(Debug)]
    pub struct Reader<'a> {
        buf: &'a [u8],
        off: usize,
    }

    impl<'a> Reader<'a> {
        /// Reader positioned at the start of `buf`.
        pub fn new(buf: &'a [u8]) -> Self {
            Self { buf, off: 0 }
        }

        /// Takes the next `n` bytes.
        pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
            let end = self
                .off
                .checked_add(n)
                .filter(|end| *end <= self.buf.len())
                .ok_or_else(|| {
                    DuskError::Corruption(format!(
                        "read of {n} bytes past end (remaining {})",
                        self.remaining()
                    ))
                })?;
            let slice = &self.buf[self.off..end];
            self.off = end;
            Ok(slice)
        }

        /// Reads one byte.
        pub fn u8(&mut self) -> Result<u8> {
            Ok(self.take(1)?[0])
        }

        /// Reads an unsigned LEB128 varint.
        pub fn varint(&mut self) -> Result<u64> {
            var::decode_u64(self.buf, &mut self.off)
        }

        /// Reads a varint-length-prefixed byte string.
        pub fn bytes(&mut self) -> Result<&'a [u8]> {
            let len = self.varint()? as usize;
            self.take(len)
        }

        /// Reads a varint-length-prefixed UTF-8 string.
        pub fn string(&mut self) -> Result<String> {
            let raw = self.bytes()?;
            String::from_utf8(raw.to_vec())
                .map_err(|_| DuskError::Corruption("string is not valid UTF-8".into()))
        }

        /// Bytes left to read.
        pub fn remaining(&self) -> usize {
            self.buf.len().saturating_sub(self.off)
        }

        /// True when every byte was consumed.
        pub fn is_empty(&self) -> bool {
            self.remaining() == 0
        }
    }
}
