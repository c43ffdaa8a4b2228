//! Minimal reader for the TLS presentation language (RFC 5246
//! section 4) as used by the RFC 6962 binary structures.

use thiserror::Error;

/// An error while decoding a TLS-encoded structure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The input ended before the structure was complete.
    #[error("truncated {0}: needed {1} more bytes")]
    Truncated(&'static str, usize),

    /// A field held a value the structure does not allow.
    #[error("unsupported {field} value {value}")]
    Unsupported { field: &'static str, value: u64 },

    /// Bytes remained after the outermost structure was decoded.
    #[error("{0} trailing bytes after structure")]
    TrailingBytes(usize),
}

/// A cursor over TLS-encoded bytes.
pub struct Reader<'a> {
    input: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self { input }
    }

    pub fn is_empty(&self) -> bool {
        self.input.is_empty()
    }

    /// Remaining unread bytes.
    pub fn remaining(&self) -> usize {
        self.input.len()
    }

    pub fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], DecodeError> {
        if self.input.len() < n {
            return Err(DecodeError::Truncated(what, n - self.input.len()));
        }
        let (head, tail) = self.input.split_at(n);
        self.input = tail;
        Ok(head)
    }

    pub fn u8(&mut self, what: &'static str) -> Result<u8, DecodeError> {
        Ok(self.take(1, what)?[0])
    }

    pub fn u16(&mut self, what: &'static str) -> Result<u16, DecodeError> {
        let bytes = self.take(2, what)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn u24(&mut self, what: &'static str) -> Result<u32, DecodeError> {
        let bytes = self.take(3, what)?;
        Ok(u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]))
    }

    pub fn u64(&mut self, what: &'static str) -> Result<u64, DecodeError> {
        let bytes: [u8; 8] = self.take(8, what)?.try_into().unwrap();
        Ok(u64::from_be_bytes(bytes))
    }

    /// An `opaque field<0..2^8-1>` vector.
    pub fn opaque_u8(&mut self, what: &'static str) -> Result<&'a [u8], DecodeError> {
        let len = self.u8(what)? as usize;
        self.take(len, what)
    }

    /// An `opaque field<0..2^16-1>` vector.
    pub fn opaque_u16(&mut self, what: &'static str) -> Result<&'a [u8], DecodeError> {
        let len = self.u16(what)? as usize;
        self.take(len, what)
    }

    /// An `opaque field<0..2^24-1>` vector.
    pub fn opaque_u24(&mut self, what: &'static str) -> Result<&'a [u8], DecodeError> {
        let len = self.u24(what)? as usize;
        self.take(len, what)
    }

    /// Asserts that the whole input was consumed.
    pub fn finish(self) -> Result<(), DecodeError> {
        if self.input.is_empty() {
            Ok(())
        } else {
            Err(DecodeError::TrailingBytes(self.input.len()))
        }
    }
}
