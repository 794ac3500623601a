use crate::error::{Error, Result};

/// Source of encoded items.
///
/// Mirrors [`Output`](crate::Output): parsers ask for a minimum number of
/// buffered bytes via [`require`](Input::require), inspect them, and then
/// [`consume`](Input::consume) what they decoded. Chunked implementations
/// may need to stitch bytes across chunk boundaries to satisfy a request.
pub trait Input {
    /// Ensures at least `n` readable bytes are buffered and returns the
    /// buffered window (which may be longer than `n`).
    fn require(&mut self, n: usize) -> Result<&[u8]>;

    /// Marks the first `n` buffered bytes as decoded.
    fn consume(&mut self, n: usize);

    /// Copies exactly `dst.len()` bytes out of the input.
    fn read_exact(&mut self, dst: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < dst.len() {
            let available = self.require(1)?;
            let take = available.len().min(dst.len() - filled);
            dst[filled..filled + take].copy_from_slice(&available[..take]);
            self.consume(take);
            filled += take;
        }
        Ok(())
    }
}

/// Input over an in-memory byte slice.
#[derive(Clone, Copy, Debug)]
pub struct SliceInput<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> SliceInput<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, position: 0 }
    }

    /// Number of bytes decoded so far.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Number of bytes left to decode.
    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.position
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }
}

impl Input for SliceInput<'_> {
    fn require(&mut self, n: usize) -> Result<&[u8]> {
        if self.remaining() < n {
            return Err(Error::MissingData);
        }
        Ok(&self.bytes[self.position..])
    }

    fn consume(&mut self, n: usize) {
        debug_assert!(self.position + n <= self.bytes.len());
        self.position += n;
    }

    fn read_exact(&mut self, dst: &mut [u8]) -> Result<()> {
        if self.remaining() < dst.len() {
            return Err(Error::MissingData);
        }
        dst.copy_from_slice(&self.bytes[self.position..self.position + dst.len()]);
        self.position += dst.len();
        Ok(())
    }
}
