use crate::error::{Error, Result};

/// Destination for encoded items.
///
/// An output exposes a window of writable bytes. Emitters call
/// [`ensure_capacity`](Output::ensure_capacity) before writing into
/// [`writable`](Output::writable) and then [`commit`](Output::commit) the
/// bytes they produced. Implementations are free to satisfy a capacity
/// request by growing, by flushing buffered bytes downstream, or to refuse
/// it with [`Error::NotEnoughSpace`] when the backing store is fixed.
pub trait Output {
    /// Makes at least `n` contiguous writable bytes available.
    fn ensure_capacity(&mut self, n: usize) -> Result<()>;

    /// Currently writable window. Only valid up to the last capacity the
    /// output agreed to provide.
    fn writable(&mut self) -> &mut [u8];

    /// Marks the first `n` writable bytes as produced.
    fn commit(&mut self, n: usize);

    /// Copies `src` into the output, flushing or growing as necessary.
    fn write_all(&mut self, src: &[u8]) -> Result<()> {
        self.ensure_capacity(src.len())?;
        self.writable()[..src.len()].copy_from_slice(src);
        self.commit(src.len());
        Ok(())
    }

    /// Releases everything produced so far to the final destination.
    fn sync(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Growable output backed by a `Vec<u8>`.
#[derive(Debug, Default)]
pub struct VecOutput {
    bytes: Vec<u8>,
    written: usize,
}

impl VecOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: vec![0; capacity],
            written: 0,
        }
    }

    /// Bytes produced so far.
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.written]
    }

    pub fn into_bytes(mut self) -> Vec<u8> {
        self.bytes.truncate(self.written);
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.written
    }

    pub fn is_empty(&self) -> bool {
        self.written == 0
    }
}

impl Output for VecOutput {
    fn ensure_capacity(&mut self, n: usize) -> Result<()> {
        let needed = self.written.checked_add(n).ok_or(Error::NotEnoughMemory)?;
        if self.bytes.len() < needed {
            self.bytes.resize(needed, 0);
        }
        Ok(())
    }

    fn writable(&mut self) -> &mut [u8] {
        &mut self.bytes[self.written..]
    }

    fn commit(&mut self, n: usize) {
        debug_assert!(self.written + n <= self.bytes.len());
        self.written += n;
    }
}

/// Fixed-size output over a borrowed byte slice.
///
/// Capacity requests beyond the end of the slice fail with
/// [`Error::NotEnoughSpace`].
#[derive(Debug)]
pub struct SliceOutput<'a> {
    bytes: &'a mut [u8],
    written: usize,
}

impl<'a> SliceOutput<'a> {
    pub fn new(bytes: &'a mut [u8]) -> Self {
        Self { bytes, written: 0 }
    }

    pub fn written(&self) -> usize {
        self.written
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.written
    }
}

impl Output for SliceOutput<'_> {
    fn ensure_capacity(&mut self, n: usize) -> Result<()> {
        if self.remaining() < n {
            return Err(Error::NotEnoughSpace);
        }
        Ok(())
    }

    fn writable(&mut self) -> &mut [u8] {
        &mut self.bytes[self.written..]
    }

    fn commit(&mut self, n: usize) {
        debug_assert!(self.written + n <= self.bytes.len());
        self.written += n;
    }
}
