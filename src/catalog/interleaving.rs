//! Interleaving double-buffered stream over a single catalog file.
//!
//! Two independent snapshot streams, A (even revisions) and B (odd
//! revisions), share one file. Each stream is a chain of blocks whose
//! sizes grow exponentially up to 16 pages; the blocks of both streams
//! interleave at fixed offsets behind the 8 KiB head area, so either
//! stream can be rewritten in full without disturbing the other.

use std::{
    fs::File,
    io::{Read, Seek, SeekFrom, Write},
};

use dlog_codec::{self as codec, Input};

pub(crate) const PAGE_SIZE: u64 = 4096;

/// Size in bytes of block `index` of either stream.
pub(crate) fn block_size(index: u32) -> u64 {
    (if index < 5 { 1u64 << index } else { 16 }) * PAGE_SIZE
}

/// Absolute file offset of block `index` of the selected stream.
pub(crate) fn block_offset(index: u32, odd: bool) -> u64 {
    let odd_bit = u64::from(odd);
    let pages = if index < 5 {
        (2 | odd_bit) << index
    } else {
        32 * (u64::from(index) - 3) + (odd_bit << 4)
    };
    pages * PAGE_SIZE
}

/// Chunked input over one stream of the catalog file.
///
/// Blocks are read lazily; a request that would cross into a block the
/// file does not contain fails with `EndOfStream`. Item heads that
/// straddle a block boundary are stitched in the carry buffer.
pub(crate) struct InterleavingInput<'a> {
    file: &'a File,
    odd: bool,
    next_index: u32,
    buffer: Vec<u8>,
    consumed: usize,
}

impl<'a> InterleavingInput<'a> {
    pub(crate) fn new(file: &'a File, odd: bool) -> Self {
        Self {
            file,
            odd,
            next_index: 0,
            buffer: Vec::new(),
            consumed: 0,
        }
    }

    fn buffered(&self) -> usize {
        self.buffer.len() - self.consumed
    }

    fn fetch_next_block(&mut self) -> codec::Result<()> {
        let offset = block_offset(self.next_index, self.odd);
        let len = block_size(self.next_index) as usize;

        if self.consumed > 0 {
            self.buffer.drain(..self.consumed);
            self.consumed = 0;
        }
        let tail = self.buffer.len();
        self.buffer.resize(tail + len, 0);

        let mut file = self.file;
        file.seek(SeekFrom::Start(offset))?;
        if file.read_exact(&mut self.buffer[tail..]).is_err() {
            return Err(codec::Error::EndOfStream);
        }
        self.next_index += 1;
        Ok(())
    }
}

impl Input for InterleavingInput<'_> {
    fn require(&mut self, n: usize) -> codec::Result<&[u8]> {
        while self.buffered() < n {
            self.fetch_next_block()?;
        }
        Ok(&self.buffer[self.consumed..])
    }

    fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.buffered());
        self.consumed += n;
    }
}

/// Writes `payload` as the selected stream, block by block, zero-padding
/// the final block.
pub(crate) fn write_stream(file: &File, odd: bool, payload: &[u8]) -> std::io::Result<()> {
    let mut file = file;
    let mut remaining = payload;
    let mut index = 0u32;
    loop {
        let len = block_size(index) as usize;
        let take = remaining.len().min(len);
        let mut block = vec![0u8; len];
        block[..take].copy_from_slice(&remaining[..take]);
        remaining = &remaining[take..];

        file.seek(SeekFrom::Start(block_offset(index, odd)))?;
        file.write_all(&block)?;

        if remaining.is_empty() {
            return Ok(());
        }
        index += 1;
    }
}
