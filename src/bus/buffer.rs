use std::{
    fs::OpenOptions,
    path::{Path, PathBuf},
    ptr, slice,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
};

use dlog_codec::{self as codec, Input, SliceInput};
use fslock::LockFile;
use memmap2::MmapRaw;

use crate::{
    bus::{record_buffer::RecordBuffer, MessageBus},
    error::{Error, Result},
    source::LogRecordPort,
    types::{derive_span_id, Severity, SpanContext, SpanId, TraceId},
};

/// Byte the buffer is refilled with after a drain; decodes as a null item,
/// which is what stops the linear message scan.
const UNUSED_CONTENT: u8 = 0xf6;

/// Single-writer bump-allocated mapped buffer bus.
///
/// Messages are framed with a byte-string head carrying the payload
/// length and laid out back to back. There is no reclamation while
/// filling; the consumer drains the whole buffer linearly and resets the
/// write offset. Mostly useful for tests and strictly single-threaded
/// embeddings; the offsets are atomics only so the handle can be shared
/// behind the same port abstraction as the ring bus.
pub struct BufferBus {
    map: MmapRaw,
    #[allow(dead_code)]
    lock: LockFile,
    #[allow(dead_code)]
    file: std::fs::File,
    path: PathBuf,
    capacity: usize,
    write_offset: AtomicUsize,
    span_prng_ctr: AtomicU64,
}

// SAFETY: the write offset is only advanced through atomic reservation and
// the payload bytes behind a reservation belong to exactly one writer.
unsafe impl Send for BufferBus {}
unsafe impl Sync for BufferBus {}

impl BufferBus {
    /// Creates a fresh buffer bus file of `buffer_size` bytes.
    pub fn create(path: impl AsRef<Path>, buffer_size: usize) -> Result<Self> {
        if buffer_size == 0 {
            return Err(Error::InvalidArgument);
        }
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;

        let mut lock = LockFile::open(&path)?;
        if !lock.try_lock()? {
            return Err(Error::ContainerCouldNotBeLocked);
        }

        file.set_len(buffer_size as u64)?;
        let map = MmapRaw::map_raw(&file)?;
        // SAFETY: freshly mapped file, no other accessor yet.
        unsafe { ptr::write_bytes(map.as_mut_ptr(), UNUSED_CONTENT, buffer_size) };

        Ok(Self {
            map,
            lock,
            file,
            path,
            capacity: buffer_size,
            write_offset: AtomicUsize::new(0),
            span_prng_ctr: AtomicU64::new(0),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn unlink(self) -> Result<()> {
        std::fs::remove_file(&self.path).map_err(|_| Error::MessageBusUnlinkFailed)
    }

    /// Reserves `message_size` payload bytes behind a byte-string frame.
    pub fn allocate_record_buffer(
        &self,
        message_size: usize,
        _span_id: SpanId,
    ) -> Result<RecordBuffer<'_>> {
        let overhead = codec::posint_head_size(message_size as u64);
        let total = overhead + message_size;

        let offset = self
            .write_offset
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                (total <= self.capacity - current).then_some(current + total)
            })
            .map_err(|_| Error::NotEnoughSpace)?;

        // SAFETY: the fetch_update above reserved `[offset, offset+total)`.
        unsafe {
            let base = self.map.as_mut_ptr().add(offset);
            let mut framing = dlog_codec::SliceOutput::new(slice::from_raw_parts_mut(
                base, overhead,
            ));
            codec::emit_binary_head(&mut framing, message_size as u64)
                .map_err(|_| Error::Bad)?;
            Ok(RecordBuffer::for_area(base.add(overhead), message_size))
        }
    }

    pub fn create_span_context(
        &self,
        trace_id: TraceId,
        _name: &str,
        _threshold: &mut Severity,
    ) -> SpanContext {
        let trace_id = if trace_id.is_valid() {
            trace_id
        } else {
            TraceId::random()
        };
        let ctr = self.span_prng_ctr.fetch_add(1, Ordering::Relaxed);
        let (p0, p1) = trace_id.to_words();
        SpanContext {
            trace_id,
            span_id: derive_span_id(p0, p1, ctr),
        }
    }

    /// Parses the filled prefix message by message, feeding each payload
    /// to `consumer` as a single-element batch, then resets the buffer.
    ///
    /// A malformed frame ends the scan; whatever sits behind it in a
    /// corrupted buffer is unrecoverable anyway.
    pub fn consume_messages(&self, consumer: &mut dyn FnMut(&[&[u8]])) -> Result<()> {
        let filled = self.write_offset.load(Ordering::Relaxed);
        // SAFETY: `filled` bytes have been reserved; writers past the
        // reservation never touch the prefix.
        let content = unsafe { slice::from_raw_parts(self.map.as_ptr(), filled) };

        let mut input = SliceInput::new(content);
        while !input.is_empty() {
            let Ok(head) = codec::parse_item_head(&mut input) else {
                break;
            };
            if head.kind != codec::ItemKind::Binary
                || head.indefinite
                || (input.remaining() as u64) < head.value
            {
                break;
            }
            let start = input.position();
            let len = head.value as usize;
            consumer(&[&content[start..start + len]]);
            input.consume(len);
        }

        self.clear_content();
        Ok(())
    }

    fn clear_content(&self) {
        // SAFETY: the consumer owns the whole buffer during a drain.
        unsafe { ptr::write_bytes(self.map.as_mut_ptr(), UNUSED_CONTENT, self.capacity) };
        self.write_offset.store(0, Ordering::Relaxed);
    }
}

impl LogRecordPort for BufferBus {
    fn allocate_record_buffer(
        &self,
        message_size: usize,
        span_id: SpanId,
    ) -> Result<RecordBuffer<'_>> {
        BufferBus::allocate_record_buffer(self, message_size, span_id)
    }

    fn create_span_context(
        &self,
        trace_id: TraceId,
        name: &str,
        threshold: &mut Severity,
    ) -> SpanContext {
        BufferBus::create_span_context(self, trace_id, name, threshold)
    }
}

impl MessageBus for BufferBus {
    const CONSUME_BATCH_SIZE: usize = 1;

    fn consume_messages(&self, consumer: &mut dyn FnMut(&[&[u8]])) -> Result<()> {
        BufferBus::consume_messages(self, consumer)
    }
}

#[cfg(test)]
mod tests {
    use dlog_codec::Output;
    use temp_dir::TempDir;

    use super::*;

    #[test]
    fn fill_then_drain_round_trips() {
        let dir = TempDir::new().unwrap();
        let bus = BufferBus::create(dir.path().join("bus.dbufb"), 4096).unwrap();

        let mut pushed = 0u64;
        loop {
            let size = codec::posint_head_size(pushed);
            match bus.allocate_record_buffer(size, SpanId::invalid()) {
                Ok(mut buffer) => {
                    codec::emit_uint(&mut buffer, pushed).unwrap();
                    pushed += 1;
                }
                Err(Error::NotEnoughSpace) => break,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert!(pushed > 0);

        let mut drained = Vec::new();
        bus.consume_messages(&mut |msgs| {
            assert_eq!(msgs.len(), 1);
            let mut input = SliceInput::new(msgs[0]);
            drained.push(codec::parse_u64(&mut input).unwrap());
        })
        .unwrap();
        assert_eq!(drained, (0..pushed).collect::<Vec<_>>());

        // The buffer is reset and reusable after a drain.
        let mut buffer = bus.allocate_record_buffer(1, SpanId::invalid()).unwrap();
        buffer.write_all(&[0x07]).unwrap();
        drop(buffer);
        let mut count = 0;
        bus.consume_messages(&mut |_| count += 1).unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn rejects_when_full() {
        let dir = TempDir::new().unwrap();
        let bus = BufferBus::create(dir.path().join("bus.dbufb"), 64).unwrap();
        assert!(bus.allocate_record_buffer(128, SpanId::invalid()).is_err());
    }
}
