use std::{
    alloc::{alloc, dealloc, Layout},
    fs::{File, OpenOptions},
    io::Write,
    path::PathBuf,
    ptr::NonNull,
    slice,
};

use bytes::Bytes;
use dlog_codec::{self as codec, Encode, Output, VecOutput};
use fslock::LockFile;
use tracing::debug;

use crate::{
    catalog::{FileDatabase, FileSinkId},
    clock::{EpochInfo, LogClock},
    error::{Error, Result},
    sinks::SinkBackend,
    source::LogArg,
    types::ResourceId,
};

/// File extension of a record container file.
pub const CONTAINER_FILE_EXTENSION: &str = "dlog";

/// Magic prefix of a record container file.
pub const CONTAINER_MAGIC: [u8; 16] = [
    0x83, 0x4e, 0x0d, 0x0a, 0xab, 0x7e, 0x7b, 0x64, 0x6c, 0x6f, 0x67, 0x7d, 0x7e, 0xbb, 0x0a,
    0x1a,
];

/// Container header map keys.
const VERSION_KEY: u64 = 0;
const EPOCH_KEY: u64 = 4;
const ATTRIBUTES_KEY: u64 = 23;
const CONTAINER_VERSION: u64 = 0;

const DEFAULT_TARGET_BUFFER_SIZE: usize = 64 * 1024;
const BUFFER_ALIGNMENT: usize = 4096;

/// Pre-serialized attribute map embedded into every container header.
#[derive(Clone, Debug, Default)]
pub struct CborAttributeMap {
    serialized: Bytes,
}

impl CborAttributeMap {
    /// Serializes `attributes` into the header map form.
    pub fn from_attributes(attributes: &[(ResourceId, LogArg<'_>)]) -> Result<Self> {
        let mut out = VecOutput::new();
        codec::emit_map(&mut out, attributes.len() as u64)?;
        for (id, value) in attributes {
            id.encode(&mut out)?;
            value.encode_raw(&mut out)?;
        }
        Ok(Self {
            serialized: Bytes::from(out.into_bytes()),
        })
    }

    /// The serialized map item; empty when no attributes were given.
    pub fn bytes(&self) -> &[u8] {
        &self.serialized
    }
}

/// Page-aligned heap buffer for the double-buffered file writer.
struct PageBuffer {
    ptr: NonNull<u8>,
    capacity: usize,
}

impl PageBuffer {
    fn allocate(capacity: usize) -> Result<Self> {
        let layout = Layout::from_size_align(capacity, BUFFER_ALIGNMENT)
            .map_err(|_| Error::InvalidArgument)?;
        // SAFETY: the layout has non-zero size; callers never request 0.
        let raw = unsafe { alloc(layout) };
        let ptr = NonNull::new(raw).ok_or(Error::NotEnoughMemory)?;
        Ok(Self { ptr, capacity })
    }

    fn as_slice(&self, len: usize) -> &[u8] {
        debug_assert!(len <= self.capacity);
        // SAFETY: allocation is live and `len` within capacity.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), len) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: exclusive access through `&mut self`.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.capacity) }
    }
}

impl Drop for PageBuffer {
    fn drop(&mut self) {
        // SAFETY: same layout as at allocation time.
        unsafe {
            dealloc(
                self.ptr.as_ptr(),
                Layout::from_size_align_unchecked(self.capacity, BUFFER_ALIGNMENT),
            );
        }
    }
}

// SAFETY: the buffer is plain owned memory.
unsafe impl Send for PageBuffer {}

/// Double-buffered page-aligned writer producing record container files.
///
/// Encoded records accumulate in the in-memory buffer and are flushed to
/// the backing file when the buffer runs full, when a large write bypasses
/// it, or on sync. The container framing (magic, header map, indefinite
/// record array, final break byte) is emitted through the same buffer.
struct ContainerWriter {
    file: Option<File>,
    buffer: PageBuffer,
    used: usize,
    target_buffer_size: usize,
    attributes: CborAttributeMap,
}

impl ContainerWriter {
    fn new(target_buffer_size: usize, attributes: CborAttributeMap) -> Result<Self> {
        let target = if target_buffer_size == 0 {
            DEFAULT_TARGET_BUFFER_SIZE
        } else {
            target_buffer_size
        };
        Ok(Self {
            file: None,
            buffer: PageBuffer::allocate(target)?,
            used: 0,
            target_buffer_size: target,
            attributes,
        })
    }

    fn file(&self) -> Result<&File> {
        self.file.as_ref().ok_or(Error::Bad)
    }

    fn file_len(&self) -> Result<u64> {
        Ok(self.file()?.metadata()?.len())
    }

    fn remaining(&self) -> usize {
        self.buffer.capacity - self.used
    }

    fn flush(&mut self) -> Result<()> {
        if self.used > 0 {
            let mut file = self.file()?;
            file.write_all(self.buffer.as_slice(self.used))?;
            self.used = 0;
        }
        Ok(())
    }

    /// Flushes and restores the buffer to its target size.
    fn flush_restore(&mut self) -> Result<()> {
        self.flush()?;
        if self.buffer.capacity != self.target_buffer_size {
            self.buffer = PageBuffer::allocate(self.target_buffer_size)?;
        }
        Ok(())
    }

    /// Starts a fresh container in `file`: magic, header map, and the
    /// indefinite record array opener.
    fn begin_container(&mut self, file: File, epoch: EpochInfo) -> Result<()> {
        debug_assert!(self.file.is_none());
        debug_assert_eq!(self.used, 0);
        self.file = Some(file);

        self.write_all(&CONTAINER_MAGIC)?;
        codec::emit_map(self, 3)?;
        codec::emit_uint(self, VERSION_KEY)?;
        codec::emit_uint(self, CONTAINER_VERSION)?;
        codec::emit_uint(self, EPOCH_KEY)?;
        epoch.encode(self)?;
        codec::emit_uint(self, ATTRIBUTES_KEY)?;
        if self.attributes.bytes().is_empty() {
            codec::emit_map(self, 0)?;
        } else {
            let bytes = self.attributes.serialized.clone();
            self.write_all(&bytes)?;
        }
        codec::emit_array_indefinite(self)?;

        self.flush()?;
        Ok(())
    }

    /// Terminates the record array, flushes, and closes the file.
    ///
    /// Returns the final file size, or zero if no file was attached.
    fn finalize_file(&mut self) -> Result<u64> {
        if self.file.is_none() {
            return Ok(0);
        }
        codec::emit_break(self)?;
        self.flush()?;
        let len = self.file_len()?;
        self.file = None;
        Ok(len)
    }

    fn grow(&mut self, requested: usize) -> Result<()> {
        self.flush()?;
        if self.buffer.capacity < requested {
            self.buffer = PageBuffer::allocate(requested.next_multiple_of(BUFFER_ALIGNMENT))?;
        }
        Ok(())
    }

    fn write_all(&mut self, src: &[u8]) -> Result<()> {
        if self.remaining() >= src.len() {
            self.buffer.as_mut_slice()[self.used..self.used + src.len()].copy_from_slice(src);
            self.used += src.len();
            return Ok(());
        }

        if src.len() < self.buffer.capacity / 2 {
            // Small overflow: cycle the buffer and keep coalescing.
            self.flush()?;
            self.buffer.as_mut_slice()[..src.len()].copy_from_slice(src);
            self.used = src.len();
            return Ok(());
        }

        // Large write: push the buffered bytes and the source directly.
        self.flush()?;
        let mut file = self.file()?;
        file.write_all(src)?;
        Ok(())
    }
}

fn as_codec_error(error: Error) -> codec::Error {
    match error {
        Error::Io { source } => codec::Error::Io { source },
        _ => codec::Error::NotEnoughSpace,
    }
}

impl Output for ContainerWriter {
    fn ensure_capacity(&mut self, n: usize) -> codec::Result<()> {
        if self.remaining() < n {
            self.grow(n).map_err(as_codec_error)?;
        }
        Ok(())
    }

    fn writable(&mut self) -> &mut [u8] {
        let used = self.used;
        &mut self.buffer.as_mut_slice()[used..]
    }

    fn commit(&mut self, n: usize) {
        debug_assert!(n <= self.remaining());
        self.used += n;
    }

    fn write_all(&mut self, src: &[u8]) -> codec::Result<()> {
        ContainerWriter::write_all(self, src).map_err(as_codec_error)
    }
}

/// Configuration for a plain single-file sink backend.
pub struct FileSinkConfig {
    pub path: PathBuf,
    pub target_buffer_size: usize,
    pub attributes: CborAttributeMap,
}

/// Record container sink writing to one fixed file.
pub struct FileSinkBackend {
    writer: ContainerWriter,
    lock: Option<LockFile>,
}

impl FileSinkBackend {
    /// Creates the container file and writes its header.
    pub fn create(config: FileSinkConfig) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create_new(true)
            .open(&config.path)?;

        let mut lock = LockFile::open(&config.path)?;
        if !lock.try_lock()? {
            return Err(Error::ContainerCouldNotBeLocked);
        }

        let mut writer = ContainerWriter::new(config.target_buffer_size, config.attributes)?;
        writer.begin_container(file, LogClock::epoch())?;

        Ok(Self {
            writer,
            lock: Some(lock),
        })
    }
}

impl SinkBackend for FileSinkBackend {
    fn bulk_write(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes)
    }

    fn sync_output(&mut self) -> Result<()> {
        self.writer.flush_restore()
    }

    fn finalize(&mut self) -> Result<u64> {
        let len = self.writer.finalize_file()?;
        self.lock = None;
        Ok(len)
    }
}

impl Drop for FileSinkBackend {
    fn drop(&mut self) {
        let _ = self.writer.finalize_file();
    }
}

/// Configuration for a catalog-tracked rotating file sink backend.
pub struct DbFileSinkConfig {
    pub database: FileDatabase,
    pub file_name_pattern: String,
    pub sink_id: FileSinkId,
    pub max_file_size: u64,
    pub target_buffer_size: usize,
    pub attributes: CborAttributeMap,
}

/// Rotating record container sink whose files live in a [`FileDatabase`].
///
/// A new container is requested from the catalog whenever the current one
/// outgrows `max_file_size` or the clock epoch was re-synchronized; the
/// finished file's byte size is written back to its catalog entry.
pub struct DbFileSinkBackend {
    writer: ContainerWriter,
    lock: Option<LockFile>,
    database: FileDatabase,
    file_name_pattern: String,
    sink_id: FileSinkId,
    max_file_size: u64,
    rotation: u32,
    file_epoch: EpochInfo,
}

impl DbFileSinkBackend {
    pub fn new(config: DbFileSinkConfig) -> Result<Self> {
        if config.file_name_pattern.is_empty() {
            return Err(Error::InvalidArgument);
        }
        let writer = ContainerWriter::new(config.target_buffer_size, config.attributes)?;
        let mut backend = Self {
            writer,
            lock: None,
            database: config.database,
            file_name_pattern: config.file_name_pattern,
            sink_id: config.sink_id,
            max_file_size: config.max_file_size,
            rotation: 0,
            file_epoch: EpochInfo::default(),
        };
        backend.open_next_container()?;
        Ok(backend)
    }

    pub fn sink_id(&self) -> FileSinkId {
        self.sink_id
    }

    pub fn current_rotation(&self) -> u32 {
        self.rotation
    }

    fn open_next_container(&mut self) -> Result<()> {
        let created = self
            .database
            .create_record_container(&self.file_name_pattern, self.sink_id)?;

        let mut lock = LockFile::open(&created.path)?;
        if !lock.try_lock()? {
            return Err(Error::ContainerCouldNotBeLocked);
        }

        self.file_epoch = LogClock::epoch();
        self.rotation = created.rotation;
        self.writer.begin_container(created.file, self.file_epoch)?;
        self.lock = Some(lock);
        Ok(())
    }

    /// Closes the current container and records its final size.
    fn retire_current_container(&mut self) -> Result<u64> {
        let rotation = self.rotation;
        self.rotation = 0;
        let len = self.writer.finalize_file()?;
        self.lock = None;
        if rotation != 0 {
            let _ = self
                .database
                .update_record_container_size(self.sink_id, rotation, len as u32);
        }
        Ok(len)
    }

    fn maybe_rotate(&mut self) -> Result<()> {
        if self.rotation == 0 {
            return Ok(());
        }
        let len = self.writer.file_len()?;
        if len <= self.max_file_size && LogClock::epoch() == self.file_epoch {
            return Ok(());
        }

        debug!(
            sink_id = self.sink_id.0,
            rotation = self.rotation,
            byte_size = len,
            "Rotating record container."
        );
        self.retire_current_container()?;
        self.open_next_container()
    }
}

impl SinkBackend for DbFileSinkBackend {
    fn bulk_write(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes)
    }

    fn sync_output(&mut self) -> Result<()> {
        self.writer.flush_restore()?;
        self.maybe_rotate()
    }

    fn finalize(&mut self) -> Result<u64> {
        self.retire_current_container()
    }
}

impl Drop for DbFileSinkBackend {
    fn drop(&mut self) {
        let _ = self.retire_current_container();
    }
}
