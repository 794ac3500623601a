use std::{
    fs::{File, OpenOptions},
    mem::align_of,
    path::{Path, PathBuf},
    ptr, slice,
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
    time::Duration,
};

use dlog_codec::{self as codec, Output, SliceInput, SliceOutput};
use fslock::LockFile;
use memmap2::MmapRaw;
use tracing::trace;

use crate::{
    bus::{lock_with_deadline, record_buffer::RecordBuffer, MessageBus, LOCK_DEADLINE},
    catalog::FileDatabase,
    error::{Error, Result},
    source::LogRecordPort,
    types::{derive_span_id, hash_to_index, hashed_thread_id, Severity, SpanContext, SpanId,
            TraceId},
};

/// File extension of a message bus file.
pub const BUS_FILE_EXTENSION: &str = "dmpscb";

/// Magic prefix of a message bus file.
pub const BUS_MAGIC: [u8; 18] = [
    0x82, 0x50, 0x0d, 0x0a, 0xab, 0x7e, 0x7b, 0x64, 0x6d, 0x70, 0x73, 0x63, 0x62, 0x7d, 0x7e,
    0xbb, 0x0a, 0x1a,
];

/// Smallest permissible region size.
pub const MIN_REGION_SIZE: u32 = 4 * 1024;
/// Largest payload a single message may carry.
pub const MAX_MESSAGE_SIZE: u32 = 0x1fff_ffff;
/// Largest number of messages drained per consumer callback.
pub const CONSUME_BATCH_SIZE: usize = 64;

const PAGE_SIZE: u32 = 4 * 1024;
const HEAD_AREA_SIZE: u32 = 4 * 1024;
const REGION_CTRL_SIZE: u32 = 64;

/// Smallest allocation unit; equal to the platform alignment of the
/// 32-bit header word so every header lands on an atomic-capable address.
const BLOCK_SIZE: u32 = align_of::<AtomicU32>() as u32;
const MESSAGE_HEADER_SIZE: u32 = BLOCK_SIZE;

/// Header bit set while the producer is still writing the payload.
const MESSAGE_LOCK_FLAG: u32 = 0x8000_0000;
/// Header bits set once the consumer has reclaimed the message. The lock
/// bit stays set so a partially crashed consumer leaves legible headers;
/// headers are never zeroed, only flagged.
const MESSAGE_CONSUMED_FLAG: u32 = 0xc000_0000;

/// Fill byte of never-written and reclaimed blocks. Interpreted as a
/// message header it carries the lock flag, which is what stops the
/// consumer at the allocation frontier.
const UNUSED_BLOCK_CONTENT: u8 = 0xfe;

const fn round_up(value: u32, multiple: u32) -> u32 {
    debug_assert!(multiple.is_power_of_two());
    (value + (multiple - 1)) & !(multiple - 1)
}

/// Multi-producer single-consumer shared-memory ring bus.
///
/// The backing file starts with a 4 KiB head area (magic plus bus info)
/// followed by `num_regions` regions of `region_size` bytes. Each region
/// owns a 64-byte control block and a payload ring. Producers reserve a
/// slot with a single CAS on the region's allocation hand and publish it
/// by clearing the slot header's lock flag; the consumer walks each ring
/// in batches and releases reclaimed bytes by publishing the read hand.
///
/// The file is exclusively locked for the lifetime of the handle, so two
/// processes can never drive the same bus concurrently; producers within
/// one process share the handle.
pub struct MpscBus {
    map: MmapRaw,
    // Keeps the advisory lock alive for exactly as long as the mapping.
    #[allow(dead_code)]
    lock: LockFile,
    #[allow(dead_code)]
    file: File,
    path: PathBuf,
    num_regions: u32,
    region_size: u32,
}

// SAFETY: all mutation of the shared mapping goes through atomics on
// aligned words or through memory exclusively reserved by the allocation
// protocol; the raw pointer accessors themselves are side-effect free.
unsafe impl Send for MpscBus {}
unsafe impl Sync for MpscBus {}

struct BusInfo {
    num_regions: u32,
    region_size: u32,
}

impl MpscBus {
    /// Creates a fresh bus file at `path`.
    ///
    /// Fails if the file already exists. `region_size` is rounded up to a
    /// multiple of 4 KiB.
    pub fn create(path: impl AsRef<Path>, num_regions: u32, region_size: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        Self::initialize(file, path, num_regions, region_size)
    }

    /// Initializes a pre-created, empty bus file.
    pub(crate) fn initialize(
        file: File,
        path: PathBuf,
        num_regions: u32,
        region_size: u32,
    ) -> Result<Self> {
        if num_regions == 0 || region_size < MIN_REGION_SIZE {
            return Err(Error::InvalidArgument);
        }
        if u32::MAX - PAGE_SIZE < region_size {
            return Err(Error::InvalidArgument);
        }
        let region_size = round_up(region_size, PAGE_SIZE);

        let combined = u64::from(num_regions)
            .checked_mul(u64::from(region_size))
            .and_then(|c| c.checked_add(u64::from(HEAD_AREA_SIZE)))
            .ok_or(Error::InvalidArgument)?;

        let mut lock = LockFile::open(&path)?;
        if !lock.try_lock()? {
            return Err(Error::ContainerCouldNotBeLocked);
        }

        file.set_len(combined)?;
        let map = MmapRaw::map_raw(&file)?;

        let bus = Self {
            map,
            lock,
            file,
            path,
            num_regions,
            region_size,
        };
        bus.write_head_area()?;
        for region in 0..num_regions {
            // SAFETY: the mapping covers the whole file; region offsets
            // were validated against the mapped length above.
            unsafe {
                ptr::write_bytes(bus.region_ctrl_ptr(region), 0, REGION_CTRL_SIZE as usize);
                ptr::write_bytes(
                    bus.region_data_ptr(region),
                    UNUSED_BLOCK_CONTENT,
                    (region_size - REGION_CTRL_SIZE) as usize,
                );
            }
        }

        trace!(
            path = %bus.path.display(),
            num_regions,
            region_size,
            "Created message bus."
        );
        Ok(bus)
    }

    /// Opens an existing bus file, e.g. one left behind by a crashed
    /// process, acquiring the exclusive lock within `deadline`.
    pub fn open(path: impl AsRef<Path>, deadline: Duration) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let lock = lock_with_deadline(&path, deadline)?;

        let map = MmapRaw::map_raw(&file)?;
        if map.len() < HEAD_AREA_SIZE as usize {
            return Err(Error::MissingData);
        }
        // SAFETY: the head area is within the mapping and only read here.
        let head = unsafe { slice::from_raw_parts(map.as_ptr(), HEAD_AREA_SIZE as usize) };
        if head[..BUS_MAGIC.len()] != BUS_MAGIC {
            return Err(Error::InvalidFileDatabaseHeader);
        }
        let info = Self::parse_bus_info(&head[BUS_MAGIC.len()..])?;

        let expected =
            u64::from(HEAD_AREA_SIZE) + u64::from(info.num_regions) * u64::from(info.region_size);
        if (map.len() as u64) < expected {
            return Err(Error::MissingData);
        }

        Ok(Self {
            map,
            lock,
            file,
            path,
            num_regions: info.num_regions,
            region_size: info.region_size,
        })
    }

    fn write_head_area(&self) -> Result<()> {
        // SAFETY: exclusive access during initialization.
        let head =
            unsafe { slice::from_raw_parts_mut(self.map.as_mut_ptr(), HEAD_AREA_SIZE as usize) };
        let mut out = SliceOutput::new(head);
        out.write_all(&BUS_MAGIC)?;
        codec::emit_map(&mut out, 2)?;
        codec::emit_uint(&mut out, 1)?;
        codec::emit_uint(&mut out, u64::from(self.num_regions))?;
        codec::emit_uint(&mut out, 2)?;
        codec::emit_uint(&mut out, u64::from(self.region_size))?;
        Ok(())
    }

    fn parse_bus_info(bytes: &[u8]) -> Result<BusInfo> {
        let mut input = SliceInput::new(bytes);
        let pairs = codec::parse_map_head(&mut input)?;
        let mut num_regions = None;
        let mut region_size = None;
        for _ in 0..pairs {
            let key = codec::parse_u64(&mut input)?;
            let value = codec::parse_u64(&mut input)?;
            match key {
                1 => num_regions = Some(u32::try_from(value).map_err(|_| Error::MissingData)?),
                2 => region_size = Some(u32::try_from(value).map_err(|_| Error::MissingData)?),
                _ => {}
            }
        }
        match (num_regions, region_size) {
            (Some(num_regions), Some(region_size)) if num_regions > 0 => Ok(BusInfo {
                num_regions,
                region_size,
            }),
            _ => Err(Error::MissingData),
        }
    }

    pub fn num_regions(&self) -> u32 {
        self.num_regions
    }

    pub fn region_size(&self) -> u32 {
        self.region_size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes the bus file. The handle keeps holding the lock until it
    /// is dropped, so no other process can resurrect the file in between.
    pub fn unlink(self) -> Result<()> {
        std::fs::remove_file(&self.path).map_err(|_| Error::MessageBusUnlinkFailed)
    }

    fn region_ctrl_ptr(&self, region: u32) -> *mut u8 {
        debug_assert!(region < self.num_regions);
        // SAFETY: region bounds were validated at construction.
        unsafe {
            self.map
                .as_mut_ptr()
                .add(HEAD_AREA_SIZE as usize + region as usize * self.region_size as usize)
        }
    }

    fn region_data_ptr(&self, region: u32) -> *mut u8 {
        // SAFETY: as in `region_ctrl_ptr`; the control block is 64 bytes.
        unsafe { self.region_ctrl_ptr(region).add(REGION_CTRL_SIZE as usize) }
    }

    fn read_hand(&self, region: u32) -> &AtomicU32 {
        // SAFETY: offset 0 of the control block, 4-byte aligned because
        // regions start on page boundaries.
        unsafe { AtomicU32::from_ptr(self.region_ctrl_ptr(region).cast()) }
    }

    fn alloc_hand(&self, region: u32) -> &AtomicU32 {
        // SAFETY: offset 4 of the control block.
        unsafe { AtomicU32::from_ptr(self.region_ctrl_ptr(region).add(4).cast()) }
    }

    fn span_prng_ctr(&self, region: u32) -> &AtomicU64 {
        // SAFETY: offset 8 of the control block, 8-byte aligned.
        unsafe { AtomicU64::from_ptr(self.region_ctrl_ptr(region).add(8).cast()) }
    }

    /// Reserves a message slot and returns the writable payload buffer.
    ///
    /// The starting region is chosen deterministically: producers inside
    /// a span stay on the region derived from their span id, so their
    /// records retain producer order; producers outside any span scatter
    /// by thread id. On `NotEnoughSpace` the next region is tried until
    /// the starting region comes around again.
    pub fn allocate_record_buffer(
        &self,
        message_size: usize,
        span_id: SpanId,
    ) -> Result<RecordBuffer<'_>> {
        if message_size > MAX_MESSAGE_SIZE as usize {
            return Err(Error::NotEnoughSpace);
        }
        let payload_size = message_size as u32;

        let spread = if span_id.is_valid() {
            span_id.spread()
        } else {
            hashed_thread_id()
        };
        let first_region = hash_to_index(spread, self.num_regions);

        let mut region = first_region;
        loop {
            match self.allocate(payload_size, region) {
                Ok(buffer) => return Ok(buffer),
                Err(Error::NotEnoughSpace) => {
                    region += 1;
                    if region == self.num_regions {
                        region = 0;
                    }
                    if region == first_region {
                        return Err(Error::NotEnoughSpace);
                    }
                }
                Err(other) => return Err(other),
            }
        }
    }

    fn allocate(&self, payload_size: u32, region: u32) -> Result<RecordBuffer<'_>> {
        let region_end = self.region_size - REGION_CTRL_SIZE;
        let alloc_size = round_up(payload_size, BLOCK_SIZE);
        let data = self.region_data_ptr(region);

        let shared_read_hand = self.read_hand(region);
        let shared_alloc_hand = self.alloc_hand(region);

        // The acquire pairs with the consumer's release publication of the
        // read hand and guarantees reclaimed bytes are ours to overwrite.
        let read_hand = shared_read_hand.load(Ordering::Acquire);
        let mut alloc_hand = shared_alloc_hand.load(Ordering::Relaxed);

        let payload_position;
        loop {
            let mut position = u64::from(alloc_hand) + u64::from(MESSAGE_HEADER_SIZE);
            let mut payload_end = position + u64::from(alloc_size);
            let can_wrap = alloc_hand >= read_hand;
            let buffer_end = if can_wrap {
                u64::from(region_end)
            } else {
                u64::from(read_hand)
            };

            if payload_end >= buffer_end {
                if can_wrap && payload_end == u64::from(region_end) && read_hand != 0 {
                    // The message fits exactly; only the hand wraps.
                    payload_end = 0;
                } else if can_wrap && alloc_size < read_hand {
                    position = 0;
                    payload_end = u64::from(alloc_size);
                } else {
                    return Err(Error::NotEnoughSpace);
                }
            }

            match shared_alloc_hand.compare_exchange_weak(
                alloc_hand,
                payload_end as u32,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    payload_position = position as u32;
                    break;
                }
                Err(current) => alloc_hand = current,
            }
        }

        // SAFETY: the CAS above reserved `[alloc_hand, payload_end)`
        // exclusively for this producer.
        unsafe {
            let header = data.add(alloc_hand as usize).cast::<u32>();
            AtomicU32::from_ptr(header)
                .store(payload_size | MESSAGE_LOCK_FLAG, Ordering::Relaxed);
            Ok(RecordBuffer::for_slot(
                data.add(payload_position as usize),
                alloc_size as usize,
                header,
            ))
        }
    }

    /// Derives a new span context, drawing the child counter from the
    /// region the trace id maps to.
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

        let region = hash_to_index(trace_id.spread(), self.num_regions);
        let ctr = self.span_prng_ctr(region).fetch_add(1, Ordering::Relaxed);
        let (p0, p1) = trace_id.to_words();
        SpanContext {
            trace_id,
            span_id: derive_span_id(p0, p1, ctr),
        }
    }

    /// Drains up to [`CONSUME_BATCH_SIZE`] ready messages per batch from
    /// every region. Single-threaded by contract: only one drain call may
    /// run at a time.
    pub fn consume_messages(&self, consumer: &mut dyn FnMut(&[&[u8]])) -> Result<()> {
        for region in 0..self.num_regions {
            self.read_region(region, consumer)?;
        }
        Ok(())
    }

    fn read_region(&self, region: u32, consumer: &mut dyn FnMut(&[&[u8]])) -> Result<()> {
        let region_end = self.region_size - REGION_CTRL_SIZE;
        let data = self.region_data_ptr(region);

        let shared_read_hand = self.read_hand(region);
        let shared_alloc_hand = self.alloc_hand(region);

        let original_read_pos = shared_read_hand.load(Ordering::Relaxed);
        if shared_alloc_hand.load(Ordering::Relaxed) == original_read_pos {
            return Ok(());
        }

        let mut read_pos = original_read_pos;
        loop {
            let mut batch_len = 0usize;
            let mut msgs: [&[u8]; CONSUME_BATCH_SIZE] = [&[]; CONSUME_BATCH_SIZE];
            let mut reclaim = [(0u32, 0u32, 0u32); CONSUME_BATCH_SIZE];

            while batch_len < CONSUME_BATCH_SIZE {
                let header_pos = read_pos;
                // SAFETY: `header_pos` is always block-aligned and inside
                // the region payload area.
                let head = unsafe {
                    AtomicU32::from_ptr(data.add(header_pos as usize).cast())
                        .load(Ordering::Acquire)
                };
                if head & MESSAGE_LOCK_FLAG != 0 {
                    // Either the allocation frontier (unused fill) or a
                    // message still being written.
                    break;
                }

                let payload_pos = if u64::from(header_pos)
                    + u64::from(MESSAGE_HEADER_SIZE)
                    + u64::from(head)
                    > u64::from(region_end)
                {
                    // Wrap sentinel: the payload lives at the region start.
                    0
                } else {
                    header_pos + MESSAGE_HEADER_SIZE
                };
                let alloc_size = round_up(head, BLOCK_SIZE);

                // SAFETY: committed payloads are not touched by producers
                // until the read hand passes them.
                msgs[batch_len] = unsafe {
                    slice::from_raw_parts(data.add(payload_pos as usize), head as usize)
                };
                reclaim[batch_len] = (header_pos, payload_pos, alloc_size);
                batch_len += 1;

                read_pos = payload_pos + alloc_size;
                if read_pos == region_end {
                    read_pos = 0;
                }
            }

            if batch_len == 0 {
                break;
            }

            consumer(&msgs[..batch_len]);

            for &(header_pos, payload_pos, alloc_size) in &reclaim[..batch_len] {
                // SAFETY: same slots as above; flagging and refilling them
                // happens strictly before the read hand is published.
                unsafe {
                    AtomicU32::from_ptr(data.add(header_pos as usize).cast())
                        .fetch_or(MESSAGE_CONSUMED_FLAG, Ordering::Relaxed);
                    ptr::write_bytes(
                        data.add(payload_pos as usize),
                        UNUSED_BLOCK_CONTENT,
                        alloc_size as usize,
                    );
                }
            }
        }

        if read_pos != original_read_pos {
            // Pairs with the producers' acquire load when they compute the
            // near wall; releases the reclaimed bytes to them.
            shared_read_hand.store(read_pos, Ordering::Release);
        }
        Ok(())
    }
}

impl LogRecordPort for MpscBus {
    fn allocate_record_buffer(
        &self,
        message_size: usize,
        span_id: SpanId,
    ) -> Result<RecordBuffer<'_>> {
        MpscBus::allocate_record_buffer(self, message_size, span_id)
    }

    fn create_span_context(
        &self,
        trace_id: TraceId,
        name: &str,
        threshold: &mut Severity,
    ) -> SpanContext {
        MpscBus::create_span_context(self, trace_id, name, threshold)
    }
}

impl MessageBus for MpscBus {
    const CONSUME_BATCH_SIZE: usize = CONSUME_BATCH_SIZE;

    fn consume_messages(&self, consumer: &mut dyn FnMut(&[&[u8]])) -> Result<()> {
        MpscBus::consume_messages(self, consumer)
    }
}

/// Configuration for a catalog-registered bus.
pub struct DbMpscBusConfig<'a> {
    pub database: &'a FileDatabase,
    pub bus_id: String,
    pub file_name_pattern: &'a str,
    pub num_regions: u32,
    pub region_size: u32,
}

/// A [`MpscBus`] whose backing file is registered in a [`FileDatabase`].
///
/// The catalog entry is what allows `prune_message_buses` to find and
/// recover the bus if this process dies without unlinking it.
pub struct DbMpscBus {
    bus: MpscBus,
    database: FileDatabase,
    id: String,
    rotation: u32,
}

impl DbMpscBus {
    pub fn create(config: DbMpscBusConfig<'_>) -> Result<Self> {
        let mut database = config.database.try_clone()?;
        let created = database.create_message_bus(
            config.file_name_pattern,
            config.bus_id.clone(),
            &BUS_MAGIC,
        )?;

        let bus = match MpscBus::initialize(
            created.file,
            created.path.clone(),
            config.num_regions,
            config.region_size,
        ) {
            Ok(bus) => bus,
            Err(error) => {
                let _ = std::fs::remove_file(&created.path);
                let _ = database.remove_message_bus(&config.bus_id, created.rotation);
                return Err(error);
            }
        };

        Ok(Self {
            bus,
            database,
            id: config.bus_id,
            rotation: created.rotation,
        })
    }

    pub fn bus(&self) -> &MpscBus {
        &self.bus
    }

    /// Removes the bus file and drops its catalog registration.
    pub fn unlink(self) -> Result<()> {
        let Self {
            bus,
            mut database,
            id,
            rotation,
        } = self;
        bus.unlink()?;
        database.remove_message_bus(&id, rotation)?;
        Ok(())
    }

}

impl LogRecordPort for DbMpscBus {
    fn allocate_record_buffer(
        &self,
        message_size: usize,
        span_id: SpanId,
    ) -> Result<RecordBuffer<'_>> {
        self.bus.allocate_record_buffer(message_size, span_id)
    }

    fn create_span_context(
        &self,
        trace_id: TraceId,
        name: &str,
        threshold: &mut Severity,
    ) -> SpanContext {
        self.bus.create_span_context(trace_id, name, threshold)
    }
}

impl MessageBus for DbMpscBus {
    const CONSUME_BATCH_SIZE: usize = CONSUME_BATCH_SIZE;

    fn consume_messages(&self, consumer: &mut dyn FnMut(&[&[u8]])) -> Result<()> {
        self.bus.consume_messages(consumer)
    }
}

/// Drains an orphaned bus file left behind by a dead process.
///
/// Acquiring the exclusive lock proves the previous owner is gone; the
/// remaining messages are handed to `consumer` and the file is unlinked.
pub(crate) fn recover_bus_file(
    path: &Path,
    consumer: &mut dyn FnMut(&[&[u8]]),
) -> Result<()> {
    let bus = MpscBus::open(path, LOCK_DEADLINE)?;
    bus.consume_messages(consumer)?;
    bus.unlink()
}
