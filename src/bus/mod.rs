//! Message buses carrying encoded log messages from producers to the
//! single consumer.
//!
//! The workhorse is the shared-memory [`MpscBus`]: a mapped file split
//! into regions, each owning a lock-free ring with wait-free producer
//! allocation. [`BufferBus`] is the single-threaded bump-allocated
//! variant. Both hand producers a [`RecordBuffer`] pointing straight at
//! the reserved bytes and implement [`LogRecordPort`] so the source layer
//! does not care which one it writes to.

use std::{path::Path, thread, time::Duration};

use fslock::LockFile;

use crate::error::{Error, Result};

pub(crate) mod buffer;
pub(crate) mod mpsc;
pub(crate) mod record_buffer;

pub use self::{
    buffer::BufferBus,
    mpsc::{DbMpscBus, DbMpscBusConfig, MpscBus, CONSUME_BATCH_SIZE, MAX_MESSAGE_SIZE,
           MIN_REGION_SIZE},
    record_buffer::RecordBuffer,
};

pub(crate) use self::mpsc::recover_bus_file;

/// Default deadline for advisory lock acquisition on unlink and recovery.
pub const LOCK_DEADLINE: Duration = Duration::from_secs(30);

/// A bus the log fabric can drain.
pub trait MessageBus: crate::source::LogRecordPort {
    /// Largest number of messages handed to the consumer in one batch.
    const CONSUME_BATCH_SIZE: usize;

    /// Drains every region, feeding batches of raw messages to `consumer`.
    ///
    /// Message slices are only valid for the duration of the callback;
    /// their backing blocks are reclaimed as soon as it returns.
    fn consume_messages(&self, consumer: &mut dyn FnMut(&[&[u8]])) -> Result<()>;
}

/// Acquires an exclusive advisory lock, retrying until `deadline` elapses.
pub(crate) fn lock_with_deadline(path: &Path, deadline: Duration) -> Result<LockFile> {
    let path = path.to_path_buf();
    let mut lock = LockFile::open(&path)?;
    let give_up = std::time::Instant::now() + deadline;
    loop {
        if lock.try_lock()? {
            return Ok(lock);
        }
        if std::time::Instant::now() >= give_up {
            return Err(Error::ContainerCouldNotBeLocked);
        }
        thread::sleep(Duration::from_millis(10));
    }
}
