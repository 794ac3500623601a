use std::{
    marker::PhantomData,
    slice,
    sync::atomic::{AtomicU32, Ordering},
};

use dlog_codec::{self as codec, Output};

use crate::bus::mpsc::MAX_MESSAGE_SIZE;

/// Producer-side writable byte stream over a reserved bus slot.
///
/// The buffer is handed out by a bus allocation and points straight into
/// the shared mapping. Writes must not exceed the reserved capacity; the
/// encoders pre-compute their exact size, so running out of room here
/// means the caller sized the allocation wrong.
///
/// Dropping the buffer commits the message: for the ring bus that clears
/// the slot's header lock flag with release ordering, which is the point
/// at which the consumer may observe the payload.
pub struct RecordBuffer<'bus> {
    data: *mut u8,
    capacity: usize,
    written: usize,
    ctrl: *mut u32,
    _bus: PhantomData<&'bus ()>,
}

impl<'bus> RecordBuffer<'bus> {
    /// Buffer over a ring-bus slot; `ctrl` is the slot's header word.
    ///
    /// # Safety
    ///
    /// `data..data+capacity` must be a live, exclusively reserved payload
    /// area inside the bus mapping, and `ctrl` the matching header word,
    /// both valid for `'bus`.
    pub(crate) unsafe fn for_slot(data: *mut u8, capacity: usize, ctrl: *mut u32) -> Self {
        Self {
            data,
            capacity,
            written: 0,
            ctrl,
            _bus: PhantomData,
        }
    }

    /// Buffer over a bump-allocated area that needs no commit step.
    ///
    /// # Safety
    ///
    /// `data..data+capacity` must be a live, exclusively reserved area
    /// valid for `'bus`.
    pub(crate) unsafe fn for_area(data: *mut u8, capacity: usize) -> Self {
        Self {
            data,
            capacity,
            written: 0,
            ctrl: std::ptr::null_mut(),
            _bus: PhantomData,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn written(&self) -> usize {
        self.written
    }

    fn remaining(&self) -> usize {
        self.capacity - self.written
    }
}

impl Output for RecordBuffer<'_> {
    fn ensure_capacity(&mut self, n: usize) -> codec::Result<()> {
        if self.remaining() < n {
            return Err(codec::Error::NotEnoughSpace);
        }
        Ok(())
    }

    fn writable(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.data.add(self.written), self.remaining()) }
    }

    fn commit(&mut self, n: usize) {
        debug_assert!(n <= self.remaining());
        self.written += n;
    }

    fn sync(&mut self) -> codec::Result<()> {
        if !self.ctrl.is_null() {
            // Pairs with the consumer's acquire load of the header.
            unsafe { AtomicU32::from_ptr(self.ctrl) }
                .fetch_and(MAX_MESSAGE_SIZE, Ordering::Release);
            self.ctrl = std::ptr::null_mut();
        }
        Ok(())
    }
}

impl Drop for RecordBuffer<'_> {
    fn drop(&mut self) {
        let _ = self.sync();
    }
}
