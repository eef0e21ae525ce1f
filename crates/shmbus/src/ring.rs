//! Bounded MPMC ring protocol.
//!
//! Producers and consumers claim free-running tickets with a CAS on `tail`
//! or `head`; the ticket modulo the capacity selects a slot. Per-slot state
//! tags (`EMPTY -> WRITING -> READY -> READING -> EMPTY`) close the race
//! between a ticket holder and the peer still copying the previous element
//! in the same slot. Blocking paths park on the `not_empty` / `not_full`
//! futex words with the usual snapshot-then-recheck discipline.

use crate::errors::{IpcError, Result};
use crate::layout::{
    self, QueueHeader, SlotState, QUEUE_MAGIC, SLOT_EMPTY, SLOT_READING, SLOT_READY, SLOT_WRITING,
};
use crate::region::SharedRegion;
use std::mem::size_of;
use std::ptr;
use std::sync::atomic::Ordering;
use std::time::Duration;

/// Upper bound on a single park. The two futex words are shared by
/// full/empty waiters and by slot-state waiters, so a `wake(1)` can land on
/// the wrong class; the bound turns a misdirected wake into a short delay
/// instead of a stall.
const WAIT_POLL: Duration = Duration::from_millis(20);

/// Result of a single dequeue attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PopStatus {
    /// An element of this length was copied out.
    Popped(usize),
    Empty,
    /// The ring is closed and drained.
    Closed,
}

#[derive(Debug)]
pub(crate) struct QueueRegion {
    region: SharedRegion,
    capacity: u64,
    stride: usize,
    max_element_size: usize,
}

impl QueueRegion {
    pub fn init(region: SharedRegion, max_element_size: usize, capacity: usize) -> Result<Self> {
        if max_element_size == 0 || capacity == 0 {
            return Err(IpcError::InvalidArgument(
                "queue element size and capacity must be non-zero".to_string(),
            ));
        }
        if layout::queue_region_size(max_element_size, capacity) > region.len() {
            return Err(IpcError::InvalidArgument(format!(
                "region {} is too small for the requested queue geometry",
                region.name()
            )));
        }

        let this = Self {
            region,
            capacity: capacity as u64,
            stride: layout::element_stride(max_element_size),
            max_element_size,
        };

        let header = this.header();
        header
            .max_element_size
            .store(max_element_size as u64, Ordering::Relaxed);
        header
            .element_stride
            .store(this.stride as u64, Ordering::Relaxed);
        header.capacity.store(capacity as u64, Ordering::Relaxed);
        header.magic.store(QUEUE_MAGIC, Ordering::Release);

        Ok(this)
    }

    pub fn attach(region: SharedRegion) -> Result<Self> {
        if region.len() < size_of::<QueueHeader>() {
            return Err(IpcError::IncompatibleRegion(format!(
                "region {} is too small for a queue header",
                region.name()
            )));
        }

        let (max_element_size, stride, capacity) = {
            let header = unsafe { &*(region.as_ptr() as *const QueueHeader) };
            if header.magic.load(Ordering::Acquire) != QUEUE_MAGIC {
                return Err(IpcError::IncompatibleRegion(format!(
                    "region {} does not hold a circular queue",
                    region.name()
                )));
            }
            (
                header.max_element_size.load(Ordering::Acquire) as usize,
                header.element_stride.load(Ordering::Acquire) as usize,
                header.capacity.load(Ordering::Acquire) as usize,
            )
        };

        if max_element_size == 0
            || capacity == 0
            || stride != layout::element_stride(max_element_size)
            || layout::queue_region_size(max_element_size, capacity) > region.len()
        {
            return Err(IpcError::IncompatibleRegion(format!(
                "region {} declares an inconsistent queue geometry",
                region.name()
            )));
        }

        Ok(Self {
            region,
            capacity: capacity as u64,
            stride,
            max_element_size,
        })
    }

    fn header(&self) -> &QueueHeader {
        unsafe { &*(self.region.as_ptr() as *const QueueHeader) }
    }

    fn state(&self, index: usize) -> &SlotState {
        debug_assert!(index < self.capacity as usize);
        unsafe {
            let base = self.region.as_ptr().add(layout::queue_states_offset()) as *const SlotState;
            &*base.add(index)
        }
    }

    unsafe fn slot_ptr(&self, index: usize) -> *mut u8 {
        unsafe {
            self.region
                .as_ptr()
                .add(layout::queue_slots_offset(self.capacity as usize) + index * self.stride)
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    pub fn max_element_size(&self) -> usize {
        self.max_element_size
    }

    pub fn region_len(&self) -> usize {
        self.region.len()
    }

    /// Number of elements currently claimed by producers. Advisory: under
    /// contention the instantaneous `tail - head` may momentarily exceed
    /// the capacity, so the result is clamped.
    pub fn len(&self) -> usize {
        let header = self.header();
        let tail = header.tail.load(Ordering::Acquire);
        let head = header.head.load(Ordering::Acquire);
        tail.saturating_sub(head).min(self.capacity) as usize
    }

    pub fn is_full(&self) -> bool {
        let header = self.header();
        let tail = header.tail.load(Ordering::Acquire);
        let head = header.head.load(Ordering::Acquire);
        tail.wrapping_sub(head) >= self.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.header().closed.load(Ordering::Acquire) != 0
    }

    pub fn close(&self) {
        let header = self.header();
        header.closed.store(1, Ordering::Release);
        header.not_empty_word.bump();
        header.not_empty_word.wake_all();
        header.not_full_word.bump();
        header.not_full_word.wake_all();
        tracing::debug!(region = self.region.name(), "queue region closed");
    }

    /// Enqueue without blocking on a full ring. Returns `false` when the
    /// ring is full or closed.
    pub fn try_push(&self, data: &[u8]) -> Result<bool> {
        self.check_element_size(data.len())?;
        let header = self.header();

        let ticket = loop {
            if self.is_closed() {
                return Ok(false);
            }
            let tail = header.tail.load(Ordering::Acquire);
            let head = header.head.load(Ordering::Acquire);
            if tail.wrapping_sub(head) >= self.capacity {
                return Ok(false);
            }
            if header
                .tail
                .compare_exchange_weak(tail, tail + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break tail;
            }
        };

        self.fill_slot(ticket, data)
    }

    /// Enqueue, parking while the ring is full. Returns `false` when the
    /// ring closes before the element is committed.
    pub fn push_blocking(&self, data: &[u8]) -> Result<bool> {
        self.check_element_size(data.len())?;
        let header = self.header();

        let ticket = loop {
            if self.is_closed() {
                return Ok(false);
            }
            let snapshot = header.not_full_word.load();
            let tail = header.tail.load(Ordering::Acquire);
            let head = header.head.load(Ordering::Acquire);
            if tail.wrapping_sub(head) >= self.capacity {
                header.not_full_word.wait(snapshot, Some(WAIT_POLL))?;
                continue;
            }
            if header
                .tail
                .compare_exchange_weak(tail, tail + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break tail;
            }
        };

        self.fill_slot(ticket, data)
    }

    /// Dequeue without blocking on an empty ring.
    ///
    /// `out` must hold at least `max_element_size` bytes.
    pub fn try_pop(&self, out: &mut [u8]) -> Result<PopStatus> {
        let header = self.header();

        let ticket = loop {
            let head = header.head.load(Ordering::Acquire);
            let tail = header.tail.load(Ordering::Acquire);
            if head == tail {
                if self.is_closed() {
                    return Ok(PopStatus::Closed);
                }
                return Ok(PopStatus::Empty);
            }
            if header
                .head
                .compare_exchange_weak(head, head + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break head;
            }
        };

        self.drain_slot(ticket, out)
    }

    /// Dequeue, parking while the ring is empty. Reports `Closed` once the
    /// ring is closed and drained.
    pub fn pop_blocking(&self, out: &mut [u8]) -> Result<PopStatus> {
        let header = self.header();
        loop {
            let snapshot = header.not_empty_word.load();
            match self.try_pop(out)? {
                PopStatus::Empty => {
                    header.not_empty_word.wait(snapshot, Some(WAIT_POLL))?;
                }
                status => return Ok(status),
            }
        }
    }

    fn check_element_size(&self, len: usize) -> Result<()> {
        if len > self.max_element_size {
            return Err(IpcError::PayloadTooLarge {
                len,
                capacity: self.max_element_size,
            });
        }
        Ok(())
    }

    /// Write `data` into the slot owned by `ticket` and mark it ready.
    /// Returns `false` if the ring closed while the slot was still being
    /// drained by a slow consumer.
    fn fill_slot(&self, ticket: u64, data: &[u8]) -> Result<bool> {
        let header = self.header();
        let index = (ticket % self.capacity) as usize;
        let state = self.state(index);

        loop {
            let snapshot = header.not_full_word.load();
            if state
                .compare_exchange(SLOT_EMPTY, SLOT_WRITING, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
            // The consumer of the lapped element is still copying it out.
            if self.is_closed() {
                return Ok(false);
            }
            header.not_full_word.wait(snapshot, Some(WAIT_POLL))?;
        }

        unsafe {
            let slot = self.slot_ptr(index);
            ptr::copy_nonoverlapping(
                (data.len() as u64).to_le_bytes().as_ptr(),
                slot,
                layout::LEN_PREFIX,
            );
            ptr::copy_nonoverlapping(data.as_ptr(), slot.add(layout::LEN_PREFIX), data.len());
        }

        state.store(SLOT_READY, Ordering::Release);
        header.not_empty_word.bump();
        header.not_empty_word.wake(1);
        Ok(true)
    }

    fn drain_slot(&self, ticket: u64, out: &mut [u8]) -> Result<PopStatus> {
        let header = self.header();
        let index = (ticket % self.capacity) as usize;
        let state = self.state(index);

        loop {
            let snapshot = header.not_empty_word.load();
            if state
                .compare_exchange(SLOT_READY, SLOT_READING, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
            // The producer holding this ticket has not committed yet. If it
            // abandoned the slot at close time, give up instead of parking
            // forever.
            if self.is_closed() && state.load(Ordering::Acquire) != SLOT_READY {
                return Ok(PopStatus::Closed);
            }
            header.not_empty_word.wait(snapshot, Some(WAIT_POLL))?;
        }

        let len = unsafe {
            let slot = self.slot_ptr(index);
            let mut prefix = [0u8; layout::LEN_PREFIX];
            ptr::copy_nonoverlapping(slot, prefix.as_mut_ptr(), layout::LEN_PREFIX);
            u64::from_le_bytes(prefix) as usize
        };
        if len > self.max_element_size || len > out.len() {
            return Err(IpcError::IncompatibleRegion(
                "slot length prefix exceeds the element size".to_string(),
            ));
        }
        unsafe {
            ptr::copy_nonoverlapping(self.slot_ptr(index).add(layout::LEN_PREFIX), out.as_mut_ptr(), len);
        }

        state.store(SLOT_EMPTY, Ordering::Release);
        header.not_full_word.bump();
        header.not_full_word.wake(1);
        Ok(PopStatus::Popped(len))
    }
}
