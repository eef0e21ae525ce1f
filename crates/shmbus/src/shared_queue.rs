//! SharedCircularQueue: a bounded multi-producer / multi-consumer FIFO of
//! fixed-capacity byte elements over a named shared-memory region.

use crate::errors::{IpcError, Result};
use crate::layout;
use crate::region::SharedRegion;
use crate::ring::{PopStatus, QueueRegion};
use crate::types::OpenMode;
use std::sync::Mutex;

/// One participant's handle on a shared queue region.
///
/// Any number of producers and consumers (across threads and processes) may
/// target the same name. Elements are opaque byte strings of up to
/// `max_element_size` bytes; dequeue order follows the order in which
/// producers claimed their slots.
pub struct SharedCircularQueue {
    inner: QueueRegion,
    name: String,
    mode: OpenMode,
    scratch: Mutex<Vec<u8>>,
}

impl SharedCircularQueue {
    /// Create (or reset) the named queue with `capacity` slots of up to
    /// `max_element_size` bytes each.
    pub fn create(
        name: &str,
        max_element_size: usize,
        capacity: usize,
        mode: OpenMode,
    ) -> Result<Self> {
        if max_element_size == 0 || capacity == 0 {
            return Err(IpcError::InvalidArgument(
                "queue element size and capacity must be non-zero".to_string(),
            ));
        }
        let region =
            SharedRegion::create(name, layout::queue_region_size(max_element_size, capacity))?;
        let inner = QueueRegion::init(region, max_element_size, capacity)?;
        Ok(Self::from_parts(inner, name, mode))
    }

    /// Attach to an existing named queue.
    pub fn open(name: &str, mode: OpenMode) -> Result<Self> {
        let region = SharedRegion::open(name)?;
        let inner = QueueRegion::attach(region)?;
        Ok(Self::from_parts(inner, name, mode))
    }

    /// Remove the backing region; live handles keep working on their
    /// mappings.
    pub fn unlink(name: &str) -> Result<()> {
        SharedRegion::unlink(name)
    }

    fn from_parts(inner: QueueRegion, name: &str, mode: OpenMode) -> Self {
        let scratch = vec![0u8; inner.max_element_size()];
        Self {
            inner,
            name: name.to_string(),
            mode,
            scratch: Mutex::new(scratch),
        }
    }

    /// Enqueue without blocking; `false` when the queue is full or closed.
    pub fn try_write(&self, data: &[u8]) -> Result<bool> {
        self.check_can_write()?;
        self.inner.try_push(data)
    }

    /// Enqueue, waiting for a free slot; `false` when the queue closes
    /// before the element is committed.
    pub fn blocking_write(&self, data: &[u8]) -> Result<bool> {
        self.check_can_write()?;
        self.inner.push_blocking(data)
    }

    /// Dequeue without blocking; `None` when the queue is empty or closed
    /// and drained.
    pub fn try_read(&self) -> Result<Option<Vec<u8>>> {
        self.check_can_read()?;
        let mut scratch = self.scratch.lock().unwrap();
        match self.inner.try_pop(scratch.as_mut_slice())? {
            PopStatus::Popped(len) => Ok(Some(scratch[..len].to_vec())),
            PopStatus::Empty | PopStatus::Closed => Ok(None),
        }
    }

    /// Dequeue, waiting for an element; `None` once the queue is closed and
    /// drained.
    pub fn blocking_read(&self) -> Result<Option<Vec<u8>>> {
        self.check_can_read()?;
        let mut scratch = self.scratch.lock().unwrap();
        match self.inner.pop_blocking(scratch.as_mut_slice())? {
            PopStatus::Popped(len) => Ok(Some(scratch[..len].to_vec())),
            PopStatus::Empty | PopStatus::Closed => Ok(None),
        }
    }

    /// Drain every element currently available, in FIFO order.
    pub fn read_all(&self) -> Result<Vec<Vec<u8>>> {
        self.check_can_read()?;
        let mut scratch = self.scratch.lock().unwrap();
        let mut drained = Vec::new();
        while let PopStatus::Popped(len) = self.inner.try_pop(scratch.as_mut_slice())? {
            drained.push(scratch[..len].to_vec());
        }
        Ok(drained)
    }

    /// Number of queued elements; advisory under contention.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.inner.is_full()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Publish the closed flag and wake every blocked producer and
    /// consumer.
    pub fn close(&self) -> Result<()> {
        self.check_can_write()?;
        self.inner.close();
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Size of the backing region in bytes (header and slot states
    /// included).
    pub fn memory_size(&self) -> usize {
        self.inner.region_len()
    }

    pub fn max_element_size(&self) -> usize {
        self.inner.max_element_size()
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    fn check_can_read(&self) -> Result<()> {
        if !self.mode.can_read() {
            return Err(IpcError::InvalidArgument(
                "queue was opened write-only".to_string(),
            ));
        }
        Ok(())
    }

    fn check_can_write(&self) -> Result<()> {
        if !self.mode.can_write() {
            return Err(IpcError::InvalidArgument(
                "queue was opened read-only".to_string(),
            ));
        }
        Ok(())
    }
}
