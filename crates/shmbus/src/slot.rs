//! Versioned slot protocol: a seqlock over the region's single payload
//! slot, plus the reader-acknowledgement counters that drive the
//! wait-for-readers policy.

use crate::errors::{IpcError, Result};
use crate::futex::WaitOutcome;
use crate::layout::{
    self, ack_count, ack_version, pack_ack, MessageHeader, MESSAGE_MAGIC,
};
use crate::region::SharedRegion;
use crate::types::{ReadStatus, ReaderWaitPolicy, WriteOutcome};
use std::mem::size_of;
use std::ptr;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

/// A message region: [`MessageHeader`] at offset 0, payload after it.
#[derive(Debug)]
pub(crate) struct MessageRegion {
    region: SharedRegion,
    capacity: usize,
}

impl MessageRegion {
    /// Initialize a freshly created (zeroed) region with exactly `capacity`
    /// payload bytes. Page-rounding slack beyond the header and the payload
    /// stays unused.
    pub fn init(region: SharedRegion, capacity: usize) -> Result<Self> {
        if capacity == 0 || size_of::<MessageHeader>() + capacity > region.len() {
            return Err(IpcError::InvalidArgument(format!(
                "region {} cannot hold a header and {capacity} payload bytes",
                region.name()
            )));
        }
        let this = Self { region, capacity };

        let header = this.header();
        header.capacity.store(capacity as u64, Ordering::Relaxed);
        // Publishing the magic last marks the header as initialized.
        header.magic.store(MESSAGE_MAGIC, Ordering::Release);

        Ok(this)
    }

    /// Attach to a region initialized by another participant.
    pub fn attach(region: SharedRegion) -> Result<Self> {
        if region.len() <= size_of::<MessageHeader>() {
            return Err(IpcError::IncompatibleRegion(format!(
                "region {} is too small for a message header",
                region.name()
            )));
        }

        let capacity = {
            let header = unsafe { &*(region.as_ptr() as *const MessageHeader) };
            if header.magic.load(Ordering::Acquire) != MESSAGE_MAGIC {
                return Err(IpcError::IncompatibleRegion(format!(
                    "region {} does not hold a shared message",
                    region.name()
                )));
            }
            header.capacity.load(Ordering::Acquire) as usize
        };

        if size_of::<MessageHeader>() + capacity > region.len() {
            return Err(IpcError::IncompatibleRegion(format!(
                "region {} declares a capacity larger than its mapping",
                region.name()
            )));
        }

        Ok(Self { region, capacity })
    }

    fn header(&self) -> &MessageHeader {
        unsafe { &*(self.region.as_ptr() as *const MessageHeader) }
    }

    unsafe fn payload_ptr(&self) -> *mut u8 {
        unsafe { self.region.as_ptr().add(layout::message_payload_offset()) }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn region_len(&self) -> usize {
        self.region.len()
    }

    /// Version of the last committed write; 0 before the first write.
    pub fn version(&self) -> u64 {
        self.header().writer_seq.load(Ordering::Acquire) >> 1
    }

    pub fn is_closed(&self) -> bool {
        self.header().closed.load(Ordering::Acquire) != 0
    }

    pub fn reader_attached(&self) {
        self.header().reader_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn reader_detached(&self) {
        let header = self.header();
        header.reader_count.fetch_sub(1, Ordering::AcqRel);
        // A writer waiting for "all readers" must re-evaluate against the
        // reduced count.
        header.ack_word.bump();
        header.ack_word.wake_all();
    }

    /// Publish `data` as the next version, honoring the wait policy.
    ///
    /// Writers are serialised by the in-region mutex, so several processes
    /// may call this concurrently.
    pub fn write(&self, data: &[u8], policy: ReaderWaitPolicy) -> Result<WriteOutcome> {
        let header = self.header();

        if data.len() > self.capacity {
            return Err(IpcError::PayloadTooLarge {
                len: data.len(),
                capacity: self.capacity,
            });
        }
        if self.is_closed() {
            return Ok(WriteOutcome::Closed);
        }

        let _guard = header.writer_lock.lock();

        if !self.wait_for_acks(policy)? {
            return Ok(WriteOutcome::Closed);
        }

        let seq = header.writer_seq.load(Ordering::Relaxed);
        header.writer_seq.store(seq + 1, Ordering::Release);
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.payload_ptr(), data.len());
        }
        header.payload_len.store(data.len() as u64, Ordering::Release);
        header.writer_seq.store(seq + 2, Ordering::Release);

        header.wait_word.set((seq + 2) as u32);
        header.wait_word.wake_all();

        Ok(WriteOutcome::Committed((seq + 2) >> 1))
    }

    /// Block until the policy is satisfied for the version currently in the
    /// slot. Returns `false` if the region closed while waiting.
    fn wait_for_acks(&self, policy: ReaderWaitPolicy) -> Result<bool> {
        if matches!(policy, ReaderWaitPolicy::Count(0)) {
            return Ok(true);
        }
        let header = self.header();

        loop {
            if self.is_closed() {
                return Ok(false);
            }

            let seq = header.writer_seq.load(Ordering::Acquire);
            if seq == 0 {
                // Nothing published yet; there is no version to wait on.
                return Ok(true);
            }
            let version = seq >> 1;

            let required = match policy {
                ReaderWaitPolicy::All => header.reader_count.load(Ordering::Acquire),
                ReaderWaitPolicy::Count(n) => n as u64,
            };
            if required == 0 {
                return Ok(true);
            }

            // Snapshot before the condition check; any ack or close after
            // this point bumps the word and defeats the sleep.
            let snapshot = header.ack_word.load();
            if self.acks_for(version) >= required {
                return Ok(true);
            }
            header.ack_word.wait(snapshot, None)?;
        }
    }

    fn acks_for(&self, version: u64) -> u64 {
        let state = self.header().ack_state.load(Ordering::Acquire);
        if ack_version(state) == version {
            ack_count(state) as u64
        } else {
            0
        }
    }

    /// Copy the current payload into `out` if its version is newer than
    /// `last_version`. Non-blocking.
    pub fn try_read_into(&self, last_version: u64, out: &mut [u8]) -> Result<ReadStatus> {
        let header = self.header();

        loop {
            let seq_before = header.writer_seq.load(Ordering::Acquire);
            if seq_before & 1 == 1 {
                // Write in progress.
                std::hint::spin_loop();
                continue;
            }

            let version = seq_before >> 1;
            if version == 0 || version == last_version {
                if self.is_closed() {
                    return Ok(ReadStatus::Closed);
                }
                return Ok(ReadStatus::UpToDate);
            }

            let len = header.payload_len.load(Ordering::Acquire) as usize;
            if len > self.capacity {
                return Err(IpcError::IncompatibleRegion(
                    "payload length exceeds the region capacity".to_string(),
                ));
            }
            if len > out.len() {
                return Err(IpcError::PayloadTooLarge {
                    len,
                    capacity: out.len(),
                });
            }

            unsafe {
                ptr::copy_nonoverlapping(self.payload_ptr(), out.as_mut_ptr(), len);
            }

            let seq_after = header.writer_seq.load(Ordering::Acquire);
            if seq_before != seq_after {
                // Torn read; a writer replaced the payload under us.
                std::hint::spin_loop();
                continue;
            }

            self.acknowledge(version);
            return Ok(ReadStatus::NewVersion { version, len });
        }
    }

    /// Like [`try_read_into`], but parks on the region until a new version
    /// arrives, the region closes, or `timeout` elapses (reported as
    /// `UpToDate`).
    ///
    /// [`try_read_into`]: MessageRegion::try_read_into
    pub fn blocking_read_into(
        &self,
        last_version: u64,
        out: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<ReadStatus> {
        let header = self.header();
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let snapshot = header.wait_word.load();
            match self.try_read_into(last_version, out)? {
                ReadStatus::UpToDate => {
                    let remaining = match deadline {
                        Some(deadline) => {
                            let now = Instant::now();
                            if now >= deadline {
                                return Ok(ReadStatus::UpToDate);
                            }
                            Some(deadline - now)
                        }
                        None => None,
                    };
                    if header.wait_word.wait(snapshot, remaining)? == WaitOutcome::TimedOut {
                        return Ok(ReadStatus::UpToDate);
                    }
                }
                status => return Ok(status),
            }
        }
    }

    fn acknowledge(&self, version: u64) {
        let header = self.header();
        header.reader_ack.fetch_max(version, Ordering::AcqRel);

        let mut current = header.ack_state.load(Ordering::Acquire);
        loop {
            let next = if ack_version(current) == version {
                pack_ack(version, ack_count(current).saturating_add(1))
            } else if version > ack_version(current) {
                pack_ack(version, 1)
            } else {
                // A newer version is already being counted; this ack is
                // stale and must not pollute its count.
                break;
            };
            match header.ack_state.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }

        header.ack_word.bump();
        // Writers are serialised, so at most one is parked here.
        header.ack_word.wake(1);
    }

    pub fn close(&self) {
        let header = self.header();
        header.closed.store(1, Ordering::Release);
        header.wait_word.bump();
        header.wait_word.wake_all();
        header.ack_word.bump();
        header.ack_word.wake_all();
        tracing::debug!(region = self.region.name(), "message region closed");
    }
}
