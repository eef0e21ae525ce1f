//! Binary layout of the shared region headers.
//!
//! SAFETY & MEMORY ORDERING:
//!
//! Both headers sit at offset 0 of their region and are accessed
//! concurrently from several processes. All multi-byte fields are atomics
//! at their natural alignment; `#[repr(C, align(8))]` pins the layout so
//! independent mappings agree on every offset. Integers are little-endian
//! by virtue of the target platform; the magic number doubles as a protocol
//! and endianness check.
//!
//! Writer protocol (message): bump `writer_seq` to odd, write the payload,
//! then bump to even, both bumps with `Release`. Readers pair them with
//! `Acquire` loads and retry on an odd or changed sequence, which rules out
//! torn payloads.

use crate::futex::{RegionMutex, WaitWord};
use std::mem::{align_of, size_of};
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, AtomicU8};

pub(crate) const MESSAGE_MAGIC: u32 = u32::from_le_bytes(*b"SMSG");
pub(crate) const QUEUE_MAGIC: u32 = u32::from_le_bytes(*b"SCQ1");

/// Header of a [`SharedMessage`](crate::SharedMessage) region.
#[repr(C, align(8))]
pub(crate) struct MessageHeader {
    pub magic: AtomicU32,
    /// Serialises writers; steps 2-6 of the write protocol run under it.
    pub writer_lock: RegionMutex,
    /// Payload bytes available after the header.
    pub capacity: AtomicU64,
    /// Seqlock word: even = stable, odd = write in progress. The
    /// user-visible version is `writer_seq / 2`.
    pub writer_seq: AtomicU64,
    pub payload_len: AtomicU64,
    /// Highest version fully consumed by some reader (fetch-max).
    pub reader_ack: AtomicU64,
    /// Packed `(version << 16) | count`: how many readers acknowledged the
    /// version currently in the slot.
    pub ack_state: AtomicU64,
    /// Attached readers, best-effort (incremented on open, decremented on
    /// drop).
    pub reader_count: AtomicU64,
    pub closed: AtomicU8,
    _pad0: [u8; 3],
    /// Readers park here; holds the low 32 bits of the committed sequence.
    pub wait_word: WaitWord,
    /// Writers enforcing a wait policy park here; bumped on every ack.
    pub ack_word: WaitWord,
    _pad1: u32,
}

const _: () = assert!(size_of::<MessageHeader>() == 72);
const _: () = assert!(align_of::<MessageHeader>() == 8);

/// Header of a [`SharedCircularQueue`](crate::SharedCircularQueue) region.
///
/// Followed by one `u16` state per slot (padded to 8 bytes), then
/// `capacity * element_stride` bytes of slot data. `head` and `tail` are
/// free-running tickets; the slot index is the ticket modulo `capacity`.
#[repr(C, align(8))]
pub(crate) struct QueueHeader {
    pub magic: AtomicU32,
    _pad0: u32,
    pub max_element_size: AtomicU64,
    /// Bytes per slot: 8-byte length prefix + max element size, rounded up
    /// to 8.
    pub element_stride: AtomicU64,
    /// Number of slots.
    pub capacity: AtomicU64,
    pub head: AtomicU64,
    pub tail: AtomicU64,
    pub closed: AtomicU8,
    _pad1: [u8; 3],
    pub not_empty_word: WaitWord,
    pub not_full_word: WaitWord,
    _pad2: u32,
}

const _: () = assert!(size_of::<QueueHeader>() == 64);
const _: () = assert!(align_of::<QueueHeader>() == 8);

/// Per-slot lifecycle: `EMPTY -> WRITING -> READY -> READING -> EMPTY`.
/// No other transition is legal.
pub(crate) const SLOT_EMPTY: u16 = 0;
pub(crate) const SLOT_WRITING: u16 = 1;
pub(crate) const SLOT_READY: u16 = 2;
pub(crate) const SLOT_READING: u16 = 3;

pub(crate) type SlotState = AtomicU16;

pub(crate) const LEN_PREFIX: usize = 8;

const ACK_COUNT_BITS: u32 = 16;
const ACK_COUNT_MASK: u64 = (1u64 << ACK_COUNT_BITS) - 1;

pub(crate) fn pack_ack(version: u64, count: u16) -> u64 {
    (version << ACK_COUNT_BITS) | count as u64
}

pub(crate) fn ack_version(state: u64) -> u64 {
    state >> ACK_COUNT_BITS
}

pub(crate) fn ack_count(state: u64) -> u16 {
    (state & ACK_COUNT_MASK) as u16
}

fn align8(value: usize) -> usize {
    (value + 7) & !7
}

/// Total bytes needed for a message region with `capacity` payload bytes.
pub(crate) fn message_region_size(capacity: usize) -> usize {
    size_of::<MessageHeader>() + capacity
}

pub(crate) fn message_payload_offset() -> usize {
    size_of::<MessageHeader>()
}

pub(crate) fn element_stride(max_element_size: usize) -> usize {
    align8(LEN_PREFIX + max_element_size)
}

pub(crate) fn queue_states_offset() -> usize {
    size_of::<QueueHeader>()
}

pub(crate) fn queue_slots_offset(capacity: usize) -> usize {
    align8(queue_states_offset() + capacity * size_of::<u16>())
}

/// Total bytes needed for a queue of `capacity` slots of
/// `max_element_size` bytes each.
pub(crate) fn queue_region_size(max_element_size: usize, capacity: usize) -> usize {
    queue_slots_offset(capacity) + capacity * element_stride(max_element_size)
}
