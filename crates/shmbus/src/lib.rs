//! Shared-memory IPC primitives for cooperating processes.
//!
//! Two primitives map over a named region of OS-backed shared memory:
//!
//! - [`SharedMessage`]: a single-slot, versioned "latest value wins"
//!   broadcast register. Writers publish whole byte payloads; every reader
//!   observes each committed version at most once. A configurable
//!   wait-for-readers policy lets a writer pace itself against its
//!   audience, and async modes move the blocking side onto a thread owned
//!   by the handle.
//! - [`SharedCircularQueue`]: a bounded multi-producer / multi-consumer
//!   FIFO of fixed-capacity byte elements.
//!
//! All coordination lives inside the region itself: a seqlock over the
//! message payload, ticket counters and per-slot states for the queue, and
//! futex words for cross-process blocking. No state is shared through the
//! participants beyond the mapping, so any mix of threads and processes
//! can cooperate, and a crashed participant never leaves the others
//! holding a lock they cannot observe.
//!
//! ```no_run
//! use shmbus::{OperationMode, ReaderWaitPolicy, SharedMessage};
//!
//! let writer = SharedMessage::create(
//!     "/sensors.frame",
//!     4096,
//!     OperationMode::WriteSync,
//!     ReaderWaitPolicy::Count(0),
//! )?;
//! let reader = SharedMessage::open(
//!     "/sensors.frame",
//!     OperationMode::ReadSync,
//!     ReaderWaitPolicy::Count(0),
//! )?;
//!
//! writer.write(b"hello")?;
//! assert_eq!(reader.read(false)?.as_deref(), Some(b"hello".as_slice()));
//! # Ok::<(), shmbus::IpcError>(())
//! ```

pub mod batch;
pub mod errors;
mod futex;
mod layout;
pub mod region;
mod ring;
pub mod shared_message;
pub mod shared_queue;
mod slot;
pub mod types;

pub use batch::{read_all, read_all_map};
pub use errors::{IpcError, Result};
pub use region::SharedRegion;
pub use shared_message::SharedMessage;
pub use shared_queue::SharedCircularQueue;
pub use types::{OpenMode, OperationMode, ReadStatus, ReaderWaitPolicy, WriteOutcome};
