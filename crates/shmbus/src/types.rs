/// How a [`SharedMessage`](crate::SharedMessage) handle participates in the
/// exchange.
///
/// A handle is either a reader or a writer; the async variants move the
/// shared-memory side of the operation onto a dedicated thread owned by the
/// handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationMode {
    /// `read(true)` blocks on the region, `read(false)` polls.
    ReadSync,
    /// A drainer thread follows the region and buffers versions locally.
    ReadAsync,
    /// `write` commits to the region before returning.
    WriteSync,
    /// `write` enqueues; a feeder thread commits in the background.
    WriteAsync,
}

impl OperationMode {
    pub fn can_read(self) -> bool {
        matches!(self, OperationMode::ReadSync | OperationMode::ReadAsync)
    }

    pub fn can_write(self) -> bool {
        matches!(self, OperationMode::WriteSync | OperationMode::WriteAsync)
    }
}

/// Access mode of a [`SharedCircularQueue`](crate::SharedCircularQueue)
/// handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl OpenMode {
    pub fn can_read(self) -> bool {
        matches!(self, OpenMode::ReadOnly | OpenMode::ReadWrite)
    }

    pub fn can_write(self) -> bool {
        matches!(self, OpenMode::WriteOnly | OpenMode::ReadWrite)
    }
}

/// What a writer waits for before replacing the current version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderWaitPolicy {
    /// Wait until every attached reader has consumed the current version.
    All,
    /// Wait until `n` readers have consumed it; `Count(0)` never waits
    /// (fire-and-forget).
    Count(u32),
}

/// Result of a [`SharedMessage::write`](crate::SharedMessage::write).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The payload was committed as this version.
    Committed(u64),
    /// The payload was handed to the feeder thread (`WriteAsync`).
    Enqueued,
    /// The region is closed; nothing was written.
    Closed,
}

impl WriteOutcome {
    pub fn version(self) -> Option<u64> {
        match self {
            WriteOutcome::Committed(version) => Some(version),
            _ => None,
        }
    }

    pub fn is_closed(self) -> bool {
        matches!(self, WriteOutcome::Closed)
    }
}

/// Result of a read against a message region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// A version newer than the caller's cursor was copied out.
    NewVersion { version: u64, len: usize },
    /// No version newer than the caller's cursor exists.
    UpToDate,
    /// The region is closed and fully consumed.
    Closed,
}
