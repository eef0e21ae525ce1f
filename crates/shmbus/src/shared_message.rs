//! SharedMessage: a versioned "latest value wins" broadcast register over a
//! named shared-memory region.

use crate::errors::{IpcError, Result};
use crate::layout;
use crate::region::SharedRegion;
use crate::slot::MessageRegion;
use crate::types::{OperationMode, ReadStatus, ReaderWaitPolicy, WriteOutcome};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Depth of the local handoff queues used by the async modes.
const ASYNC_CHANNEL_DEPTH: usize = 64;

/// How often a drainer thread wakes to check for shutdown.
const DRAINER_POLL: Duration = Duration::from_millis(50);

struct Drainer {
    receiver: Mutex<Receiver<(u64, Vec<u8>)>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    stop: Arc<AtomicBool>,
}

/// One participant's handle on a shared message region.
///
/// Several handles (across threads and processes) may target the same name;
/// writers are serialised by a mutex inside the region, readers track their
/// own cursor and see every committed version at most once.
pub struct SharedMessage {
    inner: Arc<MessageRegion>,
    name: String,
    mode: OperationMode,
    policy: ReaderWaitPolicy,
    last_written_version: Arc<AtomicU64>,
    last_read_version: Arc<AtomicU64>,
    scratch: Mutex<Vec<u8>>,
    feeder: Mutex<Option<SyncSender<Vec<u8>>>>,
    feeder_handle: Mutex<Option<JoinHandle<()>>>,
    drainer: Option<Drainer>,
}

impl SharedMessage {
    /// Create (or reset) the named region with room for `size` payload
    /// bytes.
    pub fn create(
        name: &str,
        size: usize,
        mode: OperationMode,
        policy: ReaderWaitPolicy,
    ) -> Result<Self> {
        if size == 0 {
            return Err(IpcError::InvalidArgument(
                "message size must be non-zero".to_string(),
            ));
        }
        let region = SharedRegion::create(name, layout::message_region_size(size))?;
        let inner = MessageRegion::init(region, size)?;
        Self::from_parts(inner, name, mode, policy)
    }

    /// Attach to an existing named region.
    pub fn open(name: &str, mode: OperationMode, policy: ReaderWaitPolicy) -> Result<Self> {
        let region = SharedRegion::open(name)?;
        let inner = MessageRegion::attach(region)?;
        Self::from_parts(inner, name, mode, policy)
    }

    /// Remove the backing region; live handles keep working on their
    /// mappings.
    pub fn unlink(name: &str) -> Result<()> {
        SharedRegion::unlink(name)
    }

    fn from_parts(
        inner: MessageRegion,
        name: &str,
        mode: OperationMode,
        policy: ReaderWaitPolicy,
    ) -> Result<Self> {
        let inner = Arc::new(inner);

        if mode.can_read() {
            inner.reader_attached();
        }

        let mut this = Self {
            inner,
            name: name.to_string(),
            mode,
            policy,
            last_written_version: Arc::new(AtomicU64::new(0)),
            last_read_version: Arc::new(AtomicU64::new(0)),
            scratch: Mutex::new(Vec::new()),
            feeder: Mutex::new(None),
            feeder_handle: Mutex::new(None),
            drainer: None,
        };

        if mode == OperationMode::ReadAsync {
            this.drainer = Some(this.spawn_drainer()?);
        }

        Ok(this)
    }

    /// Publish a payload.
    ///
    /// `WriteSync` commits before returning and reports the new version;
    /// `WriteAsync` hands the payload to the feeder thread and reports
    /// [`WriteOutcome::Enqueued`]. Both report [`WriteOutcome::Closed`]
    /// once the region is closed.
    pub fn write(&self, data: &[u8]) -> Result<WriteOutcome> {
        if !self.mode.can_write() {
            return Err(IpcError::InvalidArgument(
                "handle was not opened for writing".to_string(),
            ));
        }
        if data.len() > self.inner.capacity() {
            return Err(IpcError::PayloadTooLarge {
                len: data.len(),
                capacity: self.inner.capacity(),
            });
        }

        match self.mode {
            OperationMode::WriteAsync => self.write_async(data),
            _ => {
                let outcome = self.inner.write(data, self.policy)?;
                if let WriteOutcome::Committed(version) = outcome {
                    self.last_written_version.store(version, Ordering::Relaxed);
                }
                Ok(outcome)
            }
        }
    }

    fn write_async(&self, data: &[u8]) -> Result<WriteOutcome> {
        if self.inner.is_closed() {
            return Ok(WriteOutcome::Closed);
        }

        // Clone the sender out of the lock: a send into a full channel
        // blocks, and shutdown must be able to take the slot meanwhile.
        let sender = {
            let mut feeder = self.feeder.lock().unwrap();
            match feeder.as_ref() {
                Some(sender) => sender.clone(),
                None => {
                    let (sender, handle) = self.spawn_feeder()?;
                    *self.feeder_handle.lock().unwrap() = Some(handle);
                    *feeder = Some(sender.clone());
                    sender
                }
            }
        };

        match sender.send(data.to_vec()) {
            Ok(()) => Ok(WriteOutcome::Enqueued),
            // The feeder only exits when the region closes.
            Err(_) => Ok(WriteOutcome::Closed),
        }
    }

    fn spawn_feeder(&self) -> Result<(SyncSender<Vec<u8>>, JoinHandle<()>)> {
        let (sender, receiver) = std::sync::mpsc::sync_channel::<Vec<u8>>(ASYNC_CHANNEL_DEPTH);
        let inner = Arc::clone(&self.inner);
        let last_written = Arc::clone(&self.last_written_version);
        let policy = self.policy;
        let name = self.name.clone();

        let handle = std::thread::Builder::new()
            .name("shmbus-feeder".to_string())
            .spawn(move || {
                tracing::debug!(region = %name, "feeder thread started");
                while let Ok(first) = receiver.recv() {
                    // The slot is latest-value-wins: coalesce the backlog
                    // down to the newest pending payload.
                    let data = receiver.try_iter().last().unwrap_or(first);
                    match inner.write(&data, policy) {
                        Ok(WriteOutcome::Committed(version)) => {
                            last_written.store(version, Ordering::Relaxed);
                        }
                        Ok(_) => break,
                        Err(e) => {
                            tracing::warn!(region = %name, error = %e, "async write failed");
                            break;
                        }
                    }
                }
                tracing::debug!(region = %name, "feeder thread exiting");
            })?;

        Ok((sender, handle))
    }

    fn spawn_drainer(&self) -> Result<Drainer> {
        let (sender, receiver) = std::sync::mpsc::sync_channel::<(u64, Vec<u8>)>(ASYNC_CHANNEL_DEPTH);
        let inner = Arc::clone(&self.inner);
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let name = self.name.clone();

        let handle = std::thread::Builder::new()
            .name("shmbus-drainer".to_string())
            .spawn(move || {
                tracing::debug!(region = %name, "drainer thread started");
                let mut cursor = 0u64;
                let mut scratch = vec![0u8; inner.capacity()];

                while !stop_flag.load(Ordering::Relaxed) {
                    match inner.blocking_read_into(cursor, &mut scratch, Some(DRAINER_POLL)) {
                        Ok(ReadStatus::NewVersion { version, len }) => {
                            cursor = version;
                            let mut item = (version, scratch[..len].to_vec());
                            loop {
                                match sender.try_send(item) {
                                    Ok(()) => break,
                                    Err(TrySendError::Full(back)) => {
                                        if stop_flag.load(Ordering::Relaxed) {
                                            return;
                                        }
                                        item = back;
                                        std::thread::sleep(Duration::from_millis(1));
                                    }
                                    Err(TrySendError::Disconnected(_)) => return,
                                }
                            }
                        }
                        // Poll timeout; loop around to honor the stop flag.
                        Ok(ReadStatus::UpToDate) => {}
                        Ok(ReadStatus::Closed) => break,
                        Err(e) => {
                            tracing::warn!(region = %name, error = %e, "drainer read failed");
                            break;
                        }
                    }
                }
                tracing::debug!(region = %name, "drainer thread exiting");
            })?;

        Ok(Drainer {
            receiver: Mutex::new(receiver),
            handle: Mutex::new(Some(handle)),
            stop,
        })
    }

    /// Read the next unseen version.
    ///
    /// Returns `None` when no new version exists (non-blocking) or when the
    /// region is closed and fully consumed.
    pub fn read(&self, block: bool) -> Result<Option<Vec<u8>>> {
        if !self.mode.can_read() {
            return Err(IpcError::InvalidArgument(
                "handle was not opened for reading".to_string(),
            ));
        }

        match &self.drainer {
            Some(drainer) => {
                let receiver = drainer.receiver.lock().unwrap();
                let item = if block {
                    receiver.recv().ok()
                } else {
                    receiver.try_recv().ok()
                };
                Ok(item.map(|(version, bytes)| {
                    self.last_read_version.store(version, Ordering::Relaxed);
                    bytes
                }))
            }
            None => {
                let mut scratch = self.scratch.lock().unwrap();
                if scratch.len() < self.inner.capacity() {
                    scratch.resize(self.inner.capacity(), 0);
                }
                let last = self.last_read_version.load(Ordering::Relaxed);
                let status = if block {
                    self.inner
                        .blocking_read_into(last, scratch.as_mut_slice(), None)?
                } else {
                    self.inner.try_read_into(last, scratch.as_mut_slice())?
                };
                match status {
                    ReadStatus::NewVersion { version, len } => {
                        self.last_read_version.store(version, Ordering::Relaxed);
                        Ok(Some(scratch[..len].to_vec()))
                    }
                    _ => Ok(None),
                }
            }
        }
    }

    /// Non-blocking read into a caller-provided buffer, avoiding the
    /// allocation of [`read`].
    ///
    /// Unavailable in `ReadAsync` mode, where payloads travel through the
    /// drainer's queue.
    ///
    /// [`read`]: SharedMessage::read
    pub fn read_into(&self, out: &mut [u8]) -> Result<ReadStatus> {
        if !self.mode.can_read() {
            return Err(IpcError::InvalidArgument(
                "handle was not opened for reading".to_string(),
            ));
        }
        if self.drainer.is_some() {
            return Err(IpcError::InvalidArgument(
                "read_into is unavailable in ReadAsync mode".to_string(),
            ));
        }

        let last = self.last_read_version.load(Ordering::Relaxed);
        let status = self.inner.try_read_into(last, out)?;
        if let ReadStatus::NewVersion { version, .. } = status {
            self.last_read_version.store(version, Ordering::Relaxed);
        }
        Ok(status)
    }

    /// Whether a version newer than this handle's cursor has been
    /// committed.
    pub fn is_new_version_available(&self) -> Result<bool> {
        if !self.mode.can_read() {
            return Err(IpcError::InvalidArgument(
                "handle was not opened for reading".to_string(),
            ));
        }
        let version = self.inner.version();
        Ok(version != 0 && version != self.last_read_version.load(Ordering::Relaxed))
    }

    /// Version of the last write committed through this handle.
    pub fn last_written_version(&self) -> u64 {
        self.last_written_version.load(Ordering::Relaxed)
    }

    /// Version of the last read consumed through this handle.
    pub fn last_read_version(&self) -> u64 {
        self.last_read_version.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Size of the backing region in bytes (header included).
    pub fn memory_size(&self) -> usize {
        self.inner.region_len()
    }

    /// Payload bytes available per version.
    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Publish the closed flag, wake every blocked participant and join
    /// this handle's worker threads.
    pub fn close(&self) -> Result<()> {
        if !self.mode.can_write() {
            return Err(IpcError::InvalidArgument(
                "handle was not opened for writing".to_string(),
            ));
        }
        self.inner.close();
        self.shutdown_threads();
        Ok(())
    }

    fn shutdown_threads(&self) {
        // Dropping the sender ends the feeder's recv loop.
        drop(self.feeder.lock().unwrap().take());
        if let Some(handle) = self.feeder_handle.lock().unwrap().take() {
            let _ = handle.join();
        }

        if let Some(drainer) = &self.drainer {
            drainer.stop.store(true, Ordering::Relaxed);
            if let Some(handle) = drainer.handle.lock().unwrap().take() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for SharedMessage {
    fn drop(&mut self) {
        self.shutdown_threads();
        if self.mode.can_read() {
            self.inner.reader_detached();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    static TEST_ID: AtomicUsize = AtomicUsize::new(0);

    fn unique_name() -> String {
        format!(
            "/shmbus_msg_test_{}_{}",
            std::process::id(),
            TEST_ID.fetch_add(1, Ordering::SeqCst)
        )
    }

    #[test]
    fn write_requires_a_writing_mode() {
        let name = unique_name();
        let reader = SharedMessage::create(
            &name,
            64,
            OperationMode::ReadSync,
            ReaderWaitPolicy::Count(0),
        )
        .unwrap();

        assert!(matches!(
            reader.write(b"nope"),
            Err(IpcError::InvalidArgument(_))
        ));
        assert!(matches!(
            reader.close(),
            Err(IpcError::InvalidArgument(_))
        ));

        SharedMessage::unlink(&name).unwrap();
    }

    #[test]
    fn read_requires_a_reading_mode() {
        let name = unique_name();
        let writer = SharedMessage::create(
            &name,
            64,
            OperationMode::WriteSync,
            ReaderWaitPolicy::Count(0),
        )
        .unwrap();

        assert!(matches!(
            writer.read(false),
            Err(IpcError::InvalidArgument(_))
        ));
        assert!(matches!(
            writer.is_new_version_available(),
            Err(IpcError::InvalidArgument(_))
        ));

        SharedMessage::unlink(&name).unwrap();
    }

    #[test]
    fn zero_size_creation_is_rejected() {
        assert!(matches!(
            SharedMessage::create(
                "/shmbus_msg_zero",
                0,
                OperationMode::WriteSync,
                ReaderWaitPolicy::Count(0)
            ),
            Err(IpcError::InvalidArgument(_))
        ));
    }

    #[test]
    fn open_of_missing_region_fails() {
        assert!(matches!(
            SharedMessage::open(
                "/shmbus_msg_absent",
                OperationMode::ReadSync,
                ReaderWaitPolicy::Count(0)
            ),
            Err(IpcError::NotFound(_))
        ));
    }

    #[test]
    fn per_instance_counters_track_this_handle() {
        let name = unique_name();
        let writer = SharedMessage::create(
            &name,
            64,
            OperationMode::WriteSync,
            ReaderWaitPolicy::Count(0),
        )
        .unwrap();
        let reader = SharedMessage::open(
            &name,
            OperationMode::ReadSync,
            ReaderWaitPolicy::Count(0),
        )
        .unwrap();

        writer.write(b"one").unwrap();
        writer.write(b"two").unwrap();
        assert_eq!(writer.last_written_version(), 2);
        assert_eq!(writer.last_read_version(), 0);

        assert!(reader.is_new_version_available().unwrap());
        assert_eq!(reader.read(false).unwrap().unwrap(), b"two");
        assert_eq!(reader.last_read_version(), 2);
        assert!(!reader.is_new_version_available().unwrap());

        SharedMessage::unlink(&name).unwrap();
    }

    #[test]
    fn read_into_spares_the_allocation() {
        let name = unique_name();
        let writer = SharedMessage::create(
            &name,
            64,
            OperationMode::WriteSync,
            ReaderWaitPolicy::Count(0),
        )
        .unwrap();
        let reader = SharedMessage::open(
            &name,
            OperationMode::ReadSync,
            ReaderWaitPolicy::Count(0),
        )
        .unwrap();

        let mut buf = [0u8; 64];
        assert_eq!(reader.read_into(&mut buf).unwrap(), ReadStatus::UpToDate);

        writer.write(b"payload").unwrap();
        assert_eq!(
            reader.read_into(&mut buf).unwrap(),
            ReadStatus::NewVersion { version: 1, len: 7 }
        );
        assert_eq!(&buf[..7], b"payload");

        SharedMessage::unlink(&name).unwrap();
    }

    #[test]
    fn memory_size_is_page_rounded_and_capacity_is_exact() {
        let name = unique_name();
        let writer = SharedMessage::create(
            &name,
            100,
            OperationMode::WriteSync,
            ReaderWaitPolicy::Count(0),
        )
        .unwrap();

        assert_eq!(writer.capacity(), 100);
        assert!(writer.memory_size() > 100);
        assert!(matches!(
            writer.write(&[0u8; 101]),
            Err(IpcError::PayloadTooLarge { len: 101, .. })
        ));

        SharedMessage::unlink(&name).unwrap();
    }
}
