//! Named shared-memory regions under `/dev/shm`.
//!
//! A region is an OS-named byte buffer that every participant maps
//! independently. Names follow the POSIX convention of a single leading
//! slash (`/sensors.frame`); they resolve to files in `/dev/shm`. Regions
//! outlive their handles and are removed only by an explicit [`unlink`].
//!
//! [`unlink`]: SharedRegion::unlink

use crate::errors::{IpcError, Result};
use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;

const SHM_DIR: &str = "/dev/shm";

/// An owned mapping of a named shared-memory region.
///
/// Dropping the handle unmaps the region but never unlinks it; the backing
/// object persists until [`SharedRegion::unlink`] is called.
#[derive(Debug)]
pub struct SharedRegion {
    name: String,
    ptr: *mut u8,
    len: usize,
    _mmap: MmapMut,
    _file: File,
}

// The raw pointer targets a MAP_SHARED mapping whose concurrent use is
// governed by the atomic protocols layered on top.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Create (or reset) a region of at least `size` bytes, zero-filled.
    ///
    /// The size is rounded up to the page size. An existing object with the
    /// same name is truncated and reset.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        let path = object_path(name)?;
        if size == 0 {
            return Err(IpcError::InvalidArgument(
                "region size must be non-zero".to_string(),
            ));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)?;

        Self::init_mapping(name, file, size)
    }

    /// Strict variant of [`create`]: fails with `AlreadyExists` if an object
    /// with this name is already present.
    ///
    /// [`create`]: SharedRegion::create
    pub fn create_exclusive(name: &str, size: usize) -> Result<Self> {
        let path = object_path(name)?;
        if size == 0 {
            return Err(IpcError::InvalidArgument(
                "region size must be non-zero".to_string(),
            ));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)
            .map_err(|e| {
                if e.kind() == io::ErrorKind::AlreadyExists {
                    IpcError::AlreadyExists(name.to_string())
                } else {
                    IpcError::Io(e)
                }
            })?;

        Self::init_mapping(name, file, size)
    }

    /// Map an existing region at its current size.
    pub fn open(name: &str) -> Result<Self> {
        let path = object_path(name)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| {
                if e.kind() == io::ErrorKind::NotFound {
                    IpcError::NotFound(name.to_string())
                } else {
                    IpcError::Io(e)
                }
            })?;

        let len = file.metadata()?.len() as usize;
        if len == 0 {
            return Err(IpcError::IncompatibleRegion(format!(
                "region {name} has zero size"
            )));
        }

        let mut mmap = unsafe { MmapOptions::new().map_mut(&file)? };
        let ptr = mmap.as_mut_ptr();

        tracing::debug!(name, size = len, "opened shared memory region");

        Ok(Self {
            name: name.to_string(),
            ptr,
            len,
            _mmap: mmap,
            _file: file,
        })
    }

    /// Remove the named object. Existing mappings stay valid until dropped.
    pub fn unlink(name: &str) -> Result<()> {
        let path = object_path(name)?;
        std::fs::remove_file(&path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                IpcError::NotFound(name.to_string())
            } else {
                IpcError::Io(e)
            }
        })?;
        tracing::debug!(name, "unlinked shared memory region");
        Ok(())
    }

    fn init_mapping(name: &str, file: File, size: usize) -> Result<Self> {
        let len = round_to_page(size);
        file.set_len(len as u64)?;

        let mut mmap = unsafe { MmapOptions::new().map_mut(&file)? };
        let ptr = mmap.as_mut_ptr();

        tracing::debug!(name, size = len, "created shared memory region");

        Ok(Self {
            name: name.to_string(),
            ptr,
            len,
            _mmap: mmap,
            _file: file,
        })
    }

    /// Mapped size in bytes (page-rounded).
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }
}

fn object_path(name: &str) -> Result<PathBuf> {
    let stem = name.strip_prefix('/').unwrap_or(name);
    if stem.is_empty() {
        return Err(IpcError::InvalidArgument(
            "region name cannot be empty".to_string(),
        ));
    }
    if stem.contains('/') {
        return Err(IpcError::InvalidArgument(format!(
            "region name {name} may only contain a leading slash"
        )));
    }
    Ok(PathBuf::from(SHM_DIR).join(stem))
}

fn page_size() -> usize {
    let value = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if value <= 0 {
        4096
    } else {
        value as usize
    }
}

fn round_to_page(size: usize) -> usize {
    size.div_ceil(page_size()) * page_size()
}
