//! Shared memory region management

use crate::platform::validate_object_name;
use crate::{Result, SharedMemoryError};
use memmap2::{MmapMut, MmapOptions};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use std::fs::File;
use std::ptr::NonNull;
use std::time::{Duration, Instant};
use tracing::{debug, instrument};

/// Largest region this crate will create (1GB)
pub const MAX_REGION_SIZE: usize = 1024 * 1024 * 1024;

/// How long an attacher waits for the creator to size a fresh region
pub const DEFAULT_ATTACH_TIMEOUT: Duration = Duration::from_secs(1);

/// Shared memory region handle
///
/// The region outlives the handle: dropping unmaps and closes, it never
/// unlinks. Removing the name is an explicit [`SharedRegion::destroy`].
pub struct SharedRegion {
    /// Region name/identifier
    name: String,
    /// Region size in bytes
    size: usize,
    /// Start of the mapping
    ptr: NonNull<u8>,
    _map: MmapMut,
    _file: File,
    /// Whether this handle created the region
    is_creator: bool,
}

impl SharedRegion {
    /// Create the region, or attach to it if it already exists
    ///
    /// The creator's bytes start zeroed. Attachers must ask for the same
    /// size the creator used.
    pub fn create_or_attach(name: &str, size: usize) -> Result<Self> {
        Self::create_or_attach_within(name, size, DEFAULT_ATTACH_TIMEOUT)
    }

    /// Like [`SharedRegion::create_or_attach`] with an explicit wait for a
    /// concurrent creator that has not sized the region yet
    #[instrument(skip(attach_timeout))]
    pub fn create_or_attach_within(name: &str, size: usize, attach_timeout: Duration) -> Result<Self> {
        validate_object_name(name)?;
        validate_region_size(size)?;

        let flags = OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR;
        match shm_open(name, flags, Mode::S_IRUSR | Mode::S_IWUSR) {
            Ok(fd) => {
                let file = File::from(fd);
                let created = file
                    .set_len(size as u64)
                    .map_err(|e| io_error(e, format!("sizing {}", name)))
                    .and_then(|()| Self::map(name, file, size, true));

                match created {
                    Ok(region) => {
                        debug!("Created shared region {} ({} bytes)", name, size);
                        Ok(region)
                    }
                    Err(e) => {
                        let _ = shm_unlink(name);
                        Err(e)
                    }
                }
            }
            Err(Errno::EEXIST) => Self::attach(name, size, attach_timeout),
            Err(errno) => Err(SharedMemoryError::from_errno(errno as i32, format!("shm_open {}", name))),
        }
    }

    /// Attach to an existing region
    pub fn open(name: &str, size: usize) -> Result<Self> {
        validate_object_name(name)?;
        validate_region_size(size)?;
        Self::attach(name, size, DEFAULT_ATTACH_TIMEOUT)
    }

    /// Remove the name; mappings that already exist stay valid
    pub fn destroy(name: &str) -> Result<()> {
        validate_object_name(name)?;
        shm_unlink(name).map_err(|e| SharedMemoryError::from_errno(e as i32, name))?;
        debug!("Unlinked shared region {}", name);
        Ok(())
    }

    fn attach(name: &str, size: usize, attach_timeout: Duration) -> Result<Self> {
        let fd = shm_open(name, OFlag::O_RDWR, Mode::empty())
            .map_err(|e| SharedMemoryError::from_errno(e as i32, name))?;
        let file = File::from(fd);

        let actual = wait_for_size(&file, attach_timeout)?;
        if actual != size {
            return Err(SharedMemoryError::SizeMismatch {
                name: name.to_string(),
                expected: size,
                actual,
            });
        }

        debug!("Attached to shared region {} ({} bytes)", name, size);
        Self::map(name, file, size, false)
    }

    fn map(name: &str, file: File, size: usize, is_creator: bool) -> Result<Self> {
        let mut map = unsafe { MmapOptions::new().len(size).map_mut(&file) }
            .map_err(|e| io_error(e, format!("mapping {}", name)))?;

        let ptr = NonNull::new(map.as_mut_ptr())
            .ok_or_else(|| SharedMemoryError::Platform("mmap returned null".to_string()))?;

        Ok(Self {
            name: name.to_string(),
            size,
            ptr,
            _map: map,
            _file: file,
            is_creator,
        })
    }

    /// Region name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Region size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether this handle created the region
    pub fn is_creator(&self) -> bool {
        self.is_creator
    }

    /// Copy `buf.len()` bytes starting at `offset` out of the region
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.check_bounds(offset, buf.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    /// Copy `data` into the region at `offset`
    ///
    /// No atomicity: callers serialize writers themselves.
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check_bounds(offset, data.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len());
        }
        Ok(())
    }

    /// Raw pointer to the first byte of the mapping
    pub fn base_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn check_bounds(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(SharedMemoryError::OutOfBounds {
                offset,
                len,
                size: self.size,
            }),
        }
    }
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("is_creator", &self.is_creator)
            .finish()
    }
}

// Safety: the mapping is process-wide and stays valid for the handle's lifetime
unsafe impl Send for SharedRegion {}
// Safety: shared access is raw-byte only; callers synchronize through a gate
unsafe impl Sync for SharedRegion {}

/// Validate region size
fn validate_region_size(size: usize) -> Result<()> {
    if size == 0 || size > MAX_REGION_SIZE {
        return Err(SharedMemoryError::Platform(format!(
            "Invalid region size {}, must be between 1 and {}",
            size, MAX_REGION_SIZE
        )));
    }

    Ok(())
}

/// A freshly created object is zero-length until its creator sizes it
fn wait_for_size(file: &File, timeout: Duration) -> Result<usize> {
    let deadline = Instant::now() + timeout;
    loop {
        let len = file.metadata()?.len() as usize;
        if len != 0 || Instant::now() >= deadline {
            return Ok(len);
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn io_error(err: std::io::Error, context: String) -> SharedMemoryError {
    match err.raw_os_error() {
        Some(errno) => SharedMemoryError::from_errno(errno, context),
        None => SharedMemoryError::Io(err),
    }
}
