// Shared memory backend abstraction for Linux
// Named segments live under /dev/shm so unrelated processes can map them by name

use std::fmt::Debug;
use std::io;

/// Shared memory backend trait for cross-platform memory mapping
pub trait SharedMemoryBackend: Send + Sync + Debug {
    /// Get a pointer to the mapped memory region
    fn as_ptr(&self) -> *mut u8;

    /// Get the size of the mapped region in bytes
    fn size(&self) -> usize;

    /// Get the underlying file descriptor
    fn raw_handle(&self) -> RawHandle;

    /// Name the segment was created or attached under
    fn name(&self) -> &str;
}

/// Platform-specific handle type
#[derive(Debug, Clone, Copy)]
pub enum RawHandle {
    /// Unix file descriptor (Linux)
    Fd(i32),
}

/// Create a new named shared memory region with the specified size.
///
/// An existing segment of the same name is truncated and re-sized.
///
/// # Arguments
/// * `size` - Size of the shared memory region in bytes
/// * `name` - Name of the region under `/dev/shm`
#[cfg(target_os = "linux")]
pub fn create_shared_memory(size: usize, name: &str) -> io::Result<Box<dyn SharedMemoryBackend>> {
    Ok(Box::new(LinuxSharedMemory::create(size, name)?))
}

/// Attach to an existing named shared memory region.
///
/// The mapping covers the whole segment as sized by its creator.
#[cfg(target_os = "linux")]
pub fn attach_shared_memory(name: &str) -> io::Result<Box<dyn SharedMemoryBackend>> {
    Ok(Box::new(LinuxSharedMemory::attach(name)?))
}

/// Unlink a named region. Existing mappings stay valid until dropped.
#[cfg(target_os = "linux")]
pub fn remove_shared_memory(name: &str) -> io::Result<()> {
    match std::fs::remove_file(shm_path(name)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(not(target_os = "linux"))]
pub fn create_shared_memory(_size: usize, _name: &str) -> io::Result<Box<dyn SharedMemoryBackend>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "Shared memory only supported on Linux",
    ))
}

#[cfg(not(target_os = "linux"))]
pub fn attach_shared_memory(_name: &str) -> io::Result<Box<dyn SharedMemoryBackend>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "Shared memory only supported on Linux",
    ))
}

#[cfg(not(target_os = "linux"))]
pub fn remove_shared_memory(_name: &str) -> io::Result<()> {
    Ok(())
}

#[cfg(target_os = "linux")]
fn shm_path(name: &str) -> String {
    format!("/dev/shm/{}", name)
}

#[cfg(target_os = "linux")]
use std::{
    fs::{File, OpenOptions},
    os::fd::{AsRawFd, IntoRawFd},
    os::unix::fs::OpenOptionsExt,
    ptr::NonNull,
};

#[cfg(target_os = "linux")]
#[derive(Debug)]
pub struct LinuxSharedMemory {
    ptr: NonNull<u8>,
    size: usize,
    fd: i32,
    name: String,
}

#[cfg(target_os = "linux")]
unsafe impl Send for LinuxSharedMemory {}
#[cfg(target_os = "linux")]
unsafe impl Sync for LinuxSharedMemory {}

#[cfg(target_os = "linux")]
impl LinuxSharedMemory {
    /// Create (or truncate) a region in /dev/shm and map it read-write.
    pub fn create(size: usize, name: &str) -> io::Result<Self> {
        if size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "shared memory size must be greater than 0",
            ));
        }

        let path = shm_path(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)
            .map_err(|e| {
                io::Error::new(
                    e.kind(),
                    format!("Failed to create shared memory file at {}: {}", path, e),
                )
            })?;

        file.set_len(size as u64)?;

        tracing::debug!(name, size, "created shared memory segment");
        Self::map(file, size, name)
    }

    /// Open an existing region in /dev/shm and map all of it.
    pub fn attach(name: &str) -> io::Result<Self> {
        let path = shm_path(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| {
                io::Error::new(
                    e.kind(),
                    format!("Failed to open shared memory at {}: {}", path, e),
                )
            })?;

        let size = file.metadata()?.len() as usize;
        if size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Shared memory at {} is empty", path),
            ));
        }

        tracing::debug!(name, size, "attached shared memory segment");
        Self::map(file, size, name)
    }

    fn map(file: File, size: usize, name: &str) -> io::Result<Self> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let ptr = NonNull::new(ptr as *mut u8)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))?;

        // Keep the file descriptor alive for raw_handle()
        let fd = file.into_raw_fd();

        Ok(Self {
            ptr,
            size,
            fd,
            name: name.to_string(),
        })
    }
}

#[cfg(target_os = "linux")]
impl Drop for LinuxSharedMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
            libc::close(self.fd);
        }
    }
}

#[cfg(target_os = "linux")]
impl SharedMemoryBackend for LinuxSharedMemory {
    fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn size(&self) -> usize {
        self.size
    }

    fn raw_handle(&self) -> RawHandle {
        RawHandle::Fd(self.fd)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
