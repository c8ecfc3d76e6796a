//! Local port discovery through a named POSIX shared-memory segment.
//!
//! The coordinator writes its bound UDP port into a small segment with a
//! well-known name; workers on the same host read it before every assignment
//! request. A coordinator restart on a new port therefore needs no worker
//! reconfiguration.
//!
//! Segment layout: `[port:u16 big-endian]`, zero meaning "not published".

use std::io;

/// Well-known name of the local port segment.
pub const LOCAL_PORT_SEGMENT: &str = "/waypost-domain.port";

/// Size of the mapped segment.
#[cfg(target_os = "linux")]
const SEGMENT_SIZE: usize = 8;

/// Handle to a published port. Dropping it unlinks the segment.
#[derive(Debug)]
pub struct LocalPortSegment {
    name: String,
}

impl LocalPortSegment {
    /// Create (or overwrite) the segment `name` and write `port` into it.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the segment cannot be created or mapped, and
    /// `Unsupported` on platforms without POSIX shared memory.
    pub fn publish(name: &str, port: u16) -> io::Result<Self> {
        sys::write_port(name, port)?;
        tracing::debug!(segment = name, port, "published local port");
        Ok(Self {
            name: name.to_string(),
        })
    }

    /// Name of the segment.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for LocalPortSegment {
    fn drop(&mut self) {
        sys::unlink(&self.name);
    }
}

/// Read the port published under `name`.
///
/// Returns `Ok(None)` when no segment exists or it holds no port.
pub fn read_local_port(name: &str) -> io::Result<Option<u16>> {
    sys::read_port(name)
}

#[cfg(target_os = "linux")]
mod sys {
    use std::ffi::CString;
    use std::io;

    use super::SEGMENT_SIZE;

    fn c_name(name: &str) -> io::Result<CString> {
        CString::new(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
    }

    /// Map `fd` for `prot`, run `f` on the mapping, then unmap and close.
    fn with_mapping<R>(
        fd: libc::c_int,
        prot: libc::c_int,
        f: impl FnOnce(*mut u8) -> R,
    ) -> io::Result<R> {
        // Safety: fd is a valid shared-memory descriptor sized to at least
        // SEGMENT_SIZE. The mapping is private to this call.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                SEGMENT_SIZE,
                prot,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            // Safety: fd was returned by shm_open and is closed exactly once.
            unsafe { libc::close(fd) };
            return Err(err);
        }
        let result = f(ptr as *mut u8);
        // Safety: ptr/SEGMENT_SIZE come from the successful mmap above.
        unsafe {
            libc::munmap(ptr, SEGMENT_SIZE);
            libc::close(fd);
        }
        Ok(result)
    }

    pub(super) fn write_port(name: &str, port: u16) -> io::Result<()> {
        let c_name = c_name(name)?;
        // Safety: c_name is a valid NUL-terminated string.
        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_RDWR,
                0o600 as libc::mode_t,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // Safety: fd is a valid descriptor from shm_open.
        if unsafe { libc::ftruncate(fd, SEGMENT_SIZE as libc::off_t) } != 0 {
            let err = io::Error::last_os_error();
            // Safety: closing the descriptor we own.
            unsafe { libc::close(fd) };
            return Err(err);
        }
        with_mapping(fd, libc::PROT_READ | libc::PROT_WRITE, |ptr| {
            let bytes = port.to_be_bytes();
            // Safety: the mapping is SEGMENT_SIZE >= 2 bytes and writable.
            unsafe {
                *ptr = bytes[0];
                *ptr.add(1) = bytes[1];
            }
        })
    }

    pub(super) fn read_port(name: &str) -> io::Result<Option<u16>> {
        let c_name = c_name(name)?;
        // Safety: c_name is a valid NUL-terminated string.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDONLY, 0 as libc::mode_t) };
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::NotFound {
                return Ok(None);
            }
            return Err(err);
        }
        let port = with_mapping(fd, libc::PROT_READ, |ptr| {
            // Safety: the mapping is SEGMENT_SIZE >= 2 bytes and readable.
            unsafe { u16::from_be_bytes([*ptr, *ptr.add(1)]) }
        })?;
        Ok((port != 0).then_some(port))
    }

    pub(super) fn unlink(name: &str) {
        if let Ok(c_name) = c_name(name) {
            // Safety: c_name is a valid NUL-terminated string.
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod sys {
    use std::io;

    fn unsupported() -> io::Error {
        io::Error::new(
            io::ErrorKind::Unsupported,
            "local port discovery requires POSIX shared memory",
        )
    }

    pub(super) fn write_port(_name: &str, _port: u16) -> io::Result<()> {
        Err(unsupported())
    }

    pub(super) fn read_port(_name: &str) -> io::Result<Option<u16>> {
        Err(unsupported())
    }

    pub(super) fn unlink(_name: &str) {}
}
