use std::{io, ptr::NonNull};

pub const OS_PAGE_SIZE: usize = 4096;

/// Page protection of a fresh mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadWrite,
    ReadWriteExecute,
}

impl Access {
    pub fn new(executable: bool) -> Self {
        if executable {
            Self::ReadWriteExecute
        } else {
            Self::ReadWrite
        }
    }
}

#[cfg(unix)]
mod unix {
    use core::ffi::c_void;

    pub const PROT_READ: i32 = 0x1;
    pub const PROT_WRITE: i32 = 0x2;
    pub const PROT_EXEC: i32 = 0x4;

    pub const MAP_PRIVATE: i32 = 0x02;
    #[cfg(target_os = "linux")]
    pub const MAP_ANON: i32 = 0x20;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    pub const MAP_ANON: i32 = 0x1000;

    pub const MAP_FAILED: isize = -1;

    unsafe extern "C" {
        pub fn mmap(
            addr: *mut c_void,
            length: usize,
            prot: i32,
            flags: i32,
            fd: i32,
            offset: isize,
        ) -> *mut c_void;

        pub fn munmap(addr: *mut c_void, length: usize) -> i32;
    }
}

/// Maps `size` bytes of zeroed anonymous memory.
#[must_use]
pub fn map_memory(size: usize, access: Access) -> Option<NonNull<u8>> {
    debug_assert!(size.is_multiple_of(OS_PAGE_SIZE));
    let prot = match access {
        Access::ReadWrite => unix::PROT_READ | unix::PROT_WRITE,
        Access::ReadWriteExecute => unix::PROT_READ | unix::PROT_WRITE | unix::PROT_EXEC,
    };
    // SAFETY: anonymous private mapping at a kernel-chosen address
    let ptr = unsafe {
        unix::mmap(
            core::ptr::null_mut(),
            size,
            prot,
            unix::MAP_PRIVATE | unix::MAP_ANON,
            -1,
            0,
        )
    };
    if ptr as isize == unix::MAP_FAILED {
        log::warn!(
            "mmap of {size} bytes ({access:?}) failed: {}",
            io::Error::last_os_error()
        );
        return None;
    }
    NonNull::new(ptr.cast())
}

/// Unmaps a range previously returned by [`map_memory`], or a page-aligned
/// piece of one.
pub fn unmap_memory(ptr: NonNull<u8>, size: usize) {
    // SAFETY: callers only pass ranges inside their own mappings
    let rc = unsafe { unix::munmap(ptr.as_ptr().cast(), size) };
    if rc != 0 {
        log::warn!(
            "munmap of {size} bytes at {ptr:p} failed: {}",
            io::Error::last_os_error()
        );
    }
}
