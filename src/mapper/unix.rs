//! `mmap`/`mprotect`-based reservation via direct `libc` calls.

use crate::error::{Error, Result};

pub unsafe fn reserve(len: usize) -> Result<*mut u8> {
    let ptr = libc::mmap(
        std::ptr::null_mut(),
        len,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        -1,
        0,
    );
    if ptr == libc::MAP_FAILED {
        return Err(Error::MapFailure {
            detail: std::io::Error::last_os_error().to_string(),
        });
    }
    Ok(ptr as *mut u8)
}

pub unsafe fn protect(addr: *mut u8, len: usize, read: bool, write: bool, exec: bool) -> Result<()> {
    if len == 0 {
        return Ok(());
    }
    let mut prot = libc::PROT_NONE;
    if read {
        prot |= libc::PROT_READ;
    }
    if write {
        prot |= libc::PROT_WRITE;
    }
    if exec {
        prot |= libc::PROT_EXEC;
    }
    if libc::mprotect(addr as *mut libc::c_void, len, prot) != 0 {
        return Err(Error::MapFailure {
            detail: std::io::Error::last_os_error().to_string(),
        });
    }
    Ok(())
}

pub unsafe fn unmap(addr: *mut u8, len: usize) -> Result<()> {
    if len == 0 {
        return Ok(());
    }
    if libc::munmap(addr as *mut libc::c_void, len) != 0 {
        return Err(Error::MapFailure {
            detail: std::io::Error::last_os_error().to_string(),
        });
    }
    Ok(())
}
