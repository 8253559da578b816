//! `VirtualAlloc`/`VirtualProtect`/`VirtualFree`-based reservation (spec
//! §4.2 "Mapping", PE column).

use crate::error::{Error, Result};
use winapi::um::memoryapi::{VirtualAlloc, VirtualFree, VirtualProtect};
use winapi::um::winnt::{
    MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE,
    PAGE_EXECUTE_WRITECOPY, PAGE_NOACCESS, PAGE_READONLY, PAGE_READWRITE,
};

fn last_error() -> String {
    std::io::Error::last_os_error().to_string()
}

pub unsafe fn reserve(len: usize) -> Result<*mut u8> {
    let ptr = VirtualAlloc(
        std::ptr::null_mut(),
        len,
        MEM_COMMIT | MEM_RESERVE,
        PAGE_READWRITE,
    );
    if ptr.is_null() {
        return Err(Error::MapFailure { detail: last_error() });
    }
    Ok(ptr as *mut u8)
}

fn protection_flags(read: bool, write: bool, exec: bool) -> u32 {
    match (read, write, exec) {
        (_, true, true) => PAGE_EXECUTE_READWRITE,
        (true, false, true) => PAGE_EXECUTE_READ,
        (false, false, true) => PAGE_EXECUTE_WRITECOPY,
        (true, true, false) => PAGE_READWRITE,
        (true, false, false) => PAGE_READONLY,
        (false, false, false) => PAGE_NOACCESS,
        (false, true, false) => PAGE_READWRITE,
    }
}

pub unsafe fn protect(addr: *mut u8, len: usize, read: bool, write: bool, exec: bool) -> Result<()> {
    if len == 0 {
        return Ok(());
    }
    let mut old = 0u32;
    let ok = VirtualProtect(
        addr as *mut _,
        len,
        protection_flags(read, write, exec),
        &mut old,
    );
    if ok == 0 {
        return Err(Error::MapFailure { detail: last_error() });
    }
    Ok(())
}

pub unsafe fn unmap(addr: *mut u8, _len: usize) -> Result<()> {
    if VirtualFree(addr as *mut _, 0, MEM_RELEASE) == 0 {
        return Err(Error::MapFailure { detail: last_error() });
    }
    Ok(())
}
