//! In-memory mapper.
//!
//! Reserves one contiguous anonymous region sized to span every loadable
//! segment, copies each segment's file bytes into place, zero-fills the
//! BSS tail, and applies final page protections once relocation is done.
//! `unix` uses `mmap`/`mprotect`, `windows` uses `VirtualAlloc`/`VirtualProtect`.

use crate::error::{Error, Result};
use crate::format::Segment;

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        use unix as imp;
    } else if #[cfg(windows)] {
        mod windows;
        use windows as imp;
    } else {
        compile_error!("reflektor's mapper has no implementation for this target");
    }
}

/// The page size this mapper aligns segments to.
pub const PAGE_SIZE: u64 = 0x1000;

/// A single contiguous anonymous mapping spanning every loadable segment.
///
/// Unmapped automatically when dropped unless [`Mapping::release`] has been
/// called (e.g. while an `Image` still holds exported-function pointers into
/// it).
pub struct Mapping {
    base: *mut u8,
    len: usize,
    released: bool,
}

unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    /// Base address of the reservation.
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy `data` to `base() + offset`.
    ///
    /// # Safety
    /// `offset + data.len()` must not exceed `len()`.
    pub unsafe fn write(&self, offset: u64, data: &[u8]) {
        std::ptr::copy_nonoverlapping(data.as_ptr(), self.base.add(offset as usize), data.len());
    }

    /// Zero `len` bytes starting at `base() + offset`.
    ///
    /// # Safety
    /// `offset + len` must not exceed [`Mapping::len`].
    pub unsafe fn zero(&self, offset: u64, len: u64) {
        std::ptr::write_bytes(self.base.add(offset as usize), 0, len as usize);
    }

    /// Apply final page protections for `segments`, which must describe the
    /// same layout this mapping was reserved for.
    pub fn protect(&self, segments: &[Segment]) -> Result<()> {
        for segment in segments {
            let start = segment.aligned_start(PAGE_SIZE);
            let end = segment.aligned_end(PAGE_SIZE);
            unsafe {
                imp::protect(
                    self.base.add(start as usize),
                    (end - start) as usize,
                    segment.read,
                    segment.write,
                    segment.exec,
                )?;
            }
        }
        Ok(())
    }

    /// Unmap the reservation, even if [`Mapping::release`] was previously
    /// called.
    pub fn unmap(mut self) -> Result<()> {
        self.released = true;
        unsafe { imp::unmap(self.base, self.len) }
    }

    /// Leak the reservation past this `Mapping`'s lifetime: the memory stays
    /// mapped after `drop`. Used once an export has been invoked and may have
    /// spawned threads or installed callbacks into the mapped region.
    pub fn release(mut self) {
        self.released = true;
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        if !self.released && self.len > 0 {
            let _ = unsafe { imp::unmap(self.base, self.len) };
        }
    }
}

/// Reserve a single anonymous, read-write mapping spanning every segment in
/// `segments`, then copy each segment's file-backed bytes into place and
/// zero-fill its BSS tail. Page protections are left read-write; call
/// [`Mapping::protect`] once relocation has finished writing into the
/// region.
pub fn map_segments(image: &[u8], segments: &[Segment]) -> Result<Mapping> {
    let span_end = segments
        .iter()
        .map(|s| s.aligned_end(PAGE_SIZE))
        .max()
        .ok_or_else(|| Error::MapFailure { detail: "image has no segments to map".into() })?;
    let base = unsafe { imp::reserve(span_end as usize)? };
    let mapping = Mapping { base, len: span_end as usize, released: false };

    for segment in segments {
        let file_end = segment.file_offset as usize + segment.filesz as usize;
        if file_end > image.len() {
            return Err(Error::MapFailure {
                detail: "segment file range exceeds image buffer".into(),
            });
        }
        unsafe {
            mapping.write(
                segment.vaddr,
                &image[segment.file_offset as usize..file_end],
            );
            if segment.memsz > segment.filesz {
                mapping.zero(segment.vaddr + segment.filesz, segment.memsz - segment.filesz);
            }
        }
    }

    Ok(mapping)
}
