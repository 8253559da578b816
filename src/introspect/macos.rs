//! `_dyld_image_count`/`_dyld_get_image_*`-based module walk.

use std::ffi::CStr;

use super::{score, RuntimeModule};
use crate::error::Result;

pub fn modules() -> Result<Vec<RuntimeModule>> {
    let mut out = Vec::new();
    unsafe {
        let count = libc::_dyld_image_count();
        for i in 0..count {
            let name_ptr = libc::_dyld_get_image_name(i);
            if name_ptr.is_null() {
                continue;
            }
            let path = CStr::from_ptr(name_ptr).to_string_lossy().into_owned();
            let slide = libc::_dyld_get_image_vmaddr_slide(i);
            let score = score(&path);
            out.push(RuntimeModule { path, load_base: slide as u64, score });
        }
    }
    Ok(out)
}
