//! Process Environment Block walk: reads
//! `Ldr->InMemoryOrderModuleList` directly, since `winapi` does not expose
//! the NT-internal `PEB`/`PEB_LDR_DATA`/`LDR_DATA_TABLE_ENTRY` layouts (they
//! are undocumented Windows internals, not part of the public Win32 API
//! surface any crate in this stack wraps).

use std::ffi::OsString;
use std::os::windows::ffi::OsStringExt;

use super::{score, RuntimeModule};
use crate::error::Result;

#[repr(C)]
struct ListEntry {
    flink: *mut ListEntry,
    blink: *mut ListEntry,
}

#[repr(C)]
struct UnicodeString {
    length: u16,
    maximum_length: u16,
    buffer: *mut u16,
}

#[repr(C)]
struct LdrDataTableEntry {
    in_load_order_links: ListEntry,
    in_memory_order_links: ListEntry,
    in_initialization_order_links: ListEntry,
    dll_base: *mut u8,
    entry_point: *mut u8,
    size_of_image: u32,
    full_dll_name: UnicodeString,
    base_dll_name: UnicodeString,
}

#[repr(C)]
struct PebLdrData {
    length: u32,
    initialized: u32,
    ss_handle: *mut u8,
    in_load_order_module_list: ListEntry,
    in_memory_order_module_list: ListEntry,
}

#[repr(C)]
struct Peb {
    reserved1: [u8; 2],
    being_debugged: u8,
    reserved2: [u8; 1],
    reserved3: [*mut u8; 2],
    ldr: *mut PebLdrData,
}

extern "system" {
    fn NtCurrentTeb() -> *mut u8;
}

unsafe fn peb_from_teb(teb: *mut u8) -> *mut Peb {
    // PEB pointer sits at offset 0x60 in the TEB on x86_64, 0x30 on x86.
    let offset = if cfg!(target_pointer_width = "64") { 0x60 } else { 0x30 };
    *(teb.add(offset) as *const *mut Peb)
}

unsafe fn unicode_to_string(s: &UnicodeString) -> String {
    if s.buffer.is_null() || s.length == 0 {
        return String::new();
    }
    let len = (s.length / 2) as usize;
    let slice = std::slice::from_raw_parts(s.buffer, len);
    OsString::from_wide(slice).to_string_lossy().into_owned()
}

pub fn modules() -> Result<Vec<RuntimeModule>> {
    let mut out = Vec::new();
    unsafe {
        let peb = peb_from_teb(NtCurrentTeb());
        let ldr = (*peb).ldr;
        let head = &(*ldr).in_memory_order_module_list as *const ListEntry as *mut ListEntry;
        let mut cur = (*head).flink;
        while cur != head {
            // `in_memory_order_links` is the second `ListEntry` field of
            // `LdrDataTableEntry`; offset back to the struct's base.
            let entry = (cur as *mut u8).sub(std::mem::size_of::<ListEntry>()) as *mut LdrDataTableEntry;
            let path = unicode_to_string(&(*entry).full_dll_name);
            let score = score(&path);
            out.push(RuntimeModule {
                path,
                load_base: (*entry).dll_base as u64,
                score,
            });
            cur = (*cur).flink;
        }
    }
    Ok(out)
}
