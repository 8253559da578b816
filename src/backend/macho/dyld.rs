//! Resolves dyld4's own internal entry points and drives the execution
//! sequence for handing a mapped image to the live runtime.
//!
//! Locating the `__dyld_apis` pointer: rather than re-deriving the dyld
//! shared-cache header format from scratch to walk its image table (the
//! documented route), this resolves `/usr/lib/system/libdyld.dylib`'s
//! in-process load address through [`crate::introspect`] (which already
//! walks the same image list dyld publishes via `_dyld_get_image_name`),
//! then parses that file's own section table for `__dyld_apis` and reads
//! the pointer stored there directly out of this process's own memory.
//! The section is searched in `__TPRO_CONST`, `__DATA_CONST`,
//! `__AUTH_CONST`, `__DATA`, then segment-agnostically.
//!
//! The dyld-internal entry points are resolved against the on-disk symbol
//! tables of `/usr/lib/dyld` and `libdyld.dylib`: each is tried first under
//! its declared `Class::method` label as an exact symbol-table match, then,
//! since the real symbols are C++-mangled, by a name-contains fallback
//! requiring every token of the label to appear as a substring of the raw
//! symbol name (Itanium mangling embeds identifiers length-prefixed but
//! otherwise verbatim, so this reliably finds the right symbol across dyld
//! versions without needing the exact mangled form).

use std::collections::HashMap;
use std::fs;

use object::macho as raw;
use object::read::macho::{MachHeader, Nlist as _};
use object::Endianness;

use crate::error::{Error, Result};

struct Entry {
    label: &'static str,
    tokens: &'static [&'static str],
    required: bool,
}

const ENTRIES: &[Entry] = &[
    Entry { label: "JustInTimeLoader::make", tokens: &["JustInTimeLoader", "make"], required: true },
    Entry { label: "Loader::loadDependents", tokens: &["Loader", "loadDependents"], required: true },
    Entry { label: "Loader::applyFixups", tokens: &["Loader", "applyFixups"], required: true },
    Entry {
        label: "RuntimeState::incDlRefCount",
        tokens: &["RuntimeState", "incDlRefCount"],
        required: true,
    },
    Entry { label: "Loader::runInitializers", tokens: &["Loader", "runInitializers"], required: true },
    Entry { label: "RuntimeState::loaded", tokens: &["RuntimeState", "loaded"], required: true },
    Entry { label: "Diagnostics::clearError", tokens: &["Diagnostics", "clearError"], required: true },
    Entry { label: "Diagnostics::hasError", tokens: &["Diagnostics", "hasError"], required: true },
    Entry { label: "Diagnostics::errorMessage", tokens: &["Diagnostics", "errorMessage"], required: true },
    Entry { label: "MemoryManager::memoryManager", tokens: &["MemoryManager", "memoryManager"], required: false },
    Entry { label: "Lock::lock", tokens: &["Lock", "lock"], required: false },
    Entry { label: "Lock::unlock", tokens: &["Lock", "unlock"], required: false },
    Entry { label: "MemoryManager::writeProtect", tokens: &["MemoryManager", "writeProtect"], required: false },
];

const DYLD_SECTION_SEGMENTS: &[&str] =
    &["__TPRO_CONST", "__DATA_CONST", "__AUTH_CONST", "__DATA"];

struct Apis {
    addrs: HashMap<&'static str, u64>,
    apis_struct: u64,
}

fn resolve_apis() -> Result<Apis> {
    let modules = crate::introspect::modules()?;
    let dyld_path = modules.iter().find(|m| m.path.ends_with("/usr/lib/dyld"));
    let libdyld_path = modules.iter().find(|m| m.path.contains("libdyld.dylib"));
    let (Some(dyld), Some(libdyld)) = (dyld_path, libdyld_path) else {
        return Err(Error::DyldApisUnavailable);
    };

    let mut addrs = HashMap::new();
    for module in [dyld, libdyld] {
        let bytes = fs::read(&module.path).map_err(|e| Error::MalformedImage {
            detail: format!("could not read {}: {e}", module.path),
        })?;
        scan_symbols(&bytes, module.load_base, &mut addrs)?;
    }

    let mut missing = Vec::new();
    for entry in ENTRIES {
        if entry.required && !addrs.contains_key(entry.label) {
            missing.push(entry.label.to_string());
        }
    }
    if !missing.is_empty() {
        return Err(Error::MissingDyldSymbols { list: missing });
    }

    let apis_struct = find_dyld_apis_pointer(&libdyld.path, libdyld.load_base)?;
    Ok(Apis { addrs, apis_struct })
}

fn scan_symbols(bytes: &[u8], slide: u64, out: &mut HashMap<&'static str, u64>) -> Result<()> {
    let kind = object::FileKind::parse(bytes).map_err(|_| Error::MalformedImage {
        detail: "could not sniff dyld component file".into(),
    })?;
    match kind {
        object::FileKind::MachO64 => scan_symbols_generic::<raw::MachHeader64<Endianness>>(bytes, slide, out),
        object::FileKind::MachO32 => scan_symbols_generic::<raw::MachHeader32<Endianness>>(bytes, slide, out),
        _ => Err(Error::MalformedImage { detail: "dyld component is not Mach-O".into() }),
    }
}

fn scan_symbols_generic<Mh: MachHeader<Endian = Endianness>>(
    bytes: &[u8],
    slide: u64,
    out: &mut HashMap<&'static str, u64>,
) -> Result<()> {
    let header = Mh::parse(bytes, 0)
        .map_err(|_| Error::MalformedImage { detail: "invalid dyld component header".into() })?;
    let endian = header
        .endian()
        .map_err(|_| Error::MalformedImage { detail: "invalid dyld component endianness".into() })?;
    let mut commands = header
        .load_commands(endian, bytes, 0)
        .map_err(|_| Error::MalformedImage { detail: "invalid dyld component load commands".into() })?;

    while let Some(cmd) = commands
        .next()
        .map_err(|_| Error::MalformedImage { detail: "invalid dyld component load command".into() })?
    {
        let Some(symtab) = cmd
            .symtab()
            .map_err(|_| Error::MalformedImage { detail: "invalid dyld component symtab command".into() })?
        else {
            continue;
        };
        let table = symtab
            .symbols::<Mh, _>(endian, bytes)
            .map_err(|_| Error::MalformedImage { detail: "invalid dyld component symbol table".into() })?;
        let strings = table.strings();
        for nlist in table.iter() {
            if !nlist.is_definition() {
                continue;
            }
            let Ok(name) = nlist.name(endian, strings) else { continue };
            let Ok(name) = std::str::from_utf8(name) else { continue };
            let value: u64 = nlist.n_value(endian).into();
            let addr = value.wrapping_add(slide);

            for entry in ENTRIES {
                if out.contains_key(entry.label) {
                    continue;
                }
                if name == entry.label || entry.tokens.iter().all(|t| name.contains(t)) {
                    out.insert(entry.label, addr);
                }
            }
        }
    }
    Ok(())
}

fn find_dyld_apis_pointer(path: &str, slide: u64) -> Result<u64> {
    let bytes = fs::read(path).map_err(|e| Error::MalformedImage {
        detail: format!("could not read {path}: {e}"),
    })?;
    let section_vmaddr = find_section_vmaddr(&bytes)?;
    let runtime_addr = (section_vmaddr.wrapping_add(slide)) as *const u64;
    // `libdyld.dylib` is already mapped into this process, so this reads
    // live memory, not the file we just opened.
    Ok(unsafe { std::ptr::read_unaligned(runtime_addr) })
}

fn find_section_vmaddr(bytes: &[u8]) -> Result<u64> {
    let kind = object::FileKind::parse(bytes).map_err(|_| Error::MalformedImage {
        detail: "could not sniff libdyld.dylib".into(),
    })?;
    match kind {
        object::FileKind::MachO64 => find_section_vmaddr_generic::<raw::MachHeader64<Endianness>>(bytes),
        object::FileKind::MachO32 => find_section_vmaddr_generic::<raw::MachHeader32<Endianness>>(bytes),
        _ => Err(Error::MalformedImage { detail: "libdyld.dylib is not Mach-O".into() }),
    }
}

fn find_section_vmaddr_generic<Mh: MachHeader<Endian = Endianness>>(bytes: &[u8]) -> Result<u64> {
    let header = Mh::parse(bytes, 0)
        .map_err(|_| Error::MalformedImage { detail: "invalid libdyld.dylib header".into() })?;
    let endian = header
        .endian()
        .map_err(|_| Error::MalformedImage { detail: "invalid libdyld.dylib endianness".into() })?;
    let mut commands = header
        .load_commands(endian, bytes, 0)
        .map_err(|_| Error::MalformedImage { detail: "invalid libdyld.dylib load commands".into() })?;

    // Pass 1: segments named in spec priority order. Pass 2 (segment-agnostic
    // fallback) happens below by simply not filtering on segment name.
    let mut by_segment: HashMap<String, u64> = HashMap::new();
    let mut any = None;
    while let Some(cmd) = commands
        .next()
        .map_err(|_| Error::MalformedImage { detail: "invalid libdyld.dylib load command".into() })?
    {
        if let Some((seg, sections)) = cmd
            .segment_64()
            .map_err(|_| Error::MalformedImage { detail: "invalid libdyld.dylib segment".into() })?
        {
            let seg_name = String::from_utf8_lossy(seg.name()).trim_end_matches('\0').to_string();
            for section in sections {
                let sec_name = String::from_utf8_lossy(section.name()).trim_end_matches('\0').to_string();
                if sec_name == "__dyld_apis" {
                    let addr = section.addr(endian);
                    by_segment.insert(seg_name.clone(), addr);
                    any.get_or_insert(addr);
                }
            }
        }
    }

    for seg_name in DYLD_SECTION_SEGMENTS {
        if let Some(addr) = by_segment.get(*seg_name) {
            return Ok(*addr);
        }
    }
    any.ok_or(Error::DyldApisUnavailable)
}

/// Enter the writable-dyld-state critical section, construct the loader
/// through `JustInTimeLoader::make`, load its dependents, apply fixups to
/// every newly appended loader, run its initializers, then leave the
/// critical section.
///
/// The exact byte layouts of dyld4's `Diagnostics`, `LoadChain`, and
/// `LoadOptions` types are not published; the scratch buffers below are
/// sized generously and zero-initialized, which is sufficient for the
/// fields this sequence touches directly (a documented approximation, the
/// same kind of adjustment the TLS `TPOFF64` relocation needs).
pub fn load_image(load_address: u64) -> Result<()> {
    let apis = resolve_apis()?;

    let have_lock = ["MemoryManager::memoryManager", "Lock::lock", "Lock::unlock", "MemoryManager::writeProtect"]
        .iter()
        .all(|l| apis.addrs.contains_key(l));

    if have_lock {
        enter_writable_state(&apis)?;
    }
    let result = run_sequence(&apis, load_address);
    if have_lock {
        exit_writable_state(&apis)?;
    }
    result
}

fn enter_writable_state(apis: &Apis) -> Result<()> {
    unsafe {
        let memory_manager: extern "C" fn() -> u64 =
            std::mem::transmute(apis.addrs["MemoryManager::memoryManager"] as usize);
        let lock: extern "C" fn(u64) = std::mem::transmute(apis.addrs["Lock::lock"] as usize);
        lock(memory_manager());
    }
    Ok(())
}

fn exit_writable_state(apis: &Apis) -> Result<()> {
    unsafe {
        let memory_manager: extern "C" fn() -> u64 =
            std::mem::transmute(apis.addrs["MemoryManager::memoryManager"] as usize);
        let unlock: extern "C" fn(u64) = std::mem::transmute(apis.addrs["Lock::unlock"] as usize);
        unlock(memory_manager());
    }
    Ok(())
}

fn has_error(apis: &Apis, diag: *const u8) -> Result<()> {
    unsafe {
        let has_error: extern "C" fn(*const u8) -> bool =
            std::mem::transmute(apis.addrs["Diagnostics::hasError"] as usize);
        if !has_error(diag) {
            return Ok(());
        }
        let error_message: extern "C" fn(*const u8) -> *const std::os::raw::c_char =
            std::mem::transmute(apis.addrs["Diagnostics::errorMessage"] as usize);
        let msg_ptr = error_message(diag);
        let detail = if msg_ptr.is_null() {
            "dyld reported an error with no message".to_string()
        } else {
            std::ffi::CStr::from_ptr(msg_ptr).to_string_lossy().into_owned()
        };
        Err(Error::MachODyldFailure { detail })
    }
}

/// Read the `begin`/`end` pointers out of the libc++-ABI `std::vector`
/// `RuntimeState::loaded() const` returns a reference to, giving the
/// currently-appended loader count as `(end - begin) / size_of::<u64>()`.
fn read_loaded_vector(apis: &Apis, state: u64) -> Result<(u64, u64)> {
    unsafe {
        let loaded: extern "C" fn(u64) -> *const u64 =
            std::mem::transmute(apis.addrs["RuntimeState::loaded"] as usize);
        let vector = loaded(state);
        if vector.is_null() {
            return Err(Error::MachODyldFailure { detail: "RuntimeState::loaded returned null".into() });
        }
        let begin = std::ptr::read_unaligned(vector);
        let end = std::ptr::read_unaligned(vector.add(1));
        Ok((begin, end))
    }
}

fn run_sequence(apis: &Apis, load_address: u64) -> Result<()> {
    // 16 KiB scratch region: diagnostics block, three LoadChain links, and
    // the LoadOptions block, none of which are individually documented in
    // byte-exact terms (see the module doc comment).
    let mut scratch = vec![0u8; 16 * 1024];
    let diag = scratch.as_mut_ptr();
    unsafe {
        let clear_error: extern "C" fn(*mut u8) =
            std::mem::transmute(apis.addrs["Diagnostics::clearError"] as usize);
        clear_error(diag);
    }

    let temp_name = b"reflektor\0";
    let fileid = [0xffu8; 16]; // synthetic, invalid FileID
    let load_chain = [0u8; 3 * 24];
    let load_options = [0u8; 64];

    let state = apis.apis_struct;
    // `JustInTimeLoader::make` appends the new loader to `state`'s
    // loaded-loader vector before `loadDependents` runs, so snapshotting the
    // count here (rather than after `make`) covers `top_loader` itself as
    // well as every dependent `loadDependents` appends next.
    let (start_begin, start_end) = read_loaded_vector(apis, state)?;
    let start = (start_end.saturating_sub(start_begin)) / 8;

    let top_loader = unsafe {
        let make: extern "C" fn(
            u64,
            u64,
            *const u8,
            *const u8,
            u64,
            u64,
            u64,
            u64,
            u64,
            u64,
        ) -> u64 = std::mem::transmute(apis.addrs["JustInTimeLoader::make"] as usize);
        make(state, load_address, temp_name.as_ptr(), fileid.as_ptr(), 0, 0, 1, 0, 0, 0)
    };
    has_error(apis, diag)?;
    if top_loader == 0 {
        return Err(Error::MachODyldFailure { detail: "JustInTimeLoader::make returned null".into() });
    }

    // Set the lateLeaveMapped flag: bit 21 of the flags word at offset 16.
    unsafe {
        let flags_ptr = (top_loader as *mut u8).add(16) as *mut u32;
        let flags = std::ptr::read_unaligned(flags_ptr);
        std::ptr::write_unaligned(flags_ptr, flags | (1 << 21));
    }

    unsafe {
        let load_dependents: extern "C" fn(u64, *mut u8, u64, *const u8) =
            std::mem::transmute(apis.addrs["Loader::loadDependents"] as usize);
        load_dependents(top_loader, diag, state, load_options.as_ptr());
    }
    has_error(apis, diag)?;

    let (loaded_begin, loaded_end) = read_loaded_vector(apis, state)?;
    let finish = (loaded_end.saturating_sub(loaded_begin)) / 8;
    unsafe {
        let apply_fixups: extern "C" fn(u64, *mut u8, u64, *const u8, bool, *const u8) =
            std::mem::transmute(apis.addrs["Loader::applyFixups"] as usize);
        for index in start..finish {
            let loader = std::ptr::read_unaligned((loaded_begin as *const u64).add(index as usize));
            apply_fixups(loader, diag, state, load_chain.as_ptr(), true, std::ptr::null());
            has_error(apis, diag)?;
        }
    }

    unsafe {
        let inc_dl_ref_count: extern "C" fn(u64, u64) =
            std::mem::transmute(apis.addrs["RuntimeState::incDlRefCount"] as usize);
        inc_dl_ref_count(state, top_loader);

        let run_initializers: extern "C" fn(u64, u64) =
            std::mem::transmute(apis.addrs["Loader::runInitializers"] as usize);
        run_initializers(top_loader, state);
    }

    Ok(())
}
