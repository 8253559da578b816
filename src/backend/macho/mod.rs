//! Mach-O loader backend.
//!
//! Unlike the ELF and PE backends, this one does not relocate or link the
//! image itself: it maps the segments, then hands the result to the live
//! dyld4 runtime already resident in this process, the same way the dynamic
//! linker would bring in any other dylib. `dyld` module resolves and invokes
//! dyld4's own internal entry points for that handoff.

mod dyld;

use log::debug;

use crate::aplib;
use crate::error::{Error, Result};
use crate::format::macho::{self, MachOImage};
use crate::mapper;

pub struct Loaded {
    symbols: Vec<(String, u64)>,
}

pub fn load(bytes: &[u8]) -> Result<Loaded> {
    let owned;
    let bytes = if macho::is_ap32(bytes) {
        owned = aplib::decompress(bytes)?;
        owned.as_slice()
    } else {
        bytes
    };

    let image: MachOImage = macho::parse(bytes)?;
    debug!("parsed Mach-O image: {} segments, __TEXT at {:#x}", image.segments.len(), image.text.0);

    let mapping = mapper::map_segments(bytes, &image.segments)?;
    // `mapping.base()` is the runtime address of vmaddr 0; every segment and
    // symbol vmaddr in `image` is absolute, so this is also the slide.
    let slide = mapping.base() as u64;
    // load address = mapping_base + text.vmaddr - text.fileoff
    let load_address = slide.wrapping_add(image.text.0).wrapping_sub(image.text.1);

    dyld::load_image(load_address)?;

    mapping.protect(&image.segments)?;
    // The image now has live threads/state reachable only through dyld's own
    // bookkeeping; leaking the mapping keeps it valid past this call, since
    // there is no supported path to unmap it again.
    mapping.release();

    let symbols = image.symbols.into_iter().map(|(name, vmaddr)| (name, vmaddr.wrapping_add(slide))).collect();

    Ok(Loaded { symbols })
}

impl Loaded {
    pub fn call_export(&self, name: &str) -> Result<()> {
        let (_, addr) = self
            .symbols
            .iter()
            .find(|(n, _)| n == name)
            .ok_or_else(|| Error::ExportNotFound { name: name.to_string() })?;
        debug!("calling export `{name}` at {addr:#x}");
        let func: extern "C" fn() = unsafe { std::mem::transmute(*addr as usize) };
        func();
        Ok(())
    }

    /// Clean Mach-O unload is out of scope. `free` only forgets this
    /// loader's own handle; dyld's own loader state for the image is left
    /// exactly as the execution sequence left it.
    pub fn free(self) -> Result<()> {
        Ok(())
    }
}
