//! PE loader backend.
//!
//! Mirrors the map → relocate → resolve-imports → protect pipeline a
//! from-scratch PE loader runs: reserve one block, copy section data in,
//! rebase via `IMAGE_DIRECTORY_ENTRY_BASERELOC`, fill the IAT via
//! `resolver::Resolver`, then apply per-section page protections.

use log::{debug, warn};
use object::pe as raw;

use crate::error::{Error, Result};
use crate::format::pe::{self, PeImage};
use crate::mapper::{self, Mapping};
use crate::resolver::Resolver;

pub struct Loaded {
    mapping: Mapping,
    entry_rva: u32,
    symbols: Vec<(String, u64)>,
}

pub fn load(bytes: &[u8]) -> Result<Loaded> {
    let image = pe::parse(bytes)?;
    debug!(
        "parsed PE image: {} sections, {} base relocations, {} imports, {} exports",
        image.segments.len(),
        image.base_relocations.len(),
        image.imports.len(),
        image.exports.len(),
    );

    let mapping = mapper::map_segments(bytes, &image.segments)?;
    let new_base = mapping.base() as u64;
    let delta = new_base.wrapping_sub(image.image_base);

    apply_base_relocations(&mapping, delta, &image)?;

    let mut resolver = Resolver::new()?;
    resolve_imports(&mapping, &image, &mut resolver)?;

    mapping.protect(&image.segments)?;

    let symbols = image.exports.iter().map(|(name, rva)| (name.clone(), new_base + *rva as u64)).collect();

    Ok(Loaded { mapping, entry_rva: image.entry_rva, symbols })
}

fn apply_base_relocations(mapping: &Mapping, delta: u64, image: &PeImage) -> Result<()> {
    if delta == 0 {
        return Ok(());
    }
    for reloc in &image.base_relocations {
        unsafe {
            let addr = mapping.base().add(reloc.rva as usize);
            match reloc.kind {
                raw::IMAGE_REL_BASED_ABSOLUTE => {}
                raw::IMAGE_REL_BASED_HIGHLOW => {
                    let v = std::ptr::read_unaligned(addr as *const u32);
                    std::ptr::write_unaligned(addr as *mut u32, v.wrapping_add(delta as u32));
                }
                raw::IMAGE_REL_BASED_DIR64 => {
                    let v = std::ptr::read_unaligned(addr as *const u64);
                    std::ptr::write_unaligned(addr as *mut u64, v.wrapping_add(delta));
                }
                other => {
                    return Err(Error::RelocationFailure {
                        detail: format!("unsupported PE base relocation type {other}"),
                    })
                }
            }
        }
    }
    Ok(())
}

fn resolve_imports(mapping: &Mapping, image: &PeImage, resolver: &mut Resolver) -> Result<()> {
    for import in &image.imports {
        if let Err(e) = resolver.load_dependency(&import.dll) {
            warn!("could not load import dependency `{}`: {e}", import.dll);
        }
        let symbol_name = match (&import.name, import.ordinal) {
            (Some(name), _) => name.clone(),
            (None, Some(ordinal)) => format!("#{ordinal}"),
            (None, None) => continue,
        };
        let addr = resolver.resolve(&symbol_name)?;
        unsafe {
            let slot = mapping.base().add(import.thunk_rva as usize) as *mut u64;
            std::ptr::write_unaligned(slot, addr);
        }
    }
    Ok(())
}

impl Loaded {
    pub fn call_export(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::EmptyExportName);
        }
        let addr = match self.symbols.iter().find(|(n, _)| n == name) {
            Some((_, addr)) => *addr,
            // No export directory at all: fall back to the image's single
            // entry point, the same target every requested name resolves to.
            None if self.symbols.is_empty() => self.mapping.base() as u64 + self.entry_rva as u64,
            None => return Err(Error::ExportNotFound { name: name.to_string() }),
        };
        debug!("calling export `{name}` at {addr:#x}");
        let func: extern "system" fn() = unsafe { std::mem::transmute(addr as usize) };
        func();
        Ok(())
    }

    pub fn free(self) -> Result<()> {
        self.mapping.unmap()
    }
}
