//! ELF loader backend.
//!
//! `load` parses, maps, relocates, and protects the image; the returned
//! `Loaded` only keeps what `call_export`/`free` need afterward.

use log::{debug, trace, warn};
use object::elf as raw;

use crate::error::{Error, Result};
use crate::format::elf::{self, ElfImage};
use crate::format::{Binding, Relocation, SymKind};
use crate::mapper::{self, Mapping};
use crate::resolver::Resolver;

pub struct Loaded {
    mapping: Mapping,
    symbols: Vec<(String, u64)>,
}

pub fn load(bytes: &[u8]) -> Result<Loaded> {
    let image = elf::parse(bytes)?;
    debug!(
        "parsed ELF image: {} segments, {} symbols, {} relocations, needs {:?}",
        image.segments.len(),
        image.symbols.len(),
        image.relocations.len(),
        image.needed_libraries
    );

    let mapping = mapper::map_segments(bytes, &image.segments)?;
    let base = mapping.base() as u64;

    let mut resolver = Resolver::new()?;
    for dep in &image.needed_libraries {
        if let Err(e) = resolver.load_dependency(dep) {
            warn!("could not prime dependency `{dep}`: {e}");
        }
    }

    apply_relocations(&mapping, base, &image, &mut resolver)?;
    mapping.protect(&image.segments)?;

    let mut symbols = Vec::new();
    for sym in &image.symbols {
        if !sym.defined || !matches!(sym.kind, SymKind::Func | SymKind::NoType) || sym.name.is_empty() {
            continue;
        }
        let addr = base + sym.value;
        symbols.push((sym.name.clone(), addr));
        // A versioned export (`name@VERSION`) also registers under its bare
        // name, the same way an unversioned caller would resolve it.
        if let Some(base_name) = sym.name.split('@').next() {
            if base_name != sym.name {
                symbols.push((base_name.to_string(), addr));
            }
        }
    }

    Ok(Loaded { mapping, symbols })
}

fn apply_relocations(
    mapping: &Mapping,
    base: u64,
    image: &ElfImage,
    resolver: &mut Resolver,
) -> Result<()> {
    for reloc in &image.relocations {
        trace!("relocation at {:#x}: type {}", reloc.offset, reloc.rel_type);
        let Some((value, width)) = resolve_relocation_value(base, image, reloc, resolver)? else {
            continue;
        };
        let end = reloc.offset.checked_add(width.bytes()).ok_or_else(|| Error::RelocationFailure {
            detail: format!("relocation offset {:#x} overflows the address space", reloc.offset),
        })?;
        if end > mapping.len() as u64 {
            return Err(Error::RelocationFailure {
                detail: format!(
                    "relocation at {:#x} (width {}) exceeds mapping of {} bytes",
                    reloc.offset,
                    width.bytes(),
                    mapping.len()
                ),
            });
        }
        unsafe {
            write_word(mapping, reloc.offset, value, width);
        }
    }
    Ok(())
}

/// Word width a relocation's value is written as.
#[derive(Clone, Copy)]
enum Width {
    Word32,
    Word64,
}

impl Width {
    fn bytes(self) -> u64 {
        match self {
            Width::Word32 => 4,
            Width::Word64 => 8,
        }
    }
}

/// Narrow `value` to an unsigned 32-bit word, erroring if it doesn't fit.
fn narrow_u32(value: u64, reloc: &Relocation) -> Result<u64> {
    u32::try_from(value).map(u64::from).map_err(|_| Error::RelocationFailure {
        detail: format!("relocation at {:#x} overflows an unsigned 32-bit word", reloc.offset),
    })
}

/// Narrow `value` (two's-complement in a `u64`) to a signed 32-bit word,
/// erroring if it doesn't fit.
fn narrow_i32(value: u64, reloc: &Relocation) -> Result<u64> {
    i32::try_from(value as i64).map(|v| u64::from(v as u32)).map_err(|_| Error::RelocationFailure {
        detail: format!("relocation at {:#x} overflows a signed 32-bit word", reloc.offset),
    })
}

/// Compute the value and word width to write for `reloc`, per the
/// arch-specific relocation type tables. Returns `None` for relocation types
/// this loader intentionally ignores (e.g. `R_*_NONE`).
fn resolve_relocation_value(
    base: u64,
    image: &ElfImage,
    reloc: &Relocation,
    resolver: &mut Resolver,
) -> Result<Option<(u64, Width)>> {
    let symbol = |resolver: &mut Resolver| -> Result<u64> {
        let index = reloc.symbol_index.ok_or_else(|| Error::RelocationFailure {
            detail: "relocation has no symbol index".into(),
        })?;
        let sym = image.symbols.get(index).ok_or_else(|| Error::RelocationFailure {
            detail: format!("relocation references out-of-range symbol {index}"),
        })?;
        if sym.defined {
            return Ok(base + sym.value);
        }
        if sym.binding == Binding::Weak && sym.value == 0 {
            // Unresolved weak symbols default to 0, same as the static
            // linker would leave them when no definition exists.
            return resolver.resolve(&sym.name).or(Ok(0));
        }
        resolver.resolve(&sym.name)
    };

    let addend = reloc.addend.unwrap_or(0) as u64;

    use crate::format::Machine;
    let value = match (image.machine, reloc.rel_type) {
        (Machine::X86_64, raw::R_X86_64_NONE) => None,
        (Machine::X86_64, raw::R_X86_64_RELATIVE) | (Machine::X86_64, raw::R_X86_64_RELATIVE64) => {
            Some((base.wrapping_add(addend), Width::Word64))
        }
        (Machine::X86_64, raw::R_X86_64_GLOB_DAT)
        | (Machine::X86_64, raw::R_X86_64_JUMP_SLOT)
        | (Machine::X86_64, raw::R_X86_64_64) => {
            Some((symbol(resolver)?.wrapping_add(addend), Width::Word64))
        }
        (Machine::X86_64, raw::R_X86_64_32) => {
            let full = symbol(resolver)?.wrapping_add(addend);
            Some((narrow_u32(full, reloc)?, Width::Word32))
        }
        (Machine::X86_64, raw::R_X86_64_32S) => {
            let full = symbol(resolver)?.wrapping_add(addend);
            Some((narrow_i32(full, reloc)?, Width::Word32))
        }
        (Machine::X86_64, raw::R_X86_64_PC32) => {
            let full = symbol(resolver)?.wrapping_add(addend).wrapping_sub(base + reloc.offset);
            Some((narrow_i32(full, reloc)?, Width::Word32))
        }
        (Machine::X86_64, raw::R_X86_64_TPOFF64) => Some((symbol(resolver)?, Width::Word64)),

        (Machine::I386, raw::R_386_NONE) => None,
        (Machine::I386, raw::R_386_RELATIVE) => {
            Some((narrow_u32(base.wrapping_add(addend), reloc)?, Width::Word32))
        }
        (Machine::I386, raw::R_386_GLOB_DAT)
        | (Machine::I386, raw::R_386_JMP_SLOT)
        | (Machine::I386, raw::R_386_32) => {
            let full = symbol(resolver)?.wrapping_add(addend);
            Some((narrow_u32(full, reloc)?, Width::Word32))
        }

        (Machine::Aarch64, raw::R_AARCH64_NONE) => None,
        (Machine::Aarch64, raw::R_AARCH64_RELATIVE) => {
            Some((base.wrapping_add(addend), Width::Word64))
        }
        (Machine::Aarch64, raw::R_AARCH64_GLOB_DAT)
        | (Machine::Aarch64, raw::R_AARCH64_JUMP_SLOT)
        | (Machine::Aarch64, raw::R_AARCH64_ABS64) => {
            Some((symbol(resolver)?.wrapping_add(addend), Width::Word64))
        }
        (Machine::Aarch64, raw::R_AARCH64_TLS_TPREL) => Some((symbol(resolver)?, Width::Word64)),

        (_, other) => {
            return Err(Error::RelocationFailure {
                detail: format!("unsupported relocation type {other} for {:?}", image.machine),
            })
        }
    };
    Ok(value)
}

unsafe fn write_word(mapping: &Mapping, offset: u64, value: u64, width: Width) {
    let ptr = mapping.base().add(offset as usize);
    match width {
        Width::Word32 => std::ptr::write_unaligned(ptr as *mut u32, value as u32),
        Width::Word64 => std::ptr::write_unaligned(ptr as *mut u64, value),
    }
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

    pub fn free(self) -> Result<()> {
        self.mapping.unmap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{Machine, Segment};
    use crate::mapper;

    fn tiny_mapping() -> Mapping {
        let image = vec![0u8; 16];
        let segments = vec![Segment {
            vaddr: 0,
            memsz: 16,
            file_offset: 0,
            filesz: 16,
            read: true,
            write: true,
            exec: false,
        }];
        mapper::map_segments(&image, &segments).unwrap()
    }

    fn empty_image(relocations: Vec<Relocation>) -> ElfImage {
        ElfImage {
            machine: Machine::X86_64,
            entry: 0,
            segments: Vec::new(),
            symbols: Vec::new(),
            relocations,
            needed_libraries: Vec::new(),
        }
    }

    #[test]
    fn relocation_past_mapping_end_is_rejected() {
        let mapping = tiny_mapping();
        let base = mapping.base() as u64;
        let image = empty_image(vec![Relocation {
            offset: mapping.len() as u64, // offset + 8 exceeds the mapping
            rel_type: raw::R_X86_64_RELATIVE,
            symbol_index: None,
            addend: Some(0),
        }]);
        let mut resolver = Resolver::new().unwrap();
        let err = apply_relocations(&mapping, base, &image, &mut resolver).unwrap_err();
        assert!(matches!(err, Error::RelocationFailure { .. }));
    }

    #[test]
    fn relocation_offset_overflow_is_rejected() {
        let mapping = tiny_mapping();
        let base = mapping.base() as u64;
        let image = empty_image(vec![Relocation {
            offset: u64::MAX,
            rel_type: raw::R_X86_64_RELATIVE,
            symbol_index: None,
            addend: Some(0),
        }]);
        let mut resolver = Resolver::new().unwrap();
        let err = apply_relocations(&mapping, base, &image, &mut resolver).unwrap_err();
        assert!(matches!(err, Error::RelocationFailure { .. }));
    }

    #[test]
    fn narrow_u32_rejects_overflow() {
        let reloc = Relocation { offset: 0, rel_type: 0, symbol_index: None, addend: None };
        assert!(narrow_u32(u64::from(u32::MAX), &reloc).is_ok());
        assert!(narrow_u32(u64::from(u32::MAX) + 1, &reloc).is_err());
    }

    #[test]
    fn narrow_i32_rejects_overflow() {
        let reloc = Relocation { offset: 0, rel_type: 0, symbol_index: None, addend: None };
        assert!(narrow_i32(i32::MAX as u64, &reloc).is_ok());
        assert!(narrow_i32(i32::MAX as u64 + 1, &reloc).is_err());
        // -1i32 as a two's-complement u64 bit pattern: fits.
        assert!(narrow_i32(u64::MAX, &reloc).is_ok());
    }
}
