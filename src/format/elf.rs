//! ELF parsing and validation: segment layout, dynamic symbols, and relocations.
//!
//! Parses program headers, the dynamic symbol table, the four well-known
//! relocation sections, and `DT_NEEDED` entries, using the `object` crate's
//! low-level `read::elf` traits so we get at raw relocation types (`r_type`)
//! rather than the crate's own abstracted `RelocationKind`.

use object::elf as raw;
use object::read::elf::{Dyn, FileHeader, ProgramHeader, Rel, Rela, SectionHeader, Sym};
use object::{Endianness, StringTable};

use super::{Binding, DynSymbol, Machine, Relocation, Segment, SymKind};
use crate::error::{Error, Result};

/// Everything the ELF backend needs out of a parsed image.
#[derive(Debug)]
pub struct ElfImage {
    pub machine: Machine,
    pub entry: u64,
    pub segments: Vec<Segment>,
    /// Dynamic symbol table, index-aligned with relocation `symbol_index`
    /// (index 0 is always the null symbol).
    pub symbols: Vec<DynSymbol>,
    pub relocations: Vec<Relocation>,
    pub needed_libraries: Vec<String>,
}

const RELOCATION_SECTIONS: &[&str] = &[".rela.dyn", ".rela.plt", ".rel.dyn", ".rel.plt"];

pub fn parse(bytes: &[u8]) -> Result<ElfImage> {
    let kind = object::FileKind::parse(bytes).map_err(|_| Error::UnsupportedFormat)?;
    match kind {
        object::FileKind::Elf64 => parse_generic::<raw::FileHeader64<Endianness>>(bytes),
        object::FileKind::Elf32 => parse_generic::<raw::FileHeader32<Endianness>>(bytes),
        _ => Err(Error::UnsupportedFormat),
    }
}

fn parse_generic<Elf: FileHeader<Endian = Endianness>>(bytes: &[u8]) -> Result<ElfImage> {
    let header = Elf::parse(bytes).map_err(|_| Error::MalformedImage {
        detail: "could not parse ELF header".into(),
    })?;
    let endian = header
        .endian()
        .map_err(|_| Error::MalformedImage { detail: "invalid ELF endianness".into() })?;

    let machine = match header.e_machine(endian) {
        raw::EM_X86_64 => Machine::X86_64,
        raw::EM_386 => Machine::I386,
        raw::EM_AARCH64 => Machine::Aarch64,
        other => {
            return Err(Error::ForeignPlatform {
                provided: format!("EM_{other}"),
                expected: Machine::host().to_string(),
            })
        }
    };
    if machine != Machine::host() {
        return Err(Error::ForeignPlatform {
            provided: machine.to_string(),
            expected: Machine::host().to_string(),
        });
    }

    if header.e_type(endian) != raw::ET_DYN {
        return Err(Error::MalformedImage {
            detail: "ELF type is not ET_DYN (not a loadable shared object)".into(),
        });
    }

    let program_headers = header
        .program_headers(endian, bytes)
        .map_err(|_| Error::MalformedImage { detail: "invalid ELF program headers".into() })?;

    let mut segments = Vec::new();
    for phdr in program_headers {
        if phdr.p_type(endian) != raw::PT_LOAD {
            continue;
        }
        let flags = phdr.p_flags(endian);
        segments.push(Segment {
            vaddr: phdr.p_vaddr(endian).into(),
            memsz: phdr.p_memsz(endian).into(),
            file_offset: phdr.p_offset(endian).into(),
            filesz: phdr.p_filesz(endian).into(),
            read: flags & raw::PF_R != 0,
            write: flags & raw::PF_W != 0,
            exec: flags & raw::PF_X != 0,
        });
    }
    if segments.is_empty() {
        return Err(Error::MalformedImage {
            detail: "ELF image has no PT_LOAD segments".into(),
        });
    }

    let sections = header
        .sections(endian, bytes)
        .map_err(|_| Error::MalformedImage { detail: "invalid ELF section headers".into() })?;
    let dynsyms = sections
        .symbols(endian, bytes, raw::SHT_DYNSYM)
        .map_err(|_| Error::MalformedImage { detail: "invalid ELF dynamic symbol table".into() })?;

    let mut symbols = Vec::with_capacity(dynsyms.symbols().len());
    for sym in dynsyms.symbols() {
        let name = match sym.name(endian, dynsyms.strings()) {
            Ok(bytes) => validate_symbol_name(bytes)?,
            Err(_) => String::new(),
        };
        let binding = match sym.st_bind() {
            raw::STB_WEAK => Binding::Weak,
            raw::STB_LOCAL => Binding::Local,
            _ => Binding::Global,
        };
        let kind = match sym.st_type() {
            raw::STT_FUNC => SymKind::Func,
            raw::STT_NOTYPE => SymKind::NoType,
            _ => SymKind::Other,
        };
        symbols.push(DynSymbol {
            name,
            value: sym.st_value(endian).into(),
            binding,
            kind,
            defined: sym.st_shndx(endian) != raw::SHN_UNDEF,
        });
    }

    let mut relocations = Vec::new();
    for name in RELOCATION_SECTIONS {
        let Some((_, section)) = sections.section_by_name(endian, name.as_bytes()) else {
            continue;
        };
        match section.sh_type(endian) {
            raw::SHT_RELA => {
                let entries: &[Elf::Rela] = section
                    .data_as_array(endian, bytes)
                    .map_err(|_| Error::MalformedImage {
                        detail: format!("invalid {name} section"),
                    })?;
                for r in entries {
                    relocations.push(Relocation {
                        offset: r.r_offset(endian).into(),
                        rel_type: r.r_type(endian, false),
                        symbol_index: r.symbol(endian, false).map(|s| s.0),
                        addend: Some(r.r_addend(endian).into()),
                    });
                }
            }
            raw::SHT_REL => {
                let entries: &[Elf::Rel] = section
                    .data_as_array(endian, bytes)
                    .map_err(|_| Error::MalformedImage {
                        detail: format!("invalid {name} section"),
                    })?;
                for r in entries {
                    relocations.push(Relocation {
                        offset: r.r_offset(endian).into(),
                        rel_type: r.r_type(endian),
                        symbol_index: r.symbol(endian).map(|s| s.0),
                        addend: None,
                    });
                }
            }
            _ => {}
        }
    }

    let needed_libraries = needed_libraries::<Elf>(header, endian, bytes, program_headers)?;

    Ok(ElfImage {
        machine,
        entry: header.e_entry(endian).into(),
        segments,
        symbols,
        relocations,
        needed_libraries,
    })
}

/// Reject a symbol name that carries an embedded NUL byte, rather than
/// silently truncating or passing it through to a later `CString::new`.
fn validate_symbol_name(bytes: &[u8]) -> Result<String> {
    if bytes.contains(&0) {
        return Err(Error::MalformedImage {
            detail: "symbol name contains an embedded NUL byte".into(),
        });
    }
    Ok(String::from_utf8_lossy(bytes).into_owned())
}

fn needed_libraries<Elf: FileHeader<Endian = Endianness>>(
    header: &Elf,
    endian: Endianness,
    bytes: &[u8],
    program_headers: &[Elf::ProgramHeader],
) -> Result<Vec<String>> {
    let sections = header
        .sections(endian, bytes)
        .map_err(|_| Error::MalformedImage { detail: "invalid ELF section headers".into() })?;
    let dynstr = match sections.section_by_name(endian, b".dynstr") {
        Some((_, section)) => match section.file_range(endian) {
            Some((offset, size)) => StringTable::new(bytes, offset, offset + size),
            None => StringTable::default(),
        },
        None => StringTable::default(),
    };

    let mut needed = Vec::new();
    for phdr in program_headers {
        let Ok(Some(entries)) = phdr.dynamic(endian, bytes) else {
            continue;
        };
        for entry in entries {
            if entry.tag32(endian) == Some(raw::DT_NEEDED) {
                if let Ok(name) = entry.string(endian, dynstr) {
                    needed.push(String::from_utf8_lossy(name).into_owned());
                }
            }
        }
    }
    Ok(needed)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A bare ELF64 header: no program headers, no sections. Enough to
    /// exercise the header-level validation `parse_generic` does before it
    /// ever touches program/section headers.
    fn minimal_elf64_header(e_machine: u16, e_type: u16) -> Vec<u8> {
        let mut buf = vec![0u8; 64];
        buf[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        buf[4] = 2; // ELFCLASS64
        buf[5] = 1; // ELFDATA2LSB
        buf[6] = 1; // EV_CURRENT
        buf[16..18].copy_from_slice(&e_type.to_le_bytes());
        buf[18..20].copy_from_slice(&e_machine.to_le_bytes());
        buf[20..24].copy_from_slice(&1u32.to_le_bytes());
        buf[52..54].copy_from_slice(&64u16.to_le_bytes()); // e_ehsize
        buf[54..56].copy_from_slice(&56u16.to_le_bytes()); // e_phentsize
        buf[58..60].copy_from_slice(&64u16.to_le_bytes()); // e_shentsize
        buf
    }

    #[test]
    fn foreign_machine_is_rejected() {
        let header = minimal_elf64_header(raw::EM_AARCH64, raw::ET_DYN);
        let err = parse(&header).unwrap_err();
        assert!(matches!(err, Error::ForeignPlatform { .. }));
    }

    #[test]
    fn non_dyn_type_is_rejected() {
        let header = minimal_elf64_header(raw::EM_X86_64, raw::ET_EXEC);
        let err = parse(&header).unwrap_err();
        assert!(matches!(err, Error::MalformedImage { .. }));
    }

    #[test]
    fn symbol_name_with_embedded_nul_is_rejected() {
        let err = validate_symbol_name(b"abc\0def").unwrap_err();
        assert!(matches!(err, Error::MalformedImage { .. }));
    }

    #[test]
    fn symbol_name_without_nul_is_accepted() {
        assert_eq!(validate_symbol_name(b"good_name").unwrap(), "good_name");
    }
}
