//! PE parsing and validation for PE32/PE32+ DLL images.
//!
//! PE's relocation and import model doesn't fit the ELF-shaped
//! `Relocation`/`DynSymbol` types in `crate::format`, so this module keeps
//! its own PE-specific shapes; `crate::backend::pe` applies them directly.

use object::pe as raw;
use object::read::pe::{ImageNtHeaders, ImageOptionalHeader};
use object::LittleEndian as LE;

use super::{Machine, Segment};
use crate::error::{Error, Result};

pub struct PeImage {
    pub machine: Machine,
    pub image_base: u64,
    pub entry_rva: u32,
    pub segments: Vec<Segment>,
    pub base_relocations: Vec<BaseRelocation>,
    pub imports: Vec<Import>,
    /// `(name, rva)` for every named, non-forwarded export.
    pub exports: Vec<(String, u32)>,
    pub is_64: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct BaseRelocation {
    pub rva: u32,
    pub kind: u16,
}

#[derive(Debug, Clone)]
pub struct Import {
    pub dll: String,
    pub name: Option<String>,
    pub ordinal: Option<u16>,
    /// RVA of the thunk slot (IAT entry) to overwrite with the resolved
    /// address.
    pub thunk_rva: u32,
}

pub fn parse(bytes: &[u8]) -> Result<PeImage> {
    let kind = object::FileKind::parse(bytes).map_err(|_| Error::UnsupportedFormat)?;
    match kind {
        object::FileKind::Pe64 => parse_generic::<raw::ImageNtHeaders64>(bytes),
        object::FileKind::Pe32 => parse_generic::<raw::ImageNtHeaders32>(bytes),
        _ => Err(Error::UnsupportedFormat),
    }
}

fn parse_generic<Pe: ImageNtHeaders>(bytes: &[u8]) -> Result<PeImage> {
    let dos_header = raw::ImageDosHeader::parse(bytes)
        .map_err(|_| Error::MalformedImage { detail: "invalid PE DOS header".into() })?;
    let mut offset: u64 = dos_header.nt_headers_offset().into();
    let (nt_headers, data_directories) = Pe::parse(bytes, &mut offset)
        .map_err(|_| Error::MalformedImage { detail: "invalid PE NT headers".into() })?;

    let machine = match nt_headers.file_header().machine.get(LE) {
        raw::IMAGE_FILE_MACHINE_AMD64 => Machine::X86_64,
        raw::IMAGE_FILE_MACHINE_I386 => Machine::I386,
        raw::IMAGE_FILE_MACHINE_ARM64 => Machine::Aarch64,
        other => {
            return Err(Error::ForeignPlatform {
                provided: format!("machine {other:#x}"),
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

    let characteristics = nt_headers.file_header().characteristics.get(LE);
    if characteristics & raw::IMAGE_FILE_DLL == 0 {
        return Err(Error::MalformedImage {
            detail: "PE image does not carry the DLL characteristics flag".into(),
        });
    }

    let sections = nt_headers
        .sections(bytes, offset)
        .map_err(|_| Error::MalformedImage { detail: "invalid PE section table".into() })?;

    let mut segments = Vec::new();
    for section in sections.iter() {
        let (file_offset, filesz) = section.pe_file_range();
        segments.push(Segment {
            vaddr: section.virtual_address.get(LE) as u64,
            memsz: section.virtual_size.get(LE) as u64,
            file_offset: file_offset as u64,
            filesz: filesz as u64,
            read: section.characteristics.get(LE) & raw::IMAGE_SCN_MEM_READ != 0,
            write: section.characteristics.get(LE) & raw::IMAGE_SCN_MEM_WRITE != 0,
            exec: section.characteristics.get(LE) & raw::IMAGE_SCN_MEM_EXECUTE != 0,
        });
    }
    if segments.is_empty() {
        return Err(Error::MalformedImage { detail: "PE image has no sections".into() });
    }

    let base_relocations = parse_base_relocations(&data_directories, bytes, &sections)?;
    let imports = parse_imports::<Pe>(&data_directories, bytes, &sections)?;
    let exports = parse_exports(&data_directories, bytes, &sections)?;

    Ok(PeImage {
        machine,
        image_base: nt_headers.optional_header().image_base(),
        entry_rva: nt_headers.optional_header().address_of_entry_point(),
        segments,
        base_relocations,
        imports,
        exports,
        is_64: nt_headers.is_type_64(),
    })
}

fn parse_exports(
    data_directories: &object::read::pe::DataDirectories,
    bytes: &[u8],
    sections: &object::read::pe::SectionTable,
) -> Result<Vec<(String, u32)>> {
    let Some(table) = data_directories
        .export_table(bytes, sections)
        .map_err(|_| Error::MalformedImage { detail: "invalid PE export directory".into() })?
    else {
        return Ok(Vec::new());
    };

    let exports = table
        .exports()
        .map_err(|_| Error::MalformedImage { detail: "invalid PE export table".into() })?;

    let mut out = Vec::new();
    for export in exports {
        let object::read::pe::ExportTarget::Address(rva) = export.target else {
            continue; // forwarded exports resolve into another DLL, out of scope
        };
        if let Some(name) = export.name {
            out.push((String::from_utf8_lossy(name).into_owned(), rva));
        }
    }
    Ok(out)
}

fn parse_base_relocations(
    data_directories: &object::read::pe::DataDirectories,
    bytes: &[u8],
    sections: &object::read::pe::SectionTable,
) -> Result<Vec<BaseRelocation>> {
    let Some(mut blocks) = data_directories
        .relocation_blocks(bytes, sections)
        .map_err(|_| Error::MalformedImage { detail: "invalid PE base relocation directory".into() })?
    else {
        return Ok(Vec::new());
    };

    let mut out = Vec::new();
    while let Some(block) = blocks.next().map_err(|_| Error::MalformedImage {
        detail: "invalid PE base relocation block".into(),
    })? {
        for reloc in block {
            out.push(BaseRelocation { rva: reloc.virtual_address, kind: reloc.typ });
        }
    }
    Ok(out)
}

fn parse_imports<Pe: ImageNtHeaders>(
    data_directories: &object::read::pe::DataDirectories,
    bytes: &[u8],
    sections: &object::read::pe::SectionTable,
) -> Result<Vec<Import>> {
    let Some(table) = data_directories
        .import_table(bytes, sections)
        .map_err(|_| Error::MalformedImage { detail: "invalid PE import directory".into() })?
    else {
        return Ok(Vec::new());
    };

    let mut out = Vec::new();
    let mut descriptors = table
        .descriptors()
        .map_err(|_| Error::MalformedImage { detail: "invalid PE import descriptors".into() })?;
    while let Some(descriptor) = descriptors.next().map_err(|_| Error::MalformedImage {
        detail: "invalid PE import descriptor".into(),
    })? {
        let dll = table
            .name(descriptor.name.get(LE))
            .map(|n| String::from_utf8_lossy(n).into_owned())
            .unwrap_or_default();
        let thunk_addr = descriptor.original_first_thunk.get(LE);
        let thunk_addr = if thunk_addr == 0 { descriptor.first_thunk.get(LE) } else { thunk_addr };
        let mut rva = descriptor.first_thunk.get(LE);
        let mut thunks = table
            .thunks(thunk_addr)
            .map_err(|_| Error::MalformedImage { detail: "invalid PE import thunk list".into() })?;
        while let Some(thunk) = thunks
            .next::<Pe>()
            .map_err(|_| Error::MalformedImage { detail: "invalid PE import thunk".into() })?
        {
            let import = table
                .import::<Pe>(thunk)
                .map_err(|_| Error::MalformedImage { detail: "invalid PE import entry".into() })?;
            let (name, ordinal) = match import {
                object::read::pe::Import::Ordinal(ord) => (None, Some(ord)),
                object::read::pe::Import::Name(_, name) => {
                    (Some(String::from_utf8_lossy(name).into_owned()), None)
                }
            };
            out.push(Import { dll: dll.clone(), name, ordinal, thunk_rva: rva });
            rva += std::mem::size_of::<Pe::ImageThunkData>() as u32;
        }
    }
    Ok(out)
}
