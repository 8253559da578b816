//! Mach-O parsing and validation: segment layout and optional AP32 decompression.
//!
//! Unlike the ELF and PE backends, the Mach-O backend does not apply
//! relocations itself (dyld4 does, see `crate::backend::macho`), so this
//! module only needs to lay out segments and hand back the `__TEXT`
//! segment's file offset/vmaddr, which the backend uses to compute the
//! "load address" dyld expects.

use object::macho as raw;
use object::read::macho::{MachHeader, Nlist as _, Segment as _};
use object::Endianness;

use super::{Machine, Segment};
use crate::error::{Error, Result};

pub struct MachOImage {
    pub machine: Machine,
    pub segments: Vec<Segment>,
    /// `(vmaddr, fileoff)` of the `__TEXT` segment.
    pub text: (u64, u64),
    pub is_64: bool,
    /// `(name, vmaddr)` for every defined, non-stab symbol, vmaddr relative
    /// to this image's own preferred base (add the mapping's slide to get a
    /// runtime address).
    pub symbols: Vec<(String, u64)>,
}

const AP32_MAGIC: [u8; 4] = *b"AP32";

/// Whether the image is AP32-compressed.
pub fn is_ap32(bytes: &[u8]) -> bool {
    bytes.len() >= 4 && bytes[0..4] == AP32_MAGIC
}

pub fn parse(bytes: &[u8]) -> Result<MachOImage> {
    let kind = object::FileKind::parse(bytes).map_err(|_| Error::UnsupportedFormat)?;
    match kind {
        object::FileKind::MachO64 => parse_generic::<raw::MachHeader64<Endianness>>(bytes),
        object::FileKind::MachO32 => parse_generic::<raw::MachHeader32<Endianness>>(bytes),
        _ => Err(Error::UnsupportedFormat),
    }
}

fn parse_generic<Mh: MachHeader<Endian = Endianness>>(bytes: &[u8]) -> Result<MachOImage> {
    let header = Mh::parse(bytes, 0).map_err(|_| Error::MalformedImage {
        detail: "could not parse Mach-O header".into(),
    })?;
    let endian = header
        .endian()
        .map_err(|_| Error::MalformedImage { detail: "invalid Mach-O endianness".into() })?;

    let machine = match header.cputype(endian) {
        raw::CPU_TYPE_X86_64 => Machine::X86_64,
        raw::CPU_TYPE_ARM64 => Machine::Aarch64,
        other => {
            return Err(Error::ForeignPlatform {
                provided: format!("cputype {other}"),
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

    let filetype = header.filetype(endian);
    if filetype != raw::MH_DYLIB && filetype != raw::MH_BUNDLE {
        return Err(Error::MalformedImage {
            detail: "Mach-O file type is not a dylib or bundle".into(),
        });
    }

    let mut commands = header
        .load_commands(endian, bytes, 0)
        .map_err(|_| Error::MalformedImage { detail: "invalid Mach-O load commands".into() })?;

    let mut segments = Vec::new();
    let mut text = None;
    let mut symbols = Vec::new();
    while let Some(cmd) = commands.next().map_err(|_| Error::MalformedImage {
        detail: "invalid Mach-O load command".into(),
    })? {
        if let Some((seg, _)) = cmd
            .segment_32()
            .map_err(|_| Error::MalformedImage { detail: "invalid Mach-O segment".into() })?
        {
            push_segment(&mut segments, &mut text, seg.name(), seg.vmaddr(endian).into(),
                seg.vmsize(endian).into(), seg.fileoff(endian).into(), seg.filesize(endian).into(),
                seg.initprot(endian));
        }
        if let Some((seg, _)) = cmd
            .segment_64()
            .map_err(|_| Error::MalformedImage { detail: "invalid Mach-O segment".into() })?
        {
            push_segment(&mut segments, &mut text, seg.name(), seg.vmaddr(endian),
                seg.vmsize(endian), seg.fileoff(endian), seg.filesize(endian),
                seg.initprot(endian));
        }
        if let Some(symtab) = cmd
            .symtab()
            .map_err(|_| Error::MalformedImage { detail: "invalid Mach-O symtab command".into() })?
        {
            let table = symtab
                .symbols::<Mh, _>(endian, bytes)
                .map_err(|_| Error::MalformedImage { detail: "invalid Mach-O symbol table".into() })?;
            for nlist in table.iter() {
                if !nlist.is_definition() {
                    continue;
                }
                let Ok(name) = nlist.name(endian, table.strings()) else { continue };
                if name.is_empty() {
                    continue;
                }
                symbols.push((String::from_utf8_lossy(name).into_owned(), nlist.n_value(endian).into()));
            }
        }
    }

    let text = text.ok_or_else(|| Error::MalformedImage {
        detail: "Mach-O image has no __TEXT segment".into(),
    })?;

    Ok(MachOImage { machine, segments, text, is_64: header.is_type_64(), symbols })
}

#[allow(clippy::too_many_arguments)]
fn push_segment(
    segments: &mut Vec<Segment>,
    text: &mut Option<(u64, u64)>,
    name: &[u8],
    vmaddr: u64,
    vmsize: u64,
    fileoff: u64,
    filesize: u64,
    initprot: u32,
) {
    if name == raw::SEG_TEXT.as_bytes() {
        *text = Some((vmaddr, fileoff));
    }
    segments.push(Segment {
        vaddr: vmaddr,
        memsz: vmsize,
        file_offset: fileoff,
        filesz: filesize,
        read: initprot & raw::VM_PROT_READ != 0,
        write: initprot & raw::VM_PROT_WRITE != 0,
        exec: initprot & raw::VM_PROT_EXECUTE != 0,
    });
}
