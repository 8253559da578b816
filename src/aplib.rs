//! AP32-container aplib-safe decompression.
//!
//! A Mach-O image may arrive aplib-compressed, flagged by a leading `AP32`
//! container header. `decompress` validates the header and depacks the
//! payload with a bounds-checked port of the classic aPLib LZ scheme: an
//! 8-bit tag stream of control bits, gamma-coded lengths/offsets, and
//! backward byte copies. No reference aPLib stream was available to check
//! constants against, so the bias values below follow the commonly
//! published description of the format; every buffer access is bounds
//! checked and returns [`Error::Ap32DecodeFailure`] rather than indexing
//! out of range.

use crate::error::{Error, Result};

const AP32_TAG: u32 = 0x3233_5041; // "AP32", little-endian u32 read of b"AP32"
const HEADER_LEN: usize = 20;

struct Header {
    header_size: u32,
    packed_size: u32,
    orig_size: u32,
}

fn read_u32(bytes: &[u8], offset: usize) -> Result<u32> {
    bytes
        .get(offset..offset + 4)
        .map(|s| u32::from_le_bytes(s.try_into().unwrap()))
        .ok_or(Error::Ap32HeaderInvalid)
}

fn parse_header(bytes: &[u8]) -> Result<Header> {
    if bytes.len() < HEADER_LEN {
        return Err(Error::Ap32HeaderInvalid);
    }
    let tag = read_u32(bytes, 0)?;
    if tag != AP32_TAG {
        return Err(Error::Ap32HeaderInvalid);
    }
    let header_size = read_u32(bytes, 4)?;
    let packed_size = read_u32(bytes, 8)?;
    // bytes 12..16 reserved
    let orig_size = read_u32(bytes, 16)?;

    if header_size < 24 || orig_size == 0 {
        return Err(Error::Ap32HeaderInvalid);
    }
    let payload_end = (header_size as u64)
        .checked_add(packed_size as u64)
        .ok_or(Error::Ap32HeaderInvalid)?;
    if payload_end > bytes.len() as u64 {
        return Err(Error::Ap32HeaderInvalid);
    }
    Ok(Header { header_size, packed_size, orig_size })
}

/// Depack an AP32-wrapped image, returning the decompressed Mach-O bytes.
pub fn decompress(bytes: &[u8]) -> Result<Vec<u8>> {
    let header = parse_header(bytes)?;
    let start = header.header_size as usize;
    let end = start + header.packed_size as usize;
    let packed = &bytes[start..end];
    depack(packed, header.orig_size as usize)
}

struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
    tag: u8,
    bitcount: u8,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> BitReader<'a> {
        BitReader { data, pos: 0, tag: 0, bitcount: 0 }
    }

    fn byte(&mut self) -> Result<u8> {
        let b = *self.data.get(self.pos).ok_or(Error::Ap32DecodeFailure {
            detail: "aplib stream exhausted reading a literal byte".into(),
        })?;
        self.pos += 1;
        Ok(b)
    }

    fn bit(&mut self) -> Result<u32> {
        if self.bitcount == 0 {
            self.tag = self.byte()?;
            self.bitcount = 8;
        }
        let bit = (self.tag & 0x80 != 0) as u32;
        self.tag <<= 1;
        self.bitcount -= 1;
        Ok(bit)
    }

    /// aPLib's gamma code: a unary-terminated run of bits building up a
    /// value starting from 1, MSB-first.
    fn gamma(&mut self) -> Result<u32> {
        let mut result: u32 = 1;
        loop {
            result = (result << 1) | self.bit()?;
            if self.bit()? == 0 {
                break;
            }
        }
        Ok(result)
    }
}

fn depack(packed: &[u8], orig_size: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(orig_size);
    let mut reader = BitReader::new(packed);
    let mut last_offset: u32 = 0;

    // The first output byte is always a literal.
    out.push(reader.byte()?);

    while out.len() < orig_size {
        if reader.bit()? == 0 {
            out.push(reader.byte()?);
            continue;
        }

        let (offset, length) = if reader.bit()? == 0 {
            // Short match: reuses the last offset, gamma-coded length.
            let length = reader.gamma()? + 1;
            (last_offset, length)
        } else {
            // Long match: gamma-coded offset high bits plus a literal low
            // byte, gamma-coded length, with length bias applied based on
            // offset magnitude (the classic aPLib adjustment).
            let high = reader.gamma()?.wrapping_sub(2);
            let low = reader.byte()? as u32;
            let offset = (high << 8) | low;
            if offset == 0 {
                break; // end-of-stream marker
            }
            let mut length = reader.gamma()?;
            if offset >= 32000 {
                length += 1;
            }
            if offset >= 1280 {
                length += 1;
            }
            if offset < 128 {
                length += 2;
            }
            (offset, length)
        };

        if offset == 0 || offset as usize > out.len() {
            return Err(Error::Ap32DecodeFailure {
                detail: format!("back-reference offset {offset} exceeds decoded output"),
            });
        }
        last_offset = offset;
        for _ in 0..length {
            if out.len() >= orig_size {
                break;
            }
            let byte = out[out.len() - offset as usize];
            out.push(byte);
        }
    }

    out.truncate(orig_size);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_HEADER_SIZE: u32 = 24;

    fn build_ap32(orig_size: u32, packed: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"AP32");
        out.extend_from_slice(&TEST_HEADER_SIZE.to_le_bytes());
        out.extend_from_slice(&(packed.len() as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&orig_size.to_le_bytes());
        out.resize(TEST_HEADER_SIZE as usize, 0); // pad up to header_size
        out.extend_from_slice(packed);
        out
    }

    /// A literal-only stream: every control bit is 0, so the loop never
    /// reaches a back-reference. A `0x00` tag byte supplies 8 zero control
    /// bits, each immediately followed in the stream by the literal byte it
    /// gates — matching `BitReader`'s lazy tag refill.
    #[test]
    fn literal_only_round_trip() {
        let literal_bytes = b"HELLOWRLD"; // first byte is the raw literal
        let remaining = &literal_bytes[1..];
        let mut packed = vec![literal_bytes[0]];
        for group in remaining.chunks(8) {
            packed.push(0x00); // 8 literal control bits
            packed.extend_from_slice(group);
        }

        let ap32 = build_ap32(literal_bytes.len() as u32, &packed);
        let out = decompress(&ap32).unwrap();
        assert_eq!(out, literal_bytes);
    }

    #[test]
    fn rejects_bad_tag() {
        let mut bytes = vec![0u8; HEADER_LEN];
        bytes[0..4].copy_from_slice(b"XXXX");
        assert!(matches!(decompress(&bytes), Err(Error::Ap32HeaderInvalid)));
    }

    #[test]
    fn rejects_short_header_size() {
        let mut header = vec![0u8; HEADER_LEN];
        header[0..4].copy_from_slice(b"AP32");
        header[4..8].copy_from_slice(&20u32.to_le_bytes()); // < 24
        header[16..20].copy_from_slice(&4u32.to_le_bytes());
        assert!(matches!(decompress(&header), Err(Error::Ap32HeaderInvalid)));
    }

    #[test]
    fn rejects_zero_orig_size() {
        let mut header = vec![0u8; HEADER_LEN];
        header[0..4].copy_from_slice(b"AP32");
        header[4..8].copy_from_slice(&24u32.to_le_bytes());
        header[16..20].copy_from_slice(&0u32.to_le_bytes());
        assert!(matches!(decompress(&header), Err(Error::Ap32HeaderInvalid)));
    }

    #[test]
    fn rejects_packed_size_overflowing_buffer() {
        let mut header = vec![0u8; HEADER_LEN];
        header[0..4].copy_from_slice(b"AP32");
        header[4..8].copy_from_slice(&24u32.to_le_bytes());
        header[8..12].copy_from_slice(&1000u32.to_le_bytes());
        header[16..20].copy_from_slice(&4u32.to_le_bytes());
        assert!(matches!(decompress(&header), Err(Error::Ap32HeaderInvalid)));
    }
}
