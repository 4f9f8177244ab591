//! Firmware file formats
use std::str;
use std::{borrow::Cow, path::Path};

use object::{
    elf::FileHeader32, elf::PT_LOAD, read::elf::FileHeader, read::elf::ProgramHeader, Endianness,
};

use crate::constants::ERASED_BYTE;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FirmwareFormat {
    PlainHex,
    IntelHex,
    ELF,
    Binary,
}

fn invalid(e: impl std::fmt::Display) -> Error {
    Error::InvalidImage(e.to_string())
}

/// Read a program image, laid out from flash address 0.
pub fn read_firmware_from_file<P: AsRef<Path>>(path: P) -> Result<Vec<u8>> {
    let p = path.as_ref();
    let raw = std::fs::read(p).map_err(|e| invalid(format!("{}: {}", p.display(), e)))?;

    let format = guess_format(p, &raw);
    log::info!("Read {} as {:?} format", p.display(), format);
    read_firmware(format, &raw)
}

pub fn read_firmware(format: FirmwareFormat, raw: &[u8]) -> Result<Vec<u8>> {
    match format {
        FirmwareFormat::PlainHex => read_hex(str::from_utf8(raw).map_err(invalid)?),
        FirmwareFormat::IntelHex => read_ihex(str::from_utf8(raw).map_err(invalid)?),
        FirmwareFormat::ELF => objcopy_binary(raw),
        FirmwareFormat::Binary => Ok(raw.to_vec()),
    }
}

pub fn guess_format(path: &Path, raw: &[u8]) -> FirmwareFormat {
    let ext = path
        .extension()
        .map(|s| s.to_string_lossy())
        .unwrap_or_default()
        .to_lowercase();
    if ["ihex", "ihe", "h86", "hex", "a43", "a90"].contains(&&*ext) {
        return FirmwareFormat::IntelHex;
    }
    if ext == "bin" || raw.is_empty() {
        return FirmwareFormat::Binary;
    }

    if raw.starts_with(&[0x7f, b'E', b'L', b'F']) {
        FirmwareFormat::ELF
    } else if raw[0] == b':'
        && raw
            .iter()
            .all(|&c| c.is_ascii_hexdigit() || c == b':' || c == b'\n' || c == b'\r')
    {
        FirmwareFormat::IntelHex
    } else if raw
        .iter()
        .all(|&c| c.is_ascii_hexdigit() || c.is_ascii_whitespace())
    {
        FirmwareFormat::PlainHex
    } else {
        FirmwareFormat::Binary
    }
}

pub fn read_hex(data: &str) -> Result<Vec<u8>> {
    let digits: String = data.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    hex::decode(digits).map_err(invalid)
}

pub fn read_ihex(data: &str) -> Result<Vec<u8>> {
    use ihex::Record;

    let mut base_address = 0;

    let mut records = vec![];
    for record in ihex::Reader::new(data) {
        let record = record.map_err(invalid)?;
        use Record::*;
        match record {
            Data { offset, value } => {
                let offset = base_address + offset as u32;

                records.push((offset, value.into()));
            }
            EndOfFile => (),
            ExtendedSegmentAddress(address) => {
                base_address = (address as u32) * 16;
            }
            StartSegmentAddress { .. } => (),
            ExtendedLinearAddress(address) => {
                base_address = (address as u32) << 16;
            }
            StartLinearAddress(_) => (),
        };
    }
    merge_sections(records)
}

/// Simulates `objcopy -O binary` for the loadable segments of an ELF32 file.
pub fn objcopy_binary(elf_data: &[u8]) -> Result<Vec<u8>> {
    let file_kind = object::FileKind::parse(elf_data).map_err(invalid)?;

    match file_kind {
        object::FileKind::Elf32 => (),
        _ => return Err(invalid("cannot read file as ELF32 format")),
    }
    let elf_header = FileHeader32::<Endianness>::parse(elf_data).map_err(invalid)?;
    let endian = elf_header.endian().map_err(invalid)?;

    let mut sections = vec![];
    for segment in elf_header
        .program_headers(endian, elf_data)
        .map_err(invalid)?
    {
        // The data is programmed at the physical (load) address.
        let p_paddr: u64 = segment.p_paddr(endian).into();

        let segment_data = segment
            .data(endian, elf_data)
            .map_err(|_| invalid("Failed to access data for an ELF segment"))?;
        if !segment_data.is_empty() && segment.p_type(endian) == PT_LOAD {
            log::info!(
                "Found loadable segment, physical address: {:#06x}, size: {:#x}",
                p_paddr,
                segment_data.len()
            );
            sections.push((p_paddr as u32, Cow::Borrowed(segment_data)));
        }
    }

    if sections.is_empty() {
        return Err(invalid("empty ELF file"));
    }
    log::debug!("found {} segments", sections.len());
    merge_sections(sections)
}

/// Flatten `(address, data)` chunks into an image starting at address 0.
fn merge_sections(mut sections: Vec<(u32, Cow<[u8]>)>) -> Result<Vec<u8>> {
    sections.sort_by_key(|(addr, _)| *addr);

    let end_address = sections
        .iter()
        .map(|(addr, sect)| *addr as usize + sect.len())
        .max()
        .unwrap_or(0);

    let mut binary = vec![ERASED_BYTE; end_address];
    let mut filled_to = 0;
    for (addr, sect) in sections {
        let sect_start = addr as usize;
        if sect_start < filled_to {
            return Err(invalid(format!("overlapping data at {:#06x}", sect_start)));
        }
        let sect_end = sect_start + sect.len();
        binary[sect_start..sect_end].copy_from_slice(&sect);
        filled_to = sect_end;
    }
    Ok(binary)
}
