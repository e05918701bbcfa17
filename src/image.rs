//! `.r5m` image loading: parse the 64-byte header, validate it, and place
//! `.code`/`.data` into a freshly allocated sandbox.

use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::error::ImageError;
use crate::memory::Sandbox;
use crate::vm::Vm;

const MAGIC: &[u8; 4] = b"r5vm";
const SUPPORTED_VERSION: u16 = 1;
const HEADER_SIZE: usize = 64;
const MIN_MEM_SIZE: u32 = 64;

struct Header {
    entry: u32,
    load_addr: u32,
    ram_size: u32,
    code_offset: u32,
    code_size: u32,
    data_offset: u32,
    data_size: u32,
    bss_size: u32,
}

fn rd_u16_le(buf: &[u8], off: usize) -> u16 {
    (buf[off] as u16) | ((buf[off + 1] as u16) << 8)
}

fn rd_u32_le(buf: &[u8], off: usize) -> u32 {
    (buf[off] as u32)
        | ((buf[off + 1] as u32) << 8)
        | ((buf[off + 2] as u32) << 16)
        | ((buf[off + 3] as u32) << 24)
}

fn parse_header(buf: &[u8; HEADER_SIZE]) -> Result<Header, ImageError> {
    if &buf[0..4] != MAGIC {
        return Err(ImageError::BadMagic);
    }
    let version = rd_u16_le(buf, 4);
    if version != SUPPORTED_VERSION {
        return Err(ImageError::UnsupportedVersion {
            found: version,
            expected: SUPPORTED_VERSION,
        });
    }
    let flags = rd_u16_le(buf, 6);
    if flags & 1 != 0 {
        return Err(ImageError::Is64Bit);
    }
    Ok(Header {
        entry: rd_u32_le(buf, 8),
        load_addr: rd_u32_le(buf, 12),
        ram_size: rd_u32_le(buf, 16),
        code_offset: rd_u32_le(buf, 20),
        code_size: rd_u32_le(buf, 24),
        data_offset: rd_u32_le(buf, 28),
        data_size: rd_u32_le(buf, 32),
        bss_size: rd_u32_le(buf, 36),
        // total_size (offset 40) and the 24 reserved bytes are
        // informational only and ignored on load.
    })
}

fn next_power_of_two_at_least(value: u32, minimum: u32) -> u32 {
    let mut size = minimum.max(1);
    while size < value {
        size <<= 1;
    }
    size
}

/// Load an `.r5m` image from any `Read + Seek` source (a real file, or an
/// in-memory cursor in tests) into a fresh `Vm` sized at least
/// `requested_mem_size` bytes (0 = no override beyond the header's own
/// `ram_size`).
pub fn load<R: Read + Seek>(mut reader: R, requested_mem_size: u32) -> Result<Vm, ImageError> {
    let mut header_buf = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header_buf)?;
    let h = parse_header(&header_buf)?;

    let needed = h
        .load_addr
        .wrapping_add(h.code_size)
        .wrapping_add(h.data_size)
        .wrapping_add(h.bss_size);
    if needed > h.ram_size {
        return Err(ImageError::SectionsExceedRam {
            load_addr: h.load_addr,
            code_size: h.code_size,
            data_size: h.data_size,
            bss_size: h.bss_size,
            ram_size: h.ram_size,
        });
    }

    let mem_size = next_power_of_two_at_least(h.ram_size.max(requested_mem_size), MIN_MEM_SIZE);
    let mut sandbox = Sandbox::new(mem_size);

    reader.seek(SeekFrom::Start(h.code_offset as u64))?;
    let mut code_buf = vec![0u8; h.code_size as usize];
    reader.read_exact(&mut code_buf)?;
    sandbox.write_blob(h.load_addr, &code_buf);

    if h.data_size > 0 {
        reader.seek(SeekFrom::Start(h.data_offset as u64))?;
        let mut data_buf = vec![0u8; h.data_size as usize];
        reader.read_exact(&mut data_buf)?;
        sandbox.write_blob(h.load_addr.wrapping_add(h.code_size), &data_buf);
    }

    let mut vm = Vm::new(sandbox);
    vm.code_offset = h.load_addr;
    vm.code_size = h.code_size;
    vm.data_offset = h.load_addr.wrapping_add(h.code_size);
    vm.data_size = h.data_size;
    vm.bss_offset = vm.data_offset.wrapping_add(vm.data_size);
    vm.bss_size = h.bss_size;
    vm.entry = h.entry & vm.mask();
    vm.reset();
    Ok(vm)
}

/// Convenience wrapper over `load` for a real file on disk.
pub fn load_file(path: &Path, requested_mem_size: u32) -> Result<Vm, ImageError> {
    let file = std::fs::File::open(path)?;
    load(std::io::BufReader::new(file), requested_mem_size)
}
