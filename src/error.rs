//! Flat (non-hierarchical) error kinds for the loader, interpreter, and JIT.
//!
//! None of these nest inside one another: a caller matches on exactly one
//! enum depending on which stage failed, mirroring the "flat error kinds"
//! propagation policy the VM is specified against.

use thiserror::Error;

/// Failures from parsing and placing a `.r5m` image into a sandbox.
#[derive(Error, Debug)]
pub enum ImageError {
    #[error("bad magic number in image header")]
    BadMagic,
    #[error("unsupported image version {found}, expected {expected}")]
    UnsupportedVersion { found: u16, expected: u16 },
    #[error("image targets 64-bit (flags bit 0 set); this VM is 32-bit only")]
    Is64Bit,
    #[error(
        "sections do not fit in requested ram: load_addr={load_addr} code_size={code_size} \
         data_size={data_size} bss_size={bss_size} ram_size={ram_size}"
    )]
    SectionsExceedRam {
        load_addr: u32,
        code_size: u32,
        data_size: u32,
        bss_size: u32,
        ram_size: u32,
    },
    #[error("I/O error reading image: {0}")]
    Io(#[from] std::io::Error),
}

/// Faults reported by the interpreter's fetch-decode-execute loop.
#[derive(Error, Debug)]
pub enum DecodeFault {
    #[error("illegal instruction 0x{instr:08x} at pc=0x{pc:08x}: {reason}")]
    IllegalInstruction {
        pc: u32,
        instr: u32,
        reason: &'static str,
    },
}

/// Failures while compiling RV32I code to host machine code.
#[derive(Error, Debug)]
pub enum JitError {
    #[error("host memory allocation failed for {bytes} bytes")]
    Alloc { bytes: usize },
    #[error("JIT emit cursor exceeded buffer capacity")]
    BufferOverflow,
    #[error(transparent)]
    Decode(#[from] DecodeFault),
}
