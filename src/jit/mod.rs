//! The single-pass template JIT: lowers a loaded image's RV32I code
//! region to host x86-32 machine code, routing all control flow through
//! a per-PC dispatch table (§4.7–§4.9).
//!
//! `unsafe` is confined to this module: mmap-backed RWX memory, raw
//! pointer writes into the emitted buffer, and calling the compiled
//! region as a function are unavoidable for a JIT. (The crate uses
//! `#[deny(unsafe_code)]` rather than `#[forbid(unsafe_code)]` at the
//! root specifically so this module can carry the scoped exception;
//! `forbid` cannot be locally overridden even in a submodule.)
#![allow(unsafe_code)]

pub mod buffer;
pub mod dispatch;
pub mod driver;
pub mod state;
pub mod templates;

pub use buffer::JitBuffer;
pub use dispatch::DispatchTable;
pub use driver::run_jit;
pub use state::JitState;
