//! RV32I sandbox VM: a decode-dispatch interpreter and a single-pass
//! x86-32 template JIT sharing one architectural state record.
//!
//! `unsafe` is denied everywhere except the `jit` module, which cannot
//! avoid it (RWX host memory, raw-pointer emission, and invoking
//! compiled code as a function pointer).
#![deny(unsafe_code)]

pub mod decode;
pub mod diff;
pub mod error;
pub mod image;
pub mod jit;
pub mod memory;
pub mod vm;

pub use error::{DecodeFault, ImageError, JitError};
pub use vm::{ErrorSink, HostIo, RunResult, StderrSink, StdoutIo, StepOutcome, Vm};
