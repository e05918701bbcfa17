//! The fixed-layout record the emitted host code addresses through its
//! pinned base pointer (EDI).
//!
//! `Vm` itself cannot be used directly here: it owns its sandbox through
//! a `Vec<u8>`-backed `Sandbox`, and `Vec`'s internal layout is not
//! `repr(C)`, so there is no stable offset the JIT could bake into an
//! immediate displacement for "the memory base pointer". `JitState` is a
//! small, `repr(C)` projection of exactly the fields the templates touch
//! — register file, `pc`, and a raw pointer to the sandbox's backing
//! bytes plus its mask — built right before the emitted function is
//! called and copied back into the `Vm` afterward. This mirrors
//! `r5vm_t`'s flat layout in the reference implementation, adapted to
//! Rust's ownership model.
#[repr(C)]
pub struct JitState {
    pub pc: u32,
    pub regs: [u32; 32],
    pub mem_ptr: *mut u8,
    pub mem_mask: u32,
}

pub mod offsets {
    use super::JitState;

    pub fn pc() -> i32 {
        std::mem::offset_of!(JitState, pc) as i32
    }

    pub fn reg(n: u32) -> i32 {
        (std::mem::offset_of!(JitState, regs) + (n as usize) * 4) as i32
    }

    pub fn mem_ptr() -> i32 {
        std::mem::offset_of!(JitState, mem_ptr) as i32
    }

    pub fn mem_mask() -> i32 {
        std::mem::offset_of!(JitState, mem_mask) as i32
    }
}
