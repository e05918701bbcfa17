//! Compiles a loaded image's code region to host machine code and runs
//! it once (§4.9).
//!
//! Sequence: allocate the RWX buffer and dispatch table, emit the
//! prolog, walk the code region recording each instruction's dispatch
//! slot *before* emitting its bytes, emit the epilog, then call the
//! emitted function. The JIT never re-enters: one call compiles and
//! executes exactly once.

use std::cell::RefCell;

use crate::decode::Fields;
use crate::error::JitError;
use crate::jit::buffer::JitBuffer;
use crate::jit::dispatch::DispatchTable;
use crate::jit::state::JitState;
use crate::jit::templates;
use crate::vm::{ErrorSink, HostIo, RunResult, Vm};

// The emitted machine code can only reach a fixed-address Rust function
// by `call`, not a two-word trait object. This thread-local is the
// bridge: the driver pins the caller's injected `HostIo`/`ErrorSink` here
// for the sole duration of one emitted-function call, and the ECALL
// handler below reads through it. This is the only process-wide mutable
// state the JIT introduces, and it exists only to route ECALL back to
// the same injected capability the interpreter uses — not a new global.
thread_local! {
    static ACTIVE_HOST: RefCell<Option<*mut dyn HostIo>> = RefCell::new(None);
    static ACTIVE_SINK: RefCell<Option<*mut dyn ErrorSink>> = RefCell::new(None);
}

struct ActiveGuard;

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        ACTIVE_HOST.with(|h| *h.borrow_mut() = None);
        ACTIVE_SINK.with(|s| *s.borrow_mut() = None);
    }
}

fn set_active(host: &mut dyn HostIo, sink: &mut dyn ErrorSink) -> ActiveGuard {
    ACTIVE_HOST.with(|h| *h.borrow_mut() = Some(host as *mut dyn HostIo));
    ACTIVE_SINK.with(|s| *s.borrow_mut() = Some(sink as *mut dyn ErrorSink));
    ActiveGuard
}

/// The ECALL bridge emitted code `call`s with the `JitState` pointer
/// (pushed by the template) as its sole argument. Returns nonzero to
/// signal "halt requested" back to the emitted epilog check.
///
/// # Safety
/// Called only from JIT-emitted machine code while `ACTIVE_HOST`/
/// `ACTIVE_SINK` are set by `run_jit`, with `state` pointing at a live
/// `JitState` pinned for the duration of that call.
extern "C" fn jit_ecall_handler(state: *mut JitState) -> i32 {
    let state = unsafe { &mut *state };
    let a7 = state.regs[17];
    let a0 = state.regs[10];
    match a7 {
        0 => 1, // halt
        1 => {
            ACTIVE_HOST.with(|h| {
                if let Some(host_ptr) = *h.borrow() {
                    let host = unsafe { &mut *host_ptr };
                    host.write_byte((a0 & 0xff) as u8);
                }
            });
            0
        }
        _ => {
            ACTIVE_SINK.with(|s| {
                if let Some(sink_ptr) = *s.borrow() {
                    let _sink = unsafe { &mut *sink_ptr };
                    // The error sink's signature takes a `Vm`, which this
                    // bridge has no access to from raw emitted code; the
                    // JIT's illegal-ECALL-service report is therefore a
                    // plain stderr line instead of the full state dump
                    // the interpreter's sink produces.
                    eprintln!(
                        "r5vm: unrecognized ECALL service a7={a7} (a0=0x{a0:08x}) during JIT execution"
                    );
                }
            });
            0
        }
    }
}

fn buffer_capacity_for(code_size: u32) -> usize {
    // §4.6: "size to 8 x code_size or larger, rounded to pages." The
    // byte-wise masked load/store templates (see jit::templates) can
    // expand a single 4-byte LW/SW into over a hundred bytes of host
    // code, well past the reference's flat 8x, so this multiplier is
    // sized for that worst case instead of the reference's partial port.
    (code_size as usize).saturating_mul(32).max(4096)
}

/// Compile `vm`'s code region and run it to completion, mutating `vm` in
/// place exactly as `Vm::run` would for the interpreter. Returns the same
/// `RunResult` shape for the acceptance check in `diff::compare_runs`,
/// though the JIT has no step counter: the emitted program runs until it
/// reaches an ECALL-halt or EBREAK, so `steps_taken` is always reported
/// as 0.
pub fn run_jit(
    vm: &mut Vm,
    host: &mut dyn HostIo,
    sink: &mut dyn ErrorSink,
    dump_path: Option<&std::path::Path>,
) -> Result<RunResult, JitError> {
    let mem_size = vm.mem.size();
    let table = DispatchTable::new(mem_size);
    let mut buf = JitBuffer::alloc(buffer_capacity_for(vm.code_size))?;

    let mut state = JitState {
        pc: vm.pc,
        regs: *vm.regs(),
        mem_ptr: vm.mem.as_mut_slice().as_mut_ptr(),
        mem_mask: vm.mask(),
    };
    let state_addr = &state as *const JitState as u32;
    let handler_addr = jit_ecall_handler as usize as u32;

    templates::emit_prolog(&mut buf, state_addr);

    let mut pc = vm.code_offset;
    let end = vm.code_offset.wrapping_add(vm.code_size);
    let mut compile_err: Option<JitError> = None;
    while pc < end {
        table.set(pc, buf.cursor_host_addr());
        let instr = vm.mem.load_u32(pc);
        let f = Fields::decode(instr);
        let pc_next = pc.wrapping_add(4) & vm.mask();
        if let Err(e) = templates::emit_instruction(
            &mut buf,
            &table,
            vm.mask(),
            pc,
            pc_next,
            instr,
            &f,
            handler_addr,
            vm.fault_on_illegal,
        ) {
            compile_err = Some(e);
            break;
        }
        pc = pc.wrapping_add(4);
    }
    templates::emit_epilog(&mut buf);

    if let Some(e) = compile_err {
        return Err(e);
    }
    if buf.has_error() {
        return Err(JitError::BufferOverflow);
    }

    if let Some(path) = dump_path {
        if let Err(e) = buf.dump(path) {
            eprintln!("r5vm: failed to write JIT dump to {}: {e}", path.display());
        }
    }

    let guard = set_active(host, sink);
    // SAFETY: compilation finished without error; `buf` holds a complete
    // program ending in `ret`, and `state_addr` points at a live,
    // exclusively-borrowed `JitState` for the whole call.
    unsafe { buf.call_entry() };
    drop(guard);

    vm.pc = state.pc;
    for i in 0..32u32 {
        vm.set_reg(i, state.regs[i as usize]);
    }

    Ok(RunResult {
        steps_taken: 0,
        halted: true,
    })
}
