//! One emit function per RV32I instruction family — the heart of the
//! template JIT.
//!
//! Calling convention and addressing follow §4.7 exactly: EDI is pinned
//! at entry to the address of the `JitState` record (see `jit::state`);
//! every template round-trips its operands through `[edi+off]` rather
//! than allocating host registers across instructions, so every emitted
//! instruction is independently relocatable and the dispatch table can
//! be the sole control-flow mechanism. All state-record addressing uses
//! a 32-bit displacement (not disp8): the register file alone is 128
//! bytes wide, which already exceeds `i8`'s range.

use crate::decode::{opcode, Fields, FUNCT7_ALT};
use crate::error::{DecodeFault, JitError};
use crate::jit::buffer::JitBuffer;
use crate::jit::dispatch::DispatchTable;
use crate::jit::state::offsets;

const EAX: u8 = 0;
const ECX: u8 = 1;
const EDX: u8 = 2;
const EBX: u8 = 3;

fn modrm_edi_disp32(reg: u8) -> u8 {
    0x80 | (reg << 3) | 0x07
}

/// ModRM byte selecting a `[base+index*1]` SIB addressing form (mod=00,
/// rm=100) for register `reg`.
fn modrm_sib(reg: u8) -> u8 {
    (reg << 3) | 0x04
}

/// SIB byte for `[base + index*1]` (scale bits 00).
fn sib_byte(base: u8, index: u8) -> u8 {
    (index << 3) | base
}

fn emit_load_state(buf: &mut JitBuffer, reg: u8, off: i32) {
    buf.emit_u8(0x8B);
    buf.emit_u8(modrm_edi_disp32(reg));
    buf.emit_u32_le(off as u32);
}

fn emit_store_state(buf: &mut JitBuffer, reg: u8, off: i32) {
    buf.emit_u8(0x89);
    buf.emit_u8(modrm_edi_disp32(reg));
    buf.emit_u32_le(off as u32);
}

/// `mov dword ptr [edi+off], imm32` — used to keep `JitState.pc` current
/// with the architectural pc at every instruction boundary (§3: `pc` is
/// part of the state both engines share), without needing a register.
fn emit_store_state_imm32(buf: &mut JitBuffer, off: i32, value: u32) {
    buf.emit_u8(0xC7);
    buf.emit_u8(modrm_edi_disp32(0));
    buf.emit_u32_le(off as u32);
    buf.emit_u32_le(value);
}

fn emit_mov_eax_imm32(buf: &mut JitBuffer, value: u32) {
    buf.emit_u8(0xB8);
    buf.emit_u32_le(value);
}

fn emit_add_eax_imm32(buf: &mut JitBuffer, value: u32) {
    buf.emit_u8(0x05);
    buf.emit_u32_le(value);
}

fn emit_and_eax_imm32(buf: &mut JitBuffer, value: u32) {
    buf.emit_bytes(&[0x25]);
    buf.emit_u32_le(value);
}

fn modrm_reg_reg(reg: u8, rm: u8) -> u8 {
    0xC0 | (reg << 3) | rm
}

/// `mov dst, src` (register-to-register).
fn emit_mov_reg_reg(buf: &mut JitBuffer, dst: u8, src: u8) {
    buf.emit_u8(0x89);
    buf.emit_u8(modrm_reg_reg(src, dst));
}

/// `add dst, imm32`, any general register.
fn emit_add_reg_imm32(buf: &mut JitBuffer, dst: u8, value: u32) {
    buf.emit_u8(0x81);
    buf.emit_u8(modrm_reg_reg(0, dst));
    buf.emit_u32_le(value);
}

/// `and dst, imm32`, any general register.
fn emit_and_reg_imm32(buf: &mut JitBuffer, dst: u8, value: u32) {
    buf.emit_u8(0x81);
    buf.emit_u8(modrm_reg_reg(4, dst));
    buf.emit_u32_le(value);
}

/// `or dst, src`.
fn emit_or_reg_reg(buf: &mut JitBuffer, dst: u8, src: u8) {
    buf.emit_u8(0x09);
    buf.emit_u8(modrm_reg_reg(src, dst));
}

/// `shl dst, imm8`.
fn emit_shl_reg_imm8(buf: &mut JitBuffer, dst: u8, shamt: u8) {
    buf.emit_u8(0xC1);
    buf.emit_u8(modrm_reg_reg(4, dst));
    buf.emit_u8(shamt);
}

/// `shr dst, imm8`.
fn emit_shr_reg_imm8(buf: &mut JitBuffer, dst: u8, shamt: u8) {
    buf.emit_u8(0xC1);
    buf.emit_u8(modrm_reg_reg(5, dst));
    buf.emit_u8(shamt);
}

/// `rd <- value` where `value` is already in EAX, skipping the write
/// entirely when `rd == x0` (per §4.7: "templates emit nothing when
/// `rd == 0`").
fn writeback_rd(buf: &mut JitBuffer, rd: u32) {
    if rd != 0 {
        emit_store_state(buf, EAX, offsets::reg(rd));
    }
}

fn emit_jmp_abs_indirect(buf: &mut JitBuffer, target_addr: u32) {
    // jmp dword ptr [target_addr]  (FF /4, mod=00 rm=101 -> absolute disp32)
    buf.emit_u8(0xFF);
    buf.emit_u8(0x25);
    buf.emit_u32_le(target_addr);
}

fn emit_jmp_through_table(buf: &mut JitBuffer, table: &DispatchTable, target_pc: u32) {
    emit_jmp_abs_indirect(buf, table.slot_host_addr(target_pc));
}

/// R-type ADD/SUB/XOR/OR/AND/SLL/SRL/SRA/SLT/SLTU.
fn emit_op(buf: &mut JitBuffer, f: &Fields) -> Result<(), DecodeFault> {
    emit_load_state(buf, EAX, offsets::reg(f.rs1));
    emit_load_state(buf, EBX, offsets::reg(f.rs2));
    match (f.funct3, f.funct7) {
        (0x0, 0x00) => buf.emit_bytes(&[0x01, 0xD8]), // add eax, ebx
        (0x0, FUNCT7_ALT) => buf.emit_bytes(&[0x29, 0xD8]), // sub eax, ebx
        (0x4, 0x00) => buf.emit_bytes(&[0x31, 0xD8]), // xor eax, ebx
        (0x6, 0x00) => buf.emit_bytes(&[0x09, 0xD8]), // or eax, ebx
        (0x7, 0x00) => buf.emit_bytes(&[0x21, 0xD8]), // and eax, ebx
        (0x1, 0x00) => emit_shift_by_ebx(buf, ShiftKind::Shl),
        (0x5, 0x00) => emit_shift_by_ebx(buf, ShiftKind::Shr),
        (0x5, FUNCT7_ALT) => emit_shift_by_ebx(buf, ShiftKind::Sar),
        (0x2, 0x00) => emit_setcc(buf, Cc::Less),
        (0x3, 0x00) => emit_setcc(buf, Cc::Below),
        _ => {
            return Err(DecodeFault::IllegalInstruction {
                pc: 0,
                instr: 0,
                reason: "unrecognized R-type funct3/funct7",
            })
        }
    }
    writeback_rd(buf, f.rd);
    Ok(())
}

enum ShiftKind {
    Shl,
    Shr,
    Sar,
}

/// Shift EAX by CL, masking the count to its low 5 bits first, with the
/// count taken from EBX (register-register shifts) — matches the
/// interpreter's `count & 0x1f` rule exactly.
fn emit_shift_by_ebx(buf: &mut JitBuffer, kind: ShiftKind) {
    buf.emit_bytes(&[0x88, 0xD9]); // mov cl, bl
    buf.emit_bytes(&[0x80, 0xE1, 0x1F]); // and cl, 0x1f
    match kind {
        ShiftKind::Shl => buf.emit_bytes(&[0xD3, 0xE0]), // shl eax, cl
        ShiftKind::Shr => buf.emit_bytes(&[0xD3, 0xE8]), // shr eax, cl
        ShiftKind::Sar => buf.emit_bytes(&[0xD3, 0xF8]), // sar eax, cl
    }
}

/// Shift EAX by an immediate count already masked to 5 bits at compile
/// time (I-type shift-immediates: SLLI/SRLI/SRAI).
fn emit_shift_by_imm(buf: &mut JitBuffer, kind: ShiftKind, shamt: u8) {
    let shamt = shamt & 0x1f;
    match kind {
        ShiftKind::Shl => buf.emit_bytes(&[0xC1, 0xE0, shamt]), // shl eax, imm8
        ShiftKind::Shr => buf.emit_bytes(&[0xC1, 0xE8, shamt]), // shr eax, imm8
        ShiftKind::Sar => buf.emit_bytes(&[0xC1, 0xF8, shamt]), // sar eax, imm8
    }
}

enum Cc {
    Less,
    Below,
}

/// `cmp eax, ebx` then `set<cc> al; movzx eax, al` — produces 0/1 in EAX.
fn emit_setcc(buf: &mut JitBuffer, cc: Cc) {
    buf.emit_bytes(&[0x39, 0xD8]); // cmp eax, ebx
    match cc {
        Cc::Less => buf.emit_bytes(&[0x0F, 0x9C, 0xC0]), // setl al
        Cc::Below => buf.emit_bytes(&[0x0F, 0x92, 0xC0]), // setb al
    }
    buf.emit_bytes(&[0x0F, 0xB6, 0xC0]); // movzx eax, al
}

/// I-type ADDI/XORI/ORI/ANDI/SLTI/SLTIU/SLLI/SRLI/SRAI.
fn emit_op_imm(buf: &mut JitBuffer, f: &Fields) -> Result<(), DecodeFault> {
    emit_load_state(buf, EAX, offsets::reg(f.rs1));
    match f.funct3 {
        0x0 => emit_add_eax_imm32(buf, f.imm_i as u32),
        0x4 => {
            buf.emit_bytes(&[0x35]); // xor eax, imm32
            buf.emit_u32_le(f.imm_i as u32);
        }
        0x6 => {
            buf.emit_bytes(&[0x0D]); // or eax, imm32
            buf.emit_u32_le(f.imm_i as u32);
        }
        0x7 => emit_and_eax_imm32(buf, f.imm_i as u32),
        0x1 => emit_shift_by_imm(buf, ShiftKind::Shl, f.imm_i as u8),
        0x5 if f.funct7 == FUNCT7_ALT => emit_shift_by_imm(buf, ShiftKind::Sar, f.imm_i as u8),
        0x5 => emit_shift_by_imm(buf, ShiftKind::Shr, f.imm_i as u8),
        0x2 => {
            buf.emit_bytes(&[0x3D]); // cmp eax, imm32
            buf.emit_u32_le(f.imm_i as u32);
            buf.emit_bytes(&[0x0F, 0x9C, 0xC0]); // setl al
            buf.emit_bytes(&[0x0F, 0xB6, 0xC0]); // movzx eax, al
        }
        0x3 => {
            buf.emit_bytes(&[0x3D]);
            buf.emit_u32_le(f.imm_i as u32);
            buf.emit_bytes(&[0x0F, 0x92, 0xC0]); // setb al
            buf.emit_bytes(&[0x0F, 0xB6, 0xC0]);
        }
        _ => {
            return Err(DecodeFault::IllegalInstruction {
                pc: 0,
                instr: 0,
                reason: "unrecognized I-type funct3",
            })
        }
    }
    writeback_rd(buf, f.rd);
    Ok(())
}

/// Compute `(reg[rs1] + disp) & mask` into ECX, then load the sandbox
/// base pointer into EBX, leaving ECX as the masked base address and
/// EBX as the sandbox pointer. EAX and EDX are left free as scratch for
/// the byte-wise, independently-masked access that follows — matching
/// `Sandbox::load_u32`/`store_u32` (src/memory.rs), which re-masks each
/// constituent byte's offset rather than treating the whole word as one
/// contiguous host access. A single combined word access here would read
/// or write past the end of the sandbox's backing allocation whenever
/// the effective address lands on the last few bytes of the sandbox.
fn emit_effective_address(buf: &mut JitBuffer, rs1: u32, disp: i32, mask: u32) {
    emit_load_state(buf, ECX, offsets::reg(rs1));
    emit_add_reg_imm32(buf, ECX, disp as u32);
    emit_and_reg_imm32(buf, ECX, mask);
    emit_load_state(buf, EBX, offsets::mem_ptr());
}

/// Load the byte at `(base_addr_reg + extra) & mask` (SIB `[ebx+idx]`)
/// into `idx`, zero-extended. `base_addr_reg` already holds a masked
/// address; when `extra == 0` no further add/mask is needed since the
/// base is already in range.
fn emit_load_byte_masked(buf: &mut JitBuffer, idx: u8, base_addr_reg: u8, extra: u32, mask: u32) {
    if extra != 0 {
        emit_mov_reg_reg(buf, idx, base_addr_reg);
        emit_add_reg_imm32(buf, idx, extra);
        emit_and_reg_imm32(buf, idx, mask);
        buf.emit_bytes(&[0x0F, 0xB6, modrm_sib(idx), sib_byte(EBX, idx)]);
    } else {
        buf.emit_bytes(&[0x0F, 0xB6, modrm_sib(idx), sib_byte(EBX, base_addr_reg)]);
    }
}

/// LB/LH/LW/LBU/LHU: assemble the result byte-by-byte into EAX, each
/// byte's offset independently masked, then sign/zero-extend the
/// assembled width as RV32I requires.
fn emit_load(buf: &mut JitBuffer, f: &Fields, mask: u32) -> Result<(), DecodeFault> {
    emit_effective_address(buf, f.rs1, f.imm_i, mask);
    match f.funct3 {
        0x0 => {
            // LB: single byte, sign-extended. No wrap concern — one
            // byte can never straddle anything.
            buf.emit_bytes(&[0x0F, 0xBE, modrm_sib(EAX), sib_byte(EBX, ECX)]);
        }
        0x4 => {
            // LBU
            buf.emit_bytes(&[0x0F, 0xB6, modrm_sib(EAX), sib_byte(EBX, ECX)]);
        }
        0x1 | 0x5 => {
            // LH / LHU
            emit_load_byte_masked(buf, EAX, ECX, 0, mask);
            emit_load_byte_masked(buf, EDX, ECX, 1, mask);
            emit_shl_reg_imm8(buf, EDX, 8);
            emit_or_reg_reg(buf, EAX, EDX);
            if f.funct3 == 0x1 {
                buf.emit_bytes(&[0x0F, 0xBF, 0xC0]); // movsx eax, ax
            }
        }
        0x2 => {
            // LW
            emit_load_byte_masked(buf, EAX, ECX, 0, mask);
            for i in 1..4u32 {
                emit_load_byte_masked(buf, EDX, ECX, i, mask);
                emit_shl_reg_imm8(buf, EDX, (8 * i) as u8);
                emit_or_reg_reg(buf, EAX, EDX);
            }
        }
        _ => {
            return Err(DecodeFault::IllegalInstruction {
                pc: 0,
                instr: 0,
                reason: "unrecognized load width",
            })
        }
    }
    writeback_rd(buf, f.rd);
    Ok(())
}

/// Store one byte of EAX (its current low byte) at
/// `(base_addr_reg + extra) & mask`.
fn emit_store_byte_masked(buf: &mut JitBuffer, base_addr_reg: u8, extra: u32, mask: u32) {
    if extra != 0 {
        emit_mov_reg_reg(buf, EDX, base_addr_reg);
        emit_add_reg_imm32(buf, EDX, extra);
        emit_and_reg_imm32(buf, EDX, mask);
        buf.emit_bytes(&[0x88, modrm_sib(EAX), sib_byte(EBX, EDX)]); // mov [ebx+edx], al
    } else {
        buf.emit_bytes(&[0x88, modrm_sib(EAX), sib_byte(EBX, base_addr_reg)]); // mov [ebx+ecx], al
    }
}

/// SB/SH/SW: store byte-by-byte, each offset independently masked, same
/// rationale as `emit_load` above. The value (EAX) is destructively
/// shifted right 8 bits between bytes, exposing the next byte at AL —
/// valid because each byte is only ever read once, in ascending order.
fn emit_store(buf: &mut JitBuffer, f: &Fields, mask: u32) -> Result<(), DecodeFault> {
    emit_effective_address(buf, f.rs1, f.imm_s, mask);
    emit_load_state(buf, EAX, offsets::reg(f.rs2));
    let width = match f.funct3 {
        0x0 => 1,
        0x1 => 2,
        0x2 => 4,
        _ => {
            return Err(DecodeFault::IllegalInstruction {
                pc: 0,
                instr: 0,
                reason: "unrecognized store width",
            })
        }
    };
    emit_store_byte_masked(buf, ECX, 0, mask);
    for i in 1..width {
        emit_shr_reg_imm8(buf, EAX, 8);
        emit_store_byte_masked(buf, ECX, i, mask);
    }
    Ok(())
}

/// Branches fold nothing at compile time except the target address
/// itself (§4.7: PC-relative mask-wrap is folded at compile time). The
/// runtime comparison decides whether the indirect jump through the
/// dispatch table executes.
fn emit_branch(
    buf: &mut JitBuffer,
    table: &DispatchTable,
    f: &Fields,
    pc_of_this: u32,
    mask: u32,
) -> Result<(), DecodeFault> {
    emit_load_state(buf, EAX, offsets::reg(f.rs1));
    emit_load_state(buf, EBX, offsets::reg(f.rs2));
    buf.emit_bytes(&[0x39, 0xD8]); // cmp eax, ebx
    let skip_not_taken: u8 = match f.funct3 {
        0x0 => 0x75, // beq: skip (jump-over) when NOT equal -> jne
        0x1 => 0x74, // bne: skip when equal -> je
        0x4 => 0x7D, // blt: skip when NOT less (signed) -> jge
        0x5 => 0x7C, // bge: skip when less (signed) -> jl
        0x6 => 0x73, // bltu: skip when NOT below -> jae
        0x7 => 0x72, // bgeu: skip when below -> jb
        _ => {
            return Err(DecodeFault::IllegalInstruction {
                pc: pc_of_this,
                instr: 0,
                reason: "unrecognized branch funct3",
            })
        }
    };
    buf.emit_bytes(&[skip_not_taken, 0x06]); // j<cc> +6 (over the indirect jmp)
    let target = pc_of_this.wrapping_add(f.imm_b as u32) & mask;
    emit_jmp_through_table(buf, table, target);
    Ok(())
}

fn emit_auipc(buf: &mut JitBuffer, f: &Fields, pc_of_this: u32, mask: u32) {
    let value = pc_of_this.wrapping_add(f.imm_u as u32) & mask;
    emit_mov_eax_imm32(buf, value);
    writeback_rd(buf, f.rd);
}

fn emit_lui(buf: &mut JitBuffer, f: &Fields) {
    emit_mov_eax_imm32(buf, f.imm_u as u32);
    writeback_rd(buf, f.rd);
}

fn emit_jal(buf: &mut JitBuffer, table: &DispatchTable, f: &Fields, pc_of_this: u32, pc_next: u32, mask: u32) {
    if f.rd != 0 {
        emit_mov_eax_imm32(buf, pc_next);
        emit_store_state(buf, EAX, offsets::reg(f.rd));
    }
    let target = pc_of_this.wrapping_add(f.imm_j as u32) & mask;
    emit_jmp_through_table(buf, table, target);
}

/// JALR's target depends on a runtime register value, so (unlike every
/// other control-flow template) the dispatch-table slot address itself
/// must be computed at runtime: `table_base + ((rs1+imm)&~1&mask) * 4`.
fn emit_jalr(
    buf: &mut JitBuffer,
    table: &DispatchTable,
    f: &Fields,
    pc_next: u32,
    mask: u32,
) -> Result<(), DecodeFault> {
    if f.funct3 != 0 {
        return Err(DecodeFault::IllegalInstruction {
            pc: 0,
            instr: 0,
            reason: "JALR funct3 must be 0",
        });
    }
    if f.rd != 0 {
        emit_mov_eax_imm32(buf, pc_next);
        emit_store_state(buf, EAX, offsets::reg(f.rd));
    }
    emit_load_state(buf, EAX, offsets::reg(f.rs1));
    emit_add_eax_imm32(buf, f.imm_i as u32);
    buf.emit_bytes(&[0x83, 0xE0, 0xFE]); // and eax, 0xFFFFFFFE (clear bit 0)
    emit_and_eax_imm32(buf, mask);
    buf.emit_bytes(&[0x6B, 0xC0, 0x04]); // imul eax, eax, 4
    emit_add_eax_imm32(buf, table.base_host_addr());
    buf.emit_bytes(&[0xFF, 0x20]); // jmp dword ptr [eax]
    Ok(())
}

/// ECALL calls an externally visible handler with the base pointer as
/// its single argument (cdecl: push, call, caller cleans up). The
/// handler's return value in EAX signals "halt requested"; the template
/// tests it and, if set, falls into the same epilog EBREAK uses.
fn emit_ecall(buf: &mut JitBuffer, handler_addr: u32) {
    buf.emit_u8(0x57); // push edi
    buf.emit_u8(0xE8); // call rel32
    let call_site = buf.cursor_host_addr();
    let rel = handler_addr.wrapping_sub(call_site.wrapping_add(4));
    buf.emit_u32_le(rel);
    buf.emit_bytes(&[0x83, 0xC4, 0x04]); // add esp, 4
    buf.emit_bytes(&[0x85, 0xC0]); // test eax, eax
    buf.emit_bytes(&[0x74, 0x02]); // jz +2 (skip the epilog below)
    emit_epilog(buf);
}

/// EBREAK always terminates: the full epilog, unconditionally.
fn emit_ebreak(buf: &mut JitBuffer) {
    emit_epilog(buf);
}

fn emit_fence(buf: &mut JitBuffer) {
    buf.emit_u8(0x90); // nop
}

/// Saves the two callee-saved registers the templates clobber (EBX as a
/// second scratch register, EDI as the pinned state pointer) before
/// pinning EDI, per cdecl: a `call`er assumes EBX/ESI/EDI/EBP survive.
pub fn emit_prolog(buf: &mut JitBuffer, state_addr: u32) {
    buf.emit_u8(0x57); // push edi
    buf.emit_u8(0x53); // push ebx
    buf.emit_u8(0xBF); // mov edi, imm32
    buf.emit_u32_le(state_addr);
}

/// Restores EBX/EDI in reverse push order before returning.
pub fn emit_epilog(buf: &mut JitBuffer) {
    buf.emit_u8(0x5B); // pop ebx
    buf.emit_u8(0x5F); // pop edi
    buf.emit_u8(0xC3); // ret
}

/// Emit the host code for one RV32I instruction. `handler_addr` is the
/// host address of the ECALL bridge function (see `jit::driver`).
/// Returns `Ok(())` having emitted nothing for an illegal encoding when
/// `fault_on_illegal` is false, matching the interpreter's release-build
/// no-op behavior; returns `Err` to abort compilation when it is true.
#[allow(clippy::too_many_arguments)]
pub fn emit_instruction(
    buf: &mut JitBuffer,
    table: &DispatchTable,
    mask: u32,
    pc_of_this: u32,
    pc_next: u32,
    instr: u32,
    f: &Fields,
    handler_addr: u32,
    fault_on_illegal: bool,
) -> Result<(), JitError> {
    // Keep JitState.pc current with the architectural pc before this
    // instruction's own effect (if any) runs: every control-flow template
    // (branch/JAL/JALR) lands on some instruction's dispatch slot, and
    // that instruction's own store below always executes before anything
    // reads pc again, so this single unconditional store per instruction
    // is sufficient — no template needs to store it itself.
    emit_store_state_imm32(buf, offsets::pc(), pc_next);

    let result: Result<(), DecodeFault> = match f.opcode {
        opcode::OP => emit_op(buf, f),
        opcode::OP_IMM => emit_op_imm(buf, f),
        opcode::LOAD => emit_load(buf, f, mask),
        opcode::STORE => emit_store(buf, f, mask),
        opcode::BRANCH => emit_branch(buf, table, f, pc_of_this, mask),
        opcode::AUIPC => {
            emit_auipc(buf, f, pc_of_this, mask);
            Ok(())
        }
        opcode::LUI => {
            emit_lui(buf, f);
            Ok(())
        }
        opcode::JAL => {
            emit_jal(buf, table, f, pc_of_this, pc_next, mask);
            Ok(())
        }
        opcode::JALR => emit_jalr(buf, table, f, pc_next, mask),
        opcode::SYSTEM => {
            if f.funct3 != 0 {
                Err(DecodeFault::IllegalInstruction {
                    pc: pc_of_this,
                    instr,
                    reason: "unrecognized SYSTEM funct3",
                })
            } else {
                match f.imm_i {
                    0 => {
                        emit_ecall(buf, handler_addr);
                        Ok(())
                    }
                    1 => {
                        emit_ebreak(buf);
                        Ok(())
                    }
                    _ => Err(DecodeFault::IllegalInstruction {
                        pc: pc_of_this,
                        instr,
                        reason: "unrecognized SYSTEM immediate",
                    }),
                }
            }
        }
        opcode::FENCE => {
            emit_fence(buf);
            Ok(())
        }
        _ => Err(DecodeFault::IllegalInstruction {
            pc: pc_of_this,
            instr,
            reason: "unrecognized opcode",
        }),
    };

    match result {
        Ok(()) => Ok(()),
        Err(DecodeFault::IllegalInstruction { reason, .. }) => {
            if fault_on_illegal {
                Err(JitError::Decode(DecodeFault::IllegalInstruction {
                    pc: pc_of_this,
                    instr,
                    reason,
                }))
            } else {
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::buffer::JitBuffer;
    use crate::jit::dispatch::DispatchTable;

    #[test]
    fn prolog_pins_base_pointer_and_epilog_returns() {
        let mut buf = JitBuffer::alloc(64).unwrap();
        emit_prolog(&mut buf, 0x1000_0000);
        emit_epilog(&mut buf);
        // push edi; push ebx; mov edi,imm32; pop ebx; pop edi; ret
        assert_eq!(buf.pos(), 1 + 1 + 5 + 1 + 1 + 1);
    }

    #[test]
    fn branch_bakes_slot_address_not_value() {
        let table = DispatchTable::new(1024);
        let mut buf = JitBuffer::alloc(256).unwrap();
        let f = Fields {
            opcode: opcode::BRANCH,
            rd: 0,
            funct3: 0,
            rs1: 1,
            rs2: 2,
            funct7: 0,
            imm_i: 0,
            imm_s: 0,
            imm_b: 8,
            imm_u: 0,
            imm_j: 0,
        };
        emit_branch(&mut buf, &table, &f, 0, 1023).unwrap();
        assert!(buf.pos() > 0);
        assert!(!buf.has_error());
    }

    #[test]
    fn illegal_opcode_faults_when_configured() {
        let table = DispatchTable::new(64);
        let mut buf = JitBuffer::alloc(64).unwrap();
        let f = Fields {
            opcode: 0x5B,
            rd: 0,
            funct3: 0,
            rs1: 0,
            rs2: 0,
            funct7: 0,
            imm_i: 0,
            imm_s: 0,
            imm_b: 0,
            imm_u: 0,
            imm_j: 0,
        };
        let result = emit_instruction(&mut buf, &table, 63, 0, 4, 0, &f, 0, true);
        assert!(result.is_err());
    }

    #[test]
    fn illegal_opcode_no_ops_when_not_configured() {
        let table = DispatchTable::new(64);
        let mut buf = JitBuffer::alloc(64).unwrap();
        let f = Fields {
            opcode: 0x5B,
            rd: 0,
            funct3: 0,
            rs1: 0,
            rs2: 0,
            funct7: 0,
            imm_i: 0,
            imm_s: 0,
            imm_b: 0,
            imm_u: 0,
            imm_j: 0,
        };
        let result = emit_instruction(&mut buf, &table, 63, 0, 4, 0, &f, 0, false);
        assert!(result.is_ok());
        // Only the unconditional pc-store is emitted; the (no-op) body
        // itself contributes nothing.
        assert_eq!(buf.pos(), 10);
    }
}
