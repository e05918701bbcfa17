//! Architectural state shared by both execution engines, and the
//! decode-dispatch interpreter.
//!
//! A single `Vm` record is the "sum type that glues the two engines
//! together": the interpreter reads and writes it directly through this
//! module; the JIT reads and writes the same fields via emitted machine
//! code at fixed offsets (see `jit::templates::offsets`).

use crate::decode::{opcode, Fields, FUNCT7_ALT};
use crate::error::DecodeFault;
use crate::memory::Sandbox;

/// Register x0 through x31, aliased by ABI name per RISC-V convention.
/// `x0` is not specially stored here; `Vm::reg`/`set_reg` enforce that it
/// reads as zero and that writes to it are forced back to zero at the end
/// of every instruction, matching the reference's "R[0] = 0" rule.
pub const ABI_NAMES: [&str; 32] = [
    "zero", "ra", "sp", "gp", "tp", "t0", "t1", "t2", "s0", "s1", "a0", "a1", "a2", "a3", "a4",
    "a5", "a6", "a7", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9", "s10", "s11", "t3", "t4",
    "t5", "t6",
];

/// A capability the VM calls into for ECALL service 1 (write byte to host
/// stdout). Injected so the core has no fixed dependency on `std::io`
/// behavior beyond this interface.
pub trait HostIo {
    fn write_byte(&mut self, byte: u8);
}

/// Default host I/O: writes to the process's real stdout and flushes
/// after every byte, per §4.5 ("must be flushed on every byte write so
/// interactive output is observed").
#[derive(Default)]
pub struct StdoutIo;

impl HostIo for StdoutIo {
    fn write_byte(&mut self, byte: u8) {
        use std::io::Write;
        let mut stdout = std::io::stdout();
        let _ = stdout.write_all(&[byte]);
        let _ = stdout.flush();
    }
}

/// Injected fault-reporting capability: (message, faulting pc, instruction
/// word). The core never assumes any particular sink behavior beyond the
/// side effect of reporting.
pub trait ErrorSink {
    fn report(&mut self, vm: &Vm, message: &str, pc: u32, instr: u32);
}

/// Reports to stderr and dumps the register file, mirroring the reference
/// front end's `r5vm_error`/`r5vm_dump_state`.
#[derive(Default)]
pub struct StderrSink;

impl ErrorSink for StderrSink {
    fn report(&mut self, vm: &Vm, message: &str, pc: u32, instr: u32) {
        eprintln!("r5vm: {message} (pc=0x{pc:08x} instr=0x{instr:08x})");
        vm.dump_state_to(&mut std::io::stderr());
    }
}

/// Outcome of a single `step`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Continue,
    Halted,
}

/// Outcome of a `run`.
#[derive(Debug, Clone, Copy)]
pub struct RunResult {
    pub steps_taken: u64,
    pub halted: bool,
}

#[derive(Debug, Clone)]
pub struct Vm {
    regs: [u32; 32],
    pub pc: u32,
    pub mem: Sandbox,
    pub code_offset: u32,
    pub code_size: u32,
    pub data_offset: u32,
    pub data_size: u32,
    pub bss_offset: u32,
    pub bss_size: u32,
    pub entry: u32,
    /// Whether an opcode/funct combination with no RV32I meaning faults
    /// (via the error sink, stopping `run`) or silently no-ops. The
    /// reference source's debug builds fault and release builds no-op;
    /// this is exposed as an explicit flag rather than a build-time
    /// switch, defaulting to the safer "fault" behavior.
    pub fault_on_illegal: bool,
    /// Per-instruction trace printing, mirroring the reference front
    /// end's `Platform::set_trace` (`--debug`). Interpreter-only: the
    /// JIT has no per-instruction hook to print from.
    trace: bool,
}

impl Vm {
    pub fn new(mem: Sandbox) -> Vm {
        Vm {
            regs: [0; 32],
            pc: 0,
            mem,
            code_offset: 0,
            code_size: 0,
            data_offset: 0,
            data_size: 0,
            bss_offset: 0,
            bss_size: 0,
            entry: 0,
            fault_on_illegal: true,
            trace: false,
        }
    }

    pub fn set_trace(&mut self, trace: bool) {
        self.trace = trace;
    }

    pub fn mask(&self) -> u32 {
        self.mem.mask()
    }

    pub fn reg(&self, n: u32) -> u32 {
        if n == 0 {
            0
        } else {
            self.regs[n as usize]
        }
    }

    pub fn set_reg(&mut self, n: u32, value: u32) {
        if n != 0 {
            self.regs[n as usize] = value;
        }
    }

    pub fn regs(&self) -> &[u32; 32] {
        &self.regs
    }

    pub fn zero(&self) -> u32 { self.reg(0) }
    pub fn ra(&self) -> u32 { self.reg(1) }
    pub fn sp(&self) -> u32 { self.reg(2) }
    pub fn gp(&self) -> u32 { self.reg(3) }
    pub fn tp(&self) -> u32 { self.reg(4) }
    pub fn t0(&self) -> u32 { self.reg(5) }
    pub fn t1(&self) -> u32 { self.reg(6) }
    pub fn t2(&self) -> u32 { self.reg(7) }
    pub fn s0(&self) -> u32 { self.reg(8) }
    pub fn s1(&self) -> u32 { self.reg(9) }
    pub fn a0(&self) -> u32 { self.reg(10) }
    pub fn a1(&self) -> u32 { self.reg(11) }
    pub fn a2(&self) -> u32 { self.reg(12) }
    pub fn a3(&self) -> u32 { self.reg(13) }
    pub fn a4(&self) -> u32 { self.reg(14) }
    pub fn a5(&self) -> u32 { self.reg(15) }
    pub fn a6(&self) -> u32 { self.reg(16) }
    pub fn a7(&self) -> u32 { self.reg(17) }
    pub fn s2(&self) -> u32 { self.reg(18) }
    pub fn s3(&self) -> u32 { self.reg(19) }
    pub fn s4(&self) -> u32 { self.reg(20) }
    pub fn s5(&self) -> u32 { self.reg(21) }
    pub fn s6(&self) -> u32 { self.reg(22) }
    pub fn s7(&self) -> u32 { self.reg(23) }
    pub fn s8(&self) -> u32 { self.reg(24) }
    pub fn s9(&self) -> u32 { self.reg(25) }
    pub fn s10(&self) -> u32 { self.reg(26) }
    pub fn s11(&self) -> u32 { self.reg(27) }
    pub fn t3(&self) -> u32 { self.reg(28) }
    pub fn t4(&self) -> u32 { self.reg(29) }
    pub fn t5(&self) -> u32 { self.reg(30) }
    pub fn t6(&self) -> u32 { self.reg(31) }

    /// Zero every register and place `pc` at `entry`, per §3's invariant
    /// that holds immediately after reset.
    pub fn reset(&mut self) {
        self.regs = [0; 32];
        self.pc = self.entry;
    }

    pub fn dump_state_to(&self, w: &mut dyn std::io::Write) {
        let _ = writeln!(w, "pc = 0x{:08x}", self.pc);
        for row in 0..4 {
            let mut line = String::new();
            for col in 0..8 {
                let n = row * 8 + col;
                line.push_str(&format!(
                    "{:>4}={:08x} ",
                    ABI_NAMES[n as usize],
                    self.reg(n)
                ));
            }
            let _ = writeln!(w, "{line}");
        }
    }

    /// Fetch, decode, and execute one instruction. `pc` is advanced to
    /// the next sequential instruction *before* dispatch (matching the
    /// reference loop), so every template that needs "the address of the
    /// instruction following this one" can read `self.pc` directly and
    /// every PC-relative target is computed from the pre-advance fetch
    /// address captured in `pc_of_this`.
    pub fn step(&mut self, host: &mut dyn HostIo, sink: &mut dyn ErrorSink) -> StepOutcome {
        let mask = self.mask();
        let pc_of_this = self.pc;
        let instr = self.mem.load_u32(pc_of_this);
        self.pc = pc_of_this.wrapping_add(4) & mask;

        if self.trace {
            println!("\n--- pc=0x{pc_of_this:08x} instr=0x{instr:08x} ---");
            println!("regs: {:x?}", self.regs);
        }

        let f = Fields::decode(instr);
        let outcome = self.execute(pc_of_this, instr, &f, host, sink);
        self.set_reg(0, 0);
        outcome
    }

    fn illegal(&mut self, pc: u32, instr: u32, reason: &'static str, sink: &mut dyn ErrorSink) -> StepOutcome {
        if self.fault_on_illegal {
            sink.report(self, &DecodeFault::IllegalInstruction { pc, instr, reason }.to_string(), pc, instr);
        }
        StepOutcome::Continue
    }

    fn execute(
        &mut self,
        pc_of_this: u32,
        instr: u32,
        f: &Fields,
        host: &mut dyn HostIo,
        sink: &mut dyn ErrorSink,
    ) -> StepOutcome {
        let mask = self.mask();
        match f.opcode {
            opcode::OP => {
                let a = self.reg(f.rs1);
                let b = self.reg(f.rs2);
                let result = match (f.funct3, f.funct7) {
                    (0x0, 0x00) => a.wrapping_add(b),
                    (0x0, FUNCT7_ALT) => a.wrapping_sub(b),
                    (0x4, 0x00) => a ^ b,
                    (0x6, 0x00) => a | b,
                    (0x7, 0x00) => a & b,
                    (0x1, 0x00) => a.wrapping_shl(b & 0x1f),
                    (0x5, 0x00) => a.wrapping_shr(b & 0x1f),
                    (0x5, FUNCT7_ALT) => ((a as i32).wrapping_shr(b & 0x1f)) as u32,
                    (0x2, 0x00) => ((a as i32) < (b as i32)) as u32,
                    (0x3, 0x00) => (a < b) as u32,
                    _ => return self.illegal(pc_of_this, instr, "unrecognized R-type funct3/funct7", sink),
                };
                self.set_reg(f.rd, result);
                StepOutcome::Continue
            }
            opcode::OP_IMM => {
                let a = self.reg(f.rs1);
                let shamt = (f.imm_i as u32) & 0x1f;
                let result = match f.funct3 {
                    0x0 => a.wrapping_add(f.imm_i as u32),
                    0x4 => a ^ (f.imm_i as u32),
                    0x6 => a | (f.imm_i as u32),
                    0x7 => a & (f.imm_i as u32),
                    0x1 => a.wrapping_shl(shamt),
                    0x5 if f.funct7 == FUNCT7_ALT => ((a as i32).wrapping_shr(shamt)) as u32,
                    0x5 => a.wrapping_shr(shamt),
                    0x2 => ((a as i32) < f.imm_i) as u32,
                    0x3 => (a < (f.imm_i as u32)) as u32,
                    _ => return self.illegal(pc_of_this, instr, "unrecognized I-type funct3", sink),
                };
                self.set_reg(f.rd, result);
                StepOutcome::Continue
            }
            opcode::LOAD => {
                let addr = self.reg(f.rs1).wrapping_add(f.imm_i as u32) & mask;
                let value = match f.funct3 {
                    0x0 => self.mem.load_i8(addr) as u32,
                    0x1 => self.mem.load_i16(addr) as u32,
                    0x2 => self.mem.load_u32(addr),
                    0x4 => self.mem.load_u8(addr) as u32,
                    0x5 => self.mem.load_u16(addr) as u32,
                    _ => return self.illegal(pc_of_this, instr, "unrecognized load width", sink),
                };
                self.set_reg(f.rd, value);
                StepOutcome::Continue
            }
            opcode::STORE => {
                let addr = self.reg(f.rs1).wrapping_add(f.imm_s as u32) & mask;
                let value = self.reg(f.rs2);
                match f.funct3 {
                    0x0 => self.mem.store_u8(addr, value as u8),
                    0x1 => self.mem.store_u16(addr, value as u16),
                    0x2 => self.mem.store_u32(addr, value),
                    _ => return self.illegal(pc_of_this, instr, "unrecognized store width", sink),
                }
                StepOutcome::Continue
            }
            opcode::BRANCH => {
                let a = self.reg(f.rs1);
                let b = self.reg(f.rs2);
                let taken = match f.funct3 {
                    0x0 => a == b,
                    0x1 => a != b,
                    0x4 => (a as i32) < (b as i32),
                    0x5 => (a as i32) >= (b as i32),
                    0x6 => a < b,
                    0x7 => a >= b,
                    _ => return self.illegal(pc_of_this, instr, "unrecognized branch funct3", sink),
                };
                if taken {
                    self.pc = pc_of_this.wrapping_add(f.imm_b as u32) & mask;
                }
                StepOutcome::Continue
            }
            opcode::AUIPC => {
                self.set_reg(f.rd, pc_of_this.wrapping_add(f.imm_u as u32) & mask);
                StepOutcome::Continue
            }
            opcode::LUI => {
                self.set_reg(f.rd, f.imm_u as u32);
                StepOutcome::Continue
            }
            opcode::JAL => {
                let return_addr = self.pc;
                self.set_reg(f.rd, return_addr);
                self.pc = pc_of_this.wrapping_add(f.imm_j as u32) & mask;
                StepOutcome::Continue
            }
            opcode::JALR => {
                if f.funct3 != 0 {
                    return self.illegal(pc_of_this, instr, "JALR funct3 must be 0", sink);
                }
                let return_addr = self.pc;
                let target = self.reg(f.rs1).wrapping_add(f.imm_i as u32) & !1u32;
                self.set_reg(f.rd, return_addr);
                self.pc = target & mask;
                StepOutcome::Continue
            }
            opcode::SYSTEM => {
                if f.funct3 != 0 {
                    return self.illegal(pc_of_this, instr, "unrecognized SYSTEM funct3", sink);
                }
                match f.imm_i {
                    0 => {
                        // ECALL: a7 selects the service, a0 the argument.
                        match self.a7() {
                            0 => StepOutcome::Halted,
                            1 => {
                                host.write_byte((self.a0() & 0xff) as u8);
                                StepOutcome::Continue
                            }
                            _ => self.illegal(pc_of_this, instr, "unrecognized ECALL service in a7", sink),
                        }
                    }
                    1 => StepOutcome::Halted, // EBREAK
                    _ => self.illegal(pc_of_this, instr, "unrecognized SYSTEM immediate", sink),
                }
            }
            opcode::FENCE => StepOutcome::Continue,
            _ => self.illegal(pc_of_this, instr, "unrecognized opcode", sink),
        }
    }

    /// Runs until halted, `max_steps` reached (0 = unbounded), or an
    /// illegal instruction is faulted with `fault_on_illegal` set.
    pub fn run(&mut self, max_steps: u64, host: &mut dyn HostIo, sink: &mut dyn ErrorSink) -> RunResult {
        let mut steps_taken = 0u64;
        loop {
            if max_steps != 0 && steps_taken >= max_steps {
                return RunResult {
                    steps_taken,
                    halted: false,
                };
            }
            match self.step(host, sink) {
                StepOutcome::Continue => {}
                StepOutcome::Halted => {
                    return RunResult {
                        steps_taken: steps_taken + 1,
                        halted: true,
                    }
                }
            }
            steps_taken += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Sandbox;

    fn vm_with_code(code: &[u32]) -> Vm {
        let mut mem = Sandbox::new(1024);
        for (i, word) in code.iter().enumerate() {
            mem.store_u32((i * 4) as u32, *word);
        }
        let mut vm = Vm::new(mem);
        vm.code_offset = 0;
        vm.code_size = (code.len() * 4) as u32;
        vm.entry = 0;
        vm.reset();
        vm
    }

    fn r_type(funct7: u32, rs2: u32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
        (funct7 << 25) | (rs2 << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | opcode
    }

    fn i_type(imm12: u32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
        ((imm12 & 0xfff) << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | opcode
    }

    #[test]
    fn fibonacci_in_registers() {
        use crate::decode::opcode;
        // a0 = x10, t0 = x5, t1 = x6, t2 = x7
        // addi a0, zero, 0
        // addi t0, zero, 1
        // addi t2, zero, 10   ; counter
        // loop:
        //   add  t1, a0, t0
        //   mv   a0, t0   (addi a0, t0, 0)
        //   mv   t0, t1   (addi t0, t1, 0)
        //   addi t2, t2, -1
        //   bne  t2, zero, loop
        let loop_start = 3 * 4;
        let code = vec![
            i_type(0, 0, 0, 10, opcode::OP_IMM),
            i_type(1, 0, 0, 5, opcode::OP_IMM),
            i_type(10, 0, 0, 7, opcode::OP_IMM),
            r_type(0, 5, 10, 0, 6, opcode::OP),
            i_type(0, 5, 0, 10, opcode::OP_IMM),
            i_type(0, 6, 0, 5, opcode::OP_IMM),
            i_type(0xfff, 7, 0, 7, opcode::OP_IMM),
            // bne t2(x7), zero, loop: imm_b = loop_start - (this pc)
            {
                let this_pc = 7 * 4;
                let imm: i32 = loop_start - this_pc;
                let imm_u = imm as u32;
                let bit12 = (imm_u >> 12) & 1;
                let bit11 = (imm_u >> 11) & 1;
                let bits10_5 = (imm_u >> 5) & 0x3f;
                let bits4_1 = (imm_u >> 1) & 0xf;
                (bit12 << 31)
                    | (bits10_5 << 25)
                    | (0 << 20)
                    | (7 << 15)
                    | (0x1 << 12)
                    | (bits4_1 << 8)
                    | (bit11 << 7)
                    | opcode::BRANCH
            },
            // ecall halt: a7 = 0 via addi, then ecall
            i_type(0, 0, 0, 17, opcode::OP_IMM),
            i_type(0, 0, 0, 0, opcode::SYSTEM),
        ];
        let mut vm = vm_with_code(&code);
        let mut host = StdoutIo::default();
        let mut sink = StderrSink::default();
        let result = vm.run(0, &mut host, &mut sink);
        assert!(result.halted);
        assert_eq!(vm.reg(10), 55);
    }

    #[test]
    fn signed_vs_unsigned_compare() {
        use crate::decode::opcode;
        // t0 = -1, t1 = 1, slt a0 t0 t1, sltu a1 t0 t1
        let code = vec![
            i_type(0xfff, 0, 0, 5, opcode::OP_IMM), // addi t0, zero, -1
            i_type(1, 0, 0, 6, opcode::OP_IMM),     // addi t1, zero, 1
            r_type(0, 6, 5, 0x2, 10, opcode::OP),   // slt a0, t0, t1
            r_type(0, 6, 5, 0x3, 11, opcode::OP),   // sltu a1, t0, t1
            i_type(0, 0, 0, 17, opcode::OP_IMM),
            i_type(0, 0, 0, 0, opcode::SYSTEM),
        ];
        let mut vm = vm_with_code(&code);
        let mut host = StdoutIo::default();
        let mut sink = StderrSink::default();
        vm.run(0, &mut host, &mut sink);
        assert_eq!(vm.reg(10), 1);
        assert_eq!(vm.reg(11), 0);
    }

    #[test]
    fn arithmetic_shift_right_sign_extends() {
        use crate::decode::opcode;
        // t0 = 0x80000000 via lui; srai a0, t0, 4
        let code = vec![
            (0x80000u32 << 12) | (5 << 7) | opcode::LUI,
            i_type((FUNCT7_ALT << 5) | 4, 5, 0x5, 10, opcode::OP_IMM),
            i_type(0, 0, 0, 17, opcode::OP_IMM),
            i_type(0, 0, 0, 0, opcode::SYSTEM),
        ];
        let mut vm = vm_with_code(&code);
        let mut host = StdoutIo::default();
        let mut sink = StderrSink::default();
        vm.run(0, &mut host, &mut sink);
        assert_eq!(vm.reg(10), 0xF8000000);
    }

    #[test]
    fn unaligned_wrap_load() {
        let mut mem = Sandbox::new(1024);
        mem.store_u8(1022, 0xAA);
        mem.store_u8(1023, 0xBB);
        mem.store_u8(0, 0xCC);
        mem.store_u8(1, 0xDD);
        assert_eq!(mem.load_u32(1022), 0xDDCCBBAA);
    }

    #[test]
    fn trace_flag_does_not_alter_execution() {
        use crate::decode::opcode;
        let code = vec![i_type(5, 0, 0, 10, opcode::OP_IMM)]; // addi a0, zero, 5
        let mut vm = vm_with_code(&code);
        vm.set_trace(true);
        let mut host = StdoutIo::default();
        let mut sink = StderrSink::default();
        vm.step(&mut host, &mut sink);
        assert_eq!(vm.reg(10), 5);
    }

    #[test]
    fn abi_accessors_alias_numbered_registers() {
        use crate::decode::opcode;
        // addi a0, zero, 7 ; addi a7, zero, 1
        let code = vec![i_type(7, 0, 0, 10, opcode::OP_IMM), i_type(1, 0, 0, 17, opcode::OP_IMM)];
        let mut vm = vm_with_code(&code);
        let mut host = StdoutIo::default();
        let mut sink = StderrSink::default();
        vm.step(&mut host, &mut sink);
        vm.step(&mut host, &mut sink);
        assert_eq!(vm.a0(), vm.reg(10));
        assert_eq!(vm.a0(), 7);
        assert_eq!(vm.a7(), vm.reg(17));
        assert_eq!(vm.a7(), 1);
        assert_eq!(vm.zero(), 0);
    }

    #[test]
    fn x0_is_zero_after_every_instruction() {
        use crate::decode::opcode;
        let code = vec![i_type(5, 0, 0, 0, opcode::OP_IMM)]; // addi x0, zero, 5
        let mut vm = vm_with_code(&code);
        let mut host = StdoutIo::default();
        let mut sink = StderrSink::default();
        vm.step(&mut host, &mut sink);
        assert_eq!(vm.reg(0), 0);
    }

    #[derive(Default)]
    struct CollectIo {
        bytes: Vec<u8>,
    }

    impl HostIo for CollectIo {
        fn write_byte(&mut self, byte: u8) {
            self.bytes.push(byte);
        }
    }

    #[test]
    fn hello_world_via_ecall() {
        use crate::decode::opcode;
        let message = b"Hello, world!\n";
        let mut mem = Sandbox::new(1024);
        let data_offset = 512u32;
        mem.write_blob(data_offset, message);

        // t0 holds the read cursor into the message, t1 a decrementing
        // counter seeded with its length; each iteration loads a byte,
        // writes it via ECALL, and loops until the counter hits zero.
        let upper = (data_offset >> 12) << 12;
        let lower = (data_offset & 0xfff) as i32;

        let mut code = Vec::new();
        code.push((upper) | (5 << 7) | opcode::LUI); // lui t0, upper
        code.push(i_type((lower as u32) & 0xfff, 5, 0, 5, opcode::OP_IMM)); // addi t0, t0, lower
        code.push(i_type(message.len() as u32, 0, 0, 6, opcode::OP_IMM)); // addi t1(x6), zero, len
        let loop_start = code.len() as u32 * 4;
        code.push(i_type(0, 5, 0x0, 10, opcode::LOAD)); // lb a0, 0(t0)
        code.push(i_type(1, 5, 0, 5, opcode::OP_IMM)); // addi t0, t0, 1
        code.push(i_type(1, 0, 0, 17, opcode::OP_IMM)); // addi a7, zero, 1
        code.push(i_type(0, 0, 0, 0, opcode::SYSTEM)); // ecall write
        code.push(i_type(0xfff, 6, 0, 6, opcode::OP_IMM)); // addi t1, t1, -1
        let this_pc = code.len() as u32 * 4;
        let imm: i32 = loop_start as i32 - this_pc as i32;
        let imm_u = imm as u32;
        let bit12 = (imm_u >> 12) & 1;
        let bit11 = (imm_u >> 11) & 1;
        let bits10_5 = (imm_u >> 5) & 0x3f;
        let bits4_1 = (imm_u >> 1) & 0xf;
        code.push(
            (bit12 << 31)
                | (bits10_5 << 25)
                | (0 << 20) // rs2 = x0 (zero)
                | (6 << 15) // rs1 = t1
                | (0x1 << 12) // bne
                | (bits4_1 << 8)
                | (bit11 << 7)
                | opcode::BRANCH,
        );
        code.push(i_type(0, 0, 0, 17, opcode::OP_IMM)); // addi a7, zero, 0
        code.push(i_type(0, 0, 0, 0, opcode::SYSTEM)); // ecall halt

        for (i, word) in code.iter().enumerate() {
            mem.store_u32((i * 4) as u32, *word);
        }
        let mut vm = Vm::new(mem);
        vm.code_offset = 0;
        vm.code_size = (code.len() * 4) as u32;
        vm.entry = 0;
        vm.reset();

        let mut host = CollectIo::default();
        let mut sink = StderrSink::default();
        let result = vm.run(0, &mut host, &mut sink);

        assert!(result.halted);
        assert_eq!(host.bytes, message);
        assert_eq!(vm.reg(10), 0x0A);
        assert_eq!(vm.reg(17), 0);
    }

    #[test]
    fn forward_branch_skips_loop_body_once() {
        use crate::decode::opcode;
        // counter = 0
        // loop:
        //   beq counter, limit, done   (forward branch out)
        //   addi counter, counter, 1
        //   jal zero, loop              (backward jump)
        // done:
        //   addi a7, zero, 0
        //   ecall
        let counter = 5u32;
        let limit = 6u32;

        let mut code = Vec::new();
        code.push(i_type(0, 0, 0, counter, opcode::OP_IMM)); // addi counter, zero, 0
        code.push(i_type(3, 0, 0, limit, opcode::OP_IMM)); // addi limit, zero, 3
        let loop_start = code.len() as u32 * 4;
        // placeholder for beq forward to "done"; filled in after we know done's pc
        let beq_index = code.len();
        code.push(0); // filled below
        code.push(i_type(1, counter, 0, counter, opcode::OP_IMM)); // addi counter, counter, 1
        let jal_pc = code.len() as u32 * 4;
        let jal_target_imm = (loop_start as i32 - jal_pc as i32) as u32;
        code.push((((jal_target_imm >> 20) & 1) << 31)
            | (((jal_target_imm >> 1) & 0x3ff) << 21)
            | (((jal_target_imm >> 11) & 1) << 20)
            | (((jal_target_imm >> 12) & 0xff) << 12)
            | (0 << 7)
            | opcode::JAL);
        let done_pc = code.len() as u32 * 4;
        let beq_imm = (done_pc as i32 - loop_start as i32) as u32;
        let bit12 = (beq_imm >> 12) & 1;
        let bit11 = (beq_imm >> 11) & 1;
        let bits10_5 = (beq_imm >> 5) & 0x3f;
        let bits4_1 = (beq_imm >> 1) & 0xf;
        code[beq_index] = (bit12 << 31)
            | (bits10_5 << 25)
            | (limit << 20)
            | (counter << 15)
            | (0x0 << 12) // beq
            | (bits4_1 << 8)
            | (bit11 << 7)
            | opcode::BRANCH;
        code.push(i_type(0, 0, 0, 17, opcode::OP_IMM));
        code.push(i_type(0, 0, 0, 0, opcode::SYSTEM));

        let mut mem = Sandbox::new(1024);
        for (i, word) in code.iter().enumerate() {
            mem.store_u32((i * 4) as u32, *word);
        }
        let mut vm = Vm::new(mem);
        vm.code_offset = 0;
        vm.code_size = (code.len() * 4) as u32;
        vm.entry = 0;
        vm.reset();

        let mut host = StdoutIo::default();
        let mut sink = StderrSink::default();
        let result = vm.run(1000, &mut host, &mut sink);

        assert!(result.halted);
        assert_eq!(vm.reg(limit), 3);
    }
}
