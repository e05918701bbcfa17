use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

use r5vm::diff::{compare_runs, print_diff};
use r5vm::jit::run_jit;
use r5vm::{image, ErrorSink, HostIo, StderrSink, StdoutIo, Vm};

/// Run an `.r5m` image through the interpreter and/or the x86-32
/// template JIT.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the .r5m image to load
    image: PathBuf,

    /// Sandbox size override, accepts decimal, 0x-hex, and k/m suffixes
    /// (e.g. 64k, 0x10000). Defaults to the image header's own ram_size.
    #[arg(long, value_parser = parse_mem_size)]
    mem: Option<u32>,

    /// Maximum interpreter steps before stopping (0 = unbounded)
    #[arg(long, default_value_t = 0)]
    max_steps: u64,

    /// Print pc/instruction/register-file trace before every interpreted
    /// instruction (interpreter only; the JIT has no per-instruction hook)
    #[arg(short, long)]
    verbose: bool,

    /// Run only the interpreter
    #[arg(long, conflicts_with = "jit_only")]
    no_jit: bool,

    /// Run only the JIT
    #[arg(long)]
    jit_only: bool,

    /// Dump the emitted JIT machine code to this path for offline
    /// disassembly (objdump -D -b binary -mi386 -M intel <path>)
    #[arg(long)]
    dump_jit: Option<PathBuf>,
}

/// Mirrors `original_source`'s `parse_mem_arg`: an optional `0x` hex
/// prefix, then an optional trailing `k`/`m`/`K`/`M` multiplier. Plain
/// `clap_num::maybe_hex` only covers the hex half, not the suffix, so
/// this is hand-rolled rather than composed from that crate.
fn parse_mem_size(s: &str) -> Result<u32, String> {
    let trimmed = s.trim();
    let (digits, multiplier) = if let Some(rest) = trimmed.strip_suffix(['k', 'K']) {
        (rest, 1024u32)
    } else if let Some(rest) = trimmed.strip_suffix(['m', 'M']) {
        (rest, 1024u32 * 1024)
    } else {
        (trimmed, 1u32)
    };

    let value = if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).map_err(|e| format!("invalid hex memory size: {e}"))?
    } else {
        digits
            .parse::<u32>()
            .map_err(|e| format!("invalid memory size: {e}"))?
    };

    value
        .checked_mul(multiplier)
        .ok_or_else(|| "memory size overflows u32".to_string())
}

fn run_interpreter(mut vm: Vm, max_steps: u64, verbose: bool) -> Vm {
    vm.set_trace(verbose);
    let mut host = StdoutIo::default();
    let mut sink = StderrSink::default();
    vm.run(max_steps, &mut host, &mut sink);
    vm
}

fn run_jit_engine(mut vm: Vm, dump_jit: Option<&std::path::Path>) -> Vm {
    let mut host = StdoutIo::default();
    let mut sink = StderrSink::default();
    if let Err(e) = run_jit(&mut vm, &mut host, &mut sink, dump_jit) {
        eprintln!("r5vm: JIT compile failed: {e}");
    }
    vm
}

fn main() -> ExitCode {
    let args = Args::parse();

    let mem_override = args.mem.unwrap_or(0);
    let vm = match image::load_file(&args.image, mem_override) {
        Ok(vm) => vm,
        Err(e) => {
            eprintln!("r5vm: failed to load {}: {e}", args.image.display());
            return ExitCode::FAILURE;
        }
    };

    if args.no_jit {
        run_interpreter(vm, args.max_steps, args.verbose);
        return ExitCode::SUCCESS;
    }
    if args.jit_only {
        run_jit_engine(vm, args.dump_jit.as_deref());
        return ExitCode::SUCCESS;
    }

    // Default: run both engines against independently loaded copies and
    // diff the result, the reference implementation's own acceptance
    // check (spec §8's round-trip law).
    let interp_vm = match image::load_file(&args.image, mem_override) {
        Ok(vm) => vm,
        Err(e) => {
            eprintln!("r5vm: failed to load {}: {e}", args.image.display());
            return ExitCode::FAILURE;
        }
    };

    let interp_result = run_interpreter(interp_vm, args.max_steps, args.verbose);
    let jit_result = run_jit_engine(vm, args.dump_jit.as_deref());

    let diff = compare_runs(&interp_result, &jit_result);
    if diff.is_empty() {
        println!("interpreter and JIT agree");
        ExitCode::SUCCESS
    } else {
        eprintln!("r5vm: interpreter and JIT runs disagree");
        print_diff(&diff, &mut std::io::stderr());
        ExitCode::FAILURE
    }
}
