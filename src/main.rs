//! TerranVM runner.
//!
//! Loads an assembly source or an assembled program image and runs it on a
//! fresh VM bound to standard input and output.
//!
//! # Usage
//! ```text
//! terranvm <program.asm|program.bin> [OPTIONS]
//! ```
//!
//! # Options
//! - `--memory <bytes>`: Main memory size (defaults to 64 KiB)
//! - `--stack <words>`: Call-stack capacity per context (defaults to 64)
//! - `--seed <n>`: Seed for `RND`/`RNDI`
//! - `--no-handlers`: Do not install the built-in fault handlers
//! - `--trace`: Log every executed instruction
//!
//! The log level is read from `TERRANVM_LOG` (`debug`, `info`, `warn`, `error`).

use std::env;
use std::fs;
use std::path::Path;
use std::process;
use std::str::FromStr;
use terranvm::utils::log::{self, Level};
use terranvm::virtual_machine::assembler::assemble_file;
use terranvm::virtual_machine::program::Program;
use terranvm::virtual_machine::vm::{Vm, VmConfig};
use terranvm::{error, info};

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 || args[1] == "--help" || args[1] == "-h" {
        print_usage(&args[0]);
        process::exit(if args.len() < 2 { 1 } else { 0 });
    }

    if let Some(level) = log::level_from_env() {
        log::set_level(level);
    }

    let input_path = &args[1];
    let mut config = VmConfig::default();

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            k @ ("--memory" | "--stack" | "--seed") => {
                i += 1;
                if i >= args.len() {
                    error!("{k} requires an argument");
                    process::exit(1);
                }
                match k {
                    "--memory" => config = config.with_memory_size(parse_number(k, &args[i])),
                    "--stack" => config = config.with_stack_size(parse_number(k, &args[i])),
                    _ => config = config.with_rng_seed(parse_number(k, &args[i])),
                }
                i += 1;
            }
            "--no-handlers" => {
                config = config.with_default_handlers(false);
                i += 1;
            }
            "--trace" => {
                config = config.with_trace(true);
                log::set_level(Level::Debug);
                i += 1;
            }
            other => {
                error!("Unexpected argument: {}\n", other);
                print_usage(&args[0]);
                process::exit(1);
            }
        }
    }

    let path = Path::new(input_path);
    if !path.exists() {
        error!("Input file does not exist: {}", input_path);
        process::exit(1);
    }

    let program = if path.extension().is_some_and(|ext| ext == "bin") {
        let bytes = fs::read(path).unwrap_or_else(|e| {
            error!("Failed to read {}: {}", input_path, e);
            process::exit(1)
        });
        Program::from_bytes(&bytes).unwrap_or_else(|e| {
            error!("Invalid program image {}: {}", input_path, e);
            process::exit(1)
        })
    } else {
        // diagnostics are printed by the assembler
        assemble_file(path).unwrap_or_else(|_| process::exit(1))
    };

    let mut vm = Vm::new(config).unwrap_or_else(|e| {
        error!("{e}");
        process::exit(1)
    });

    if let Err(e) = vm.load_program(&program) {
        error!("Failed to load {}: {}", input_path, e);
        process::exit(1);
    }

    match vm.run() {
        Ok(reason) => info!("VM {reason} after {} ms", vm.uptime_ms()),
        // already reported with a register dump
        Err(_) => process::exit(1),
    }
}

fn parse_number<T: FromStr>(flag: &str, value: &str) -> T {
    value.parse().unwrap_or_else(|_| {
        error!("Invalid value for {flag}: '{value}' is not a valid number");
        process::exit(1)
    })
}

const USAGE: &str = "\
TerranVM

USAGE:
    {program} <program> [OPTIONS]

ARGS:
    <program>    Assembly source, or a program image ending in .bin

OPTIONS:
    --memory <bytes>    Main memory size, a multiple of 4 (default 65536)
    --stack <words>     Call-stack capacity per context (default 64)
    --seed <n>          Seed for the RND and RNDI generator
    --no-handlers       Do not install the built-in fault handlers
    --trace             Log every executed instruction
    -h, --help          Print this help message

ENVIRONMENT:
    TERRANVM_LOG    Log level: debug, info, warn or error (default info)

EXAMPLES:
    {program} hello.asm
    {program} hello.bin --memory 1048576 --trace
";

/// Prints usage information to stderr.
fn print_usage(program: &str) {
    eprintln!("{}", USAGE.replace("{program}", program));
}
