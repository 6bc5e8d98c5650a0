//! Assembly to program image compiler CLI.
//!
//! Reads an assembly source file and writes the assembled program image, or
//! prints the listing of an existing image.
//!
//! # Usage
//! ```text
//! assembler <input.asm> [OPTIONS]
//! assembler --disassemble <input.bin>
//! ```
//!
//! # Options
//! - `-o, --output <file>`: Output file path (defaults to `<input>.bin`)
//! - `-d, --disassemble`: Print the instruction listing of a program image
//!
//! # Examples
//! ```text
//! assembler program.asm
//! assembler program.asm -o output.bin
//! assembler -d output.bin
//! ```

use std::env;
use std::fs;
use std::path::Path;
use std::process;
use terranvm::utils::log;
use terranvm::virtual_machine::assembler::assemble_file;
use terranvm::virtual_machine::isa::{WORD_SIZE, disassemble};
use terranvm::virtual_machine::program::Program;
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

    let mut input_path: Option<String> = None;
    let mut output_path: Option<String> = None;
    let mut listing = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            k @ ("--output" | "-o") => {
                i += 1;
                if i >= args.len() {
                    error!("{k} requires an argument");
                    process::exit(1);
                }
                output_path = Some(args[i].clone());
                i += 1;
            }
            "--disassemble" | "-d" => {
                listing = true;
                i += 1;
            }
            other if input_path.is_none() && !other.starts_with('-') => {
                input_path = Some(other.to_string());
                i += 1;
            }
            other => {
                error!("Unexpected argument: {}\n", other);
                print_usage(&args[0]);
                process::exit(1);
            }
        }
    }

    let Some(input_path) = input_path else {
        error!("No input file given");
        process::exit(1);
    };

    if !Path::new(&input_path).exists() {
        error!("Input file does not exist: {}", input_path);
        process::exit(1);
    }

    if listing {
        print_listing(&input_path);
        return;
    }

    let output_path = output_path.unwrap_or_else(|| {
        let p = Path::new(&input_path);
        let stem = p.file_stem().unwrap_or_default().to_string_lossy();
        let parent = p.parent().unwrap_or(Path::new("."));
        parent
            .join(format!("{}.bin", stem))
            .to_string_lossy()
            .into_owned()
    });

    if let Some(parent) = Path::new(&output_path).parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        error!("Output directory does not exist: {}", parent.display());
        process::exit(1);
    }

    // diagnostics are printed by the assembler
    let program = assemble_file(&input_path).unwrap_or_else(|_| process::exit(1));
    let image = program.to_bytes();

    if let Err(e) = fs::write(&output_path, &image) {
        error!("Failed to write output file: {}", e);
        process::exit(1);
    }

    info!(
        "Assembled {} -> {} ({} bytes of code and data, {} labels)",
        input_path,
        output_path,
        program.len(),
        program.labels.len()
    );
}

/// Prints one line per word of the image at `path`.
fn print_listing(path: &str) {
    let bytes = fs::read(path).unwrap_or_else(|e| {
        error!("Failed to read {}: {}", path, e);
        process::exit(1)
    });
    let program = Program::from_bytes(&bytes).unwrap_or_else(|e| {
        error!("Invalid program image {}: {}", path, e);
        process::exit(1)
    });

    let names: Vec<(u32, &str)> = program
        .labels
        .iter()
        .map(|(name, &addr)| (addr, name.as_str()))
        .collect();

    for (i, decoded) in disassemble(&program.bytes).into_iter().enumerate() {
        let address = program.origin + i as u32 * WORD_SIZE;
        for (_, name) in names.iter().filter(|(a, _)| *a == address) {
            println!("        :{name};");
        }
        match decoded {
            Ok(d) => println!("{address:06X}  {:08X}  {d}", d.word),
            Err(_) => {
                let word = program.words().nth(i).unwrap_or_default();
                println!("{address:06X}  {word:08X}  .data");
            }
        }
    }
}

const USAGE: &str = "\
TerranVM Assembler

USAGE:
    {program} <input.asm> [OPTIONS]
    {program} --disassemble <input.bin>

OPTIONS:
    -o, --output <file>    Output file path (defaults to <input>.bin)
    -d, --disassemble      Print the listing of an assembled program image
    -h, --help             Print this help message

ENVIRONMENT:
    TERRANVM_LOG    Log level: debug, info, warn or error (default info)
";

/// Prints usage information to stderr.
fn print_usage(program: &str) {
    eprintln!("{}", USAGE.replace("{program}", program));
}
