// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Command-line driver: `mylo --run <file>`, `mylo --build <file> --dump`.

use clap::Parser;
use mylo_vm::bytecode::disassemble::disassemble;
use mylo_vm::compiler::{self, SourceLoader};
use mylo_vm::vm::Vm;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::debug;

/// Resolves `import "path"` against the main file's directory, per
/// spec.md §6: "relative to the main file's directory plus any paths
/// added by `module_path("dir")`" (the latter are tried by the compiler
/// itself, prefixing the path it hands back to `load`).
struct FsLoader {
    base_dir: PathBuf,
}

impl SourceLoader for FsLoader {
    fn load(&self, path: &str) -> Option<String> {
        fs::read_to_string(self.base_dir.join(path)).ok()
    }
}

#[derive(Parser)]
#[command(name = "mylo", version, about = "Compiler and VM for the mylo scripting language")]
struct Cli {
    /// Source file to compile (and, unless --build is given, run)
    file: PathBuf,

    /// Compile only; do not execute
    #[arg(long)]
    build: bool,

    /// Compile and execute (the default if neither --run nor --build is given)
    #[arg(long)]
    run: bool,

    /// Print a disassembly of the compiled bytecode to stdout
    #[arg(long)]
    dump: bool,

    /// Log one line per executed instruction to stderr
    #[arg(long)]
    trace: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    run(&cli)
}

fn run(cli: &Cli) -> ExitCode {
    let source = match fs::read_to_string(&cli.file) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: {}: {e}", cli.file.display());
            return ExitCode::FAILURE;
        }
    };

    debug!(file = %cli.file.display(), "compiling");
    let base_dir = cli.file.parent().map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    let loader = FsLoader { base_dir };
    let chunk = match compiler::compile(&source, &loader) {
        Ok(chunk) => chunk,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    // --dump alone, with neither --run nor --build, behaves like --build --dump.
    let build_only = cli.build || (cli.dump && !cli.run);

    if cli.dump {
        print!("{}", disassemble(&chunk));
    }

    if build_only {
        return ExitCode::SUCCESS;
    }

    let mut vm = Vm::new(chunk);
    vm.set_trace(cli.trace);
    match vm.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}
