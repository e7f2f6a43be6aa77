use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use zap::dsl::{self, debug::disassemble_function, Vm};
use zap::error::AppError;
use zap::settings::{self, Settings};

// ── CLI argument parsing ─────────────────────────────────────────

#[derive(Parser)]
#[command(name = "zap", about = "Interpreter for the ZAP array language", version)]
struct Cli {
    /// Script to run; starts a REPL when omitted
    file: Option<PathBuf>,

    /// Settings file (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log every instruction as it executes
    #[arg(long)]
    trace: bool,

    /// Log the bytecode listing of each compiled chunk
    #[arg(long)]
    print_code: bool,

    /// Print the bytecode listing of FILE instead of running it
    #[arg(long, requires = "file")]
    disassemble: bool,

    /// Report errors as JSON instead of formatted text
    #[arg(long)]
    json: bool,
}

// ── Helpers ──────────────────────────────────────────────────────

/// Diagnostics go to stderr; `RUST_LOG` overrides the default filter.
fn init_logging(verbose: bool) {
    let default = if verbose { "zap=trace" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

/// Settings file values, then command-line switches on top.
fn load_settings(cli: &Cli) -> Result<Settings, AppError> {
    let mut settings = match &cli.config {
        Some(path) => settings::load_settings(path)?,
        None => Settings::default(),
    };
    settings.trace_execution |= cli.trace;
    settings.print_code |= cli.print_code;
    Ok(settings)
}

fn report(error: &AppError, json: bool) {
    if json {
        match serde_json::to_string(error) {
            Ok(text) => eprintln!("{text}"),
            Err(_) => eprintln!("{error}"),
        }
    } else {
        eprintln!("{error}");
    }
}

fn run_file(path: &Path, settings: Settings) -> Result<(), AppError> {
    let source = std::fs::read_to_string(path)?;
    let mut vm = Vm::new(settings);
    vm.interpret(&source)?;
    Ok(())
}

fn disassemble_file(path: &Path) -> Result<(), AppError> {
    let source = std::fs::read_to_string(path)?;
    let script = dsl::compile_source(&source).map_err(|errors| AppError::CompileError { errors })?;
    print!("{}", disassemble_function(&script));
    Ok(())
}

/// Line-at-a-time REPL over one VM, so globals carry over between lines.
fn run_prompt(settings: Settings, json: bool) -> Result<(), AppError> {
    let mut vm = Vm::new(settings);
    let stdin = io::stdin();
    let mut line = String::new();
    loop {
        print!("> ");
        io::stdout().flush()?;
        line.clear();
        if stdin.lock().read_line(&mut line)? == 0 {
            println!();
            return Ok(());
        }
        if let Err(e) = vm.interpret(&line) {
            report(&AppError::from(e), json);
        }
    }
}

// ── Main ─────────────────────────────────────────────────────────

fn main() {
    let cli = Cli::parse();
    init_logging(cli.trace || cli.print_code);

    let result = load_settings(&cli).and_then(|settings| match &cli.file {
        Some(path) if cli.disassemble => disassemble_file(path),
        Some(path) => run_file(path, settings),
        None => run_prompt(settings, cli.json),
    });

    if let Err(e) = result {
        report(&e, cli.json);
        process::exit(e.exit_code());
    }
}
