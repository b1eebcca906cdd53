use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use kaleido_core::prelude::{default_prelude_root, load_prelude_files};
use kaleido_core::{
    CompileOptions, Driver, DriverOptions, UnitOutcome, WasmBackend, compile_wasm, preload,
};
use tracing::{debug, info};
use tracing_subscriber::filter::LevelFilter;

/// Compile and run kaleido programs.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "Source file to compile (starts an interactive session when omitted)"
    )]
    input: Option<PathBuf>,

    #[arg(short, long, value_name = "FILE", help = "Write the wasm module to this path")]
    output: Option<PathBuf>,

    #[arg(long, help = "Evaluate top-level expressions of the input file")]
    run: bool,

    #[arg(
        long,
        value_name = "DIR",
        help = "Path to the prelude root (defaults to bundled prelude)",
        conflicts_with = "no_prelude"
    )]
    prelude: Option<PathBuf>,

    #[arg(long, help = "Do not load any prelude")]
    no_prelude: bool,

    #[arg(long, value_enum, default_value_t = LogLevel::Warn)]
    log_level: LogLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level);
    execute(cli)
}

fn init_logging(level: LogLevel) {
    tracing_subscriber::fmt()
        .with_max_level(LevelFilter::from(level))
        .without_time()
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn prelude_root(cli: &Cli) -> Option<PathBuf> {
    if cli.no_prelude {
        debug!("prelude disabled");
        return None;
    }
    let root = cli.prelude.clone().unwrap_or_else(default_prelude_root);
    debug!(root = %root.display(), "using prelude");
    Some(root)
}

fn execute(cli: Cli) -> Result<()> {
    match &cli.input {
        Some(path) => compile_file(&cli, path),
        None => interactive(&cli),
    }
}

fn compile_file(cli: &Cli, path: &Path) -> Result<()> {
    let source = fs::read_to_string(path)
        .with_context(|| format!("failed to read input file {}", path.display()))?;

    let options = CompileOptions {
        prelude_root: prelude_root(cli),
        evaluate_top_level: cli.run,
    };
    let artifact = compile_wasm(&source, &options).context("failed to compile source")?;

    for outcome in &artifact.outcomes {
        match outcome {
            UnitOutcome::Evaluated { value } => println!("Evaluated to {value}"),
            UnitOutcome::Failed(err) => eprintln!("error: {err}"),
            _ => {}
        }
    }

    if let Some(output) = &cli.output {
        write_output(output, &artifact.wasm)?;
    }

    let failed = artifact.failures().count();
    if failed > 0 {
        anyhow::bail!("{failed} top-level unit(s) failed in {}", path.display());
    }
    Ok(())
}

fn interactive(cli: &Cli) -> Result<()> {
    let prelude = match prelude_root(cli) {
        Some(root) => load_prelude_files(root).context("failed to load prelude")?,
        None => Vec::new(),
    };

    let mut driver = Driver::new(
        WasmBackend::new(),
        DriverOptions {
            evaluate_top_level: true,
        },
    );
    preload(&mut driver, &prelude).context("failed to load prelude")?;

    driver
        .run_interactive(io::stdin().lock(), io::stdout().lock())
        .context("interactive session failed")?;

    if let Some(output) = &cli.output {
        let image = driver
            .session()
            .backend()
            .emit_module()
            .context("failed to encode module")?;
        write_output(output, &image.wasm)?;
    }
    Ok(())
}

fn write_output(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
    }
    fs::write(path, bytes)
        .with_context(|| format!("failed to write output file {}", path.display()))?;
    info!(path = %path.display(), bytes = bytes.len(), "wrote wasm module");
    Ok(())
}
