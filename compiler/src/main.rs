use clap::Parser;
use std::path::PathBuf;

use log::{debug, LevelFilter};

use tlc::config::{parse_param_list, ParamOverrides, TargetConfig};
use tlc::error::CompileError;
use tlc::pass::PassId;
use tlc::pipeline::{parse_source, run_pipeline, CompilationState, CompileOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum EmitStage {
    /// Parsed syntax tree
    Ast,
    /// Tile IR straight from the builder
    Ir,
    /// Tuning parameters and their values
    Params,
    /// Tile IR after shared-memory staging
    Staged,
    /// Live intervals of staged values
    Liveness,
    /// Shared-memory offsets
    Alloc,
    /// Per-lane low-level IR
    Lir,
}

impl EmitStage {
    fn terminal(self) -> Option<PassId> {
        match self {
            EmitStage::Ast => None,
            EmitStage::Ir => Some(PassId::BuildIr),
            EmitStage::Params => Some(PassId::Validate),
            EmitStage::Staged => Some(PassId::PlaceShared),
            EmitStage::Liveness => Some(PassId::Liveness),
            EmitStage::Alloc => Some(PassId::Allocate),
            EmitStage::Lir => Some(PassId::Select),
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "tlc",
    version,
    about = "Tile Language Compiler: lowers tile-shaped tensor kernels to per-lane SIMT code"
)]
struct Cli {
    /// Input .tl source file
    source: PathBuf,

    /// Output file path (stdout when omitted)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Output stage
    #[arg(long, value_enum, default_value_t = EmitStage::Lir)]
    emit: EmitStage,

    /// Comma-separated parameter values in enumeration order
    #[arg(long, conflicts_with = "params_file")]
    params: Option<String>,

    /// JSON file with a parameter list or a name → value map
    #[arg(long)]
    params_file: Option<PathBuf>,

    /// JSON target description
    #[arg(long)]
    target: Option<PathBuf>,

    /// Shared-memory budget in bytes (overrides the target file)
    #[arg(long)]
    shared_memory: Option<u64>,

    /// Treat tuning constraint violations as errors
    #[arg(long)]
    strict: bool,

    /// Print compiler phases and timing
    #[arg(long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    };
    env_logger::Builder::new()
        .filter_level(default_level)
        .parse_default_env()
        .init();

    debug!("tlc: source = {}", cli.source.display());
    debug!("tlc: emit   = {:?}", cli.emit);

    let source = match std::fs::read_to_string(&cli.source) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("tlc: error: {}: {}", cli.source.display(), e);
            std::process::exit(2);
        }
    };
    let path = cli.source.display().to_string();

    let text = match compile(&cli, &source) {
        Ok((text, warnings)) => {
            report(&warnings, &path, &source);
            text
        }
        Err(e) => {
            report(&e.diagnostics(), &path, &source);
            let code = if matches!(e, CompileError::Config(_)) { 2 } else { 1 };
            std::process::exit(code);
        }
    };

    match &cli.output {
        Some(out) => {
            if let Err(e) = std::fs::write(out, &text) {
                eprintln!("tlc: error: {}: {}", out.display(), e);
                std::process::exit(2);
            }
        }
        None => print!("{}", text),
    }
}

fn options(cli: &Cli) -> Result<CompileOptions, CompileError> {
    let mut target = match &cli.target {
        Some(path) => TargetConfig::load(path)?,
        None => TargetConfig::default(),
    };
    if let Some(bytes) = cli.shared_memory {
        target.shared_memory_bytes = bytes;
    }
    let params = match (&cli.params, &cli.params_file) {
        (Some(list), _) => Some(ParamOverrides::List(parse_param_list(list)?)),
        (None, Some(path)) => Some(ParamOverrides::load(path)?),
        (None, None) => None,
    };
    Ok(CompileOptions {
        target,
        params,
        strict: cli.strict,
    })
}

/// Run the pipeline up to `cli.emit` and render that stage's artifact.
fn compile(cli: &Cli, source: &str) -> Result<(String, Vec<tlc::diag::Diagnostic>), CompileError> {
    let options = options(cli)?;
    let program = parse_source(source)?;
    let Some(terminal) = cli.emit.terminal() else {
        return Ok((format!("{:#?}\n", program), Vec::new()));
    };

    let mut state = CompilationState::new(source, program);
    run_pipeline(&mut state, terminal, &options, |_, _| {})?;

    let missing = || CompileError::Internal(format!("no artifact for --emit {:?}", cli.emit));
    let module = state.module.as_ref().ok_or_else(missing)?;
    let text = match cli.emit {
        EmitStage::Ast => format!("{:#?}\n", state.program),
        EmitStage::Ir | EmitStage::Staged => module.display(&state.ctx).to_string(),
        EmitStage::Params => state.tuner.as_ref().ok_or_else(missing)?.describe(),
        EmitStage::Liveness => state.liveness.as_ref().ok_or_else(missing)?.describe(module),
        EmitStage::Alloc => state.allocation.as_ref().ok_or_else(missing)?.describe(module),
        EmitStage::Lir => state.lir.as_ref().ok_or_else(missing)?.to_string(),
    };
    Ok((text, state.diagnostics))
}

fn report(diags: &[tlc::diag::Diagnostic], path: &str, source: &str) {
    for d in diags {
        eprintln!("{}", d.render(path, source));
    }
}
