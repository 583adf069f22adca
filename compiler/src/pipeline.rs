// pipeline.rs — Compilation state and pass orchestration
//
// Holds every pass artifact and runs the minimal set of passes for a given
// terminal PassId. Fatal errors stop the run; constraint violations are
// collected as warnings unless strict mode turns them into a failure.
//
// Preconditions: the program parsed without errors.
// Postconditions: artifacts for every pass in `required_passes(terminal)`
//                 are populated, or an error is returned.
// Failure modes: `CompileError` from any pass, or `StrictViolations`.
// Side effects: calls `on_pass_complete` after each pass; logs timing.

use std::time::Instant;

use log::{debug, info};

use crate::allocation::{allocate, Allocation};
use crate::ast::Program;
use crate::config::{ParamOverrides, TargetConfig};
use crate::diag::{codes, Diagnostic};
use crate::error::CompileError;
use crate::ir::{Context, Module};
use crate::lir::LirModule;
use crate::liveness::{compute_liveness, Liveness};
use crate::pass::{descriptor, required_passes, PassId};
use crate::select::{select, SelectInput};
use crate::shared::{place_shared_copies, SharedCopies};
use crate::tune::Tuner;

// ── Options ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    pub target: TargetConfig,
    /// Applied right after parameter discovery.
    pub params: Option<ParamOverrides>,
    /// Treat constraint violations as fatal.
    pub strict: bool,
}

// ── Provenance ─────────────────────────────────────────────────────────────

/// Provenance metadata for cache keys and emitted headers.
///
/// `source_hash`: SHA-256 of the raw kernel source text.
/// `params_hash`: SHA-256 of the final parameter vector, one decimal value
/// per line, so equal tunings of equal sources share a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provenance {
    pub source_hash: [u8; 32],
    pub params_hash: [u8; 32],
    pub compiler_version: &'static str,
}

impl Provenance {
    pub fn source_hash_hex(&self) -> String {
        bytes_to_hex(&self.source_hash)
    }

    pub fn params_hash_hex(&self) -> String {
        bytes_to_hex(&self.params_hash)
    }

    /// Comment lines for the top of an emitted module.
    pub fn header_lines(&self) -> Vec<String> {
        vec![
            format!("tlc {}", self.compiler_version),
            format!("source sha256 {}", self.source_hash_hex()),
            format!("params sha256 {}", self.params_hash_hex()),
        ]
    }

    pub fn to_json(&self) -> String {
        serde_json::json!({
            "source_hash": self.source_hash_hex(),
            "params_hash": self.params_hash_hex(),
            "compiler_version": self.compiler_version,
        })
        .to_string()
    }
}

fn bytes_to_hex(bytes: &[u8; 32]) -> String {
    let mut s = String::with_capacity(64);
    for b in bytes {
        use std::fmt::Write;
        let _ = write!(s, "{:02x}", b);
    }
    s
}

fn sha256(bytes: &[u8]) -> [u8; 32] {
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&hasher.finalize());
    hash
}

pub fn compute_provenance(source: &str, params: &[u32]) -> Provenance {
    let canonical: String = params.iter().map(|v| format!("{}\n", v)).collect();
    Provenance {
        source_hash: sha256(source.as_bytes()),
        params_hash: sha256(canonical.as_bytes()),
        compiler_version: env!("CARGO_PKG_VERSION"),
    }
}

// ── Parsing ────────────────────────────────────────────────────────────────

/// Parse `source`, converting syntax errors into E0001 diagnostics.
pub fn parse_source(source: &str) -> Result<Program, CompileError> {
    let result = crate::parser::parse(source);
    if !result.errors.is_empty() {
        let diags = result
            .errors
            .iter()
            .map(|e| {
                Diagnostic::error(e.to_string())
                    .with_code(codes::E0001)
                    .with_span(*e.span())
            })
            .collect();
        return Err(CompileError::Parse(diags));
    }
    result
        .program
        .ok_or_else(|| CompileError::Parse(vec![Diagnostic::error("empty parse result").with_code(codes::E0001)]))
}

// ── Artifact storage ───────────────────────────────────────────────────────

/// Holds all compilation artifacts and accumulated diagnostics.
pub struct CompilationState {
    pub source: String,
    pub program: Program,
    pub ctx: Context,
    pub module: Option<Module>,
    pub tuner: Option<Tuner>,
    pub copies: Option<SharedCopies>,
    pub liveness: Option<Liveness>,
    pub allocation: Option<Allocation>,
    pub lir: Option<LirModule>,
    /// Non-fatal diagnostics, currently only W0201 constraint violations.
    pub diagnostics: Vec<Diagnostic>,
    pub provenance: Option<Provenance>,
}

impl CompilationState {
    pub fn new(source: impl Into<String>, program: Program) -> Self {
        Self {
            source: source.into(),
            program,
            ctx: Context::new(),
            module: None,
            tuner: None,
            copies: None,
            liveness: None,
            allocation: None,
            lir: None,
            diagnostics: Vec::new(),
            provenance: None,
        }
    }

    /// Parse `source` and run every pass.
    pub fn compile(source: &str, options: &CompileOptions) -> Result<Self, CompileError> {
        let program = parse_source(source)?;
        let mut state = Self::new(source, program);
        run_pipeline(&mut state, PassId::Select, options, |_, _| {})?;
        Ok(state)
    }
}

/// Artifact a pass needs but an earlier pass did not produce. Unreachable
/// when passes run in `required_passes` order.
fn missing(pass: PassId) -> CompileError {
    CompileError::Internal(format!("pass {} ran before its inputs", descriptor(pass).name))
}

// ── Pipeline runner ────────────────────────────────────────────────────────

/// Run the minimal set of passes to produce `terminal`.
pub fn run_pipeline(
    state: &mut CompilationState,
    terminal: PassId,
    options: &CompileOptions,
    mut on_pass_complete: impl FnMut(PassId, &[Diagnostic]),
) -> Result<(), CompileError> {
    options.target.validate()?;

    for pass in required_passes(terminal) {
        let t = Instant::now();
        let diags = run_pass(state, pass, options)?;
        debug!(
            "tlc: {} complete, {:.1}ms",
            descriptor(pass).name,
            t.elapsed().as_secs_f64() * 1000.0
        );
        on_pass_complete(pass, &diags);
        state.diagnostics.extend(diags);
    }
    Ok(())
}

fn run_pass(
    state: &mut CompilationState,
    pass: PassId,
    options: &CompileOptions,
) -> Result<Vec<Diagnostic>, CompileError> {
    match pass {
        PassId::BuildIr => {
            let mut module = Module::new("kernels");
            crate::irgen::build_ir(&state.program, &mut state.ctx, &mut module)?;
            state.module = Some(module);
        }
        PassId::Tune => {
            let module = state.module.as_ref().ok_or_else(|| missing(pass))?;
            let mut tuner = Tuner::new(&options.target);
            tuner.run(module, &state.ctx);
            if let Some(overrides) = &options.params {
                overrides.apply(&mut tuner)?;
            }
            info!("tune: {} parameter(s)", tuner.params().len());
            state.provenance = Some(compute_provenance(&state.source, &tuner.values()));
            state.tuner = Some(tuner);
        }
        PassId::Validate => {
            let module = state.module.as_ref().ok_or_else(|| missing(pass))?;
            let tuner = state.tuner.as_ref().ok_or_else(|| missing(pass))?;
            let violations: Vec<Diagnostic> = tuner
                .check_constraints()
                .into_iter()
                .flat_map(|(v, messages)| {
                    let subject = module.value_name(v);
                    messages.into_iter().map(move |m| {
                        Diagnostic::warning(m)
                            .with_code(codes::W0201)
                            .with_subject(subject.clone())
                    })
                })
                .collect();
            if options.strict && !violations.is_empty() {
                return Err(CompileError::StrictViolations(violations));
            }
            return Ok(violations);
        }
        PassId::PlaceShared => {
            let module = state.module.as_mut().ok_or_else(|| missing(pass))?;
            state.copies = Some(place_shared_copies(module, &state.ctx));
        }
        PassId::Liveness => {
            let module = state.module.as_ref().ok_or_else(|| missing(pass))?;
            let copies = state.copies.as_ref().ok_or_else(|| missing(pass))?;
            state.liveness = Some(compute_liveness(module, copies));
        }
        PassId::Allocate => {
            let module = state.module.as_ref().ok_or_else(|| missing(pass))?;
            let liveness = state.liveness.as_ref().ok_or_else(|| missing(pass))?;
            let budget = options.target.shared_memory_bytes;
            state.allocation = Some(allocate(module, &state.ctx, liveness, budget)?);
        }
        PassId::Select => {
            let input = SelectInput {
                module: state.module.as_ref().ok_or_else(|| missing(pass))?,
                ctx: &state.ctx,
                tuner: state.tuner.as_ref().ok_or_else(|| missing(pass))?,
                copies: state.copies.as_ref().ok_or_else(|| missing(pass))?,
                alloc: state.allocation.as_ref().ok_or_else(|| missing(pass))?,
            };
            let mut lir = LirModule::new("kernels");
            if let Some(p) = &state.provenance {
                lir.header = p.header_lines();
            }
            select(&input, &mut lir)?;
            state.lir = Some(lir);
        }
    }
    Ok(Vec::new())
}
