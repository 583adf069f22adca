// Numerical checks on selected LIR.
//
// Compiles matrix product kernels through the full pipeline, runs one
// thread block of the result on the lock-step interpreter in `simt`, and
// compares the stored tile with a host-side product.

mod simt;

use tlc::config::ParamOverrides;
use tlc::lir::LirModule;
use tlc::pipeline::{CompilationState, CompileOptions};

use simt::{buffer, Machine, Val};

const MATMUL: &str = include_str!("../../kernels/matmul.tl");

/// The fixture with the loads moved ahead of the reduction: the loop body
/// reduces the current tiles and then fetches the next ones, so both
/// reduction operands are double-buffered.
const PREFETCH: &str = "
void matmul(fp32 *a, fp32 *b, fp32 *c, int32 M, int32 N, int32 K){
  int32 rx[32] = get_global_range[32](0);
  int32 ry[32] = get_global_range[32](1);
  int32 rka[8] = 0 ... 8;
  int32 rkb[8] = 0 ... 8;
  fp32 C[32, 32] = 0;
  int32 k;
  fp32* pa[32, 8] = a + rx[:, newaxis] + rka[newaxis, :]*M;
  fp32* pb[8, 32] = b + rkb[:, newaxis]*N + ry[newaxis, :];
  fp32* pc[32, 32] = c + rx[:, newaxis] + ry[newaxis, :]*M;
  fp32 x[32, 8] = *pa;
  fp32 y[8, 32] = *pb;
  for(k = K; k > 0; k = k - 8){
    C = dot(x, y, C);
    pa = pa + 8*M;
    pb = pb + 8*N;
    x = *pa;
    y = *pb;
  }
  *pc = C;
}
";

const DEFAULT_PARAMS: [u32; 12] = [1, 8, 1, 1, 4, 1, 1, 4, 1, 1, 8, 1];
const REFERENCE_PARAMS: [u32; 12] = [2, 8, 1, 4, 4, 1, 2, 4, 1, 1, 8, 1];

/// The fixture resized to a `size` x `size` output tile.
fn square_kernel(size: u32) -> String {
    MATMUL
        .replace("[32]", &format!("[{size}]"))
        .replace("[32, ", &format!("[{size}, "))
        .replace(", 32]", &format!(", {size}]"))
}

fn lower(source: &str, params: &[u32]) -> LirModule {
    let options = CompileOptions {
        params: Some(ParamOverrides::List(params.to_vec())),
        ..CompileOptions::default()
    };
    let state = CompilationState::compile(source, &options).unwrap_or_else(|e| panic!("compile: {e}"));
    state.lir.expect("lir")
}

fn a_at(i: usize, k: usize) -> f64 {
    ((i * 3 + k * 5) % 7) as f64 - 3.0
}

fn b_at(k: usize, j: usize) -> f64 {
    ((k * 2 + j * 7) % 5) as f64 - 2.0
}

/// Run `lir` on an `m` x `n` x `k` product and return the mismatching
/// `(i, j, got, want)` entries of C.
fn mismatches(lir: &LirModule, m: usize, n: usize, k: usize) -> Vec<(usize, usize, Option<f64>, f64)> {
    let (a, b, c) = (buffer(0), buffer(1), buffer(2));
    let mut machine = Machine::new();
    // One extra K-step of zeros keeps a trailing prefetch inside written memory.
    for kk in 0..k + 8 {
        for i in 0..m {
            let v = if kk < k { a_at(i, kk) } else { 0.0 };
            machine.write_f32(a, i + kk * m, v);
        }
        for j in 0..n {
            let v = if kk < k { b_at(kk, j) } else { 0.0 };
            machine.write_f32(b, kk * n + j, v);
        }
    }
    let args = [a, b, c, Val::Int(m as i64), Val::Int(n as i64), Val::Int(k as i64)];
    machine.run(lir, 0, &args).unwrap_or_else(|e| panic!("run: {e}"));

    let mut bad = Vec::new();
    for i in 0..m {
        for j in 0..n {
            let want: f64 = (0..k).map(|kk| a_at(i, kk) * b_at(kk, j)).sum();
            let got = machine.read_f32(c, i + j * m);
            if got != Some(want) {
                bad.push((i, j, got, want));
            }
        }
    }
    bad
}

#[test]
fn matmul_default_parameters_compute_the_product() {
    let lir = lower(MATMUL, &DEFAULT_PARAMS);
    let bad = mismatches(&lir, 32, 32, 16);
    assert!(bad.is_empty(), "{:?}", bad);
}

#[test]
fn matmul_reference_parameters_compute_the_product() {
    let lir = lower(MATMUL, &REFERENCE_PARAMS);
    let bad = mismatches(&lir, 32, 32, 16);
    assert!(bad.is_empty(), "{:?}", bad);
}

#[test]
fn matmul_with_several_elements_per_lane() {
    let lir = lower(MATMUL, &[4, 4, 1, 1, 8, 1, 1, 8, 1, 2, 4, 1]);
    let bad = mismatches(&lir, 32, 32, 8);
    assert!(bad.is_empty(), "{:?}", bad);
}

#[test]
fn multi_warp_matmul_computes_the_product() {
    let lir = lower(&square_kernel(64), &[1, 8, 2, 1, 4, 2, 1, 4, 2, 1, 8, 2]);
    assert_eq!(lir.functions()[0].decl.threads_per_block, 128);
    let bad = mismatches(&lir, 64, 64, 16);
    assert!(bad.is_empty(), "{:?}", bad);
}

#[test]
fn double_buffered_prefetch_computes_the_product() {
    for params in [DEFAULT_PARAMS, REFERENCE_PARAMS] {
        let lir = lower(PREFETCH, &params);
        let bad = mismatches(&lir, 32, 32, 24);
        assert!(bad.is_empty(), "params {:?}: {:?}", params, bad);
    }
}

#[test]
fn reads_of_unwritten_memory_are_reported() {
    // Nothing written to global memory: the first tile load fails.
    let lir = lower(PREFETCH, &DEFAULT_PARAMS);
    let mut machine = Machine::new();
    let args = [buffer(0), buffer(1), buffer(2), Val::Int(32), Val::Int(32), Val::Int(8)];
    let err = machine.run(&lir, 0, &args).unwrap_err();
    assert!(err.to_string().contains("unwritten"), "{err}");
}
