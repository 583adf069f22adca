// Integration tests for the `tlc` command line.
//
// Each test runs the built binary on the matrix product kernel and checks
// stdout, stderr and the exit status for one --emit target or flag.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

fn tlc_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_tlc"))
}

fn project_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .unwrap()
        .to_path_buf()
}

fn matmul() -> PathBuf {
    project_root().join("kernels/matmul.tl")
}

fn run(args: &[&str]) -> Output {
    Command::new(tlc_binary())
        .arg(matmul())
        .args(args)
        .output()
        .expect("failed to run tlc")
}

fn stdout(o: &Output) -> String {
    String::from_utf8_lossy(&o.stdout).into_owned()
}

fn stderr(o: &Output) -> String {
    String::from_utf8_lossy(&o.stderr).into_owned()
}

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("tlc-{}-{}", std::process::id(), name))
}

#[test]
fn emit_params_lists_twelve_values() {
    let o = run(&["--emit", "params"]);
    assert!(o.status.success(), "stderr: {}", stderr(&o));
    let out = stdout(&o);
    assert_eq!(out.lines().count(), 12);
    assert!(out.starts_with("rx.p0.d0 = 1\n"));
    assert!(stderr(&o).is_empty());
}

#[test]
fn emit_ast_is_parse_only() {
    let o = run(&["--emit", "ast", "--shared-memory", "0"]);
    assert!(o.status.success(), "stderr: {}", stderr(&o));
    assert!(stdout(&o).contains("matmul"));
}

#[test]
fn emit_alloc_prints_regions_and_peak() {
    let o = run(&["--emit", "alloc"]);
    assert!(o.status.success(), "stderr: {}", stderr(&o));
    let out = stdout(&o);
    assert!(out.contains("offset 0 size 1024"));
    assert!(out.contains("offset 1024 size 1024"));
    assert!(out.ends_with("peak 2048 of 49152 bytes\n"));
}

#[test]
fn emit_lir_is_the_default() {
    let o = run(&["--params", "2,8,1,4,4,1,2,4,1,1,8,1"]);
    assert!(o.status.success(), "stderr: {}", stderr(&o));
    let out = stdout(&o);
    assert!(out.starts_with("; module kernels\n; tlc "));
    assert!(out.contains("define void @matmul("));
    assert!(out.contains("@llvm.fma.float"));
}

#[test]
fn small_budget_fails_with_allocation_error() {
    let o = run(&["--shared-memory", "1536"]);
    assert_eq!(o.status.code(), Some(1));
    let err = stderr(&o);
    assert!(err.contains("error[E0301]"), "stderr: {err}");
    assert!(err.contains("requests 1024 bytes, 512 bytes available (budget 1536 bytes)"));
}

#[test]
fn violations_warn_but_compile() {
    let o = run(&["--emit", "params", "--params", "0,8,1,1,4,1,1,4,1,1,8,1"]);
    assert!(o.status.success(), "stderr: {}", stderr(&o));
    assert!(stderr(&o).contains("warning[W0201]"));
}

#[test]
fn strict_mode_rejects_violations() {
    let o = run(&["--emit", "params", "--strict", "--params", "0,8,1,1,4,1,1,4,1,1,8,1"]);
    assert_eq!(o.status.code(), Some(1));
    let err = stderr(&o);
    assert!(err.contains("error[W0201]"), "stderr: {err}");
    assert!(err.contains("error[E0502]"), "stderr: {err}");
}

#[test]
fn wrong_parameter_count_is_rejected() {
    let o = run(&["--params", "1,2,3"]);
    assert_eq!(o.status.code(), Some(1));
    assert!(stderr(&o).contains("expected 12 parameter values, got 3"));
}

#[test]
fn params_file_accepts_names() {
    let path = temp_path("params.json");
    std::fs::write(&path, r#"{"rx.p0.d0": 2, "ry.p0.d0": 4}"#).unwrap();
    let o = run(&["--emit", "params", "--params-file", path.to_str().unwrap()]);
    let _ = std::fs::remove_file(&path);
    assert!(o.status.success(), "stderr: {}", stderr(&o));
    let out = stdout(&o);
    assert!(out.contains("rx.p0.d0 = 2\n"));
    assert!(out.contains("ry.p0.d0 = 4\n"));
}

#[test]
fn invalid_target_exits_with_usage_code() {
    let path = temp_path("target.json");
    std::fs::write(&path, r#"{"warp_size": 24}"#).unwrap();
    let o = run(&["--target", path.to_str().unwrap()]);
    let _ = std::fs::remove_file(&path);
    assert_eq!(o.status.code(), Some(2));
    assert!(stderr(&o).contains("error[E0501]"));
}

#[test]
fn output_flag_writes_file() {
    let path = temp_path("matmul.ll");
    let o = run(&["-o", path.to_str().unwrap()]);
    assert!(o.status.success(), "stderr: {}", stderr(&o));
    assert!(stdout(&o).is_empty());
    let text = std::fs::read_to_string(&path).unwrap();
    let _ = std::fs::remove_file(&path);
    assert!(text.contains("threads_per_block = 32"));
}

#[test]
fn syntax_error_reports_location() {
    let path = temp_path("broken.tl");
    std::fs::write(&path, "void f(fp32 *p) {\n  int32 x = ;\n}\n").unwrap();
    let o = Command::new(tlc_binary())
        .arg(&path)
        .output()
        .expect("failed to run tlc");
    let _ = std::fs::remove_file(&path);
    assert_eq!(o.status.code(), Some(1));
    let err = stderr(&o);
    assert!(err.contains("error[E0001]"), "stderr: {err}");
    assert!(err.contains(":2:"), "stderr: {err}");
}
