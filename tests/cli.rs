use std::fs;
use std::process::Command;

use omicfuse::io::read_embedding;
use omicfuse::{ConvergenceReport, RunConfig};
use tempfile::tempdir;

#[test]
fn simulate_then_run_writes_every_engine_output() {
    let tmp = tempdir().expect("temporary directory");
    let cohort_dir = tmp.path().join("cohort");
    let out_dir = tmp.path().join("results");
    let exe = env!("CARGO_BIN_EXE_omicfuse");

    let status = Command::new(exe)
        .args(["simulate", "--out-dir"])
        .arg(&cohort_dir)
        .args(["--samples", "16", "--seed", "5"])
        .status()
        .expect("run omicfuse simulate");
    assert!(status.success(), "simulate exited with status {status:?}");

    let run_file = cohort_dir.join("run.toml");
    for name in ["expression.tsv", "mutation.tsv", "copy_number.tsv", "labels.tsv"] {
        assert!(cohort_dir.join(name).exists(), "{name} missing");
    }
    let config = RunConfig::load(&run_file).expect("generated run file parses");
    assert_eq!(config.blocks.len(), 3);
    assert_eq!(config.evaluation.positive_class.as_deref(), Some("A"));

    let status = Command::new(exe)
        .args(["run", "--config"])
        .arg(&run_file)
        .arg("--out-dir")
        .arg(&out_dir)
        .status()
        .expect("run omicfuse run");
    assert!(status.success(), "run exited with status {status:?}");

    for engine in ["mfa", "joint_nmf", "mixed_likelihood"] {
        let embedding = read_embedding(&out_dir.join(format!("{engine}_embedding.tsv")))
            .expect("embedding TSV");
        assert_eq!(embedding.sample_ids.len(), 16);
        assert_eq!(embedding.scores.ncols(), 2);
        assert!(embedding.labels.is_some());
        assert!(out_dir.join(format!("{engine}_provenance.toml")).exists());
        assert!(out_dir.join(format!("{engine}_loadings")).join("mutation.tsv").exists());
    }
    let convergence: ConvergenceReport = toml::from_str(
        &fs::read_to_string(out_dir.join("joint_nmf_convergence.toml")).expect("convergence file"),
    )
    .expect("convergence TOML");
    assert!(convergence.iterations > 0);
    assert!(!out_dir.join("mfa_convergence.toml").exists());
    assert!(out_dir.join("evaluation.tsv").exists());
    assert!(out_dir.join("run_effective.toml").exists());

    let output = Command::new(exe)
        .args(["evaluate"])
        .arg(out_dir.join("mfa_embedding.tsv"))
        .arg("--labels")
        .arg(cohort_dir.join("labels.tsv"))
        .args(["--positive-class", "A", "--dims", "0,1"])
        .output()
        .expect("run omicfuse evaluate");
    assert!(output.status.success(), "evaluate failed: {}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut lines = stdout.lines();
    assert_eq!(
        lines.next(),
        Some("class\tfalse_positives\tfalse_negatives\tnormal_x\tnormal_y\toffset")
    );
    assert!(lines.next().is_some_and(|row| row.starts_with("A\t")));
}

#[test]
fn missing_run_file_fails_with_status_one() {
    let tmp = tempdir().expect("temporary directory");
    let output = Command::new(env!("CARGO_BIN_EXE_omicfuse"))
        .args(["run", "--config"])
        .arg(tmp.path().join("absent.toml"))
        .arg("--out-dir")
        .arg(tmp.path().join("out"))
        .output()
        .expect("run omicfuse");
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Error:"));
}
