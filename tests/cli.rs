//! Integration tests for the `scriptest` command line.

use std::fs;
use std::process::{Command, Output};
use std::time::Instant;
use tempfile::TempDir;

fn scriptest_cmd() -> Command {
    Command::new(env!("CARGO_BIN_EXE_scriptest"))
}

fn describe(output: &Output) -> String {
    format!(
        "stdout: {}\nstderr: {}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    )
}

/// A script that sleeps for a given duration.
fn sleep_script(duration_secs: f64) -> String {
    format!("exec sleep {duration_secs}\n")
}

// ==================== Run Tests ====================

#[test]
fn test_scripts_run_in_parallel_by_default() {
    let temp_dir = TempDir::new().unwrap();
    fs::write(temp_dir.path().join("sleep1.txt"), sleep_script(0.3)).unwrap();
    fs::write(temp_dir.path().join("sleep2.txt"), sleep_script(0.3)).unwrap();

    let start = Instant::now();
    let output = scriptest_cmd().arg("run").arg(temp_dir.path()).output().unwrap();
    let elapsed = start.elapsed();

    assert!(output.status.success(), "{}", describe(&output));

    // If parallel, should complete in ~0.3s (+ overhead)
    // If serial, would take ~0.6s
    assert!(
        elapsed.as_secs_f64() < 0.8,
        "Scripts took {:.2}s to run (expected < 0.8s for parallel execution)",
        elapsed.as_secs_f64()
    );
}

#[test]
fn test_scripts_run_serially_when_configured() {
    let temp_dir = TempDir::new().unwrap();
    fs::write(temp_dir.path().join("scriptest.yaml"), "version: 1\nserial: true\n").unwrap();
    fs::write(temp_dir.path().join("sleep1.txt"), sleep_script(0.2)).unwrap();
    fs::write(temp_dir.path().join("sleep2.txt"), sleep_script(0.2)).unwrap();

    let start = Instant::now();
    let output = scriptest_cmd().arg("run").arg(temp_dir.path()).output().unwrap();
    let elapsed = start.elapsed();

    assert!(output.status.success(), "{}", describe(&output));
    assert!(
        elapsed.as_secs_f64() >= 0.35,
        "Scripts took {:.2}s to run (expected >= 0.35s for serial execution)",
        elapsed.as_secs_f64()
    );
}

#[test]
fn test_results_maintain_order() {
    let temp_dir = TempDir::new().unwrap();
    for name in ["c_third", "a_first", "b_second"] {
        fs::write(temp_dir.path().join(format!("{name}.txt")), "exec echo hi\n").unwrap();
    }

    let output = scriptest_cmd().arg("run").arg(temp_dir.path()).output().unwrap();
    assert!(output.status.success(), "{}", describe(&output));

    let stdout = String::from_utf8_lossy(&output.stdout);
    let pos_a = stdout.find("a_first").expect("a_first not found");
    let pos_b = stdout.find("b_second").expect("b_second not found");
    let pos_c = stdout.find("c_third").expect("c_third not found");
    assert!(pos_a < pos_b && pos_b < pos_c, "Results not in expected order:\n{stdout}");
}

#[test]
fn test_failure_exit_code_and_location() {
    let temp_dir = TempDir::new().unwrap();
    fs::write(
        temp_dir.path().join("broken.txt"),
        "exec echo hello\nstdout goodbye\n",
    )
    .unwrap();

    let output = scriptest_cmd().arg("run").arg(temp_dir.path()).output().unwrap();
    assert_eq!(output.status.code(), Some(1), "{}", describe(&output));

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("✗ broken"), "{stdout}");
    assert!(stdout.contains("broken.txt:2"), "{stdout}");
    assert!(stdout.contains("no match for `goodbye` found in stdout"), "{stdout}");
    assert!(stdout.contains("0 passed, 1 failed, 0 skipped"), "{stdout}");
}

#[test]
fn test_json_output() {
    let temp_dir = TempDir::new().unwrap();
    fs::write(temp_dir.path().join("ok.txt"), "exec echo hi\nstdout hi\n").unwrap();
    fs::write(temp_dir.path().join("skipped.txt"), "skip 'not here'\n").unwrap();

    let output = scriptest_cmd()
        .args(["run", "--output", "json"])
        .arg(temp_dir.path())
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", describe(&output));

    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["passed"], 1);
    assert_eq!(json["skipped"], 1);
    assert_eq!(json["results"][0]["name"], "ok");
    assert_eq!(json["results"][0]["outcome"], "passed");
    assert_eq!(json["results"][1]["outcome"], "skipped");
    assert_eq!(json["results"][1]["skip_reason"], "not here");
}

#[test]
fn test_junit_output() {
    let temp_dir = TempDir::new().unwrap();
    fs::write(temp_dir.path().join("fails.txt"), "exists <missing>\n").unwrap();

    let output = scriptest_cmd()
        .args(["run", "--output", "junit"])
        .arg(temp_dir.path())
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));

    let xml = String::from_utf8_lossy(&output.stdout);
    assert!(xml.starts_with("<?xml"), "{xml}");
    assert!(xml.contains("<testcase name=\"fails\""), "{xml}");
    assert!(xml.contains("<failure message=\"&lt;missing&gt; does not exist\">"), "{xml}");
}

#[test]
fn test_update_flag_rewrites_script() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("golden.txt");
    fs::write(&path, "exec echo fresh\ncmp stdout want\n-- want --\nstale\n").unwrap();

    let output = scriptest_cmd().arg("run").arg(&path).output().unwrap();
    assert_eq!(output.status.code(), Some(1), "{}", describe(&output));

    let output = scriptest_cmd().args(["run", "--update"]).arg(&path).output().unwrap();
    assert!(output.status.success(), "{}", describe(&output));
    assert_eq!(
        fs::read_to_string(&path).unwrap(),
        "exec echo fresh\ncmp stdout want\n-- want --\nfresh\n"
    );

    let output = scriptest_cmd().arg("run").arg(&path).output().unwrap();
    assert!(output.status.success(), "{}", describe(&output));
}

#[test]
fn test_local_workdir_root() {
    let temp_dir = TempDir::new().unwrap();
    fs::write(temp_dir.path().join("t.txt"), "exists f\n-- f --\n").unwrap();

    let output = scriptest_cmd()
        .args(["run", "--workdir-root", "local"])
        .arg(temp_dir.path())
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", describe(&output));
    assert!(temp_dir.path().join(".scriptest").is_dir());
}

// ==================== Validate/Init/Schema Tests ====================

#[test]
fn test_validate() {
    let temp_dir = TempDir::new().unwrap();
    fs::write(temp_dir.path().join("good.txt"), "exec echo hi\ncustomcmd x\n").unwrap();

    let output = scriptest_cmd().arg("validate").arg(temp_dir.path()).output().unwrap();
    assert!(output.status.success(), "{}", describe(&output));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("2 instructions, 0 files"), "{stdout}");
    assert!(stdout.contains("\"customcmd\" is not a built-in command"), "{stdout}");

    fs::write(temp_dir.path().join("bad.txt"), "exec \"unterminated\n").unwrap();
    let output = scriptest_cmd().arg("validate").arg(temp_dir.path()).output().unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("unterminated"));
}

#[test]
fn test_init_creates_runnable_script() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("new/example.txt");

    let output = scriptest_cmd().arg("init").arg(&path).output().unwrap();
    assert!(output.status.success(), "{}", describe(&output));
    assert!(path.is_file());

    let output = scriptest_cmd().arg("run").arg(&path).output().unwrap();
    assert!(output.status.success(), "{}", describe(&output));

    let output = scriptest_cmd().arg("init").arg(&path).output().unwrap();
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn test_schema_output() {
    let output = scriptest_cmd().arg("schema").output().unwrap();
    assert!(output.status.success());
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert!(json["properties"]["workdir_root"].is_object());
}
