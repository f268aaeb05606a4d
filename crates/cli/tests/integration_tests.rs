use std::fs;
use std::path::Path;
use tempfile::tempdir;

/// Spawns the CLI binary, feeds it `command`, then EXIT, and returns stdout.
fn run_cli_command(data_dir: &Path, command: &str) -> String {
    use std::io::Write;
    use std::process::{Command, Stdio};

    let mut child = Command::new("cargo")
        .args(["run", "-p", "cli", "--"])
        .env("STRATA_DIR", data_dir.to_str().unwrap())
        .env("STRATA_GROUP", "sg")
        .env("STRATA_MEMTABLE_KB", "1")
        .env("STRATA_PARTITION_MS", "86400000")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("failed to spawn cli");

    {
        let stdin = child.stdin.as_mut().expect("failed to open stdin");
        stdin.write_all(command.as_bytes()).expect("failed to write commands");
        stdin.write_all(b"EXIT\n").expect("failed to write EXIT");
    }

    let output = child.wait_with_output().expect("failed to read output");
    String::from_utf8_lossy(&output.stdout).to_string()
}

#[test]
fn test_insert_and_query() {
    let dir = tempdir().unwrap();
    fs::create_dir_all(dir.path()).unwrap();

    let output = run_cli_command(dir.path(), "INSERT root.d0 s0 10 42\nQUERY root.d0 s0\n");

    assert!(output.contains("OK"));
    assert!(output.contains("10 -> 42"));
}

#[test]
fn test_insert_tablet() {
    let dir = tempdir().unwrap();

    let commands = "INSERT-TABLET root.d0 s0 1:1 2:2 3:3\nQUERY root.d0 s0\n";
    let output = run_cli_command(dir.path(), commands);

    assert!(output.contains("OK (3 rows)"));
    assert!(output.contains("1 -> 1"));
    assert!(output.contains("3 -> 3"));
}

#[test]
fn test_delete_removes_sample() {
    let dir = tempdir().unwrap();

    let commands = "INSERT root.d0 s0 10 1\nDELETE root.d0 s0 10\nQUERY root.d0 s0\n";
    let output = run_cli_command(dir.path(), commands);

    assert!(output.contains("(empty)"));
}

#[test]
fn test_query_with_range() {
    let dir = tempdir().unwrap();

    let mut commands = String::new();
    for ts in 0..10 {
        commands.push_str(&format!("INSERT root.d0 s0 {ts} {ts}\n"));
    }
    commands.push_str("QUERY root.d0 s0 3 7\n");

    let output = run_cli_command(dir.path(), &commands);

    assert!(output.contains("3 -> 3"));
    assert!(output.contains("6 -> 6"));
    assert!(!output.contains("7 -> 7"));
    assert!(!output.contains("2 -> 2"));
}

#[test]
fn test_typed_values() {
    let dir = tempdir().unwrap();

    let commands = "INSERT root.d0 temp 1 98.6:f64\nINSERT root.d0 flag 1 true:bool\nQUERY root.d0 temp\nQUERY root.d0 flag\n";
    let output = run_cli_command(dir.path(), commands);

    assert!(output.contains("98.6"));
    assert!(output.contains("true"));
}

#[test]
fn test_close_then_query_still_works() {
    let dir = tempdir().unwrap();

    let commands = "INSERT root.d0 s0 1 1\nCLOSE root.d0 s0\nQUERY root.d0 s0\n";
    let output = run_cli_command(dir.path(), commands);

    assert!(output.contains("OK"));
    assert!(output.contains("1 -> 1"));
}

#[test]
fn test_merge_command() {
    let dir = tempdir().unwrap();

    let mut commands = String::new();
    for ts in 0..20 {
        commands.push_str(&format!("INSERT root.d0 s0 {ts} {ts}\n"));
    }
    commands.push_str("MERGE full\n");
    commands.push_str("QUERY root.d0 s0\n");

    let output = run_cli_command(dir.path(), &commands);

    assert!(output.contains("OK (seq="));
    assert!(output.contains("19 -> 19"));
}

#[test]
fn test_stats_output() {
    let dir = tempdir().unwrap();

    let commands = "INSERT root.d0 s0 1 1\nSTATS\n";
    let output = run_cli_command(dir.path(), commands);

    assert!(output.contains("StorageGroupProcessor"));
}

#[test]
fn test_quit_command() {
    let dir = tempdir().unwrap();

    let output = run_cli_command(dir.path(), "INSERT root.d0 s0 1 1\nQUIT\n");

    assert!(output.contains("OK"));
    assert!(output.contains("bye"));
}

#[test]
fn test_persistence_across_restarts() {
    let dir = tempdir().unwrap();

    run_cli_command(dir.path(), "INSERT root.d0 s0 1 keepme\nCLOSE root.d0 s0\n");
    let output = run_cli_command(dir.path(), "QUERY root.d0 s0\n");

    assert!(output.contains("keepme"));
}

#[test]
fn test_unknown_command_reports_error() {
    let dir = tempdir().unwrap();

    let output = run_cli_command(dir.path(), "BOGUS foo\n");

    assert!(output.contains("unknown command"));
}
