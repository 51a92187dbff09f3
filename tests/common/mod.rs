#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{Value, json};

pub struct CmdResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub log_path: PathBuf,
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn resolve_bin_path() -> PathBuf {
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_csa") {
        return PathBuf::from(path);
    }

    let exe_name = if cfg!(windows) { "csa.exe" } else { "csa" };
    let fallback = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(PathBuf::from))
        .and_then(|deps| deps.parent().map(PathBuf::from))
        .map(|debug_dir| debug_dir.join(exe_name));

    match fallback {
        Some(path) if path.exists() => path,
        _ => panic!("unable to resolve csa binary path for integration test"),
    }
}

/// Run the binary with `home` as `$HOME`, so no user config or activity log
/// is touched, and keep a transcript under the temp dir.
pub fn run_cli_case(case_name: &str, home: &Path, args: &[&str]) -> CmdResult {
    let root = std::env::temp_dir().join("csa-test-logs");
    fs::create_dir_all(&root).expect("create temp test log dir");

    let log_path = root.join(format!("{}-{}.log", sanitize(case_name), now_millis()));
    let bin_path = resolve_bin_path();

    let output = Command::new(&bin_path)
        .args(args)
        .current_dir(home)
        .env("HOME", home)
        .env("CSA_OUTPUT_FORMAT", "json")
        .env("RUST_BACKTRACE", "1")
        .output()
        .expect("execute csa command");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    let mut log_content = String::new();
    log_content.push_str(&format!("case={case_name}\n"));
    log_content.push_str(&format!("bin={}\n", bin_path.display()));
    log_content.push_str(&format!("args={args:?}\n"));
    log_content.push_str(&format!("status={}\n", output.status));
    log_content.push_str("----- stdout -----\n");
    log_content.push_str(&stdout);
    log_content.push('\n');
    log_content.push_str("----- stderr -----\n");
    log_content.push_str(&stderr);
    log_content.push('\n');
    fs::write(&log_path, log_content).expect("write test log");

    CmdResult {
        status: output.status,
        stdout,
        stderr,
        log_path,
    }
}

/// Three projects, each with an empty bucket, a 5e9-byte bucket and a 100 GiB disk.
pub fn three_project_inventory() -> Value {
    let project = |id: &str| {
        json!({
            "id": id,
            "buckets": [
                {"name": format!("{id}-empty"), "primary": "0        gs://empty"},
                {"name": format!("{id}-data"), "primary": "5000000000  gs://data", "delay_ms": 5}
            ],
            "disks": [
                {
                    "name": format!("{id}-boot"),
                    "scope": "us-central1-a",
                    "metadata": {
                        "sizeGb": "100",
                        "zone": "projects/p/zones/us-central1-a",
                        "type": "projects/p/zones/us-central1-a/diskTypes/pd-balanced",
                        "creationTimestamp": "2024-03-01T10:00:00.000-07:00",
                        "labels": {"env": "prod"}
                    }
                }
            ]
        })
    };
    json!({"projects": [project("proj-a"), project("proj-b"), project("proj-c")]})
}

/// Write a fixture document into `dir` and return its path.
pub fn write_fixture(dir: &Path, inventory: &Value) -> PathBuf {
    let path = dir.join("inventory.json");
    fs::write(&path, serde_json::to_vec_pretty(inventory).expect("encode fixture"))
        .expect("write fixture");
    path
}
