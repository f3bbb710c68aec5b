#![cfg(all(unix, feature = "cli"))]

use std::path::PathBuf;
use std::process::{Command, Output};

use serde_json::Value;

fn unique_temp_dir(tag: &str) -> PathBuf {
    let dir = PathBuf::from(format!(
        "/tmp/capctl-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir
}

fn capctl(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_capctl"))
        .env_remove("CAPCTL_SOURCES")
        .args(["--log-level", "error", "--format", "json"])
        .args(args)
        .output()
        .expect("capctl should run")
}

fn json_stdout(output: &Output) -> Value {
    let stdout = String::from_utf8_lossy(&output.stdout);
    serde_json::from_str(stdout.trim()).unwrap_or_else(|err| panic!("bad json {stdout:?}: {err}"))
}

#[test]
fn version_prints_package_version() {
    let output = Command::new(env!("CARGO_BIN_EXE_capctl"))
        .arg("version")
        .output()
        .expect("version should run");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(stdout.trim(), format!("capctl {}", env!("CARGO_PKG_VERSION")));
}

#[test]
fn channels_lists_defaults_and_extras() {
    let output = capctl(&["channels", "--channel-list", "short:1,6,11"]);
    assert!(output.status.success());
    let lists = json_stdout(&output);
    let lists = lists.as_array().expect("array of lists");

    let b = lists
        .iter()
        .find(|l| l["name"] == "IEEE80211b")
        .expect("IEEE80211b present");
    assert_eq!(b["entries"], 11);
    assert!(lists.iter().any(|l| l["name"] == "n/a"));
    let short = lists.iter().find(|l| l["name"] == "short").expect("extra list");
    assert_eq!(short["definition"], "1,6,11");
}

#[test]
fn bad_channel_list_is_a_usage_error() {
    let output = capctl(&["channels", "--channel-list", "broken:1,,x"]);
    assert_eq!(output.status.code(), Some(64));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("channel list"));
}

#[test]
fn drivers_are_listed() {
    let output = capctl(&["drivers"]);
    assert!(output.status.success());
    let drivers = json_stdout(&output);
    let names: Vec<&str> = drivers
        .as_array()
        .expect("array of drivers")
        .iter()
        .filter_map(|d| d["type_name"].as_str())
        .collect();
    for expected in ["linuxwifi", "simroot", "sim"] {
        assert!(names.contains(&expected), "{expected} missing from {names:?}");
    }
}

#[test]
fn drivers_probe_picks_claiming_driver() {
    let output = capctl(&["drivers", "--probe", "simroot3"]);
    assert!(output.status.success());
    let drivers = json_stdout(&output);
    assert_eq!(drivers[0]["type_name"], "simroot");
    assert_eq!(drivers[0]["requires_privilege"], true);

    let output = capctl(&["drivers", "--probe", "nosuchif0"]);
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn run_without_sources_is_a_usage_error() {
    let output = capctl(&["run"]);
    assert_eq!(output.status.code(), Some(64));
}

#[test]
fn unprivileged_sources_hop_and_report() {
    let output = capctl(&[
        "run",
        "--no-helper",
        "--channel-list",
        "short:1,6,11",
        "--source",
        "sim0:channellist=short,hoprate=10",
        "--source",
        "sim1:channellist=short,hoprate=10",
        "--duration",
        "1",
    ]);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let report = json_stdout(&output);

    let sources = report["sources"].as_array().expect("sources");
    assert_eq!(sources.len(), 2);
    for source in sources {
        assert_eq!(source["state"], "running");
        assert_eq!(source["hopping"], true);
    }
    assert_ne!(sources[0]["position"], sources[1]["position"]);
    assert!(report["ticks"].as_u64().unwrap_or(0) > 0);
    assert!(!report["channel_usage"].as_object().expect("usage").is_empty());
}

#[test]
fn unknown_interface_stays_visible_in_error() {
    let output = capctl(&["run", "--no-helper", "--source", "nosuchif0", "--duration", "0.3"]);
    assert_eq!(output.status.code(), Some(2));
    let report = json_stdout(&output);
    let source = &report["sources"][0];
    assert_eq!(source["state"], "error");
    assert_eq!(source["driver"], "broken");
    assert!(source["warning"].as_str().unwrap_or("").contains("nosuchif0"));
}

#[test]
fn privileged_source_runs_through_helper() {
    let dir = unique_temp_dir("helper");
    let output = capctl(&[
        "run",
        "--tmp-dir",
        dir.to_str().expect("utf-8 temp dir"),
        "--source",
        "simroot0:channel=6",
        "--duration",
        "2",
    ]);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let report = json_stdout(&output);
    let source = &report["sources"][0];
    assert_eq!(source["driver"], "simroot");
    assert_eq!(source["state"], "running");
    assert_eq!(source["channel"], 6);

    let leftovers: Vec<_> = std::fs::read_dir(&dir)
        .expect("temp dir readable")
        .filter_map(Result::ok)
        .collect();
    assert!(leftovers.is_empty(), "side-channel socket not removed");
    let _ = std::fs::remove_dir_all(&dir);
}
