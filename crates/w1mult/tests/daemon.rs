//! Configuration files run end to end on the simulated bus.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow as _;
use clap as _;
use env_logger as _;
use log as _;
use serde as _;
use serde_json::Value;
use tempfile::TempDir;
use w1mult::{load, run, RunOptions, Summary};
use w1mult_core::{DeviceKind, Rom, FAMILY_THERMOMETER};

fn demo() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("demos/mixed-bus.json")
}

fn virtual_run(path: &Path, heartbeats: u32) -> Summary {
    let config = load(path).expect("configuration loads");
    run(
        &config,
        RunOptions {
            heartbeats,
            virtual_clock: true,
        },
    )
    .expect("run completes")
}

fn last_values(summary: &Summary, index: usize) -> Vec<Option<i32>> {
    summary.devices[index]
        .logs
        .iter()
        .map(|log| log.last)
        .collect()
}

#[test]
fn demo_bus_samples_every_family() {
    let summary = virtual_run(&demo(), 4);

    assert_eq!(summary.heartbeats, 4);
    assert!(summary.devices.iter().all(|device| device.found));
    let kinds: Vec<DeviceKind> = summary.devices.iter().map(|device| device.kind).collect();
    assert_eq!(
        kinds,
        [
            DeviceKind::Coupler,
            DeviceKind::Thermometer,
            DeviceKind::Thermometer,
            DeviceKind::Thermometer,
            DeviceKind::BatteryMonitor,
            DeviceKind::AdConverter,
            DeviceKind::PioOutputs,
        ]
    );
    assert_eq!(last_values(&summary, 1), [Some(336)]);
    assert_eq!(last_values(&summary, 4), [Some(672), Some(480)]);
    assert_eq!(
        last_values(&summary, 5),
        [Some(0x1234), Some(0x8000), Some(0xFFF0)]
    );
    assert!(summary.devices[3].logs.is_empty());
    assert!(summary.transactions > 0);
}

#[test]
fn summary_encodes_as_camel_case_json() {
    let summary = virtual_run(&demo(), 1);
    let json: Value = serde_json::to_value(&summary).expect("summary encodes");
    assert_eq!(json["heartbeats"], 1);
    assert_eq!(json["devices"][0]["rom"], "0x1e0000017a2b011f");
    assert_eq!(json["devices"][0]["kind"], "Coupler");
    assert!(json["devices"][1]["logs"][0].get("records").is_some());
}

#[test]
fn absent_devices_are_reported_missing() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("bus.json");
    let rom = Rom::with_crc(FAMILY_THERMOMETER, 0x51);
    let stranger = Rom::with_crc(FAMILY_THERMOMETER, 0x52);
    fs::write(
        &path,
        format!(
            r#"{{
                "devices": [ {{ "rom": "{rom}" }}, {{ "rom": "0xeb0000031f8c0328" }} ],
                "simulation": {{ "absent": [0], "strangers": ["{stranger}"] }}
            }}"#
        ),
    )
    .expect("config written");

    let summary = virtual_run(&path, 2);
    let found: Vec<bool> = summary.devices.iter().map(|device| device.found).collect();
    assert_eq!(found, [false, true]);
    assert_eq!(summary.devices.len(), 2);
}

#[test]
fn structural_errors_fail_the_run() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("bus.json");
    // A thermometer cannot parent another device.
    fs::write(
        &path,
        r#"{ "devices": [
            { "rom": "0xdc0000031f8c0228" },
            { "rom": "0xeb0000031f8c0328", "parentIndex": 0 }
        ] }"#,
    )
    .expect("config written");

    let config = load(&path).expect("well-formed file");
    let options = RunOptions {
        heartbeats: 1,
        virtual_clock: true,
    };
    assert!(run(&config, options).is_err());
}

#[test]
fn missing_file_names_the_path() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("absent.json");
    let error = load(&path).expect_err("no such file");
    assert!(format!("{error:#}").contains("absent.json"));
}
