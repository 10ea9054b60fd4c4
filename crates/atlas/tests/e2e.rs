//! End-to-end runs through settings loaded from disk and real child
//! processes standing in for the reconstruction tools.

#![cfg(unix)]

mod common;

use std::path::Path;

use serde_json::{json, Value};
use tempfile::TempDir;

use atlas::config::load_settings;
use atlas::pipeline::{Attempt, AttemptOutcome};
use atlas::storage::StageDir;
use atlas::{JobOptions, JobStatus, Service};

use common::*;

fn shell(script: &str, args: &[&str], expected: &[&str]) -> Value {
    let mut argv = vec!["-c".to_string(), script.to_string(), "sh".to_string()];
    argv.extend(args.iter().map(|a| a.to_string()));
    json!({"program": "sh", "args": argv, "expected_outputs": expected})
}

/// Writes a settings file whose tools are small shell scripts.
fn write_config(dir: &Path, dense: Value) -> std::path::PathBuf {
    let model = dir.join("fixture.glb");
    std::fs::write(&model, minimal_glb()).unwrap();

    let config = json!({
        "storage_root": dir.join("storage"),
        "limits": {"min_images": 3, "max_images": 20, "max_upload_mb": 5},
        "worker": {"count": 1, "hard_time_limit_secs": 60, "soft_time_limit_secs": 30},
        "segmentation": {"enabled": false},
        "tools": {
            "sparse": shell(
                r#"ls "$1" > "$3/sfm_data.json" && echo "quality=$4" >> "$3/sfm_data.json""#,
                &["{input.images}", "{input.masks}", "{output}", "{option.quality}"],
                &["sfm_data.json"]
            ),
            "dense": dense,
            "mesh": shell(r#"echo ply > "$1/mesh.ply""#, &["{output}"], &["*.ply|*.obj"]),
            "export": shell(
                r#"cp "$1" "$2/model.glb""#,
                &[model.to_str().unwrap(), "{output}"],
                &["model.glb"]
            )
        },
        "logging": {"format": "text"}
    });

    let path = dir.join("atlas.json");
    std::fs::write(&path, serde_json::to_vec_pretty(&config).unwrap()).unwrap();
    path
}

fn open(dir: &TempDir, dense: Value) -> Service {
    let settings = load_settings(write_config(dir.path(), dense)).unwrap();
    Service::open(settings).unwrap()
}

#[test]
fn test_shell_tools_produce_model() {
    let temp = TempDir::new().unwrap();
    let service = open(
        &temp,
        shell(
            r#"cp "$1/sfm_data.json" "$2/scene_dense.mvs""#,
            &["{input.sparse}", "{output}"],
            &["scene_dense.mvs"],
        ),
    );

    let raw = r#"{"quality": "high"}"#;
    let receipt = service.submit(png_uploads(4), raw).unwrap();
    let outcome = service
        .executor()
        .execute(&Attempt::new(&receipt.job_id, JobOptions::parse(raw).unwrap()))
        .unwrap();
    assert!(matches!(outcome, AttemptOutcome::Completed(_)));

    let record = service.status(&receipt.job_id).unwrap();
    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(record.num_images, 4);
    assert_eq!(record.metrics.unwrap().triangle_count, 1);

    let dense = service
        .workspaces()
        .resolve(&receipt.job_id, StageDir::Dense)
        .join("scene_dense.mvs");
    let scene = std::fs::read_to_string(dense).unwrap();
    assert!(scene.contains("0003.png"));
    assert!(scene.contains("quality=high"));

    let handle = service.artifact(&receipt.job_id).unwrap();
    assert_eq!(std::fs::read(handle.path).unwrap(), minimal_glb());
}

#[test]
fn test_tool_exit_code_fails_job_with_stderr() {
    let temp = TempDir::new().unwrap();
    let service = open(
        &temp,
        shell(
            r#"echo "loading scene" >&2; echo "densify: out of memory" >&2; exit 3"#,
            &["{input.sparse}", "{output}"],
            &["scene_dense.mvs"],
        ),
    );

    let receipt = service.submit(png_uploads(3), "").unwrap();
    let outcome = service
        .executor()
        .execute(&Attempt::new(&receipt.job_id, JobOptions::default()))
        .unwrap();
    assert!(matches!(outcome, AttemptOutcome::Failed { .. }));

    let record = service.status(&receipt.job_id).unwrap();
    assert_eq!(record.status, JobStatus::Failed);
    let cause = record.error.unwrap();
    assert!(cause.starts_with("Stage 'dense' failed"));
    assert!(cause.contains("exited with"));
    assert!(record.trace.unwrap().ends_with("densify: out of memory"));
    assert!(service.artifact(&receipt.job_id).is_err());
}

#[test]
fn test_missing_expected_output_fails_job() {
    let temp = TempDir::new().unwrap();
    let service = open(
        &temp,
        shell("exit 0", &["{input.sparse}", "{output}"], &["scene_dense.mvs"]),
    );

    let receipt = service.submit(png_uploads(3), "").unwrap();
    service
        .executor()
        .execute(&Attempt::new(&receipt.job_id, JobOptions::default()))
        .unwrap();

    let record = service.status(&receipt.job_id).unwrap();
    assert_eq!(record.status, JobStatus::Failed);
    assert_eq!(record.progress, 50);
    assert!(record.error.unwrap().contains("scene_dense.mvs"));
}

#[test]
fn test_unknown_program_fails_job() {
    let temp = TempDir::new().unwrap();
    let service = open(
        &temp,
        json!({"program": "atlas-test-no-such-tool", "args": ["{output}"]}),
    );

    let receipt = service.submit(png_uploads(3), "").unwrap();
    service
        .executor()
        .execute(&Attempt::new(&receipt.job_id, JobOptions::default()))
        .unwrap();

    let record = service.status(&receipt.job_id).unwrap();
    assert_eq!(record.status, JobStatus::Failed);
    assert!(record.error.unwrap().contains("Failed to launch 'atlas-test-no-such-tool'"));
}
