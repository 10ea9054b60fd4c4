//! Submission, query, fetch, delete and sweep through the service facade.

mod common;

use chrono::Utc;
use serde_json::json;

use atlas::status::StatusUpdate;
use atlas::{JobStatus, ServiceError, Upload, ValidationError};

use common::*;

#[test]
fn test_submit_records_queued_job() {
    let harness = TestHarness::new();
    let receipt = harness.service.submit(png_uploads(3), "").unwrap();

    assert_eq!(receipt.status, JobStatus::Queued);
    assert!(!receipt.dispatch_handle.dispatch_id.is_empty());
    atlas::validate_job_id(&receipt.job_id).unwrap();

    let record = harness.status(&receipt.job_id);
    assert_eq!(record.status, JobStatus::Queued);
    assert_eq!(record.progress, 0);
    assert_eq!(record.num_images, 3);
    assert!(record.total_size_bytes > 0);
    assert_eq!(record.options, json!({}));
    assert!(record.completed_at.is_none());

    assert!(harness.service.workspaces().exists(&receipt.job_id));
    assert_eq!(harness.service.queue().pending_count().unwrap(), 1);
}

#[test]
fn test_submit_echoes_options_as_sent() {
    let harness = TestHarness::new();
    let raw = r#"{"quality": "high", "customer_ref": "A-17"}"#;
    let job_id = harness.submit(png_uploads(3), raw);

    let record = harness.status(&job_id);
    assert_eq!(record.options, json!({"quality": "high", "customer_ref": "A-17"}));
}

#[test]
fn test_too_few_images_leave_nothing_behind() {
    let harness = TestHarness::new();
    let err = harness.service.submit(png_uploads(2), "").unwrap_err();

    assert!(matches!(
        err,
        ServiceError::Validation(ValidationError::TooFewInputs { min: 3, actual: 2 })
    ));
    assert_eq!(harness.workspace_count(), 0);
    assert!(harness.service.list().unwrap().is_empty());
    assert_eq!(harness.service.queue().pending_count().unwrap(), 0);
}

#[test]
fn test_too_few_streamed_images_leave_nothing_behind() {
    let harness = TestHarness::new();
    let mut remaining = 2;
    let uploads = std::iter::from_fn(move || {
        if remaining == 0 {
            return None;
        }
        remaining -= 1;
        Some(Upload::from_bytes("view.png", png_bytes(4, 4)))
    });

    let err = harness.service.submit(uploads, "").unwrap_err();
    assert!(matches!(
        err,
        ServiceError::Validation(ValidationError::TooFewInputs { actual: 2, .. })
    ));
    assert_eq!(harness.workspace_count(), 0);
}

#[test]
fn test_too_many_images_rejected() {
    let harness = TestHarness::new();
    let err = harness.service.submit(png_uploads(11), "").unwrap_err();
    assert!(matches!(
        err,
        ServiceError::Validation(ValidationError::TooManyInputs { max: 10 })
    ));
    assert_eq!(harness.workspace_count(), 0);
}

#[test]
fn test_oversized_payload_leaves_nothing_behind() {
    let harness = TestHarness::new();
    let err = harness
        .service
        .submit(sized_uploads(3, 400 * 1024), "")
        .unwrap_err();

    assert!(matches!(
        err,
        ServiceError::Validation(ValidationError::PayloadTooLarge { limit_mb: 1 })
    ));
    assert_eq!(harness.workspace_count(), 0);
    assert!(harness.service.list().unwrap().is_empty());
}

#[test]
fn test_non_image_upload_rejected() {
    let harness = TestHarness::new();
    let mut uploads = vec![Upload::from_bytes("notes.txt", b"hello".to_vec())];
    uploads.extend(png_uploads(3));

    let err = harness.service.submit(uploads, "").unwrap_err();
    assert!(matches!(
        err,
        ServiceError::Validation(ValidationError::UnsupportedMedia { ref filename }) if filename == "notes.txt"
    ));
    assert_eq!(harness.workspace_count(), 0);
}

#[test]
fn test_invalid_options_rejected_before_staging() {
    let harness = TestHarness::new();

    for raw in [r#"{"quality": "ultra"}"#, "{", "[1, 2]", r#"{"max_texture_size": 3000}"#] {
        let err = harness.service.submit(png_uploads(3), raw).unwrap_err();
        assert!(
            matches!(err, ServiceError::Validation(ValidationError::InvalidOptions(_))),
            "{} was accepted",
            raw
        );
    }
    assert_eq!(harness.workspace_count(), 0);
}

#[test]
fn test_malformed_job_ids_rejected() {
    let harness = TestHarness::new();
    for id in ["../status", "not-a-uuid", "7D1C52BE-3F29-4D6C-9A43-0B2C8F1F5E11", ""] {
        assert!(matches!(
            harness.service.status(id),
            Err(ServiceError::Validation(ValidationError::InvalidJobId(_)))
        ));
        assert!(harness.service.delete(id).is_err());
    }
}

#[test]
fn test_unknown_job_not_found() {
    let harness = TestHarness::new();
    let id = "7d1c52be-3f29-4d6c-9a43-0b2c8f1f5e11";
    assert!(matches!(harness.service.status(id), Err(ServiceError::NotFound(_))));
    assert!(matches!(harness.service.artifact(id), Err(ServiceError::NotFound(_))));
}

#[test]
fn test_artifact_of_unfinished_job_conflicts() {
    let harness = TestHarness::new();
    let job_id = harness.submit(png_uploads(3), "");

    let err = harness.service.artifact(&job_id).unwrap_err();
    assert!(matches!(err, ServiceError::Conflict { status: JobStatus::Queued, .. }));
    assert_eq!(err.to_string(), "Job not completed yet. Current status: queued");
}

#[test]
fn test_completed_job_without_artifact_reports_missing() {
    let harness = TestHarness::new();
    let job_id = harness.submit(png_uploads(3), "");
    harness
        .service
        .store()
        .update(&job_id, StatusUpdate::completed(None))
        .unwrap();

    assert!(matches!(
        harness.service.artifact(&job_id),
        Err(ServiceError::ArtifactMissing(id)) if id == job_id
    ));
}

#[test]
fn test_delete_is_idempotent() {
    let harness = TestHarness::new();
    let job_id = harness.submit(png_uploads(3), "");

    harness.service.delete(&job_id).unwrap();
    harness.service.delete(&job_id).unwrap();

    assert!(matches!(harness.service.status(&job_id), Err(ServiceError::NotFound(_))));
    assert!(!harness.service.workspaces().exists(&job_id));
    assert!(!harness.service.artifacts().exists(&job_id));
    harness
        .service
        .delete("7d1c52be-3f29-4d6c-9a43-0b2c8f1f5e11")
        .unwrap();
}

#[test]
fn test_list_returns_oldest_first() {
    let harness = TestHarness::new();
    let first = harness.submit(png_uploads(3), "");
    let second = harness.submit(png_uploads(3), "");

    let ids: Vec<String> = harness
        .service
        .list()
        .unwrap()
        .into_iter()
        .map(|r| r.job_id)
        .collect();
    assert_eq!(ids, vec![first, second]);
}

#[test]
fn test_sweep_removes_expired_terminal_workspaces_only() {
    let log = CallLog::default();
    let harness = TestHarness::with_settings(
        |settings| settings.workspace_ttl_hours = Some(1),
        fake_registry(&log),
        log,
    );
    let failed = harness.submit(png_uploads(3), "");
    let queued = harness.submit(png_uploads(3), "");
    harness
        .service
        .store()
        .update(&failed, StatusUpdate::failed(20, "boom", None))
        .unwrap();

    assert!(harness.service.sweep(Utc::now()).unwrap().is_empty());

    let swept = harness
        .service
        .sweep(Utc::now() + chrono::Duration::hours(2))
        .unwrap();
    assert_eq!(swept, vec![failed.clone()]);
    assert!(!harness.service.workspaces().exists(&failed));
    assert!(harness.service.workspaces().exists(&queued));
    assert_eq!(harness.status(&failed).status, JobStatus::Failed);
}

#[test]
fn test_sweep_without_ttl_is_a_no_op() {
    let harness = TestHarness::new();
    let job_id = harness.submit(png_uploads(3), "");
    harness
        .service
        .store()
        .update(&job_id, StatusUpdate::failed(0, "boom", None))
        .unwrap();

    let swept = harness
        .service
        .sweep(Utc::now() + chrono::Duration::days(365))
        .unwrap();
    assert!(swept.is_empty());
    assert!(harness.service.workspaces().exists(&job_id));
}
