//! End-to-end tests against a running service
//!
//! These tests require:
//! 1. The service running on the configured port (PostgreSQL optional)
//! 2. S3-compatible storage reachable with the configured credentials
//! 3. ffmpeg on the service's PATH for video and HEIC inputs
//!
//! Run with: cargo test --test e2e_test -- --ignored --nocapture
//!
//! Set API_BASE_URL to override default (http://localhost:3000)

mod fixtures;
mod helpers;

use fixtures::*;
use helpers::*;
use uuid::Uuid;

fn get_base_url() -> String {
    std::env::var("API_BASE_URL").unwrap_or_else(|_| "http://localhost:3000".to_string())
}

#[tokio::test]
#[ignore] // Requires running service and storage
async fn test_e2e_health_check() {
    let base_url = get_base_url();
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{}/health", base_url))
        .send()
        .await
        .expect("Health check failed");

    assert!(
        response.status().is_success(),
        "Health check returned non-success status: {}",
        response.status()
    );

    let body: serde_json::Value = response.json().await.expect("Invalid health body");
    assert_eq!(body["checks"]["store"]["status"], "ok");
    println!("✓ Health check passed");
}

#[tokio::test]
#[ignore] // Requires running service and storage
async fn test_e2e_batch_import() {
    let base_url = get_base_url();
    let client = reqwest::Client::new();
    let game_id = Uuid::new_v4();

    let files = BATCH_FIXTURES
        .iter()
        .map(|f| (f.file_name.to_string(), fixture_bytes(f)))
        .collect();
    let (status, body) = upload_media(&client, &base_url, game_id, files)
        .await
        .expect("Failed to upload batch");
    assert_eq!(status, reqwest::StatusCode::ACCEPTED, "Upload rejected: {body}");

    let task_id: Uuid = serde_json::from_value(body["id"].clone()).expect("Missing task id");
    println!("Submitted task {} for game {}", task_id, game_id);

    let task = poll_task_status(&client, &base_url, task_id, 120)
        .await
        .expect("Failed to poll task");

    assert_eq!(task.game_id, Some(game_id));
    assert_eq!(task.items.len(), BATCH_FIXTURES.len());
    for (item, fixture) in task.items.iter().zip(BATCH_FIXTURES) {
        let expected = if fixture.should_import { "Completed" } else { "Failed" };
        assert_eq!(
            item.status, expected,
            "{} ({}): {:?}",
            fixture.file_name, fixture.description, item.message
        );
        println!("  {} [{}] → {}", item.base_name, item.resource_type, item.status);
    }

    // One unsupported file fails the task but not its siblings.
    assert_eq!(task.status, "Failed");
    assert!(task.message.as_deref().unwrap_or("").starts_with("lineup"));
    println!("✓ Batch import finished with progress {:.2}", task.progress);
}

#[tokio::test]
#[ignore] // Requires running service and storage
async fn test_e2e_concurrent_submission_conflicts() {
    let base_url = get_base_url();
    let client = reqwest::Client::new();
    let game_id = Uuid::new_v4();

    let batch = || {
        (1..=3)
            .map(|i| {
                let name = format!("inning_{i}.jpg");
                let bytes = encoded_image(&name);
                (name, bytes)
            })
            .collect::<Vec<_>>()
    };

    let (first, body) = upload_media(&client, &base_url, game_id, batch())
        .await
        .expect("First upload failed");
    assert_eq!(first, reqwest::StatusCode::ACCEPTED);

    let (second, _) = upload_media(&client, &base_url, game_id, batch())
        .await
        .expect("Second upload failed");
    assert_eq!(second, reqwest::StatusCode::CONFLICT);

    let active = client
        .get(format!("{}/api/v1/games/{}/imports/active", base_url, game_id))
        .send()
        .await
        .expect("Active lookup failed")
        .json::<serde_json::Value>()
        .await
        .expect("Invalid active body");
    // Either still running or already done.
    assert!(active.is_null() || active["id"] == body["id"]);
    println!("✓ Second submission rejected with 409");
}

#[tokio::test]
#[ignore] // Requires running service and storage
async fn test_e2e_unknown_task_is_404() {
    let base_url = get_base_url();
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{}/api/v1/imports/{}", base_url, Uuid::new_v4()))
        .send()
        .await
        .expect("Request failed");
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

    let response = client
        .post(format!("{}/api/v1/imports/{}/restart", base_url, Uuid::new_v4()))
        .send()
        .await
        .expect("Request failed");
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
}
