//! Test helper utilities for E2E testing

use reqwest::multipart;
use serde::Deserialize;
use std::time::Duration;
use tokio::time::sleep;
use uuid::Uuid;

/// Response body of the import endpoints.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResponse {
    pub id: Uuid,
    pub game_id: Option<Uuid>,
    pub status: String,
    pub message: Option<String>,
    pub progress: f64,
    pub items: Vec<ItemResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemResponse {
    pub base_name: String,
    pub resource_type: String,
    pub status: String,
    pub message: Option<String>,
}

/// Upload a batch to POST /api/v1/games/{game_id}/imports.
///
/// Returns the HTTP status alongside the body so callers can assert on
/// rejections.
pub async fn upload_media(
    client: &reqwest::Client,
    base_url: &str,
    game_id: Uuid,
    files: Vec<(String, Vec<u8>)>,
) -> Result<(reqwest::StatusCode, serde_json::Value), Box<dyn std::error::Error>> {
    let mut form = multipart::Form::new();
    for (name, bytes) in files {
        form = form.part("files", multipart::Part::bytes(bytes).file_name(name));
    }

    let response = client
        .post(format!("{}/api/v1/games/{}/imports", base_url, game_id))
        .multipart(form)
        .send()
        .await?;

    let status = response.status();
    let body = response.json::<serde_json::Value>().await?;
    Ok((status, body))
}

/// Poll task status until it is completed or failed, checking progress
/// never goes backwards.
pub async fn poll_task_status(
    client: &reqwest::Client,
    base_url: &str,
    task_id: Uuid,
    timeout_secs: u64,
) -> Result<TaskResponse, Box<dyn std::error::Error>> {
    let max_attempts = timeout_secs * 2; // Poll every 500ms
    let mut last_progress = 0.0;

    for attempt in 0..max_attempts {
        let response = client
            .get(format!("{}/api/v1/imports/{}", base_url, task_id))
            .send()
            .await?;

        if !response.status().is_success() {
            let error_text = response.text().await?;
            return Err(format!("Status check failed: {}", error_text).into());
        }

        let task = response.json::<TaskResponse>().await?;
        if task.progress < last_progress {
            return Err(format!("Progress went from {} to {}", last_progress, task.progress).into());
        }
        last_progress = task.progress;

        match task.status.as_str() {
            "Completed" | "Failed" => return Ok(task),
            "Queued" | "Started" => {
                if attempt % 10 == 0 && attempt > 0 {
                    println!("  ... still waiting (attempt {}/{})", attempt, max_attempts);
                }
                sleep(Duration::from_millis(500)).await;
            }
            _ => return Err(format!("Unknown task status: {}", task.status).into()),
        }
    }

    Err(format!("Task did not finish within {} seconds", timeout_secs).into())
}
