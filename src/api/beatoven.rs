use reqwest::Client;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::ApiError;

const BEATOVEN_BASE: &str = "https://public-api.beatoven.ai/api/v1";
const POLL_INTERVAL: Duration = Duration::from_secs(5);
const MAX_POLLS: u32 = 60;

fn bgm_err(msg: impl Into<String>) -> ApiError {
    ApiError::BgmGeneration(msg.into())
}

fn str_field<'a>(root: &'a serde_json::Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| root.get(k).and_then(|v| v.as_str()))
}

/// Composes a background track and writes it to `out_path`. The service is
/// asynchronous: create a track, start a compose task, poll until it reports
/// `composed`, then download the result.
pub async fn compose_bgm(
    client: &Client,
    api_key: &str,
    mood: &str,
    genre: &str,
    duration_seconds: u32,
    out_path: &Path,
) -> Result<PathBuf, ApiError> {
    let prompt = format!("{duration_seconds} seconds of {mood} {genre} music");
    debug!("bgm compose prompt: {}", prompt);

    let resp = client
        .post(format!("{BEATOVEN_BASE}/tracks"))
        .bearer_auth(api_key)
        .json(&json!({"prompt": {"text": prompt}}))
        .send()
        .await?;
    let root = read_json(resp, "track creation").await?;
    let track_id = root
        .get("tracks")
        .and_then(|t| t.get(0))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .or_else(|| str_field(&root, &["track_id", "id"]).map(str::to_string))
        .ok_or_else(|| bgm_err("track creation returned no id"))?;

    let resp = client
        .post(format!("{BEATOVEN_BASE}/tracks/compose/{track_id}"))
        .bearer_auth(api_key)
        .json(&json!({"format": "mp3", "looping": false}))
        .send()
        .await?;
    let root = read_json(resp, "compose start").await?;
    let task_id = str_field(&root, &["task_id", "id"])
        .map(str::to_string)
        .ok_or_else(|| bgm_err("compose start returned no task id"))?;

    let track_url = poll_for_track(client, api_key, &task_id).await?;

    let bytes = client
        .get(&track_url)
        .send()
        .await?
        .error_for_status()
        .map_err(|e| bgm_err(format!("track download failed: {e}")))?
        .bytes()
        .await?;

    if let Some(parent) = out_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(out_path, &bytes).await?;
    info!("bgm written: {} ({} bytes)", out_path.display(), bytes.len());
    Ok(out_path.to_path_buf())
}

async fn poll_for_track(client: &Client, api_key: &str, task_id: &str) -> Result<String, ApiError> {
    for attempt in 0..MAX_POLLS {
        tokio::time::sleep(POLL_INTERVAL).await;

        let resp = client
            .get(format!("{BEATOVEN_BASE}/tasks/{task_id}"))
            .bearer_auth(api_key)
            .send()
            .await?;
        let root = read_json(resp, "task status").await?;
        let status = str_field(&root, &["status"]).unwrap_or("unknown");
        debug!("bgm task {} poll {}: {}", task_id, attempt + 1, status);

        match status {
            "composed" => {
                return root
                    .get("meta")
                    .and_then(|m| m.get("track_url"))
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .ok_or_else(|| bgm_err("composed task carried no track url"));
            }
            "failed" => return Err(bgm_err("compose task failed")),
            _ => continue,
        }
    }
    Err(bgm_err(format!(
        "compose task not finished after {} polls",
        MAX_POLLS
    )))
}

async fn read_json(resp: reqwest::Response, what: &str) -> Result<serde_json::Value, ApiError> {
    let status = resp.status();
    if status.as_u16() == 429 {
        let retry_after = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);
        return Err(ApiError::RateLimit {
            service: "Beatoven.ai".to_string(),
            retry_after,
        });
    }
    let raw = resp.text().await?;
    if !status.is_success() {
        return Err(bgm_err(format!(
            "{what} failed with HTTP {}: {}",
            status.as_u16(),
            raw.chars().take(400).collect::<String>()
        )));
    }
    serde_json::from_str(&raw).map_err(|e| bgm_err(format!("{what} returned invalid JSON: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn str_field_prefers_first_present_key() {
        let root = json!({"task_id": "t-1", "id": "ignored"});
        assert_eq!(str_field(&root, &["task_id", "id"]), Some("t-1"));
        let root = json!({"id": "t-2"});
        assert_eq!(str_field(&root, &["task_id", "id"]), Some("t-2"));
        assert_eq!(str_field(&json!({}), &["task_id"]), None);
    }
}
