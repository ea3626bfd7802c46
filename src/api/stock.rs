use async_trait::async_trait;
use reqwest::Client;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::{env_var, StockVideoConfig};
use crate::error::ApiError;

/// One downloadable stock clip, already reduced to its best rendition.
#[derive(Debug, Clone)]
pub struct StockVideo {
    pub id: String,
    pub url: String,
    pub preview_url: String,
    /// Name of the provider the clip came from.
    pub source: String,
    pub width: u32,
    pub height: u32,
    pub duration: f64,
}

/// A searchable stock footage source. Providers with no API key configured
/// return an empty result set so the next provider gets a chance.
#[async_trait]
pub trait StockProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn search(
        &self,
        client: &Client,
        query: &str,
        cfg: &StockVideoConfig,
    ) -> Result<Vec<StockVideo>, ApiError>;
}

pub struct Pexels;

#[async_trait]
impl StockProvider for Pexels {
    fn name(&self) -> &'static str {
        "Pexels"
    }

    async fn search(
        &self,
        client: &Client,
        query: &str,
        cfg: &StockVideoConfig,
    ) -> Result<Vec<StockVideo>, ApiError> {
        let Some(api_key) = env_var("PEXELS_API_KEY") else {
            warn!("PEXELS_API_KEY not set, skipping Pexels");
            return Ok(Vec::new());
        };

        let per_page = cfg.per_page.to_string();
        let resp = client
            .get("https://api.pexels.com/videos/search")
            .header("Authorization", api_key)
            .query(&[
                ("query", query),
                ("per_page", per_page.as_str()),
                ("orientation", cfg.orientation.as_str()),
            ])
            .send()
            .await?;
        let root = read_json(resp, self.name()).await?;

        let mut videos = Vec::new();
        for hit in root.get("videos").and_then(|v| v.as_array()).unwrap_or(&Vec::new()) {
            // prefer the widest mp4 rendition
            let best = hit
                .get("video_files")
                .and_then(|v| v.as_array())
                .and_then(|files| {
                    files
                        .iter()
                        .filter(|f| {
                            f.get("file_type").and_then(|v| v.as_str()) == Some("video/mp4")
                        })
                        .max_by_key(|f| f.get("width").and_then(|v| v.as_u64()).unwrap_or(0))
                });
            let Some(best) = best else { continue };
            let Some(url) = best.get("link").and_then(|v| v.as_str()) else {
                continue;
            };
            videos.push(StockVideo {
                id: hit.get("id").and_then(|v| v.as_u64()).unwrap_or(0).to_string(),
                url: url.to_string(),
                preview_url: hit
                    .get("image")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
                source: self.name().to_string(),
                width: best.get("width").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
                height: best.get("height").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
                duration: hit.get("duration").and_then(|v| v.as_f64()).unwrap_or(0.0),
            });
        }
        Ok(videos)
    }
}

pub struct Pixabay;

#[async_trait]
impl StockProvider for Pixabay {
    fn name(&self) -> &'static str {
        "Pixabay"
    }

    async fn search(
        &self,
        client: &Client,
        query: &str,
        cfg: &StockVideoConfig,
    ) -> Result<Vec<StockVideo>, ApiError> {
        let Some(api_key) = env_var("PIXABAY_API_KEY") else {
            warn!("PIXABAY_API_KEY not set, skipping Pixabay");
            return Ok(Vec::new());
        };

        let per_page = cfg.per_page.to_string();
        let resp = client
            .get("https://pixabay.com/api/videos/")
            .query(&[
                ("key", api_key.as_str()),
                ("q", query),
                ("per_page", per_page.as_str()),
            ])
            .send()
            .await?;
        let root = read_json(resp, self.name()).await?;

        let mut videos = Vec::new();
        for hit in root.get("hits").and_then(|v| v.as_array()).unwrap_or(&Vec::new()) {
            let Some(large) = hit.get("videos").and_then(|v| v.get("large")) else {
                continue;
            };
            let Some(url) = large.get("url").and_then(|v| v.as_str()) else {
                continue;
            };
            videos.push(StockVideo {
                id: hit.get("id").and_then(|v| v.as_u64()).unwrap_or(0).to_string(),
                url: url.to_string(),
                preview_url: large
                    .get("thumbnail")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
                source: self.name().to_string(),
                width: large.get("width").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
                height: large.get("height").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
                duration: hit.get("duration").and_then(|v| v.as_f64()).unwrap_or(0.0),
            });
        }
        Ok(videos)
    }
}

/// Searches providers in order and returns the first hit. Provider errors
/// are logged and skipped; background footage is never worth failing a run.
pub async fn find_stock_video(
    client: &Client,
    query: &str,
    cfg: &StockVideoConfig,
) -> Option<StockVideo> {
    let providers: [&dyn StockProvider; 2] = [&Pexels, &Pixabay];
    for provider in providers {
        match provider.search(client, query, cfg).await {
            Ok(videos) => {
                if let Some(video) = videos.into_iter().next() {
                    info!("{} hit for '{}': {}", provider.name(), query, video.id);
                    return Some(video);
                }
            }
            Err(err) => {
                warn!("{} search failed for '{}': {}", provider.name(), query, err);
            }
        }
    }
    None
}

pub async fn download_video(
    client: &Client,
    video: &StockVideo,
    out_path: &Path,
) -> Result<PathBuf, ApiError> {
    let bytes = client
        .get(&video.url)
        .send()
        .await?
        .error_for_status()
        .map_err(|e| ApiError::stock("download", e.to_string()))?
        .bytes()
        .await?;

    if let Some(parent) = out_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(out_path, &bytes).await?;
    info!(
        "stock video written: {} ({} bytes)",
        out_path.display(),
        bytes.len()
    );
    Ok(out_path.to_path_buf())
}

/// Pexels photo search, used as the image fallback when generation fails.
/// Unlike video search, a missing key is an error here: the caller only
/// lands on this path when it has no other way to fill the slot.
pub async fn find_stock_photo(client: &Client, query: &str) -> Result<String, ApiError> {
    let api_key = env_var("PEXELS_API_KEY").ok_or_else(|| {
        ApiError::Configuration("PEXELS_API_KEY is required for the photo fallback".to_string())
    })?;

    let resp = client
        .get("https://api.pexels.com/v1/search")
        .header("Authorization", api_key)
        .query(&[("query", query), ("per_page", "1")])
        .send()
        .await?;
    let root = read_json(resp, "Pexels").await?;

    root.get("photos")
        .and_then(|v| v.as_array())
        .and_then(|photos| photos.first())
        .and_then(|p| p.get("src"))
        .and_then(|s| s.get("large"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| ApiError::stock("Pexels", format!("no photo found for '{query}'")))
}

pub async fn download_photo(
    client: &Client,
    url: &str,
    out_path: &Path,
) -> Result<PathBuf, ApiError> {
    let bytes = client
        .get(url)
        .send()
        .await?
        .error_for_status()
        .map_err(|e| ApiError::stock("download", e.to_string()))?
        .bytes()
        .await?;

    if let Some(parent) = out_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(out_path, &bytes).await?;
    Ok(out_path.to_path_buf())
}

async fn read_json(resp: reqwest::Response, source: &str) -> Result<serde_json::Value, ApiError> {
    let status = resp.status();
    if status.as_u16() == 429 {
        let retry_after = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(std::time::Duration::from_secs);
        return Err(ApiError::RateLimit {
            service: source.to_string(),
            retry_after,
        });
    }
    let raw = resp.text().await?;
    if !status.is_success() {
        return Err(ApiError::stock(
            source,
            format!(
                "HTTP {}: {}",
                status.as_u16(),
                raw.chars().take(400).collect::<String>()
            ),
        ));
    }
    serde_json::from_str(&raw).map_err(|e| ApiError::stock(source, format!("invalid JSON: {e}")))
}
