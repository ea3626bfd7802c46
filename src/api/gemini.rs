use base64::Engine;
use reqwest::Client;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::ApiError;

const GEMINI_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const TTS_MODEL: &str = "gemini-2.5-pro-preview-tts";

/// Gemini TTS returns raw PCM at this rate: 24 kHz, 16-bit, mono.
const TTS_SAMPLE_RATE: u32 = 24_000;
const TTS_CHANNELS: u16 = 1;
const TTS_BITS_PER_SAMPLE: u16 = 16;

fn retry_after_header(resp: &reqwest::Response) -> Option<Duration> {
    resp.headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn inline_data_base64(root: &serde_json::Value) -> Option<(String, String)> {
    let parts = root
        .get("candidates")?
        .get(0)?
        .get("content")?
        .get("parts")?
        .as_array()?;
    for part in parts {
        if let Some(inline) = part.get("inlineData").or_else(|| part.get("inline_data")) {
            let mime = inline
                .get("mimeType")
                .or_else(|| inline.get("mime_type"))
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            if let Some(data) = inline.get("data").and_then(|v| v.as_str()) {
                return Some((mime, data.to_string()));
            }
        }
    }
    None
}

/// Synthesizes one dialogue line and writes it as a WAV file. Gemini returns
/// headerless PCM, so the RIFF header is prepended here.
pub async fn synthesize_speech(
    client: &Client,
    api_key: &str,
    text: &str,
    voice: &str,
    out_path: &Path,
) -> Result<PathBuf, ApiError> {
    let url = format!("{GEMINI_BASE}/{TTS_MODEL}:generateContent?key={api_key}");
    let body = json!({
        "contents": [{"parts": [{"text": text}]}],
        "generationConfig": {
            "responseModalities": ["AUDIO"],
            "speechConfig": {
                "voiceConfig": {"prebuiltVoiceConfig": {"voiceName": voice}}
            }
        }
    });

    let resp = client.post(&url).json(&body).send().await?;
    let status = resp.status();
    if status.as_u16() == 429 {
        return Err(ApiError::RateLimit {
            service: "Gemini TTS".to_string(),
            retry_after: retry_after_header(&resp),
        });
    }
    let raw = resp.text().await?;
    if !status.is_success() {
        return Err(ApiError::Tts(format!(
            "HTTP {}: {}",
            status.as_u16(),
            raw.chars().take(400).collect::<String>()
        )));
    }

    let root: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|e| ApiError::Tts(format!("unparseable response: {e}")))?;
    let (mime, data) = inline_data_base64(&root)
        .ok_or_else(|| ApiError::Tts("response carried no audio data".to_string()))?;
    debug!("tts audio payload mime: {}", mime);

    let pcm = base64::engine::general_purpose::STANDARD
        .decode(&data)
        .map_err(|e| ApiError::Tts(format!("invalid audio base64: {e}")))?;

    let wav = wrap_pcm_in_wav(&pcm, TTS_SAMPLE_RATE, TTS_CHANNELS, TTS_BITS_PER_SAMPLE);
    tokio::fs::write(out_path, wav).await?;
    info!("tts audio written: {}", out_path.display());
    Ok(out_path.to_path_buf())
}

/// Generates a scene image and writes it to `out_path`. The model answers
/// with inline base64 image data among its response parts.
pub async fn generate_image(
    client: &Client,
    api_key: &str,
    model: &str,
    prompt: &str,
    out_path: &Path,
) -> Result<PathBuf, ApiError> {
    let url = format!("{GEMINI_BASE}/{model}:generateContent?key={api_key}");
    let body = json!({
        "contents": [{"parts": [{"text": prompt}]}],
        "generationConfig": {"responseModalities": ["TEXT", "IMAGE"]}
    });

    let resp = client.post(&url).json(&body).send().await?;
    let status = resp.status();
    if status.as_u16() == 429 {
        return Err(ApiError::RateLimit {
            service: "Gemini Image".to_string(),
            retry_after: retry_after_header(&resp),
        });
    }
    let raw = resp.text().await?;
    if !status.is_success() {
        return Err(ApiError::ImageGeneration(format!(
            "HTTP {}: {}",
            status.as_u16(),
            raw.chars().take(400).collect::<String>()
        )));
    }

    let root: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|e| ApiError::ImageGeneration(format!("unparseable response: {e}")))?;
    let (mime, data) = inline_data_base64(&root)
        .ok_or_else(|| ApiError::ImageGeneration("response carried no image data".to_string()))?;
    if !mime.is_empty() && !mime.starts_with("image/") {
        return Err(ApiError::ImageGeneration(format!(
            "unexpected payload mime: {mime}"
        )));
    }

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(&data)
        .map_err(|e| ApiError::ImageGeneration(format!("invalid image base64: {e}")))?;
    tokio::fs::write(out_path, bytes).await?;
    info!("image written: {}", out_path.display());
    Ok(out_path.to_path_buf())
}

/// Prepends a 44-byte RIFF header to raw PCM samples.
fn wrap_pcm_in_wav(pcm: &[u8], sample_rate: u32, channels: u16, bits: u16) -> Vec<u8> {
    let byte_rate = sample_rate * channels as u32 * bits as u32 / 8;
    let block_align = channels * bits / 8;
    let data_len = pcm.len() as u32;

    let mut wav = Vec::with_capacity(44 + pcm.len());
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_len).to_le_bytes());
    wav.extend_from_slice(b"WAVE");
    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes()); // PCM
    wav.extend_from_slice(&channels.to_le_bytes());
    wav.extend_from_slice(&sample_rate.to_le_bytes());
    wav.extend_from_slice(&byte_rate.to_le_bytes());
    wav.extend_from_slice(&block_align.to_le_bytes());
    wav.extend_from_slice(&bits.to_le_bytes());
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_len.to_le_bytes());
    wav.extend_from_slice(pcm);
    wav
}
