use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tokio::fs;

pub const DEFAULT_SETTINGS_PATH: &str = "config/settings.json";

/// Per-speaker voice and avatar configuration. Script lines address speakers
/// as `speaker1` / `speaker2`; the display name is free-form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeakerConfig {
    #[serde(default)]
    pub display_name: String,
    #[serde(default = "default_voice")]
    pub gemini_voice: String,
    #[serde(default = "default_language")]
    pub language_code: String,
    #[serde(default)]
    pub avatar_path: String,
}

fn default_voice() -> String {
    "Kore".to_string()
}

fn default_language() -> String {
    "ja-JP".to_string()
}

impl Default for SpeakerConfig {
    fn default() -> Self {
        Self {
            display_name: String::new(),
            gemini_voice: default_voice(),
            language_code: default_language(),
            avatar_path: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormatEntry {
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub aspect_ratio: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BgmDefaults {
    #[serde(default = "default_mood")]
    pub mood: String,
    #[serde(default = "default_genre")]
    pub genre: String,
}

fn default_mood() -> String {
    "neutral".to_string()
}

fn default_genre() -> String {
    "background".to_string()
}

impl Default for BgmDefaults {
    fn default() -> Self {
        Self {
            mood: default_mood(),
            genre: default_genre(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationDefaults {
    #[serde(default = "default_output_folder")]
    pub output_folder: String,
    #[serde(default)]
    pub bgm: BgmDefaults,
}

fn default_output_folder() -> String {
    "output".to_string()
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            output_folder: default_output_folder(),
            bgm: BgmDefaults::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageGenerationConfig {
    #[serde(default = "default_image_model")]
    pub model: String,
}

fn default_image_model() -> String {
    "gemini-2.5-flash-preview-05-20".to_string()
}

impl Default for ImageGenerationConfig {
    fn default() -> Self {
        Self {
            model: default_image_model(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockVideoConfig {
    #[serde(default = "default_per_page")]
    pub per_page: u32,
    #[serde(default = "default_orientation")]
    pub orientation: String,
}

fn default_per_page() -> u32 {
    5
}

fn default_orientation() -> String {
    "landscape".to_string()
}

impl Default for StockVideoConfig {
    fn default() -> Self {
        Self {
            per_page: default_per_page(),
            orientation: default_orientation(),
        }
    }
}

/// Application settings persisted as JSON. Every field has a default so a
/// missing or partial file still yields a usable configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub speakers: BTreeMap<String, SpeakerConfig>,
    /// Extra or overriding output formats, merged over the built-in registry.
    #[serde(default)]
    pub video_formats: BTreeMap<String, FormatEntry>,
    #[serde(default)]
    pub defaults: GenerationDefaults,
    #[serde(default)]
    pub image_generation: ImageGenerationConfig,
    #[serde(default)]
    pub stock_video: StockVideoConfig,
}

impl Settings {
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if fs::metadata(path).await.is_err() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read settings: {}", path.display()))?;
        let settings: Settings = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse settings: {}", path.display()))?;
        Ok(settings)
    }

    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)
            .await
            .with_context(|| format!("failed to write settings: {}", path.display()))?;
        Ok(())
    }

    pub fn speaker(&self, key: &str) -> SpeakerConfig {
        self.speakers.get(key).cloned().unwrap_or_default()
    }
}

/// Environment-variable lookup, empty values treated as unset. All API keys
/// (GOOGLE_API_KEY, BEATOVEN_API_KEY, PEXELS_API_KEY, PIXABAY_API_KEY) come
/// through here.
pub fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_settings_file_yields_defaults() {
        let settings = Settings::load("does/not/exist.json").await.unwrap();
        assert_eq!(settings.defaults.output_folder, "output");
        assert_eq!(settings.stock_video.per_page, 5);
        assert!(settings.speakers.is_empty());
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let mut settings = Settings::default();
        settings.speakers.insert(
            "speaker1".to_string(),
            SpeakerConfig {
                display_name: "Narrator".to_string(),
                gemini_voice: "Aoede".to_string(),
                ..SpeakerConfig::default()
            },
        );

        settings.save(&path).await.unwrap();
        let loaded = Settings::load(&path).await.unwrap();
        assert_eq!(loaded.speaker("speaker1").gemini_voice, "Aoede");
        assert_eq!(loaded.speaker("speaker1").display_name, "Narrator");
    }

    #[test]
    fn unknown_speaker_gets_defaults() {
        let settings = Settings::default();
        let sp = settings.speaker("speaker9");
        assert_eq!(sp.gemini_voice, "Kore");
        assert_eq!(sp.language_code, "ja-JP");
    }

    #[test]
    fn partial_json_fills_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{"defaults": {"output_folder": "renders"}}"#).unwrap();
        assert_eq!(settings.defaults.output_folder, "renders");
        assert_eq!(settings.defaults.bgm.mood, "neutral");
        assert_eq!(
            settings.image_generation.model,
            "gemini-2.5-flash-preview-05-20"
        );
    }
}
