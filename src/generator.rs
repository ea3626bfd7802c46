use anyhow::{Context, Result};
use chrono::Local;
use reqwest::Client;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::api::{beatoven, gemini, stock};
use crate::config::{env_var, Settings};
use crate::editor::VideoEditor;
use crate::error::ApiError;
use crate::probe::{media_duration, MediaProber};
use crate::prompts::ImagePromptList;
use crate::retry::{retry_api, RetryPolicy};
use crate::script::Script;
use crate::timeline::{parse_clock, MediaType, TimeScale, Timeline, TimelineEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Generate assets and a timeline CSV, leave the cut to an editor.
    Assets,
    /// Render finished videos.
    Video,
}

/// Assets recovered from a previous run, keyed by line/prompt number.
#[derive(Debug, Clone, Default)]
pub struct ExistingAssets {
    pub audio: BTreeMap<u32, PathBuf>,
    pub images: BTreeMap<u32, PathBuf>,
    pub bgm: Option<PathBuf>,
}

impl ExistingAssets {
    /// Scans a prior output directory for reusable material. File names are
    /// the pipeline's own: `NNN_<speaker>.wav`, `NNN_image.png`, `bgm*`.
    pub fn scan(dir: &Path) -> Self {
        let mut assets = Self::default();
        for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let ext = entry
                .path()
                .extension()
                .map(|e| e.to_ascii_lowercase().to_string_lossy().into_owned())
                .unwrap_or_default();

            if name.starts_with("bgm") && (ext == "mp3" || ext == "wav") {
                assets.bgm = Some(entry.path().to_path_buf());
                continue;
            }
            let Some(number) = numbered_prefix(&name) else {
                continue;
            };
            match ext.as_str() {
                "wav" => {
                    assets.audio.insert(number, entry.path().to_path_buf());
                }
                "png" | "jpg" | "jpeg" => {
                    assets.images.insert(number, entry.path().to_path_buf());
                }
                _ => {}
            }
        }
        info!(
            "reusing {} audio, {} image, {} bgm assets from {}",
            assets.audio.len(),
            assets.images.len(),
            assets.bgm.is_some() as u8,
            dir.display()
        );
        assets
    }
}

fn numbered_prefix(name: &str) -> Option<u32> {
    let (digits, rest) = name.split_at(name.find('_')?);
    if rest.len() < 2 || digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

#[derive(Debug)]
pub struct GenerationRequest {
    pub script: Script,
    pub prompts: ImagePromptList,
    pub output_mode: OutputMode,
    pub formats: Vec<String>,
    pub output_root: PathBuf,
    pub reuse: ExistingAssets,
}

#[derive(Debug, Default)]
pub struct GenerationOutcome {
    pub output_dir: PathBuf,
    pub timeline_csv: Option<PathBuf>,
    pub videos: Vec<PathBuf>,
    /// Formats whose render failed, with the reason. Other formats still
    /// rendered.
    pub failed_formats: Vec<(String, String)>,
}

pub struct Generator {
    settings: Settings,
    client: Client,
    policy: RetryPolicy,
    prober: Box<dyn MediaProber>,
}

impl Generator {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            client: Client::new(),
            policy: RetryPolicy::default(),
            prober: Box::new(crate::probe::FfprobeProber),
        }
    }

    /// Runs the full pipeline: narration, images, background footage, BGM,
    /// timeline assembly, then either a CSV export or per-format renders.
    /// Asset steps are sequential; everything already written stays on disk
    /// when a later step fails, so a rerun can reuse it.
    pub async fn run(&self, request: GenerationRequest) -> Result<GenerationOutcome> {
        let output_dir = request
            .output_root
            .join(Local::now().format("%Y%m%d_%H%M%S").to_string());
        for sub in ["audio", "images", "videos/backgrounds", "bgm"] {
            tokio::fs::create_dir_all(output_dir.join(sub))
                .await
                .with_context(|| format!("failed to create {}", output_dir.join(sub).display()))?;
        }
        info!(
            "generating into {} ({} lines, {} prompts)",
            output_dir.display(),
            request.script.total_lines(),
            request.prompts.total_images()
        );

        let audio = self
            .generate_narration(&request.script, &output_dir, &request.reuse)
            .await?;
        let images = self
            .generate_images(&request.prompts, &output_dir, &request.reuse)
            .await;
        let backgrounds = self
            .fetch_backgrounds(&request.prompts, &output_dir)
            .await;
        let bgm = self
            .generate_bgm(&request.prompts, &output_dir, &request.reuse)
            .await;

        let timeline = assemble_timeline(
            &request.script,
            &request.prompts,
            &audio,
            &images,
            &backgrounds,
            bgm.as_deref(),
            &*self.prober,
        )
        .await;

        let mut outcome = GenerationOutcome {
            output_dir: output_dir.clone(),
            ..GenerationOutcome::default()
        };

        match request.output_mode {
            OutputMode::Assets => {
                let csv = output_dir.join("timeline.csv");
                timeline.to_csv(&csv).await?;
                info!("timeline exported: {}", csv.display());
                outcome.timeline_csv = Some(csv);
            }
            OutputMode::Video => {
                // bgm is already a timeline entry, so none is passed here
                let editor = VideoEditor::new(&self.settings);
                let bgm_volume = editor.style.bgm_volume;
                for format in &request.formats {
                    let out = output_dir.join("videos").join(format!("{format}.mp4"));
                    match editor
                        .create_video(&timeline, &out, format, None, bgm_volume)
                        .await
                    {
                        Ok(path) => outcome.videos.push(path),
                        Err(err) => {
                            warn!("render failed for {}: {:#}", format, err);
                            outcome.failed_formats.push((format.clone(), format!("{err:#}")));
                        }
                    }
                }
            }
        }

        Ok(outcome)
    }

    /// One WAV per dialogue line. A TTS failure aborts the run; whatever was
    /// synthesized already stays on disk for a rerun with reuse.
    async fn generate_narration(
        &self,
        script: &Script,
        output_dir: &Path,
        reuse: &ExistingAssets,
    ) -> Result<BTreeMap<u32, PathBuf>> {
        let mut audio = BTreeMap::new();
        if script.lines.is_empty() {
            return Ok(audio);
        }

        let api_key = env_var("GOOGLE_API_KEY")
            .ok_or_else(|| ApiError::Configuration("GOOGLE_API_KEY is not set".to_string()))?;

        for line in &script.lines {
            let out = output_dir
                .join("audio")
                .join(format!("{:03}_{}.wav", line.number, line.speaker));

            if let Some(existing) = reuse.audio.get(&line.number) {
                tokio::fs::copy(existing, &out).await?;
                audio.insert(line.number, out);
                continue;
            }

            let voice = self.settings.speaker(&line.speaker).gemini_voice;
            info!(
                "tts line {}/{} ({}, voice {})",
                line.number,
                script.total_lines(),
                line.speaker,
                voice
            );
            let label = format!("tts line {}", line.number);
            let path = retry_api(self.policy, &label, || {
                gemini::synthesize_speech(&self.client, &api_key, &line.text, &voice, &out)
            })
            .await
            .with_context(|| format!("speech synthesis failed for line {}", line.number))?;
            audio.insert(line.number, path);
        }
        Ok(audio)
    }

    /// One image per prompt. Generation falls back to a stock photo; if both
    /// fail the slot is left empty and the video shows the layer below.
    async fn generate_images(
        &self,
        prompts: &ImagePromptList,
        output_dir: &Path,
        reuse: &ExistingAssets,
    ) -> BTreeMap<u32, PathBuf> {
        let mut images = BTreeMap::new();
        let api_key = env_var("GOOGLE_API_KEY");
        let model = &self.settings.image_generation.model;

        for prompt in &prompts.prompts {
            let out = output_dir
                .join("images")
                .join(format!("{:03}_image.png", prompt.number));

            if let Some(existing) = reuse.images.get(&prompt.number) {
                if tokio::fs::copy(existing, &out).await.is_ok() {
                    images.insert(prompt.number, out);
                    continue;
                }
            }

            let generated = match &api_key {
                Some(key) => {
                    let label = format!("image {}", prompt.number);
                    retry_api(self.policy, &label, || {
                        gemini::generate_image(&self.client, key, model, &prompt.prompt, &out)
                    })
                    .await
                }
                None => Err(ApiError::Configuration("GOOGLE_API_KEY is not set".into())),
            };

            match generated {
                Ok(path) => {
                    images.insert(prompt.number, path);
                }
                Err(err) => {
                    warn!("image {} generation failed: {}. trying stock", prompt.number, err);
                    let jpg = output_dir
                        .join("images")
                        .join(format!("{:03}_image.jpg", prompt.number));
                    match self.stock_photo_fallback(&prompt.prompt, &jpg).await {
                        Ok(path) => {
                            images.insert(prompt.number, path);
                        }
                        Err(err) => {
                            warn!("image {} left empty: {}", prompt.number, err);
                        }
                    }
                }
            }
        }
        images
    }

    async fn stock_photo_fallback(&self, query: &str, out: &Path) -> Result<PathBuf, ApiError> {
        let url = stock::find_stock_photo(&self.client, query).await?;
        stock::download_photo(&self.client, &url, out).await
    }

    /// Background footage per prompt, searched with the prompt text. All
    /// failures are non-fatal: a scene without footage falls back to its
    /// still image over the black canvas.
    async fn fetch_backgrounds(
        &self,
        prompts: &ImagePromptList,
        output_dir: &Path,
    ) -> BTreeMap<u32, PathBuf> {
        let mut videos = BTreeMap::new();
        for prompt in &prompts.prompts {
            let Some(hit) =
                stock::find_stock_video(&self.client, &prompt.prompt, &self.settings.stock_video)
                    .await
            else {
                continue;
            };
            let out = output_dir
                .join("videos/backgrounds")
                .join(format!("{:03}_bg.mp4", prompt.number));
            match stock::download_video(&self.client, &hit, &out).await {
                Ok(path) => {
                    videos.insert(prompt.number, path);
                }
                Err(err) => warn!("background {} download failed: {}", prompt.number, err),
            }
        }
        videos
    }

    /// Background music sized to the authored runtime. Non-fatal: the mix
    /// simply has no music track on failure.
    async fn generate_bgm(
        &self,
        prompts: &ImagePromptList,
        output_dir: &Path,
        reuse: &ExistingAssets,
    ) -> Option<PathBuf> {
        let out = output_dir.join("bgm").join("bgm.mp3");
        if let Some(existing) = &reuse.bgm {
            if tokio::fs::copy(existing, &out).await.is_ok() {
                return Some(out);
            }
        }

        let Some(api_key) = env_var("BEATOVEN_API_KEY") else {
            warn!("BEATOVEN_API_KEY not set, skipping bgm");
            return None;
        };
        let duration = prompts
            .prompts
            .last()
            .map(|p| parse_clock(&p.end_time))
            .unwrap_or(0.0)
            .ceil() as u32;
        if duration == 0 {
            warn!("no authored runtime, skipping bgm");
            return None;
        }

        let bgm_cfg = &self.settings.defaults.bgm;
        let result = retry_api(self.policy, "bgm compose", || {
            beatoven::compose_bgm(
                &self.client,
                &api_key,
                &bgm_cfg.mood,
                &bgm_cfg.genre,
                duration,
                &out,
            )
        })
        .await;

        match result {
            Ok(path) => Some(path),
            Err(err) => {
                warn!("bgm generation failed: {}. continuing without music", err);
                None
            }
        }
    }
}

/// Lays narration end-to-end, maps prompts onto the narration's time axis,
/// then stretches BGM across the whole run.
pub async fn assemble_timeline(
    script: &Script,
    prompts: &ImagePromptList,
    audio: &BTreeMap<u32, PathBuf>,
    images: &BTreeMap<u32, PathBuf>,
    backgrounds: &BTreeMap<u32, PathBuf>,
    bgm: Option<&Path>,
    prober: &dyn MediaProber,
) -> Timeline {
    let mut timeline = Timeline::new();

    let mut cursor = 0.0;
    for line in &script.lines {
        let Some(path) = audio.get(&line.number) else {
            continue;
        };
        let duration = media_duration(prober, path).await;
        timeline.add_entry(
            TimelineEntry::new(
                cursor,
                cursor + duration,
                MediaType::Audio,
                path.display().to_string(),
            )
            .with_speaker(line.speaker.clone()),
        );
        cursor += duration;
    }

    let scale = TimeScale::for_prompts(timeline.total_duration, prompts);
    for prompt in &prompts.prompts {
        let (start, end) = scale.window(&prompt.start_time, &prompt.end_time);
        if end <= start {
            warn!("prompt {} has an empty window, skipping", prompt.number);
            continue;
        }
        if let Some(path) = backgrounds.get(&prompt.number) {
            timeline.add_entry(TimelineEntry::new(
                start,
                end,
                MediaType::Video,
                path.display().to_string(),
            ));
        }
        if let Some(path) = images.get(&prompt.number) {
            timeline.add_entry(TimelineEntry::new(
                start,
                end,
                MediaType::Image,
                path.display().to_string(),
            ));
        }
    }

    if let Some(bgm) = bgm {
        let end = timeline.total_duration;
        if end > 0.0 {
            timeline.add_entry(TimelineEntry::new(
                0.0,
                end,
                MediaType::Bgm,
                bgm.display().to_string(),
            ));
        }
    }

    timeline
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::testing::FixedProber;
    use crate::prompts::ImagePrompt;
    use crate::script;
    use std::collections::HashMap;

    fn fixed(entries: &[(&str, f64)]) -> FixedProber {
        FixedProber(
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect::<HashMap<_, _>>(),
        )
    }

    fn two_line_script() -> Script {
        script::parse_text("speaker1: こんにちは\nspeaker2: さようなら\n", "s.txt").unwrap()
    }

    fn prompt_list(prompts: &[(u32, &str, &str)]) -> ImagePromptList {
        ImagePromptList {
            filename: "p.txt".into(),
            prompts: prompts
                .iter()
                .map(|(n, s, e)| ImagePrompt {
                    number: *n,
                    start_time: s.to_string(),
                    end_time: e.to_string(),
                    prompt: format!("scene {n}"),
                })
                .collect(),
        }
    }

    #[test]
    fn numbered_prefix_parsing() {
        assert_eq!(numbered_prefix("001_speaker1.wav"), Some(1));
        assert_eq!(numbered_prefix("012_image.png"), Some(12));
        assert_eq!(numbered_prefix("bgm.mp3"), None);
        assert_eq!(numbered_prefix("timeline.csv"), None);
    }

    #[test]
    fn scan_collects_numbered_assets() {
        let dir = tempfile::tempdir().unwrap();
        let audio_dir = dir.path().join("audio");
        std::fs::create_dir_all(&audio_dir).unwrap();
        std::fs::write(audio_dir.join("001_speaker1.wav"), b"x").unwrap();
        std::fs::write(audio_dir.join("002_speaker2.wav"), b"x").unwrap();
        let img_dir = dir.path().join("images");
        std::fs::create_dir_all(&img_dir).unwrap();
        std::fs::write(img_dir.join("001_image.png"), b"x").unwrap();
        std::fs::write(dir.path().join("bgm.mp3"), b"x").unwrap();
        std::fs::write(dir.path().join("timeline.csv"), b"x").unwrap();

        let assets = ExistingAssets::scan(dir.path());
        assert_eq!(assets.audio.len(), 2);
        assert_eq!(assets.images.len(), 1);
        assert!(assets.bgm.is_some());
        assert!(assets.audio[&1].ends_with("001_speaker1.wav"));
    }

    #[tokio::test]
    async fn timeline_lays_audio_end_to_end_and_rescales_prompts() {
        let script = two_line_script();
        let mut audio = BTreeMap::new();
        audio.insert(1, PathBuf::from("001_speaker1.wav"));
        audio.insert(2, PathBuf::from("002_speaker2.wav"));
        let mut images = BTreeMap::new();
        images.insert(1, PathBuf::from("001_image.png"));
        let mut backgrounds = BTreeMap::new();
        backgrounds.insert(1, PathBuf::from("001_bg.mp4"));

        // narration totals 60s against a 0:30 authored runtime, so the scale
        // factor is 2.0
        let prober = fixed(&[
            ("001_speaker1.wav", 25.0),
            ("002_speaker2.wav", 35.0),
            ("001_bg.mp4", 8.0),
        ]);
        let prompts = prompt_list(&[(1, "0:00", "0:30")]);

        let timeline = assemble_timeline(
            &script,
            &prompts,
            &audio,
            &images,
            &backgrounds,
            Some(Path::new("bgm.mp3")),
            &prober,
        )
        .await;

        assert_eq!(timeline.total_duration, 60.0);

        let audio_entries: Vec<_> = timeline.entries_of(MediaType::Audio).collect();
        assert_eq!(audio_entries.len(), 2);
        assert_eq!(
            (audio_entries[0].start_time, audio_entries[0].end_time),
            (0.0, 25.0)
        );
        assert_eq!(
            (audio_entries[1].start_time, audio_entries[1].end_time),
            (25.0, 60.0)
        );
        assert_eq!(audio_entries[0].speaker.as_deref(), Some("speaker1"));

        let image = timeline.entries_of(MediaType::Image).next().unwrap();
        assert_eq!((image.start_time, image.end_time), (0.0, 60.0));
        let video = timeline.entries_of(MediaType::Video).next().unwrap();
        assert_eq!((video.start_time, video.end_time), (0.0, 60.0));

        let bgm = timeline.entries_of(MediaType::Bgm).next().unwrap();
        assert_eq!((bgm.start_time, bgm.end_time), (0.0, 60.0));
    }

    #[tokio::test]
    async fn missing_assets_leave_no_entries() {
        let script = two_line_script();
        let audio = BTreeMap::new();
        let prompts = prompt_list(&[(1, "0:00", "0:30")]);

        let timeline = assemble_timeline(
            &script,
            &prompts,
            &audio,
            &BTreeMap::new(),
            &BTreeMap::new(),
            None,
            &fixed(&[]),
        )
        .await;

        assert!(timeline.entries.is_empty());
        assert_eq!(timeline.total_duration, 0.0);
    }
}
