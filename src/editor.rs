use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::Settings;
use crate::probe::MediaProber;
use crate::timeline::{MediaType, Timeline};

/// Output geometry for one target platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatConfig {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub aspect_ratio: String,
}

impl FormatConfig {
    fn new(name: &str, width: u32, height: u32, aspect_ratio: &str) -> Self {
        Self {
            name: name.to_string(),
            width,
            height,
            aspect_ratio: aspect_ratio.to_string(),
        }
    }

    pub fn min_dimension(&self) -> u32 {
        self.width.min(self.height)
    }
}

/// Built-in platform formats, extendable through settings. Unknown names
/// fall back to the YouTube landscape default.
#[derive(Debug, Clone)]
pub struct FormatRegistry {
    formats: BTreeMap<String, FormatConfig>,
}

impl FormatRegistry {
    pub fn builtin() -> Self {
        let mut formats = BTreeMap::new();
        for f in [
            FormatConfig::new("youtube", 1920, 1080, "16:9"),
            FormatConfig::new("instagram_reel", 1080, 1920, "9:16"),
            FormatConfig::new("tiktok", 1080, 1920, "9:16"),
            FormatConfig::new("instagram_feed", 1080, 1080, "1:1"),
        ] {
            formats.insert(f.name.clone(), f);
        }
        Self { formats }
    }

    /// Built-ins with user-defined formats merged over them.
    pub fn from_settings(settings: &Settings) -> Self {
        let mut registry = Self::builtin();
        for (name, entry) in &settings.video_formats {
            registry.formats.insert(
                name.clone(),
                FormatConfig::new(name, entry.width, entry.height, &entry.aspect_ratio),
            );
        }
        registry
    }

    pub fn get(&self, name: &str) -> FormatConfig {
        if let Some(f) = self.formats.get(name) {
            return f.clone();
        }
        warn!("unknown video format '{}', using youtube", name);
        self.formats["youtube"].clone()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.formats.keys().map(String::as_str)
    }
}

/// Tunable layout and mixing constants for the compositor.
#[derive(Debug, Clone, Copy)]
pub struct CompositorStyle {
    /// Fraction of the frame an image covers when a background video is
    /// underneath it. Without a video it fills the frame.
    pub overlay_image_scale: f64,
    /// Avatar square edge as a fraction of the frame's smaller dimension.
    pub avatar_fraction: f64,
    pub avatar_margin: u32,
    /// Avatar opacity while its speaker is talking.
    pub active_opacity: f64,
    /// Avatar opacity while another speaker is talking.
    pub inactive_opacity: f64,
    /// Constant avatar opacity when no line is tagged with a speaker.
    pub untagged_opacity: f64,
    pub bgm_volume: f64,
    pub fps: u32,
}

impl Default for CompositorStyle {
    fn default() -> Self {
        Self {
            overlay_image_scale: 0.8,
            avatar_fraction: 0.15,
            avatar_margin: 20,
            active_opacity: 1.0,
            inactive_opacity: 0.4,
            untagged_opacity: 0.7,
            bgm_volume: 0.3,
            fps: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisualKind {
    Image,
    Video,
}

/// Placement of one visual input on the canvas.
#[derive(Debug, Clone, PartialEq)]
pub enum Placement {
    FullFrame,
    /// Scaled to `fraction` of the frame and centered.
    Centered { fraction: f64 },
    /// Square of `size` pixels anchored to a bottom corner.
    BottomLeft { size: u32, margin: u32 },
    BottomRight { size: u32, margin: u32 },
}

/// One visual input, fully resolved: where it goes, when it shows, how many
/// extra source loops are needed to cover its span.
#[derive(Debug, Clone, PartialEq)]
pub struct VisualLayer {
    pub input: PathBuf,
    pub kind: VisualKind,
    pub start: f64,
    pub end: f64,
    pub placement: Placement,
    pub opacity: f64,
    /// Extra `-stream_loop` iterations for videos shorter than their span.
    pub extra_loops: u32,
}

impl VisualLayer {
    pub fn span(&self) -> f64 {
        self.end - self.start
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AudioLayer {
    pub input: PathBuf,
    pub start: f64,
    pub end: f64,
    pub volume: f64,
    pub extra_loops: u32,
}

/// Everything the encoder needs, with no filesystem or process access of its
/// own. Building the plan is pure apart from duration probing, which keeps
/// the layering rules testable without ffmpeg.
#[derive(Debug, Clone)]
pub struct RenderPlan {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub duration: f64,
    pub visual_layers: Vec<VisualLayer>,
    pub audio_layers: Vec<AudioLayer>,
}

fn extra_loops_for(span: f64, source_duration: f64) -> u32 {
    if source_duration <= 0.0 || source_duration >= span {
        return 0;
    }
    (span / source_duration).ceil() as u32 - 1
}

/// Builds the layer stack for one timeline render.
///
/// Layer order, bottom to top: background videos, scene images, speaker
/// avatars. Images shrink and center when a background video plays underneath
/// their start time; otherwise they fill the frame. Avatars sit in the bottom
/// corners and brighten while their speaker talks.
pub async fn build_render_plan(
    timeline: &Timeline,
    format: &FormatConfig,
    style: &CompositorStyle,
    avatars: &BTreeMap<String, PathBuf>,
    prober: &dyn MediaProber,
) -> RenderPlan {
    let mut visual_layers = Vec::new();
    let mut audio_layers = Vec::new();

    // background videos, looped out to their span then trimmed; a clip whose
    // duration can't be read would fail the whole encode, so it is dropped
    for entry in timeline.entries_of(MediaType::Video) {
        let path = PathBuf::from(&entry.file_path);
        let source = match prober.duration_seconds(&path).await {
            Ok(d) if d > 0.0 => d,
            Ok(d) => {
                warn!(
                    "video clip reports {:.3}s, skipping: {}",
                    d, entry.file_path
                );
                continue;
            }
            Err(err) => {
                warn!("unreadable video clip, skipping {}: {}", entry.file_path, err);
                continue;
            }
        };
        visual_layers.push(VisualLayer {
            input: path,
            kind: VisualKind::Video,
            start: entry.start_time,
            end: entry.end_time,
            placement: Placement::FullFrame,
            opacity: 1.0,
            extra_loops: extra_loops_for(entry.span(), source),
        });
    }
    let video_spans: Vec<(f64, f64)> = visual_layers.iter().map(|l| (l.start, l.end)).collect();

    for entry in timeline.entries_of(MediaType::Image) {
        let over_video = video_spans
            .iter()
            .any(|(s, e)| entry.start_time >= *s && entry.start_time < *e);
        visual_layers.push(VisualLayer {
            input: PathBuf::from(&entry.file_path),
            kind: VisualKind::Image,
            start: entry.start_time,
            end: entry.end_time,
            placement: if over_video {
                Placement::Centered {
                    fraction: style.overlay_image_scale,
                }
            } else {
                Placement::FullFrame
            },
            opacity: 1.0,
            extra_loops: 0,
        });
    }

    // avatars: first configured speaker bottom-left, second bottom-right
    let avatar_size = (format.min_dimension() as f64 * style.avatar_fraction) as u32;
    let tagged: Vec<(&str, f64, f64)> = timeline
        .entries_of(MediaType::Audio)
        .filter_map(|e| {
            e.speaker
                .as_deref()
                .map(|s| (s, e.start_time, e.end_time))
        })
        .collect();

    for (idx, (speaker, avatar_path)) in avatars.iter().enumerate() {
        let placement = match idx {
            0 => Placement::BottomLeft {
                size: avatar_size,
                margin: style.avatar_margin,
            },
            1 => Placement::BottomRight {
                size: avatar_size,
                margin: style.avatar_margin,
            },
            _ => {
                warn!("more than two avatars configured, skipping {}", speaker);
                continue;
            }
        };

        if tagged.is_empty() {
            visual_layers.push(VisualLayer {
                input: avatar_path.clone(),
                kind: VisualKind::Image,
                start: 0.0,
                end: timeline.total_duration,
                placement,
                opacity: style.untagged_opacity,
                extra_loops: 0,
            });
            continue;
        }

        // dimmed for the whole run, with a bright window per own line
        visual_layers.push(VisualLayer {
            input: avatar_path.clone(),
            kind: VisualKind::Image,
            start: 0.0,
            end: timeline.total_duration,
            placement: placement.clone(),
            opacity: style.inactive_opacity,
            extra_loops: 0,
        });
        for (tag, start, end) in &tagged {
            if tag == speaker {
                visual_layers.push(VisualLayer {
                    input: avatar_path.clone(),
                    kind: VisualKind::Image,
                    start: *start,
                    end: *end,
                    placement: placement.clone(),
                    opacity: style.active_opacity,
                    extra_loops: 0,
                });
            }
        }
    }

    for entry in timeline.entries_of(MediaType::Audio) {
        audio_layers.push(AudioLayer {
            input: PathBuf::from(&entry.file_path),
            start: entry.start_time,
            end: entry.end_time,
            volume: 1.0,
            extra_loops: 0,
        });
    }
    for entry in timeline.entries_of(MediaType::Bgm) {
        let path = PathBuf::from(&entry.file_path);
        let source = match prober.duration_seconds(&path).await {
            Ok(d) if d > 0.0 => d,
            Ok(_) | Err(_) => {
                warn!("unreadable bgm track, skipping: {}", entry.file_path);
                continue;
            }
        };
        audio_layers.push(AudioLayer {
            input: path,
            start: entry.start_time,
            end: entry.end_time,
            volume: style.bgm_volume,
            extra_loops: extra_loops_for(entry.span(), source),
        });
    }

    RenderPlan {
        width: format.width,
        height: format.height,
        fps: style.fps,
        duration: timeline.total_duration,
        visual_layers,
        audio_layers,
    }
}

/// Turns a finished timeline into rendered videos.
pub struct VideoEditor {
    pub registry: FormatRegistry,
    pub style: CompositorStyle,
    pub avatars: BTreeMap<String, PathBuf>,
    prober: Box<dyn MediaProber>,
}

impl VideoEditor {
    pub fn new(settings: &Settings) -> Self {
        let mut avatars = BTreeMap::new();
        for (key, sp) in &settings.speakers {
            if !sp.avatar_path.is_empty() && Path::new(&sp.avatar_path).exists() {
                avatars.insert(key.clone(), PathBuf::from(&sp.avatar_path));
            }
        }
        Self {
            registry: FormatRegistry::from_settings(settings),
            style: CompositorStyle::default(),
            avatars,
            prober: Box::new(crate::probe::FfprobeProber),
        }
    }

    /// Renders `timeline` into `output_path` at the named format's geometry.
    /// `bgm_path` adds a music track across the whole run at `bgm_volume`,
    /// for timelines (e.g. re-imported from CSV) that don't carry one yet.
    /// Entries whose files are missing are dropped with a warning; a failed
    /// encode is fatal.
    pub async fn create_video(
        &self,
        timeline: &Timeline,
        output_path: &Path,
        format_name: &str,
        bgm_path: Option<&Path>,
        bgm_volume: f64,
    ) -> Result<PathBuf> {
        let format = self.registry.get(format_name);
        let mut usable = self.drop_missing_files(timeline);
        if usable.entries.is_empty() {
            anyhow::bail!("timeline has no usable entries");
        }

        if let Some(bgm) = bgm_path {
            if bgm.exists() {
                let end = usable.total_duration;
                usable.add_entry(crate::timeline::TimelineEntry::new(
                    0.0,
                    end,
                    MediaType::Bgm,
                    bgm.display().to_string(),
                ));
            } else {
                warn!("bgm file missing, rendering without music: {}", bgm.display());
            }
        }

        let mut style = self.style;
        style.bgm_volume = bgm_volume;
        let plan = build_render_plan(&usable, &format, &style, &self.avatars, &*self.prober)
            .await;

        if let Some(parent) = output_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        info!(
            "rendering {} ({}x{}, {:.1}s, {} visual / {} audio layers)",
            output_path.display(),
            plan.width,
            plan.height,
            plan.duration,
            plan.visual_layers.len(),
            plan.audio_layers.len()
        );
        crate::ffmpeg::encode_plan(&plan, output_path).await?;
        Ok(output_path.to_path_buf())
    }

    fn drop_missing_files(&self, timeline: &Timeline) -> Timeline {
        let mut usable = Timeline::new();
        for entry in &timeline.entries {
            if Path::new(&entry.file_path).exists() {
                usable.add_entry(entry.clone());
            } else {
                warn!("skipping missing {} clip: {}", entry.media_type, entry.file_path);
            }
        }
        // an edited csv may end before the longest clip; keep the original span
        if timeline.total_duration > usable.total_duration {
            usable.total_duration = timeline.total_duration;
        }
        usable
    }
}
