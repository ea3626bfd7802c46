use anyhow::{Context, Result};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tokio::fs;

use crate::prompts::ImagePromptList;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    Audio,
    Image,
    Video,
    Bgm,
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MediaType::Audio => "audio",
            MediaType::Image => "image",
            MediaType::Video => "video",
            MediaType::Bgm => "bgm",
        };
        f.write_str(s)
    }
}

impl FromStr for MediaType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "audio" => Ok(MediaType::Audio),
            "image" => Ok(MediaType::Image),
            "video" => Ok(MediaType::Video),
            "bgm" => Ok(MediaType::Bgm),
            other => anyhow::bail!("unknown media type: {other}"),
        }
    }
}

/// One placement instruction: put this file on screen (or in the mix) from
/// `start_time` to `end_time`. Entries are immutable once constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineEntry {
    pub start_time: f64,
    pub end_time: f64,
    pub media_type: MediaType,
    pub file_path: String,
    pub speaker: Option<String>,
}

impl TimelineEntry {
    pub fn new(
        start_time: f64,
        end_time: f64,
        media_type: MediaType,
        file_path: impl Into<String>,
    ) -> Self {
        Self {
            start_time,
            end_time,
            media_type,
            file_path: file_path.into(),
            speaker: None,
        }
    }

    pub fn with_speaker(mut self, speaker: impl Into<String>) -> Self {
        self.speaker = Some(speaker.into());
        self
    }

    pub fn span(&self) -> f64 {
        self.end_time - self.start_time
    }
}

/// Write-once collection of placement instructions for a single render.
/// Entries keep insertion order, may overlap in time (an image laid over a
/// background video does), and are never re-sorted.
#[derive(Debug, Clone, Default)]
pub struct Timeline {
    pub entries: Vec<TimelineEntry>,
    pub total_duration: f64,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry and stretches `total_duration` if needed. The
    /// duration only ever grows.
    pub fn add_entry(&mut self, entry: TimelineEntry) {
        if entry.end_time > self.total_duration {
            self.total_duration = entry.end_time;
        }
        self.entries.push(entry);
    }

    pub fn entries_of(&self, media_type: MediaType) -> impl Iterator<Item = &TimelineEntry> {
        self.entries
            .iter()
            .filter(move |e| e.media_type == media_type)
    }

    /// Serializes entries as CSV in insertion order, for the assets-only
    /// workflow where the cut is finished in an external editor.
    pub async fn to_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let mut out = String::from("start_time,end_time,media_type,file_path,speaker\n");
        for entry in &self.entries {
            out.push_str(&format!(
                "{},{},{},{},{}\n",
                entry.start_time,
                entry.end_time,
                entry.media_type,
                csv_escape(&entry.file_path),
                csv_escape(entry.speaker.as_deref().unwrap_or("")),
            ));
        }

        fs::write(path, out)
            .await
            .with_context(|| format!("failed to write timeline csv: {}", path.display()))?;
        Ok(())
    }

    /// Reads a timeline back from its CSV form (the manual-editing
    /// counterpart of `to_csv`).
    pub async fn read_csv<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read timeline csv: {}", path.display()))?;

        let mut timeline = Timeline::new();
        for (idx, line) in content.lines().enumerate() {
            if idx == 0 || line.trim().is_empty() {
                continue;
            }
            let fields = split_csv_line(line);
            if fields.len() < 5 {
                anyhow::bail!("timeline csv row {} has {} fields", idx + 1, fields.len());
            }
            let start_time: f64 = fields[0]
                .parse()
                .with_context(|| format!("bad start_time in row {}", idx + 1))?;
            let end_time: f64 = fields[1]
                .parse()
                .with_context(|| format!("bad end_time in row {}", idx + 1))?;
            let media_type: MediaType = fields[2].parse()?;

            let mut entry = TimelineEntry::new(start_time, end_time, media_type, fields[3].clone());
            if !fields[4].is_empty() {
                entry = entry.with_speaker(fields[4].clone());
            }
            timeline.add_entry(entry);
        }

        Ok(timeline)
    }
}

fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    current.push('"');
                } else {
                    in_quotes = false;
                }
            }
            '"' => in_quotes = true,
            ',' if !in_quotes => {
                fields.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
}

/// Converts `"M:SS"` or `"H:MM:SS"` clock strings to seconds. Anything else
/// yields 0.0, matching how authored prompt sheets are tolerated elsewhere.
pub fn parse_clock(s: &str) -> f64 {
    let parts: Vec<&str> = s.trim().split(':').collect();
    let nums: Option<Vec<u32>> = parts.iter().map(|p| p.parse::<u32>().ok()).collect();
    match nums.as_deref() {
        Some([m, s]) => (m * 60 + s) as f64,
        Some([h, m, s]) => (h * 3600 + m * 60 + s) as f64,
        _ => 0.0,
    }
}

/// Linear map from the authored prompt time axis onto the real audio axis.
///
/// Prompt sheets are written against an estimate (roughly five seconds per
/// line) that never matches the generated narration, so every authored time
/// is multiplied by `actual audio duration / authored total duration` before
/// it lands on the timeline.
#[derive(Debug, Clone, Copy)]
pub struct TimeScale {
    pub factor: f64,
}

impl TimeScale {
    /// `audio_total` is the real narration length; the authored total is the
    /// end time of the last prompt. A non-positive authored total (empty or
    /// malformed sheet) leaves timings untouched.
    pub fn for_prompts(audio_total: f64, prompts: &ImagePromptList) -> Self {
        let authored_total = prompts
            .prompts
            .last()
            .map(|p| parse_clock(&p.end_time))
            .unwrap_or(0.0);

        let factor = if authored_total > 0.0 {
            audio_total / authored_total
        } else {
            1.0
        };
        Self { factor }
    }

    pub fn apply(&self, seconds: f64) -> f64 {
        seconds * self.factor
    }

    /// Rescales one prompt's authored clock strings to real seconds.
    pub fn window(&self, start_time: &str, end_time: &str) -> (f64, f64) {
        (
            self.apply(parse_clock(start_time)),
            self.apply(parse_clock(end_time)),
        )
    }
}
