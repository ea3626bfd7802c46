use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use regex::Regex;
use std::path::Path;

/// One scene prompt as authored: `[3] 0:30-0:45 | a quiet street at dawn`.
/// Times stay as clock strings here; the rescaler converts them when the
/// timeline is built.
#[derive(Debug, Clone)]
pub struct ImagePrompt {
    pub number: u32,
    pub start_time: String,
    pub end_time: String,
    pub prompt: String,
}

#[derive(Debug, Clone, Default)]
pub struct ImagePromptList {
    pub filename: String,
    pub prompts: Vec<ImagePrompt>,
}

impl ImagePromptList {
    pub fn total_images(&self) -> usize {
        self.prompts.len()
    }
}

fn prompt_regex() -> Result<&'static Regex> {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_try_init(|| {
        Regex::new(r"^\[(\d+)\]\s*([\d:]+)-([\d:]+)\s*\|\s*(.+)$")
            .context("failed to compile prompt regex")
    })
}

/// Parses prompt text, skipping anything that doesn't match the line format.
pub fn parse_text(content: &str, filename: &str) -> Result<ImagePromptList> {
    let re = prompt_regex()?;

    let mut list = ImagePromptList {
        filename: filename.to_string(),
        prompts: Vec::new(),
    };

    for raw in content.lines() {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        let Some(caps) = re.captures(raw) else {
            continue;
        };
        let Ok(number) = caps[1].parse::<u32>() else {
            continue;
        };
        list.prompts.push(ImagePrompt {
            number,
            start_time: caps[2].to_string(),
            end_time: caps[3].to_string(),
            prompt: caps[4].trim().to_string(),
        });
    }

    Ok(list)
}

/// Parses a prompt file; `.docx` is supported the same way as scripts.
pub async fn parse_file<P: AsRef<Path>>(path: P) -> Result<ImagePromptList> {
    let path = path.as_ref();
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "prompts.txt".to_string());

    let content = crate::script::read_document_text(path).await?;
    parse_text(&content, &filename)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
[1] 0:00-0:15 | スタジオ風の背景、二人のキャスター
[2] 0:15-0:30 | 驚いた表情の女性キャラクター
[3] 0:30-1:00 | 高層マンションの外観、夕暮れ
";

    #[test]
    fn parses_numbers_times_and_text() {
        let list = parse_text(SAMPLE, "prompts.txt").unwrap();
        assert_eq!(list.total_images(), 3);
        assert_eq!(list.prompts[0].number, 1);
        assert_eq!(list.prompts[0].start_time, "0:00");
        assert_eq!(list.prompts[0].end_time, "0:15");
        assert_eq!(list.prompts[2].start_time, "0:30");
        assert_eq!(list.prompts[2].end_time, "1:00");
        assert!(list.prompts[2].prompt.contains("高層マンション"));
    }

    #[test]
    fn skips_malformed_lines() {
        let content = "[1] 0:00-0:15 | valid\nnot a prompt\n[2] 0:15-0:30 | also valid\nbad: line\n";
        let list = parse_text(content, "p.txt").unwrap();
        assert_eq!(list.total_images(), 2);
    }

    #[test]
    fn empty_content_yields_empty_list() {
        let list = parse_text("", "p.txt").unwrap();
        assert_eq!(list.total_images(), 0);
    }

    #[test]
    fn accepts_hour_clock_strings() {
        let list = parse_text("[1] 0:59:50-1:00:10 | long form", "p.txt").unwrap();
        assert_eq!(list.prompts[0].start_time, "0:59:50");
        assert_eq!(list.prompts[0].end_time, "1:00:10");
    }
}
