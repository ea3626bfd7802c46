use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use regex::Regex;
use std::io::Read;
use std::path::Path;

/// One parsed dialogue line.
#[derive(Debug, Clone)]
pub struct Line {
    pub number: u32,
    /// Normalized speaker tag, e.g. "speaker1".
    pub speaker: String,
    /// Text ready for TTS: scene annotations removed, reading hints expanded.
    pub text: String,
    /// The raw text as written after the speaker tag.
    pub original_text: String,
    /// A `(...)` stage direction, if the line carried one.
    pub scene_description: Option<String>,
    /// `{written|reading}` pronunciation hints, in order of appearance.
    pub reading_hints: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default)]
pub struct Script {
    pub filename: String,
    pub lines: Vec<Line>,
}

impl Script {
    pub fn total_lines(&self) -> usize {
        self.lines.len()
    }
}

fn speaker_regex() -> Result<&'static Regex> {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_try_init(|| {
        Regex::new(r"(?i)^(speaker\s*\d+):\s*(.+)$").context("failed to compile speaker regex")
    })
}

fn scene_regex() -> Result<&'static Regex> {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_try_init(|| Regex::new(r"\(([^)]+)\)").context("failed to compile scene regex"))
}

fn reading_regex() -> Result<&'static Regex> {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_try_init(|| {
        Regex::new(r"\{([^|}]+)\|([^}]+)\}").context("failed to compile reading regex")
    })
}

/// Parses script text into dialogue lines. Lines that don't carry a
/// `speakerN:` prefix (narration, comments, blanks) are ignored; accepted
/// lines are numbered 1..n in order.
pub fn parse_text(content: &str, filename: &str) -> Result<Script> {
    let speaker_re = speaker_regex()?;
    let scene_re = scene_regex()?;
    let reading_re = reading_regex()?;

    let mut script = Script {
        filename: filename.to_string(),
        lines: Vec::new(),
    };

    let mut number = 0u32;
    for raw in content.lines() {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }

        let Some(caps) = speaker_re.captures(raw) else {
            continue;
        };

        number += 1;
        // "Speaker 1" and "speaker1" address the same voice.
        let speaker: String = caps[1]
            .chars()
            .filter(|c| !c.is_whitespace())
            .flat_map(|c| c.to_lowercase())
            .collect();
        let original_text = caps[2].to_string();

        let scene_description = scene_re
            .captures(&original_text)
            .map(|c| c[1].to_string());
        let without_scene = scene_re.replace_all(&original_text, "").trim().to_string();

        let mut reading_hints = Vec::new();
        for caps in reading_re.captures_iter(&without_scene) {
            reading_hints.push((caps[1].to_string(), caps[2].to_string()));
        }
        let text = reading_re.replace_all(&without_scene, "$2").to_string();

        script.lines.push(Line {
            number,
            speaker,
            text,
            original_text,
            scene_description,
            reading_hints,
        });
    }

    Ok(script)
}

/// Parses a script file. `.docx` files are unpacked (they are zip archives);
/// anything else is read as UTF-8 text.
pub async fn parse_file<P: AsRef<Path>>(path: P) -> Result<Script> {
    let path = path.as_ref();
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "script.txt".to_string());

    let content = read_document_text(path).await?;
    parse_text(&content, &filename)
}

/// Reads a text or Word document as plain text.
pub async fn read_document_text(path: &Path) -> Result<String> {
    let is_docx = path
        .extension()
        .map(|e| e.eq_ignore_ascii_case("docx"))
        .unwrap_or(false);

    if is_docx {
        extract_docx_text(path).await
    } else {
        tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))
    }
}

/// A .docx file is a zip archive; paragraphs live in word/document.xml.
/// We only need the text runs, so strip tags and turn paragraph ends into
/// newlines instead of pulling in an XML parser.
async fn extract_docx_text(path: &Path) -> Result<String> {
    let path = path.to_owned();

    tokio::task::spawn_blocking(move || -> Result<String> {
        let file = std::fs::File::open(&path)
            .with_context(|| format!("failed to open docx: {}", path.display()))?;
        let mut archive = zip::ZipArchive::new(file).context("failed to read docx archive")?;

        let mut xml = String::new();
        archive
            .by_name("word/document.xml")
            .context("docx is missing word/document.xml")?
            .read_to_string(&mut xml)
            .context("failed to read document.xml")?;

        Ok(docx_xml_to_text(&xml))
    })
    .await?
}

fn docx_xml_to_text(xml: &str) -> String {
    let mut out = String::new();
    let mut rest = xml;

    while let Some(lt) = rest.find('<') {
        out.push_str(&rest[..lt]);
        rest = &rest[lt..];

        let Some(gt) = rest.find('>') else {
            break;
        };
        let tag = &rest[..=gt];
        // Paragraph close and explicit line breaks become newlines.
        if tag.starts_with("</w:p>") || tag.starts_with("<w:br") {
            out.push('\n');
        }
        rest = &rest[gt + 1..];
    }
    out.push_str(rest);

    out.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
speaker1: こんにちは、今日のニュースです。
Speaker 2: (ため息をついて) よろしくお願いします。
speaker1: 本日は{DSCR|ディーエスシーアール}について解説します。

これはナレーション
speaker2: なるほど、勉強になりました。
";

    #[test]
    fn parses_speaker_lines_and_numbering() {
        let script = parse_text(SAMPLE, "input.txt").unwrap();
        assert_eq!(script.filename, "input.txt");
        assert_eq!(script.total_lines(), 4);
        for (i, line) in script.lines.iter().enumerate() {
            assert_eq!(line.number, (i + 1) as u32);
        }
    }

    #[test]
    fn normalizes_speaker_tags() {
        let script = parse_text(SAMPLE, "input.txt").unwrap();
        assert_eq!(script.lines[0].speaker, "speaker1");
        assert_eq!(script.lines[1].speaker, "speaker2");
        assert_eq!(script.lines[3].speaker, "speaker2");
    }

    #[test]
    fn extracts_and_removes_scene_description() {
        let script = parse_text(SAMPLE, "input.txt").unwrap();
        let line = &script.lines[1];
        assert_eq!(line.scene_description.as_deref(), Some("ため息をついて"));
        assert!(!line.text.contains("ため息をついて"));
        assert!(line.text.contains("よろしくお願いします"));
        assert!(line.original_text.contains("(ため息をついて)"));
        assert_eq!(script.lines[0].scene_description, None);
    }

    #[test]
    fn expands_reading_hints() {
        let script = parse_text(SAMPLE, "input.txt").unwrap();
        let line = &script.lines[2];
        assert_eq!(
            line.reading_hints,
            vec![("DSCR".to_string(), "ディーエスシーアール".to_string())]
        );
        assert!(!line.text.contains('{'));
        assert!(line.text.contains("ディーエスシーアール"));
    }

    #[test]
    fn ignores_non_speaker_lines_and_blanks() {
        let content = "speaker1: one\n\nnarration here\n# comment\nspeaker2: two\n";
        let script = parse_text(content, "x.txt").unwrap();
        assert_eq!(script.total_lines(), 2);
    }

    #[test]
    fn docx_xml_paragraphs_become_newlines() {
        let xml = "<w:document><w:p><w:r><w:t>speaker1: hello</w:t></w:r></w:p>\
<w:p><w:r><w:t>speaker2: world &amp; more</w:t></w:r></w:p></w:document>";
        let text = docx_xml_to_text(xml);
        let script = parse_text(&text, "a.docx").unwrap();
        assert_eq!(script.total_lines(), 2);
        assert_eq!(script.lines[1].text, "world & more");
    }

    #[tokio::test]
    async fn parse_file_reads_plain_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("script.txt");
        tokio::fs::write(&path, "speaker1: hi\nspeaker2: bye")
            .await
            .unwrap();

        let script = parse_file(&path).await.unwrap();
        assert_eq!(script.filename, "script.txt");
        assert_eq!(script.total_lines(), 2);
    }
}
