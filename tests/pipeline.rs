use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use scriptcast::editor::{build_render_plan, CompositorStyle, FormatRegistry};
use scriptcast::ffmpeg::plan_args;
use scriptcast::generator::assemble_timeline;
use scriptcast::probe::{media_duration, MediaProber};
use scriptcast::timeline::{MediaType, Timeline};
use scriptcast::{prompts, script};

struct CannedProber(BTreeMap<String, f64>);

impl CannedProber {
    fn new(entries: &[(&str, f64)]) -> Self {
        Self(
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
        )
    }
}

#[async_trait]
impl MediaProber for CannedProber {
    async fn duration_seconds(&self, path: &Path) -> Result<f64> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.0
            .get(&name)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("no metadata for {name}"))
    }
}

const SCRIPT: &str = "\
speaker1: (スタジオにて) 本日のトピックを紹介します。
speaker2: よろしくお願いします。
speaker1: まずは{DSCR|ディーエスシーアール}の解説から。
";

const PROMPTS: &str = "\
[1] 0:00-0:20 | a news studio with two anchors
[2] 0:20-0:45 | a city skyline at dusk
";

#[tokio::test]
async fn assets_flow_produces_an_editable_timeline() {
    let dir = tempfile::tempdir().unwrap();
    let script_path = dir.path().join("script.txt");
    let prompts_path = dir.path().join("prompts.txt");
    tokio::fs::write(&script_path, SCRIPT).await.unwrap();
    tokio::fs::write(&prompts_path, PROMPTS).await.unwrap();

    let script = script::parse_file(&script_path).await.unwrap();
    assert_eq!(script.total_lines(), 3);
    let prompt_list = prompts::parse_file(&prompts_path).await.unwrap();
    assert_eq!(prompt_list.total_images(), 2);

    let mut audio = BTreeMap::new();
    audio.insert(1, PathBuf::from("001_speaker1.wav"));
    audio.insert(2, PathBuf::from("002_speaker2.wav"));
    audio.insert(3, PathBuf::from("003_speaker1.wav"));
    let mut images = BTreeMap::new();
    images.insert(1, PathBuf::from("001_image.png"));
    images.insert(2, PathBuf::from("002_image.png"));
    let backgrounds = BTreeMap::new();

    // 90 seconds of narration against a 45-second authored runtime: every
    // prompt window stretches by a factor of two
    let prober = CannedProber::new(&[
        ("001_speaker1.wav", 30.0),
        ("002_speaker2.wav", 20.0),
        ("003_speaker1.wav", 40.0),
    ]);

    let timeline = assemble_timeline(
        &script,
        &prompt_list,
        &audio,
        &images,
        &backgrounds,
        Some(Path::new("bgm.mp3")),
        &prober,
    )
    .await;

    assert_eq!(timeline.total_duration, 90.0);
    let images: Vec<_> = timeline.entries_of(MediaType::Image).collect();
    assert_eq!((images[0].start_time, images[0].end_time), (0.0, 40.0));
    assert_eq!((images[1].start_time, images[1].end_time), (40.0, 90.0));
    let bgm = timeline.entries_of(MediaType::Bgm).next().unwrap();
    assert_eq!((bgm.start_time, bgm.end_time), (0.0, 90.0));

    // export, re-import, and make sure an external edit round-trips
    let csv = dir.path().join("timeline.csv");
    timeline.to_csv(&csv).await.unwrap();
    let restored = Timeline::read_csv(&csv).await.unwrap();
    assert_eq!(restored.entries, timeline.entries);
    assert_eq!(restored.total_duration, 90.0);
}

#[tokio::test]
async fn render_plan_covers_looped_footage_exactly() {
    let script = script::parse_text("speaker1: テスト行です。\n", "s.txt").unwrap();
    let prompt_list = prompts::parse_text("[1] 0:00-0:30 | ocean waves\n", "p.txt").unwrap();

    let mut audio = BTreeMap::new();
    audio.insert(1, PathBuf::from("001_speaker1.wav"));
    let mut backgrounds = BTreeMap::new();
    backgrounds.insert(1, PathBuf::from("001_bg.mp4"));

    let prober = CannedProber::new(&[("001_speaker1.wav", 30.0), ("001_bg.mp4", 8.0)]);
    let timeline = assemble_timeline(
        &script,
        &prompt_list,
        &audio,
        &BTreeMap::new(),
        &backgrounds,
        None,
        &prober,
    )
    .await;

    let format = FormatRegistry::builtin().get("tiktok");
    assert_eq!((format.width, format.height), (1080, 1920));

    let plan = build_render_plan(
        &timeline,
        &format,
        &CompositorStyle::default(),
        &BTreeMap::new(),
        &prober,
    )
    .await;

    // an 8s clip under a 30s window needs three more passes, then a hard cut
    let bg = &plan.visual_layers[0];
    assert_eq!(bg.extra_loops, 3);
    assert_eq!(bg.span(), 30.0);

    let args = plan_args(&plan, Path::new("out.mp4"));
    let filter = &args[args.iter().position(|a| a == "-filter_complex").unwrap() + 1];
    assert!(filter.contains("trim=duration=30.000"));
    assert!(filter.contains("enable='between(t,0.000,30.000)'"));
    assert!(args.contains(&"libx264".to_string()));
}

#[tokio::test]
async fn unreadable_narration_still_gets_a_duration() {
    struct NoProbe;

    #[async_trait]
    impl MediaProber for NoProbe {
        async fn duration_seconds(&self, _path: &Path) -> Result<f64> {
            anyhow::bail!("ffprobe missing")
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let wav = dir.path().join("001_speaker1.wav");
    tokio::fs::write(&wav, vec![0u8; 480_000]).await.unwrap();

    // 480000 bytes of 24kHz mono 16-bit PCM is ten seconds
    assert_eq!(media_duration(&NoProbe, &wav).await, 10.0);
    assert_eq!(media_duration(&NoProbe, &dir.path().join("gone.wav")).await, 5.0);
}
