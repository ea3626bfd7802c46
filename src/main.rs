use anyhow::Result;
use std::path::PathBuf;

use scriptcast::config::{Settings, DEFAULT_SETTINGS_PATH};
use scriptcast::ffmpeg;
use scriptcast::generator::{ExistingAssets, GenerationRequest, Generator, OutputMode};
use scriptcast::{prompts, script};

struct Args {
    script_path: PathBuf,
    prompts_path: Option<PathBuf>,
    formats: Vec<String>,
    assets_only: bool,
    output_root: Option<PathBuf>,
    reuse_dir: Option<PathBuf>,
}

fn usage() -> ! {
    eprintln!(
        "usage: scriptcast <script> [prompts] [options]\n\
         \n\
         arguments:\n\
           <script>            dialogue script (.txt or .docx)\n\
           [prompts]           scene prompt sheet (.txt or .docx)\n\
         \n\
         options:\n\
           --format NAME       output format, repeatable (default: youtube)\n\
           --assets-only       generate assets and timeline.csv, skip rendering\n\
           --out DIR           output root (default: settings output_folder)\n\
           --reuse DIR         reuse assets from a previous output directory"
    );
    std::process::exit(2);
}

fn parse_args() -> Args {
    let mut args = Args {
        script_path: PathBuf::new(),
        prompts_path: None,
        formats: Vec::new(),
        assets_only: false,
        output_root: None,
        reuse_dir: None,
    };

    let mut positional = Vec::new();
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--format" => match iter.next() {
                Some(v) => args.formats.push(v),
                None => usage(),
            },
            "--assets-only" => args.assets_only = true,
            "--out" => match iter.next() {
                Some(v) => args.output_root = Some(PathBuf::from(v)),
                None => usage(),
            },
            "--reuse" => match iter.next() {
                Some(v) => args.reuse_dir = Some(PathBuf::from(v)),
                None => usage(),
            },
            "-h" | "--help" => usage(),
            other if other.starts_with('-') => {
                eprintln!("unknown option: {other}");
                usage();
            }
            _ => positional.push(PathBuf::from(arg)),
        }
    }

    match positional.len() {
        1 => args.script_path = positional.remove(0),
        2 => {
            args.script_path = positional.remove(0);
            args.prompts_path = Some(positional.remove(0));
        }
        _ => usage(),
    }
    if args.formats.is_empty() {
        args.formats.push("youtube".to_string());
    }
    args
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = parse_args();

    if !args.assets_only {
        ffmpeg::check_ffmpeg().await?;
    }

    let settings = Settings::load(DEFAULT_SETTINGS_PATH).await?;
    let output_root = args
        .output_root
        .clone()
        .unwrap_or_else(|| PathBuf::from(&settings.defaults.output_folder));

    let script = script::parse_file(&args.script_path).await?;
    if script.lines.is_empty() {
        anyhow::bail!(
            "no dialogue lines found in {}",
            args.script_path.display()
        );
    }
    let prompt_list = match &args.prompts_path {
        Some(path) => prompts::parse_file(path).await?,
        None => Default::default(),
    };

    let reuse = match &args.reuse_dir {
        Some(dir) => ExistingAssets::scan(dir),
        None => ExistingAssets::default(),
    };

    let request = GenerationRequest {
        script,
        prompts: prompt_list,
        output_mode: if args.assets_only {
            OutputMode::Assets
        } else {
            OutputMode::Video
        },
        formats: args.formats,
        output_root,
        reuse,
    };

    let outcome = Generator::new(settings).run(request).await?;

    println!("output directory: {}", outcome.output_dir.display());
    if let Some(csv) = &outcome.timeline_csv {
        println!("timeline: {}", csv.display());
    }
    for video in &outcome.videos {
        println!("rendered: {}", video.display());
    }
    for (format, reason) in &outcome.failed_formats {
        eprintln!("render failed for {format}: {reason}");
    }
    if !outcome.failed_formats.is_empty() && outcome.videos.is_empty() {
        std::process::exit(1);
    }
    Ok(())
}
