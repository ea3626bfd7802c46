use anyhow::{Context, Result};
use std::path::Path;
use tokio::process::Command;

use crate::editor::{Placement, RenderPlan, VisualKind};

async fn run_cmd(args: &[String]) -> Result<()> {
    if args.is_empty() {
        return Ok(());
    }

    let mut cmd = Command::new(&args[0]);
    if args.len() > 1 {
        cmd.args(&args[1..]);
    }

    let status = cmd.status().await.context("Command execution failed")?;
    if !status.success() {
        return Err(anyhow::anyhow!("Command failed: {:?}", args));
    }

    Ok(())
}

/// Fails fast when ffmpeg/ffprobe are not installed, so a long generation
/// run can't die at the final render step.
pub async fn check_ffmpeg() -> Result<()> {
    for tool in ["ffmpeg", "ffprobe"] {
        let status = Command::new(tool)
            .arg("-version")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .await
            .with_context(|| format!("{tool} is not installed or not on PATH"))?;
        if !status.success() {
            return Err(anyhow::anyhow!("{tool} -version failed"));
        }
    }
    Ok(())
}

pub async fn ffprobe_duration_seconds(path: &Path) -> Result<f64> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ])
        .arg(path)
        .output()
        .await
        .context("ffprobe execution failed")?;

    if !output.status.success() {
        return Err(anyhow::anyhow!("ffprobe failed"));
    }

    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let duration = text.parse::<f64>().unwrap_or(-1.0);
    if duration <= 0.0 {
        return Err(anyhow::anyhow!("Invalid duration"));
    }
    Ok(duration)
}

fn overlay_position(placement: &Placement) -> String {
    match placement {
        Placement::FullFrame => "0:0".to_string(),
        Placement::Centered { .. } => "(W-w)/2:(H-h)/2".to_string(),
        Placement::BottomLeft { margin, .. } => format!("{margin}:H-h-{margin}"),
        Placement::BottomRight { margin, .. } => format!("W-w-{margin}:H-h-{margin}"),
    }
}

fn scale_chain(plan: &RenderPlan, layer: &crate::editor::VisualLayer) -> String {
    let (w, h) = (plan.width, plan.height);
    match &layer.placement {
        // videos cover the frame; full-frame images letterbox instead of crop
        Placement::FullFrame => match layer.kind {
            VisualKind::Video => format!(
                "scale={w}:{h}:force_original_aspect_ratio=increase,crop={w}:{h}"
            ),
            VisualKind::Image => format!(
                "scale={w}:{h}:force_original_aspect_ratio=decrease,\
                 pad={w}:{h}:(ow-iw)/2:(oh-ih)/2:black"
            ),
        },
        Placement::Centered { fraction } => {
            let tw = (w as f64 * fraction) as u32;
            let th = (h as f64 * fraction) as u32;
            format!("scale={tw}:{th}:force_original_aspect_ratio=decrease")
        }
        Placement::BottomLeft { size, .. } | Placement::BottomRight { size, .. } => {
            format!("scale={size}:{size}:force_original_aspect_ratio=decrease")
        }
    }
}

/// Builds the complete ffmpeg invocation for a render plan. Pure so the
/// filter graph can be checked without running ffmpeg.
pub fn plan_args(plan: &RenderPlan, output: &Path) -> Vec<String> {
    let mut args = vec![
        "ffmpeg".to_string(),
        "-y".to_string(),
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
    ];

    // visual inputs first, audio inputs after, in layer order
    for layer in &plan.visual_layers {
        match layer.kind {
            VisualKind::Video => {
                if layer.extra_loops > 0 {
                    args.push("-stream_loop".to_string());
                    args.push(layer.extra_loops.to_string());
                }
            }
            VisualKind::Image => {
                args.push("-loop".to_string());
                args.push("1".to_string());
                args.push("-t".to_string());
                args.push(format!("{:.3}", layer.span()));
            }
        }
        args.push("-i".to_string());
        args.push(layer.input.display().to_string());
    }
    for layer in &plan.audio_layers {
        if layer.extra_loops > 0 {
            args.push("-stream_loop".to_string());
            args.push(layer.extra_loops.to_string());
        }
        args.push("-i".to_string());
        args.push(layer.input.display().to_string());
    }

    let mut filter = format!(
        "color=c=black:s={}x{}:r={}:d={:.3}[base]",
        plan.width, plan.height, plan.fps, plan.duration
    );

    let mut current = "base".to_string();
    for (i, layer) in plan.visual_layers.iter().enumerate() {
        let mut chain = match layer.kind {
            // loop the source out past the span, then cut it exactly
            VisualKind::Video => format!(
                "trim=duration={:.3},setpts=PTS-STARTPTS,{}",
                layer.span(),
                scale_chain(plan, layer)
            ),
            VisualKind::Image => scale_chain(plan, layer),
        };
        if layer.opacity < 1.0 {
            chain.push_str(&format!(
                ",format=rgba,colorchannelmixer=aa={:.2}",
                layer.opacity
            ));
        }
        if layer.start > 0.0 {
            chain.push_str(&format!(",setpts=PTS-STARTPTS+{:.3}/TB", layer.start));
        }
        filter.push_str(&format!(";[{i}:v]{chain}[v{i}]"));

        let out = format!("ov{i}");
        filter.push_str(&format!(
            ";[{current}][v{i}]overlay={}:enable='between(t,{:.3},{:.3})'[{out}]",
            overlay_position(&layer.placement),
            layer.start,
            layer.end
        ));
        current = out;
    }

    let audio_base = plan.visual_layers.len();
    let mut audio_labels = Vec::new();
    for (k, layer) in plan.audio_layers.iter().enumerate() {
        let idx = audio_base + k;
        let delay_ms = (layer.start * 1000.0).round() as u64;
        filter.push_str(&format!(
            ";[{idx}:a]atrim=0:{:.3},asetpts=PTS-STARTPTS,volume={:.2},adelay={delay_ms}:all=1[a{k}]",
            layer.end - layer.start,
            layer.volume
        ));
        audio_labels.push(format!("[a{k}]"));
    }
    if !audio_labels.is_empty() {
        filter.push_str(&format!(
            ";{}amix=inputs={}:duration=longest:dropout_transition=0:normalize=0[aout]",
            audio_labels.concat(),
            audio_labels.len()
        ));
    }

    args.push("-filter_complex".to_string());
    args.push(filter);
    args.push("-map".to_string());
    args.push(format!("[{current}]"));
    if !plan.audio_layers.is_empty() {
        args.push("-map".to_string());
        args.push("[aout]".to_string());
        args.push("-c:a".to_string());
        args.push("aac".to_string());
        args.push("-b:a".to_string());
        args.push("192k".to_string());
    } else {
        args.push("-an".to_string());
    }
    args.extend(
        [
            "-r",
            &plan.fps.to_string(),
            "-c:v",
            "libx264",
            "-pix_fmt",
            "yuv420p",
            "-preset",
            "veryfast",
            "-crf",
            "22",
            "-movflags",
            "+faststart",
            "-t",
        ]
        .iter()
        .map(|s| s.to_string()),
    );
    args.push(format!("{:.3}", plan.duration));
    args.push(output.display().to_string());

    args
}

pub async fn encode_plan(plan: &RenderPlan, output: &Path) -> Result<()> {
    let args = plan_args(plan, output);
    run_cmd(&args).await?;
    if !output.exists() {
        return Err(anyhow::anyhow!(
            "render produced no output: {}",
            output.display()
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::editor::{AudioLayer, VisualLayer};
    use std::path::PathBuf;

    fn base_plan() -> RenderPlan {
        RenderPlan {
            width: 1920,
            height: 1080,
            fps: 30,
            duration: 10.0,
            visual_layers: Vec::new(),
            audio_layers: Vec::new(),
        }
    }

    fn filter_of(args: &[String]) -> String {
        let pos = args.iter().position(|a| a == "-filter_complex").unwrap();
        args[pos + 1].clone()
    }

    #[test]
    fn bare_plan_encodes_black_canvas() {
        let plan = base_plan();
        let args = plan_args(&plan, Path::new("out.mp4"));
        let filter = filter_of(&args);
        assert!(filter.starts_with("color=c=black:s=1920x1080:r=30:d=10.000[base]"));
        assert!(args.contains(&"-an".to_string()));
        assert!(args.contains(&"libx264".to_string()));
        assert!(args.contains(&"yuv420p".to_string()));
        assert!(args.contains(&"+faststart".to_string()));
        assert_eq!(args.last().unwrap(), "out.mp4");
    }

    #[test]
    fn looped_video_is_trimmed_to_exact_span() {
        let mut plan = base_plan();
        plan.visual_layers.push(VisualLayer {
            input: PathBuf::from("bg.mp4"),
            kind: VisualKind::Video,
            start: 0.0,
            end: 9.0,
            placement: Placement::FullFrame,
            opacity: 1.0,
            extra_loops: 2,
        });

        let args = plan_args(&plan, Path::new("out.mp4"));
        // looped on input, cut on filter
        let loop_pos = args.iter().position(|a| a == "-stream_loop").unwrap();
        assert_eq!(args[loop_pos + 1], "2");
        let filter = filter_of(&args);
        assert!(filter.contains("trim=duration=9.000"));
        assert!(filter.contains("enable='between(t,0.000,9.000)'"));
    }

    #[test]
    fn image_inputs_are_looped_for_their_span() {
        let mut plan = base_plan();
        plan.visual_layers.push(VisualLayer {
            input: PathBuf::from("scene.png"),
            kind: VisualKind::Image,
            start: 2.0,
            end: 8.0,
            placement: Placement::Centered { fraction: 0.8 },
            opacity: 1.0,
            extra_loops: 0,
        });

        let args = plan_args(&plan, Path::new("out.mp4"));
        let loop_pos = args.iter().position(|a| a == "-loop").unwrap();
        assert_eq!(args[loop_pos + 3], "6.000");

        let filter = filter_of(&args);
        // 80% of 1920x1080, centered
        assert!(filter.contains("scale=1536:864:force_original_aspect_ratio=decrease"));
        assert!(filter.contains("overlay=(W-w)/2:(H-h)/2"));
        assert!(filter.contains("setpts=PTS-STARTPTS+2.000/TB"));
    }

    #[test]
    fn avatar_opacity_and_corners() {
        let mut plan = base_plan();
        plan.visual_layers.push(VisualLayer {
            input: PathBuf::from("ava1.png"),
            kind: VisualKind::Image,
            start: 0.0,
            end: 10.0,
            placement: Placement::BottomLeft {
                size: 162,
                margin: 20,
            },
            opacity: 0.4,
            extra_loops: 0,
        });
        plan.visual_layers.push(VisualLayer {
            input: PathBuf::from("ava2.png"),
            kind: VisualKind::Image,
            start: 0.0,
            end: 10.0,
            placement: Placement::BottomRight {
                size: 162,
                margin: 20,
            },
            opacity: 1.0,
            extra_loops: 0,
        });

        let filter = filter_of(&plan_args(&plan, Path::new("out.mp4")));
        assert!(filter.contains("colorchannelmixer=aa=0.40"));
        assert!(filter.contains("overlay=20:H-h-20"));
        assert!(filter.contains("overlay=W-w-20:H-h-20"));
        // fully opaque layers skip the alpha chain
        assert_eq!(filter.matches("colorchannelmixer").count(), 1);
    }

    #[test]
    fn audio_layers_are_delayed_and_mixed() {
        let mut plan = base_plan();
        plan.audio_layers.push(AudioLayer {
            input: PathBuf::from("001.wav"),
            start: 0.0,
            end: 4.5,
            volume: 1.0,
            extra_loops: 0,
        });
        plan.audio_layers.push(AudioLayer {
            input: PathBuf::from("002.wav"),
            start: 4.5,
            end: 10.0,
            volume: 1.0,
            extra_loops: 0,
        });
        plan.audio_layers.push(AudioLayer {
            input: PathBuf::from("bgm.mp3"),
            start: 0.0,
            end: 10.0,
            volume: 0.3,
            extra_loops: 1,
        });

        let args = plan_args(&plan, Path::new("out.mp4"));
        let filter = filter_of(&args);
        assert!(filter.contains("adelay=4500:all=1"));
        assert!(filter.contains("volume=0.30"));
        assert!(filter.contains("amix=inputs=3"));
        assert!(args.contains(&"aac".to_string()));
        // bgm loops on input before its atrim cut
        assert!(args.windows(2).any(|w| w[0] == "-stream_loop" && w[1] == "1"));
    }
}
