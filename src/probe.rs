use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use tracing::warn;

/// Bytes per second of the generated narration WAVs (24 kHz, 16-bit mono),
/// used to estimate duration when ffprobe is unavailable.
const WAV_BYTES_PER_SECOND: f64 = 48_000.0;
const MIN_ESTIMATED_SECONDS: f64 = 1.0;
const UNKNOWN_DURATION_SECONDS: f64 = 5.0;

/// Source of media durations. Production uses ffprobe; tests substitute a
/// canned or failing prober to exercise the fallback path.
#[async_trait]
pub trait MediaProber: Send + Sync {
    async fn duration_seconds(&self, path: &Path) -> Result<f64>;
}

pub struct FfprobeProber;

#[async_trait]
impl MediaProber for FfprobeProber {
    async fn duration_seconds(&self, path: &Path) -> Result<f64> {
        crate::ffmpeg::ffprobe_duration_seconds(path).await
    }
}

/// Returns a usable duration no matter what. Probe first; if that fails,
/// estimate from file size at the narration WAV bitrate; if even the size is
/// unreadable, assume five seconds. Timeline assembly must not abort because
/// one clip's metadata is unreadable.
pub async fn media_duration(prober: &dyn MediaProber, path: &Path) -> f64 {
    match prober.duration_seconds(path).await {
        Ok(d) if d > 0.0 => d,
        Ok(d) => {
            warn!("probe returned {:.3}s for {}, estimating", d, path.display());
            estimate_from_size(path).await
        }
        Err(err) => {
            warn!("probe failed for {}: {}. estimating", path.display(), err);
            estimate_from_size(path).await
        }
    }
}

async fn estimate_from_size(path: &Path) -> f64 {
    match tokio::fs::metadata(path).await {
        Ok(meta) => (meta.len() as f64 / WAV_BYTES_PER_SECOND).max(MIN_ESTIMATED_SECONDS),
        Err(err) => {
            warn!(
                "cannot stat {}: {}. assuming {:.0}s",
                path.display(),
                err,
                UNKNOWN_DURATION_SECONDS
            );
            UNKNOWN_DURATION_SECONDS
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;

    /// Prober that always fails, forcing the size-based estimate.
    pub struct FailingProber;

    #[async_trait]
    impl MediaProber for FailingProber {
        async fn duration_seconds(&self, _path: &Path) -> Result<f64> {
            anyhow::bail!("probe unavailable")
        }
    }

    /// Prober that returns fixed durations keyed by file name.
    pub struct FixedProber(pub std::collections::HashMap<String, f64>);

    #[async_trait]
    impl MediaProber for FixedProber {
        async fn duration_seconds(&self, path: &Path) -> Result<f64> {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            self.0
                .get(&name)
                .copied()
                .ok_or_else(|| anyhow::anyhow!("no duration for {name}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[tokio::test]
    async fn falls_back_to_size_estimate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.wav");
        // 480000 bytes at 48000 bytes/sec is exactly ten seconds
        tokio::fs::write(&path, vec![0u8; 480_000]).await.unwrap();

        let d = media_duration(&FailingProber, &path).await;
        assert_eq!(d, 10.0);
    }

    #[tokio::test]
    async fn size_estimate_has_a_floor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.wav");
        tokio::fs::write(&path, vec![0u8; 100]).await.unwrap();

        let d = media_duration(&FailingProber, &path).await;
        assert_eq!(d, 1.0);
    }

    #[tokio::test]
    async fn missing_file_defaults_to_five_seconds() {
        let d = media_duration(&FailingProber, Path::new("no/such/file.wav")).await;
        assert_eq!(d, 5.0);
    }

    #[tokio::test]
    async fn probe_result_wins_when_available() {
        let mut map = std::collections::HashMap::new();
        map.insert("a.wav".to_string(), 7.25);
        let d = media_duration(&FixedProber(map), Path::new("x/a.wav")).await;
        assert_eq!(d, 7.25);
    }
}
