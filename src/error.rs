use std::time::Duration;
use thiserror::Error;

/// Failures from the external generation services. Each variant keeps the
/// upstream message so orchestration code can surface something readable.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("TTS synthesis failed: {0}")]
    Tts(String),

    #[error("image generation failed: {0}")]
    ImageGeneration(String),

    #[error("BGM generation failed: {0}")]
    BgmGeneration(String),

    #[error("stock media request failed ({source_name}): {message}")]
    StockVideo { source_name: String, message: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("rate limited by {service}")]
    RateLimit {
        service: String,
        retry_after: Option<Duration>,
    },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ApiError {
    pub fn stock(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StockVideo {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    pub fn service_name(&self) -> &str {
        match self {
            Self::Tts(_) => "Gemini TTS",
            Self::ImageGeneration(_) => "Gemini Image",
            Self::BgmGeneration(_) => "Beatoven.ai",
            Self::StockVideo { source_name, .. } => source_name,
            Self::RateLimit { service, .. } => service,
            Self::Configuration(_) => "configuration",
            Self::Http(_) => "http",
            Self::Io(_) => "io",
        }
    }

    /// Configuration mistakes won't fix themselves between attempts; everything
    /// else coming back from a remote service is worth another try.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Configuration(_))
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimit { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_names() {
        assert_eq!(ApiError::Tts("x".into()).service_name(), "Gemini TTS");
        assert_eq!(
            ApiError::stock("Pexels", "boom").service_name(),
            "Pexels"
        );
        assert_eq!(
            ApiError::BgmGeneration("x".into()).service_name(),
            "Beatoven.ai"
        );
    }

    #[test]
    fn configuration_is_not_retryable() {
        assert!(!ApiError::Configuration("missing key".into()).is_retryable());
        assert!(ApiError::Tts("transient".into()).is_retryable());
    }

    #[test]
    fn rate_limit_carries_retry_after() {
        let err = ApiError::RateLimit {
            service: "Gemini TTS".into(),
            retry_after: Some(Duration::from_secs(60)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(60)));
        assert_eq!(ApiError::Tts("x".into()).retry_after(), None);
    }
}
