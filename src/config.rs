use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::audio::{encoder::StreamCodec, frame::FrameSpec};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    // Discord
    pub discord_token: String,
    pub application_id: u64,

    // Canal al que entrar al arrancar (opcional)
    pub voice_guild_id: Option<u64>,
    pub voice_channel_id: Option<u64>,

    pub playback: PlaybackConfig,
    pub lifecycle: LifecycleConfig,
}

/// Parámetros del pipeline de frames y del registro de reproducción.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PlaybackConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_duration: Duration,
    /// Frecuencia del PCM que entregan los productores (TTS, etc.)
    pub input_sample_rate: u32,
    pub codec: StreamCodec,
    pub opus_bitrate: u32,
    /// Frames que caben en el stream antes de aplicar backpressure.
    pub stream_capacity: usize,
    pub max_queued_chunks: usize,
    pub error_backoff: Duration,
}

impl PlaybackConfig {
    pub fn frame_spec(&self) -> FrameSpec {
        FrameSpec {
            sample_rate: self.sample_rate,
            channels: self.channels,
            frame_duration: self.frame_duration,
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 1,
            frame_duration: Duration::from_millis(20),
            input_sample_rate: 48_000,
            // songbird codifica Opus por su cuenta
            codec: StreamCodec::FloatPcm,
            opus_bitrate: 96_000,
            stream_capacity: 50, // 1s de audio
            max_queued_chunks: 1000,
            error_backoff: Duration::from_secs(1),
        }
    }
}

/// Tiempos del ciclo de vida de una conexión de voz.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LifecycleConfig {
    pub ready_timeout: Duration,
    pub reconnect_grace: Duration,
    /// Si está definido, tras una reconexión se exige llegar a `Ready` en
    /// este tiempo. Desactivado por defecto.
    pub stuck_watchdog: Option<Duration>,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(10),
            reconnect_grace: Duration::from_secs(5),
            stuck_watchdog: None,
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_millis(key: &str, default_ms: u64) -> Result<Duration> {
    Ok(Duration::from_millis(env_or(key, &default_ms.to_string()).parse()?))
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = PlaybackConfig::default();
        let lifecycle_defaults = LifecycleConfig::default();

        let config = Self {
            // Discord
            discord_token: std::env::var("DISCORD_TOKEN")?,
            application_id: std::env::var("APPLICATION_ID")?.parse()?,
            voice_guild_id: std::env::var("VOICE_GUILD_ID").ok().and_then(|s| s.parse().ok()),
            voice_channel_id: std::env::var("VOICE_CHANNEL_ID")
                .ok()
                .and_then(|s| s.parse().ok()),

            playback: PlaybackConfig {
                sample_rate: env_or("SAMPLE_RATE", "48000").parse()?,
                channels: env_or("CHANNELS", "1").parse()?,
                frame_duration: env_millis("FRAME_DURATION_MS", 20)?,
                input_sample_rate: env_or("INPUT_SAMPLE_RATE", "48000").parse()?,
                codec: env_or("STREAM_CODEC", "f32").parse()?,
                opus_bitrate: env_or("OPUS_BITRATE", "96000") // 96kbps (Discord default)
                    .parse()?,
                stream_capacity: env_or("STREAM_CAPACITY", "50").parse()?,
                max_queued_chunks: env_or("MAX_QUEUED_CHUNKS", "1000").parse()?,
                error_backoff: env_millis(
                    "ERROR_BACKOFF_MS",
                    defaults.error_backoff.as_millis() as u64,
                )?,
            },

            lifecycle: LifecycleConfig {
                ready_timeout: env_millis(
                    "READY_TIMEOUT_MS",
                    lifecycle_defaults.ready_timeout.as_millis() as u64,
                )?,
                reconnect_grace: env_millis(
                    "RECONNECT_GRACE_MS",
                    lifecycle_defaults.reconnect_grace.as_millis() as u64,
                )?,
                stuck_watchdog: match std::env::var("STUCK_WATCHDOG_MS") {
                    Ok(val) if !val.trim().is_empty() => {
                        Some(Duration::from_millis(val.trim().parse()?))
                    }
                    _ => None,
                },
            },
        };

        config.validate()?;

        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - Frames must be 10, 20, 40 or 60ms (Opus frame sizes)
    /// - Opus bitrate between 8kbps and 510kbps
    /// - Only mono or stereo, and resampling only for mono
    /// - Stream capacity and queue bound must be > 0
    /// - Timeouts must be non-zero
    pub fn validate(&self) -> Result<()> {
        let playback = &self.playback;

        if ![10, 20, 40, 60].contains(&playback.frame_duration.as_millis()) {
            anyhow::bail!(
                "Frame duration must be 10, 20, 40 or 60ms, got: {:?}",
                playback.frame_duration
            );
        }

        if playback.channels == 0 || playback.channels > 2 {
            anyhow::bail!("Channels must be 1 or 2, got: {}", playback.channels);
        }

        if playback.sample_rate == 0 || playback.input_sample_rate == 0 {
            anyhow::bail!("Sample rates must be greater than 0");
        }

        if playback.frame_spec().frame_bytes() == 0 {
            anyhow::bail!(
                "Sample rate {}Hz is too low for {:?} frames",
                playback.sample_rate,
                playback.frame_duration
            );
        }

        if playback.channels != 1 && playback.input_sample_rate != playback.sample_rate {
            anyhow::bail!("Input resampling is only supported for mono audio");
        }

        if playback.opus_bitrate > 510_000 {
            anyhow::bail!("Opus bitrate cannot exceed 510kbps, got: {}", playback.opus_bitrate);
        }

        if playback.opus_bitrate < 8_000 {
            anyhow::bail!("Opus bitrate too low, minimum 8kbps, got: {}", playback.opus_bitrate);
        }

        if playback.stream_capacity == 0 {
            anyhow::bail!("Stream capacity must be greater than 0");
        }

        if playback.max_queued_chunks == 0 {
            anyhow::bail!("Max queued chunks must be greater than 0");
        }

        if self.lifecycle.ready_timeout.is_zero() || self.lifecycle.reconnect_grace.is_zero() {
            anyhow::bail!("Voice timeouts must be greater than 0");
        }

        if self.voice_guild_id.is_some() != self.voice_channel_id.is_some() {
            anyhow::bail!("VOICE_GUILD_ID and VOICE_CHANNEL_ID must be set together");
        }

        Ok(())
    }

    /// Returns a summary of the current configuration for logging.
    ///
    /// Excludes the Discord token.
    pub fn summary(&self) -> String {
        let playback = &self.playback;
        let lifecycle = &self.lifecycle;
        format!(
            "Config Summary:\n  \
            Discord: App ID {} (auto-join: {})\n  \
            Audio: {}Hz x{} ch, {} frames, input {}Hz, {:?} @ {}kbps\n  \
            Stream: {} frames buffered, {} chunks max per guild, backoff {}\n  \
            Voice: ready timeout {}, reconnect grace {}, watchdog {}",
            self.application_id,
            self.voice_channel_id
                .map_or("off".to_string(), |id| id.to_string()),
            playback.sample_rate,
            playback.channels,
            humantime::format_duration(playback.frame_duration),
            playback.input_sample_rate,
            playback.codec,
            playback.opus_bitrate / 1000,
            playback.stream_capacity,
            playback.max_queued_chunks,
            humantime::format_duration(playback.error_backoff),
            humantime::format_duration(lifecycle.ready_timeout),
            humantime::format_duration(lifecycle.reconnect_grace),
            lifecycle
                .stuck_watchdog
                .map_or("off".to_string(), |d| humantime::format_duration(d).to_string()),
        )
    }
}

/// Default configuration values.
///
/// Used as fallbacks when environment variables are not provided.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Discord (no defaults - must be provided)
            discord_token: String::new(),
            application_id: 0,
            voice_guild_id: None,
            voice_channel_id: None,

            playback: PlaybackConfig::default(),
            lifecycle: LifecycleConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.playback.frame_spec().frame_bytes(), 1920);
        assert_eq!(config.lifecycle.ready_timeout, Duration::from_secs(10));
        assert_eq!(config.lifecycle.reconnect_grace, Duration::from_secs(5));
        assert_eq!(config.playback.error_backoff, Duration::from_secs(1));
    }

    #[test]
    fn test_rejects_odd_frame_duration() {
        let mut config = Config::default();
        config.playback.frame_duration = Duration::from_millis(25);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_frames_without_samples() {
        let mut config = Config::default();
        config.playback.sample_rate = 1;
        config.playback.input_sample_rate = 1;
        config.playback.frame_duration = Duration::from_millis(10);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_auto_join_needs_both_ids() {
        let mut config = Config::default();
        config.voice_guild_id = Some(1);
        assert!(config.validate().is_err());

        config.voice_channel_id = Some(2);
        config.validate().unwrap();
    }

    #[test]
    fn test_summary_hides_token() {
        let mut config = Config::default();
        config.discord_token = "super-secret".to_string();
        let summary = config.summary();
        assert!(!summary.contains("super-secret"));
        assert!(summary.contains("reconnect grace 5s"));
    }
}
