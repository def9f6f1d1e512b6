use std::sync::LazyLock;

use anyhow::Context;
use codec_bus::{FormatDescriptor, OutputTarget, TrackType};
use serde::Deserialize;

pub const CONFIG_ENV: &str = "CODEC_RELAY_CONFIG";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterMode {
    #[default]
    Async,
    Sync,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Loopback,
    Ffmpeg,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub codec_name: String,
    pub format: FormatDescriptor,
    pub output_target: Option<OutputTarget>,
    pub mode: AdapterMode,
    pub backend: Backend,
    pub synchronize_queueing: bool,
    /// Annex B elementary stream to decode; synthetic access units otherwise.
    pub input: Option<String>,
    pub frames: u32,
    pub frame_interval_us: i64,
    pub key_frame_interval: u32,
    /// Flushes the adapter once this many access units were queued.
    pub flush_after: Option<u32>,
    pub render: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            codec_name: "c2.loopback.avc.decoder".to_string(),
            format: FormatDescriptor::video(codec_bus::MIME_VIDEO_H264, 1280, 720),
            output_target: None,
            mode: AdapterMode::Async,
            backend: Backend::Loopback,
            synchronize_queueing: true,
            input: None,
            frames: 120,
            frame_interval_us: 33_333,
            key_frame_interval: 30,
            flush_after: Some(60),
            render: true,
        }
    }
}

impl RelayConfig {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: RelayConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &str) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path).with_context(|| format!("reading {}", path))?;
        Self::from_json(&json).with_context(|| format!("parsing {}", path))
    }

    fn validate(&self) -> anyhow::Result<()> {
        self.format.validate()?;
        anyhow::ensure!(self.frame_interval_us > 0, "frame_interval_us must be positive");
        anyhow::ensure!(self.key_frame_interval > 0, "key_frame_interval must be positive");
        Ok(())
    }

    pub fn track_type(&self) -> TrackType {
        if self.format.is_audio() {
            TrackType::Audio
        } else {
            TrackType::Video
        }
    }

    pub fn configuration(&self) -> codec_bus::Configuration {
        let configuration = codec_bus::Configuration::new(&self.codec_name, self.format.clone());
        match self.output_target {
            Some(target) => configuration.with_output_target(target),
            None => configuration,
        }
    }
}

pub fn config() -> &'static RelayConfig {
    static CONFIG: LazyLock<RelayConfig> = LazyLock::new(|| match std::env::var(CONFIG_ENV) {
        Ok(path) => RelayConfig::load(&path).unwrap_or_else(|e| {
            log::error!("{:#}, using defaults", e);
            RelayConfig::default()
        }),
        Err(_) => RelayConfig::default(),
    });
    &CONFIG
}

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;
