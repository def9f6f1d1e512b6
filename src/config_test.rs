use codec_bus::{MIME_AUDIO_OPUS, OutputTarget, TrackType};

use super::{AdapterMode, Backend, RelayConfig};

#[test]
fn test_empty_json_uses_defaults() -> anyhow::Result<()> {
    let config = RelayConfig::from_json("{}")?;
    assert_eq!(config, RelayConfig::default());
    assert_eq!(config.track_type(), TrackType::Video);
    Ok(())
}

#[test]
fn test_partial_override() -> anyhow::Result<()> {
    let config = RelayConfig::from_json(
        r#"{
            "codec_name": "c2.loopback.opus.decoder",
            "format": { "mime": "audio/opus", "sample_rate": 48000, "channel_count": 2 },
            "mode": "sync",
            "backend": "ffmpeg",
            "flush_after": null,
            "frames": 10
        }"#,
    )?;
    assert_eq!(config.format.mime, MIME_AUDIO_OPUS);
    assert_eq!(config.mode, AdapterMode::Sync);
    assert_eq!(config.backend, Backend::Ffmpeg);
    assert_eq!(config.flush_after, None);
    assert_eq!(config.frames, 10);
    assert_eq!(config.track_type(), TrackType::Audio);
    assert!(config.synchronize_queueing);
    Ok(())
}

#[test]
fn test_configuration_carries_output_target() -> anyhow::Result<()> {
    let config = RelayConfig::from_json(r#"{ "output_target": 42 }"#)?;
    let configuration = config.configuration();
    assert_eq!(configuration.output_target, Some(OutputTarget(42)));
    assert_eq!(configuration.codec_name, "c2.loopback.avc.decoder");
    configuration.validate()?;
    Ok(())
}

#[test]
fn test_invalid_values_are_rejected() {
    assert!(RelayConfig::from_json(r#"{ "format": { "mime": "text/plain" } }"#).is_err());
    assert!(RelayConfig::from_json(r#"{ "frame_interval_us": 0 }"#).is_err());
    assert!(RelayConfig::from_json(r#"{ "mode": "blocking" }"#).is_err());
}
