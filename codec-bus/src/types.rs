use std::fmt::{Display, Formatter};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{CodecError, CodecResult};

/// Returned by a dequeue operation when nothing is ready yet.
pub const NO_BUFFER: i32 = -1;
/// Returned by `dequeue_output_buffer_index` when the output format changed.
pub const FORMAT_CHANGED: i32 = -2;

pub const MIME_VIDEO_H264: &str = "video/avc";
pub const MIME_VIDEO_H265: &str = "video/hevc";
pub const MIME_VIDEO_VP8: &str = "video/x-vnd.on2.vp8";
pub const MIME_VIDEO_VP9: &str = "video/x-vnd.on2.vp9";
pub const MIME_VIDEO_AV1: &str = "video/av01";
pub const MIME_VIDEO_RAW: &str = "video/raw";
pub const MIME_AUDIO_AAC: &str = "audio/mp4a-latm";
pub const MIME_AUDIO_OPUS: &str = "audio/opus";
pub const MIME_AUDIO_RAW: &str = "audio/raw";

/// Buffer flag bits, shared by input submissions and output buffers.
pub mod buffer_flags {
    pub const KEY_FRAME: u32 = 1;
    pub const CODEC_CONFIG: u32 = 2;
    pub const END_OF_STREAM: u32 = 4;
    pub const PARTIAL_FRAME: u32 = 8;
}

/// Free-form parameters applied with `set_parameters`.
pub type Parameters = Map<String, Value>;
/// Diagnostic snapshot returned by `get_metrics`.
pub type Metrics = Map<String, Value>;

/// Describes one output buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferInfo {
    pub offset: usize,
    pub size: usize,
    pub presentation_time_us: i64,
    pub flags: u32,
}

impl BufferInfo {
    pub fn new(offset: usize, size: usize, presentation_time_us: i64, flags: u32) -> Self {
        Self {
            offset,
            size,
            presentation_time_us,
            flags,
        }
    }

    pub fn set(&mut self, other: &BufferInfo) {
        *self = *other;
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.flags & buffer_flags::END_OF_STREAM != 0
    }

    pub fn is_key_frame(&self) -> bool {
        self.flags & buffer_flags::KEY_FRAME != 0
    }
}

/// Media format negotiated with, or reported by, a codec.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FormatDescriptor {
    pub mime: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_input_size: Option<usize>,
    // codec specific keys, e.g. "pixel-format" or "prefer-hardware"
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl FormatDescriptor {
    pub fn video(mime: &str, width: u32, height: u32) -> Self {
        Self {
            mime: mime.to_string(),
            width: Some(width),
            height: Some(height),
            ..Default::default()
        }
    }

    pub fn audio(mime: &str, sample_rate: u32, channel_count: u32) -> Self {
        Self {
            mime: mime.to_string(),
            sample_rate: Some(sample_rate),
            channel_count: Some(channel_count),
            ..Default::default()
        }
    }

    pub fn with_max_input_size(mut self, max_input_size: usize) -> Self {
        self.max_input_size = Some(max_input_size);
        self
    }

    pub fn with_extra(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }

    pub fn is_video(&self) -> bool {
        self.mime.starts_with("video/")
    }

    pub fn is_audio(&self) -> bool {
        self.mime.starts_with("audio/")
    }

    pub fn validate(&self) -> CodecResult<()> {
        if !self.is_video() && !self.is_audio() {
            return Err(CodecError::invalid_argument(format!(
                "unsupported mime type {:?}",
                self.mime
            )));
        }
        if self.is_video() && (self.width == Some(0) || self.height == Some(0)) {
            return Err(CodecError::invalid_argument(format!(
                "invalid video size {}x{}",
                self.width.unwrap_or_default(),
                self.height.unwrap_or_default()
            )));
        }
        Ok(())
    }
}

impl Display for FormatDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.mime)?;
        if let (Some(w), Some(h)) = (self.width, self.height) {
            write!(f, " {}x{}", w, h)?;
        }
        if let (Some(rate), Some(channels)) = (self.sample_rate, self.channel_count) {
            write!(f, " {}Hz/{}ch", rate, channels)?;
        }
        Ok(())
    }
}

/// Opaque handle of the surface decoded video is rendered to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutputTarget(pub u64);

/// Opaque handle of a DRM session used for secure input.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CryptoSession {
    pub scheme: String,
    pub session_id: Bytes,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum EncryptionMode {
    #[default]
    Unencrypted = 0,
    AesCtr = 1,
    AesCbc = 2,
}

/// Pattern encryption: `encrypt_blocks` encrypted 16-byte blocks followed by
/// `skip_blocks` clear ones. Zero/zero means every block is encrypted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct EncryptionPattern {
    pub encrypt_blocks: u32,
    pub skip_blocks: u32,
}

/// Subsample layout of an encrypted input buffer. Forwarded to the codec unchanged.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CryptoInfo {
    pub num_subsamples: usize,
    pub clear_byte_counts: Vec<u32>,
    pub encrypted_byte_counts: Vec<u32>,
    pub key_id: Bytes,
    pub iv: Bytes,
    pub mode: EncryptionMode,
    pub pattern: EncryptionPattern,
}

impl CryptoInfo {
    pub fn new(
        clear_byte_counts: Vec<u32>,
        encrypted_byte_counts: Vec<u32>,
        key_id: Bytes,
        iv: Bytes,
        mode: EncryptionMode,
    ) -> Self {
        Self {
            num_subsamples: clear_byte_counts.len(),
            clear_byte_counts,
            encrypted_byte_counts,
            key_id,
            iv,
            mode,
            pattern: EncryptionPattern::default(),
        }
    }

    pub fn with_pattern(mut self, encrypt_blocks: u32, skip_blocks: u32) -> Self {
        self.pattern = EncryptionPattern {
            encrypt_blocks,
            skip_blocks,
        };
        self
    }

    /// Total bytes covered by all subsamples.
    pub fn total_size(&self) -> usize {
        self.clear_byte_counts
            .iter()
            .chain(self.encrypted_byte_counts.iter())
            .map(|n| *n as usize)
            .sum()
    }

    pub fn validate(&self) -> CodecResult<()> {
        if self.clear_byte_counts.len() != self.num_subsamples
            || self.encrypted_byte_counts.len() != self.num_subsamples
        {
            return Err(CodecError::invalid_argument(format!(
                "crypto info declares {} subsamples but carries {} clear / {} encrypted counts",
                self.num_subsamples,
                self.clear_byte_counts.len(),
                self.encrypted_byte_counts.len()
            )));
        }
        if self.mode != EncryptionMode::Unencrypted && self.iv.len() != 16 {
            return Err(CodecError::invalid_argument(format!(
                "initialization vector must be 16 bytes, got {}",
                self.iv.len()
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalingMode {
    #[default]
    ScaleToFit = 1,
    ScaleToFitWithCropping = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackType {
    Audio,
    Video,
    Unknown(i32),
}

impl TrackType {
    pub fn label(&self) -> String {
        match self {
            TrackType::Audio => "audio".to_string(),
            TrackType::Video => "video".to_string(),
            TrackType::Unknown(n) => format!("unknown({})", n),
        }
    }
}

/// Everything `initialize` needs to bring a codec up.
#[derive(Clone, Debug)]
pub struct Configuration {
    pub codec_name: String,
    pub format: FormatDescriptor,
    pub output_target: Option<OutputTarget>,
    pub crypto_session: Option<CryptoSession>,
    pub flags: u32,
}

impl Configuration {
    pub fn new(codec_name: &str, format: FormatDescriptor) -> Self {
        Self {
            codec_name: codec_name.to_string(),
            format,
            output_target: None,
            crypto_session: None,
            flags: 0,
        }
    }

    pub fn with_output_target(mut self, target: OutputTarget) -> Self {
        self.output_target = Some(target);
        self
    }

    pub fn with_crypto_session(mut self, session: CryptoSession) -> Self {
        self.crypto_session = Some(session);
        self
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn validate(&self) -> CodecResult<()> {
        if self.codec_name.is_empty() {
            return Err(CodecError::invalid_argument("codec name is empty"));
        }
        self.format.validate()?;
        if self.output_target.is_some() && !self.format.is_video() {
            return Err(CodecError::invalid_argument(
                "an output target only applies to video codecs",
            ));
        }
        Ok(())
    }
}
