//! FFmpeg backed [`DecodeEngine`]. Hardware decoders are used when the
//! format asks for them and one is available, software decoders otherwise.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use ffmpeg_next::Rational;

use crate::{
    codec::{Codec, CodecProvider},
    error::{CodecError, CodecErrorKind, CodecResult, ERROR_DECODE, ERROR_INSUFFICIENT_RESOURCE},
    software::{DecodeEngine, DecodedSample, InputSample, SoftwareCodec},
    types::{
        EncryptionMode, FormatDescriptor, MIME_AUDIO_AAC, MIME_AUDIO_OPUS, MIME_AUDIO_RAW,
        MIME_VIDEO_AV1, MIME_VIDEO_H264, MIME_VIDEO_H265, MIME_VIDEO_RAW, MIME_VIDEO_VP8,
        MIME_VIDEO_VP9, buffer_flags,
    },
};

/// Registers FFmpeg components. Call once at startup.
pub fn init() -> anyhow::Result<()> {
    ffmpeg_next::init().map_err(|e| anyhow::anyhow!("ffmpeg_next init: {}", e))
}

pub type FfmpegCodec = SoftwareCodec<FfmpegEngine>;

pub fn ffmpeg_provider() -> Arc<dyn CodecProvider> {
    Arc::new(|name: &str| -> CodecResult<Arc<dyn Codec>> {
        let codec: Arc<dyn Codec> = Arc::new(FfmpegCodec::new(name, FfmpegEngine::default()));
        Ok(codec)
    })
}

fn codec_id(mime: &str) -> Option<ffmpeg_next::codec::Id> {
    use ffmpeg_next::codec::Id;
    match mime {
        MIME_VIDEO_H264 => Some(Id::H264),
        MIME_VIDEO_H265 => Some(Id::HEVC),
        MIME_VIDEO_VP8 => Some(Id::VP8),
        MIME_VIDEO_VP9 => Some(Id::VP9),
        MIME_VIDEO_AV1 => Some(Id::AV1),
        MIME_AUDIO_AAC => Some(Id::AAC),
        MIME_AUDIO_OPUS => Some(Id::OPUS),
        _ => None,
    }
}

/// Hardware decoder backends, probed in this order.
const HARDWARE_BACKENDS: [&str; 3] = ["cuvid", "qsv", "v4l2m2m"];

/// FFmpeg names of the hardware decoders that may handle `mime`, most
/// preferred first. FFmpeg names them `<codec>_<backend>`.
fn hardware_decoder_names(mime: &str) -> Vec<String> {
    let codec = match mime {
        MIME_VIDEO_H264 => "h264",
        MIME_VIDEO_H265 => "hevc",
        MIME_VIDEO_VP8 => "vp8",
        MIME_VIDEO_VP9 => "vp9",
        MIME_VIDEO_AV1 => "av1",
        _ => return Vec::new(),
    };
    HARDWARE_BACKENDS
        .iter()
        // there is no v4l2m2m AV1 decoder
        .filter(|backend| !(codec == "av1" && **backend == "v4l2m2m"))
        .map(|backend| format!("{}_{}", codec, backend))
        .collect()
}

fn decode_error(e: ffmpeg_next::Error) -> CodecError {
    CodecError::new(ERROR_DECODE, CodecErrorKind::Fatal, e.to_string())
}

fn is_again(e: &ffmpeg_next::Error) -> bool {
    matches!(e, ffmpeg_next::Error::Other { errno } if *errno == ffmpeg_next::util::error::EAGAIN)
}

enum DecoderType {
    Video(ffmpeg_next::codec::decoder::Video),
    Audio(ffmpeg_next::codec::decoder::Audio),
}

impl DecoderType {
    fn send_packet(&mut self, packet: &ffmpeg_next::Packet) -> Result<(), ffmpeg_next::Error> {
        match self {
            DecoderType::Video(video_decoder) => video_decoder.send_packet(packet),
            DecoderType::Audio(audio_decoder) => audio_decoder.send_packet(packet),
        }
    }

    fn send_eof(&mut self) -> Result<(), ffmpeg_next::Error> {
        match self {
            DecoderType::Video(video_decoder) => video_decoder.send_eof(),
            DecoderType::Audio(audio_decoder) => audio_decoder.send_eof(),
        }
    }

    fn flush(&mut self) {
        match self {
            DecoderType::Video(video_decoder) => video_decoder.flush(),
            DecoderType::Audio(audio_decoder) => audio_decoder.flush(),
        }
    }

    /// Next decoded frame as `(data, pts, format)`; `None` once the decoder needs more input.
    fn receive_frame(
        &mut self,
    ) -> Result<Option<(Bytes, Option<i64>, FormatDescriptor)>, ffmpeg_next::Error> {
        match self {
            DecoderType::Video(video_decoder) => {
                let mut frame = ffmpeg_next::frame::Video::empty();
                match video_decoder.receive_frame(&mut frame) {
                    Ok(()) => {
                        let mut data = BytesMut::new();
                        for plane in 0..frame.planes() {
                            data.extend_from_slice(frame.data(plane));
                        }
                        let format =
                            FormatDescriptor::video(MIME_VIDEO_RAW, frame.width(), frame.height())
                                .with_extra("pixel-format", format!("{:?}", frame.format()));
                        Ok(Some((data.freeze(), frame.timestamp().or(frame.pts()), format)))
                    }
                    Err(ffmpeg_next::Error::Eof) => Ok(None),
                    Err(e) if is_again(&e) => Ok(None),
                    Err(e) => Err(e),
                }
            }
            DecoderType::Audio(audio_decoder) => {
                let mut frame = ffmpeg_next::frame::Audio::empty();
                match audio_decoder.receive_frame(&mut frame) {
                    Ok(()) => {
                        let mut data = BytesMut::new();
                        for plane in 0..frame.planes() {
                            data.extend_from_slice(frame.data(plane));
                        }
                        let format = FormatDescriptor::audio(
                            MIME_AUDIO_RAW,
                            frame.rate(),
                            frame.channels() as u32,
                        )
                        .with_extra("sample-format", format!("{:?}", frame.format()));
                        Ok(Some((data.freeze(), frame.timestamp().or(frame.pts()), format)))
                    }
                    Err(ffmpeg_next::Error::Eof) => Ok(None),
                    Err(e) if is_again(&e) => Ok(None),
                    Err(e) => Err(e),
                }
            }
        }
    }
}

/// Decodes compressed access units with libavcodec. Presentation times are
/// carried in microseconds end to end.
#[derive(Default)]
pub struct FfmpegEngine {
    decoder: Option<DecoderType>,
    decoder_name: String,
    current_format: Option<FormatDescriptor>,
    format_change: Option<FormatDescriptor>,
}

impl FfmpegEngine {
    fn decoder(&mut self) -> CodecResult<&mut DecoderType> {
        self.decoder
            .as_mut()
            .ok_or_else(|| CodecError::invalid_state("ffmpeg decoder is not configured"))
    }

    fn receive_all(&mut self, fallback_pts: i64) -> CodecResult<Vec<DecodedSample>> {
        let mut samples = Vec::new();
        loop {
            let Some((data, pts, format)) = self.decoder()?.receive_frame().map_err(decode_error)?
            else {
                break;
            };
            if self.current_format.as_ref() != Some(&format) {
                self.current_format = Some(format.clone());
                self.format_change = Some(format);
            }
            samples.push(DecodedSample {
                data,
                presentation_time_us: pts.unwrap_or(fallback_pts),
                flags: 0,
            });
        }
        Ok(samples)
    }
}

impl DecodeEngine for FfmpegEngine {
    fn name(&self) -> &str {
        if self.decoder_name.is_empty() {
            "ffmpeg"
        } else {
            &self.decoder_name
        }
    }

    fn configure(&mut self, format: &FormatDescriptor) -> CodecResult<FormatDescriptor> {
        let id = codec_id(&format.mime).ok_or_else(|| {
            CodecError::invalid_argument(format!("no ffmpeg decoder for {}", format.mime))
        })?;
        let prefer_hardware = format
            .extra
            .get("prefer-hardware")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let hardware = if prefer_hardware {
            hardware_decoder_names(&format.mime)
                .iter()
                .find_map(|name| ffmpeg_next::decoder::find_by_name(name))
        } else {
            None
        };
        if let Some(codec) = &hardware {
            log::info!("using hardware decoder {}", codec.name());
        }
        let codec = hardware
            .or_else(|| ffmpeg_next::decoder::find(id))
            .ok_or_else(|| {
                CodecError::fatal(
                    ERROR_INSUFFICIENT_RESOURCE,
                    format!("ffmpeg has no decoder for {:?}", id),
                )
            })?;

        let mut decoder_ctx = ffmpeg_next::codec::Context::new_with_codec(codec);
        unsafe {
            (*decoder_ctx.as_mut_ptr()).pkt_timebase = Rational::new(1, 1_000_000).into();
        }
        let opened = decoder_ctx
            .decoder()
            .open_as(codec)
            .map_err(|e| CodecError::fatal(ERROR_INSUFFICIENT_RESOURCE, e.to_string()))?;
        let decoder = if format.is_video() {
            DecoderType::Video(opened.video().map_err(decode_error)?)
        } else {
            DecoderType::Audio(opened.audio().map_err(decode_error)?)
        };
        log::info!("ffmpeg decoder {} opened for {}", codec.name(), format);

        self.decoder = Some(decoder);
        self.decoder_name = codec.name().to_string();
        let output = match (format.width, format.height) {
            (Some(width), Some(height)) => FormatDescriptor::video(MIME_VIDEO_RAW, width, height),
            _ if format.is_video() => FormatDescriptor {
                mime: MIME_VIDEO_RAW.to_string(),
                ..Default::default()
            },
            _ => FormatDescriptor {
                mime: MIME_AUDIO_RAW.to_string(),
                sample_rate: format.sample_rate,
                channel_count: format.channel_count,
                ..Default::default()
            },
        };
        self.current_format = Some(output.clone());
        Ok(output)
    }

    fn decode(&mut self, sample: InputSample) -> CodecResult<Vec<DecodedSample>> {
        if let Some(crypto_info) = &sample.crypto_info {
            if crypto_info.mode != EncryptionMode::Unencrypted {
                return Err(CodecError::invalid_argument(
                    "ffmpeg decoders cannot decrypt protected input",
                ));
            }
        }
        if sample.data.is_empty() {
            return Ok(Vec::new());
        }

        let mut packet = ffmpeg_next::Packet::copy(&sample.data);
        packet.set_pts(Some(sample.presentation_time_us));
        packet.set_dts(Some(sample.presentation_time_us));
        if sample.flags & buffer_flags::KEY_FRAME != 0 {
            packet.set_flags(ffmpeg_next::packet::Flags::KEY);
        }

        match self.decoder()?.send_packet(&packet) {
            Ok(()) => self.receive_all(sample.presentation_time_us),
            // the decoder is full, drain frames and resend
            Err(e) if is_again(&e) => {
                let mut samples = self.receive_all(sample.presentation_time_us)?;
                if samples.is_empty() {
                    return Err(decode_error(e));
                }
                self.decoder()?
                    .send_packet(&packet)
                    .map_err(decode_error)?;
                samples.extend(self.receive_all(sample.presentation_time_us)?);
                Ok(samples)
            }
            Err(e) => Err(decode_error(e)),
        }
    }

    fn drain(&mut self) -> CodecResult<Vec<DecodedSample>> {
        if let Err(e) = self.decoder()?.send_eof() {
            log::error!("decoder send eof error: {}", e);
        }
        let samples = self.receive_all(0)?;
        // the decoder only accepts new packets after a flush once it saw EOF
        self.decoder()?.flush();
        Ok(samples)
    }

    fn flush(&mut self) {
        if let Some(decoder) = self.decoder.as_mut() {
            decoder.flush();
        }
        self.format_change = None;
    }

    fn take_format_change(&mut self) -> Option<FormatDescriptor> {
        self.format_change.take()
    }
}

#[cfg(test)]
#[path = "ffmpeg_test.rs"]
mod ffmpeg_test;
