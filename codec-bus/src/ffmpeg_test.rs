use super::hardware_decoder_names;
use crate::types::{MIME_AUDIO_AAC, MIME_VIDEO_AV1, MIME_VIDEO_H264, MIME_VIDEO_H265};

#[test]
fn test_hardware_decoder_names() {
    assert_eq!(
        hardware_decoder_names(MIME_VIDEO_H264),
        vec!["h264_cuvid", "h264_qsv", "h264_v4l2m2m"]
    );
    assert_eq!(hardware_decoder_names(MIME_VIDEO_H265)[0], "hevc_cuvid");
    assert_eq!(
        hardware_decoder_names(MIME_VIDEO_AV1),
        vec!["av1_cuvid", "av1_qsv"]
    );
    assert!(hardware_decoder_names(MIME_AUDIO_AAC).is_empty());
}
