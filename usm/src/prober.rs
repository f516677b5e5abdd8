//! Consumer contract for codec probers (component C7). The core crate only
//! specifies these traits; it never implements or depends on a codec
//! library itself. `usm-probe` provides the `ffmpeg-the-third`-backed
//! implementation.

use crate::error::Result;

/// One coded video frame as handed to the muxer by a collaborator.
pub struct ProbedVideoFrame {
    pub data: Vec<u8>,
    pub pts: u64,
    pub is_keyframe: bool,
}

/// Everything the muxer needs to build a `VideoStream` from an elementary
/// video source, without the core ever parsing the bitstream itself.
pub struct ProbedVideo {
    pub codec_tag: String,
    pub width: u32,
    pub height: u32,
    pub fps_num: u32,
    pub fps_den: u32,
    pub frames: Vec<ProbedVideoFrame>,
}

/// Recognizes VP9/H.264 video and reports frames in decode order.
pub trait VideoProber {
    fn probe_video(&mut self) -> Result<ProbedVideo>;
}

/// Everything the muxer needs to build an `AudioStream`. HCA blocks are
/// opaque to the core; `key_pair` carries the `(a_key, b_key)` slot the
/// cipher derives, for the collaborator to apply on its own terms.
pub struct ProbedAudio {
    pub codec_tag: String,
    pub sample_rate: u32,
    pub channels: u8,
    pub blocks: Vec<Vec<u8>>,
}

/// Recognizes HCA/ADX audio and reports opaque sample blocks.
pub trait AudioProber {
    fn probe_audio(&mut self) -> Result<ProbedAudio>;
}
