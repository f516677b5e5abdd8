//! Video/audio stream entities.

use crate::prober::{ProbedAudio, ProbedVideo};
use crate::utf::{Column, ColumnStorage, TypeTag, UtfTable, Value};

/// One coded video frame, in elementary-stream order.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub pts: u64,
    pub is_keyframe: bool,
    pub data: Vec<u8>,
}

/// One coded audio block (HCA opaque frame), in elementary-stream order.
#[derive(Debug, Clone)]
pub struct AudioSample {
    pub data: Vec<u8>,
}

/// A single video elementary stream and the `@SFV` table describing it.
#[derive(Debug, Clone)]
pub struct VideoStream {
    pub channel_number: u8,
    pub codec_tag: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate_num: u32,
    pub frame_rate_den: u32,
    pub header_table: UtfTable,
    pub frames: Vec<VideoFrame>,
}

impl VideoStream {
    pub fn frame_rate(&self) -> f64 {
        if self.frame_rate_den == 0 {
            0.0
        } else {
            self.frame_rate_num as f64 / self.frame_rate_den as f64
        }
    }

    /// Builds a stream from a C7 collaborator's probe result, synthesizing
    /// its `@SFV` header table from the reported parameters.
    pub fn from_probe(probed: ProbedVideo, channel_number: u8) -> VideoStream {
        let mut header_table = UtfTable::new("VIDEO_HDR");
        header_table.columns = vec![
            constant_column("width", Value::U32(probed.width)),
            constant_column("height", Value::U32(probed.height)),
            constant_column("framerate_n", Value::U32(probed.fps_num)),
            constant_column("framerate_d", Value::U32(probed.fps_den)),
            constant_column("codec", Value::String(probed.codec_tag.clone())),
        ];

        VideoStream {
            channel_number,
            codec_tag: probed.codec_tag,
            width: probed.width,
            height: probed.height,
            frame_rate_num: probed.fps_num,
            frame_rate_den: probed.fps_den,
            header_table,
            frames: probed
                .frames
                .into_iter()
                .map(|f| VideoFrame {
                    pts: f.pts,
                    is_keyframe: f.is_keyframe,
                    data: f.data,
                })
                .collect(),
        }
    }
}

/// A single audio elementary stream and the `@SFA` table describing it.
#[derive(Debug, Clone)]
pub struct AudioStream {
    pub channel_number: u8,
    pub codec_tag: String,
    pub sample_rate: u32,
    pub channels: u8,
    pub header_table: UtfTable,
    pub samples: Vec<AudioSample>,
}

impl AudioStream {
    /// Builds a stream from a C7 collaborator's probe result, synthesizing
    /// its `@SFA` header table from the reported parameters.
    pub fn from_probe(probed: ProbedAudio, channel_number: u8) -> AudioStream {
        let mut header_table = UtfTable::new("AUDIO_HDR");
        header_table.columns = vec![
            constant_column("samplerate", Value::U32(probed.sample_rate)),
            constant_column("channels", Value::U32(probed.channels as u32)),
            constant_column("codec", Value::String(probed.codec_tag.clone())),
        ];

        AudioStream {
            channel_number,
            codec_tag: probed.codec_tag,
            sample_rate: probed.sample_rate,
            channels: probed.channels,
            header_table,
            samples: probed
                .blocks
                .into_iter()
                .map(|data| AudioSample { data })
                .collect(),
        }
    }
}

fn constant_column(name: &str, value: Value) -> Column {
    let type_tag = match &value {
        Value::U8(_) => TypeTag::U8,
        Value::I8(_) => TypeTag::I8,
        Value::U16(_) => TypeTag::U16,
        Value::I16(_) => TypeTag::I16,
        Value::U32(_) => TypeTag::U32,
        Value::I32(_) => TypeTag::I32,
        Value::U64(_) => TypeTag::U64,
        Value::I64(_) => TypeTag::I64,
        Value::F32(_) => TypeTag::F32,
        Value::F64(_) => TypeTag::F64,
        Value::String(_) => TypeTag::String,
        Value::Bytes(_) => TypeTag::Bytes,
    };
    Column {
        name: name.to_string(),
        type_tag,
        storage: ColumnStorage::Constant(value),
    }
}
