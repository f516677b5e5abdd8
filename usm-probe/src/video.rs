use std::thread;

use ffmpeg_the_third::codec::Id as CodecId;
use ffmpeg_the_third::codec::context::Context as CodecContext;
use ffmpeg_the_third::format::input as ff_input;
use ffmpeg_the_third::media::Type as StreamType;
use thingbuf::mpsc::blocking::channel;

use usm::error::{Result, UsmError};
use usm::prober::{ProbedVideo, ProbedVideoFrame, VideoProber};

/// Recognizes a VP9/H.264 video stream in any FFmpeg-readable container and
/// hands its coded frames to the muxer, one packet per frame, undecoded.
pub struct FfmpegVideoProber {
    path: String,
}

impl FfmpegVideoProber {
    pub fn new(path: impl Into<String>) -> Self {
        FfmpegVideoProber { path: path.into() }
    }
}

impl VideoProber for FfmpegVideoProber {
    fn probe_video(&mut self) -> Result<ProbedVideo> {
        let input_ctx = ff_input(&self.path).map_err(ffmpeg_io_err)?;
        let video_stream = input_ctx
            .streams()
            .best(StreamType::Video)
            .ok_or_else(|| UsmError::UnsupportedCodec {
                tag: "no video stream found".to_string(),
            })?;

        let params = video_stream.parameters();
        let codec_tag = match params.id() {
            CodecId::VP9 => "VP9".to_string(),
            CodecId::H264 => "H264".to_string(),
            other => {
                return Err(UsmError::UnsupportedCodec {
                    tag: format!("{other:?}"),
                });
            }
        };

        let decoder_ctx = CodecContext::from_parameters(params).map_err(ffmpeg_io_err)?;
        let video_decoder = decoder_ctx.decoder().video().map_err(ffmpeg_io_err)?;
        let width = video_decoder.width();
        let height = video_decoder.height();
        let rate = video_stream.rate();
        let fps_num = rate.numerator() as u32;
        let fps_den = (rate.denominator() as u32).max(1);
        let stream_index = video_stream.index();
        drop(input_ctx);

        let path = self.path.clone();
        let (tx, rx) = channel::<(Vec<u8>, u64, bool)>(256);

        let reader = thread::spawn(move || -> anyhow::Result<()> {
            let mut input_ctx = ff_input(&path)?;
            for (stream, packet) in input_ctx.packets().filter_map(std::result::Result::ok) {
                if stream.index() != stream_index {
                    continue;
                }
                let data = packet.data().unwrap_or(&[]).to_vec();
                let pts = packet.pts().unwrap_or(0) as u64;
                let is_keyframe = packet.is_key();
                if tx.send((data, pts, is_keyframe)).is_err() {
                    break;
                }
            }
            Ok(())
        });

        let mut frames = Vec::new();
        while let Some((data, pts, is_keyframe)) = rx.recv() {
            frames.push(ProbedVideoFrame {
                data,
                pts,
                is_keyframe,
            });
        }

        reader
            .join()
            .map_err(|_| UsmError::UnsupportedCodec {
                tag: "prober thread panicked".to_string(),
            })?
            .map_err(anyhow_io_err)?;

        Ok(ProbedVideo {
            codec_tag,
            width,
            height,
            fps_num,
            fps_den,
            frames,
        })
    }
}

fn ffmpeg_io_err(e: ffmpeg_the_third::Error) -> UsmError {
    UsmError::IoFailure(std::io::Error::other(e.to_string()))
}

fn anyhow_io_err(e: anyhow::Error) -> UsmError {
    UsmError::IoFailure(std::io::Error::other(e.to_string()))
}
