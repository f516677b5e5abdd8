use std::thread;

use ffmpeg_the_third::codec::context::Context as CodecContext;
use ffmpeg_the_third::format::input as ff_input;
use ffmpeg_the_third::media::Type as StreamType;
use thingbuf::mpsc::blocking::channel;

use usm::error::{Result, UsmError};
use usm::prober::{AudioProber, ProbedAudio};

/// Recognizes an HCA/ADX audio stream and hands its opaque coded blocks to
/// the muxer, one packet per block, undecoded.
pub struct FfmpegAudioProber {
    path: String,
}

impl FfmpegAudioProber {
    pub fn new(path: impl Into<String>) -> Self {
        FfmpegAudioProber { path: path.into() }
    }
}

impl AudioProber for FfmpegAudioProber {
    fn probe_audio(&mut self) -> Result<ProbedAudio> {
        let input_ctx = ff_input(&self.path).map_err(ffmpeg_io_err)?;
        let audio_stream = input_ctx
            .streams()
            .best(StreamType::Audio)
            .ok_or_else(|| UsmError::UnsupportedCodec {
                tag: "no audio stream found".to_string(),
            })?;

        let params = audio_stream.parameters();
        let codec_tag = format!("{:?}", params.id());

        let decoder_ctx = CodecContext::from_parameters(params).map_err(ffmpeg_io_err)?;
        let audio_decoder = decoder_ctx.decoder().audio().map_err(ffmpeg_io_err)?;
        let sample_rate = audio_decoder.rate();
        let channels = audio_decoder.channels() as u8;
        let stream_index = audio_stream.index();
        drop(input_ctx);

        let path = self.path.clone();
        let (tx, rx) = channel::<Vec<u8>>(256);

        let reader = thread::spawn(move || -> anyhow::Result<()> {
            let mut input_ctx = ff_input(&path)?;
            for (stream, packet) in input_ctx.packets().filter_map(std::result::Result::ok) {
                if stream.index() != stream_index {
                    continue;
                }
                let data = packet.data().unwrap_or(&[]).to_vec();
                if tx.send(data).is_err() {
                    break;
                }
            }
            Ok(())
        });

        let mut blocks = Vec::new();
        while let Some(block) = rx.recv() {
            blocks.push(block);
        }

        reader
            .join()
            .map_err(|_| UsmError::UnsupportedCodec {
                tag: "prober thread panicked".to_string(),
            })?
            .map_err(anyhow_io_err)?;

        Ok(ProbedAudio {
            codec_tag,
            sample_rate,
            channels,
            blocks,
        })
    }
}

fn ffmpeg_io_err(e: ffmpeg_the_third::Error) -> UsmError {
    UsmError::IoFailure(std::io::Error::other(e.to_string()))
}

fn anyhow_io_err(e: anyhow::Error) -> UsmError {
    UsmError::IoFailure(std::io::Error::other(e.to_string()))
}
