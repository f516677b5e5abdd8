//! FFmpeg-backed implementation of `usm`'s `VideoProber`/`AudioProber`
//! contract (component C7). Recognizes VP9/H.264 video and HCA/ADX audio in
//! an arbitrary container FFmpeg can demux, and hands coded frames to the
//! `usm` muxer. Never decodes samples itself.

pub mod audio;
pub mod video;

pub use audio::FfmpegAudioProber;
pub use video::FfmpegVideoProber;
