//! The top-level `UsmContainer` (component C6): owns streams and metadata,
//! orchestrates demux/mux, and drives the cipher and page assembler.

use encoding_rs::Encoding;

use crate::chunk::{Chunk, PayloadType};
use crate::cipher::Cipher;
use crate::encoding;
use crate::error::{Result, UsmError};
use crate::page::{sort_for_mux, PageTracker, ScheduledFrame};
use crate::stream::{AudioSample, AudioStream, VideoFrame, VideoStream};
use crate::utf::{Column, ColumnStorage, TypeTag, UtfTable, Value};

/// Serialization mode for [`UsmContainer::stream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpMode {
    /// Preserve whatever cipher state the container currently holds.
    None,
    /// Force encrypted output; fails with `KeyMissing` if no key is installed.
    Encrypt,
    /// Force plaintext output regardless of the source's encryption.
    Decrypt,
}

struct RawFrame {
    signature: [u8; 4],
    channel_number: u8,
    frame_time: u32,
    /// The chunk's own `encrypt` flag, authoritative on read (spec §4.2):
    /// a frame is reverted only if this is set, never merely because a key
    /// was supplied to `open`.
    encrypt_flag: bool,
    data: Vec<u8>,
}

pub struct UsmContainer {
    pub crid_table: UtfTable,
    pub video_streams: Vec<VideoStream>,
    pub audio_streams: Vec<AudioStream>,
    video_key: Option<u64>,
    audio_key: Option<u64>,
    source_encrypted: bool,
}

impl UsmContainer {
    /// Opens a USM byte buffer, decoding all metadata tables and elementary
    /// stream payloads eagerly, using [`encoding::DEFAULT`] for payload
    /// strings in the `@UTF` tables. `key` is required if any chunk carries
    /// the encrypt flag.
    pub fn open(data: &[u8], key: Option<u64>) -> Result<UsmContainer> {
        Self::open_with_encoding(data, key, encoding::DEFAULT)
    }

    /// Like [`UsmContainer::open`], but decodes `@UTF` payload strings
    /// (filenames, codec tags) using `enc` instead of the default.
    pub fn open_with_encoding(
        data: &[u8],
        key: Option<u64>,
        enc: &'static Encoding,
    ) -> Result<UsmContainer> {
        if data.len() < 4 || &data[0..4] != b"CRID" {
            return Err(UsmError::NotUsm);
        }

        let mut tracker = PageTracker::new();
        let mut crid_table: Option<UtfTable> = None;
        let mut video_headers: Vec<(u8, UtfTable)> = Vec::new();
        let mut audio_headers: Vec<(u8, UtfTable)> = Vec::new();
        let mut raw_frames: Vec<RawFrame> = Vec::new();
        let mut source_encrypted = false;

        let mut offset = 0usize;
        while offset < data.len() {
            let (chunk, consumed) = Chunk::parse(&data[offset..])?;
            // CRID is a single top-level table, not a per-channel STREAM with
            // its own SECTION_END; only @SFV/@SFA/@SBT/@ALP channels go
            // through the page protocol tracker.
            if &chunk.signature != b"CRID" {
                tracker.observe(&chunk)?;
            }

            match (chunk.signature, chunk.payload_type) {
                (sig, PayloadType::Header) if &sig == b"CRID" => {
                    crid_table = Some(UtfTable::decode_with_encoding(chunk.payload, enc)?);
                }
                (sig, PayloadType::Header) if &sig == b"@SFV" => {
                    video_headers.push((
                        chunk.channel_number,
                        UtfTable::decode_with_encoding(chunk.payload, enc)?,
                    ));
                }
                (sig, PayloadType::Header) if &sig == b"@SFA" => {
                    audio_headers.push((
                        chunk.channel_number,
                        UtfTable::decode_with_encoding(chunk.payload, enc)?,
                    ));
                }
                (sig, PayloadType::Stream) if &sig == b"@SFV" || &sig == b"@SFA" => {
                    source_encrypted |= chunk.encrypt_flag;
                    raw_frames.push(RawFrame {
                        signature: chunk.signature,
                        channel_number: chunk.channel_number,
                        frame_time: chunk.frame_time,
                        encrypt_flag: chunk.encrypt_flag,
                        data: chunk.payload.to_vec(),
                    });
                }
                _ => {}
            }

            offset += consumed;
        }

        let unfinalized = tracker.unfinalized();
        if !unfinalized.is_empty() {
            return Err(UsmError::StreamOrdering {
                channel: unfinalized.join(", "),
                reason: "channel never saw a SECTION_END".to_string(),
            });
        }

        let crid_table = crid_table.ok_or_else(|| UsmError::StreamOrdering {
            channel: "CRID".to_string(),
            reason: "missing CRID HEADER chunk".to_string(),
        })?;

        if video_headers.is_empty() {
            return Err(UsmError::StreamOrdering {
                channel: "@SFV".to_string(),
                reason: "container has no video stream".to_string(),
            });
        }

        if let Some(declared) = crid_table.scalar("nstream").and_then(Value::as_u64) {
            let actual = (video_headers.len() + audio_headers.len()) as u64;
            if declared != actual {
                return Err(UsmError::StreamOrdering {
                    channel: "CRID".to_string(),
                    reason: format!(
                        "CRID declares {declared} streams but {actual} were finalized"
                    ),
                });
            }
        }

        if source_encrypted && key.is_none() {
            return Err(UsmError::DecryptionRequired);
        }
        let cipher = key.map(Cipher::new);

        let mut video_streams = Vec::new();
        for (channel_number, header_table) in video_headers {
            let width = column_u32(&header_table, "width");
            let height = column_u32(&header_table, "height");
            let frame_rate_num = column_u32(&header_table, "framerate_n");
            let frame_rate_den = column_u32(&header_table, "framerate_d").max(1);

            let mut frames: Vec<VideoFrame> = raw_frames
                .iter()
                .filter(|f| f.signature == *b"@SFV" && f.channel_number == channel_number)
                .map(|f| {
                    let mut data = f.data.clone();
                    // The chunk's own flag is authoritative: only revert a
                    // frame that was actually masked on write, never merely
                    // because a key happens to be installed (spec §4.2).
                    if f.encrypt_flag {
                        if let Some(c) = &cipher {
                            c.revert_video_mask(&mut data);
                        }
                    }
                    VideoFrame {
                        pts: f.frame_time as u64,
                        is_keyframe: false,
                        data,
                    }
                })
                .collect();
            frames.sort_by_key(|f| f.pts);

            video_streams.push(VideoStream {
                channel_number,
                codec_tag: column_string(&header_table, "codec").unwrap_or_else(|| "UNKNOWN".to_string()),
                width,
                height,
                frame_rate_num,
                frame_rate_den,
                header_table,
                frames,
            });
        }

        let mut audio_streams = Vec::new();
        for (channel_number, header_table) in audio_headers {
            let sample_rate = column_u32(&header_table, "samplerate");
            let channels = column_u32(&header_table, "channels") as u8;

            let samples: Vec<AudioSample> = raw_frames
                .iter()
                .filter(|f| f.signature == *b"@SFA" && f.channel_number == channel_number)
                .map(|f| AudioSample { data: f.data.clone() })
                .collect();

            audio_streams.push(AudioStream {
                channel_number,
                codec_tag: column_string(&header_table, "codec").unwrap_or_else(|| "HCA".to_string()),
                sample_rate,
                channels,
                header_table,
                samples,
            });
        }

        Ok(UsmContainer {
            crid_table,
            video_streams,
            audio_streams,
            video_key: key,
            audio_key: key,
            source_encrypted,
        })
    }

    /// Builds a container from streams produced by a C7 collaborator (the
    /// `create` CLI path), synthesizing a top-level `CRID` table. Fails if
    /// `video_streams` is empty: a `UsmContainer` always owns at least one
    /// video stream (spec §3).
    pub fn from_streams(
        video_streams: Vec<VideoStream>,
        audio_streams: Vec<AudioStream>,
    ) -> Result<UsmContainer> {
        if video_streams.is_empty() {
            return Err(UsmError::StreamOrdering {
                channel: "@SFV".to_string(),
                reason: "container has no video stream".to_string(),
            });
        }

        let mut crid_table = UtfTable::new("CRID");
        crid_table.columns.push(Column {
            name: "nstream".to_string(),
            type_tag: TypeTag::U32,
            storage: ColumnStorage::Constant(Value::U32(
                (video_streams.len() + audio_streams.len()) as u32,
            )),
        });

        Ok(UsmContainer {
            crid_table,
            video_streams,
            audio_streams,
            video_key: None,
            audio_key: None,
            source_encrypted: false,
        })
    }

    /// Materializes elementary stream bytes: one `Vec<u8>` per video stream,
    /// one per audio stream, in stream declaration order.
    pub fn demux(&self) -> (Vec<Vec<u8>>, Vec<Vec<u8>>) {
        let video = self
            .video_streams
            .iter()
            .map(|s| s.frames.iter().flat_map(|f| f.data.iter().copied()).collect())
            .collect();
        let audio = self
            .audio_streams
            .iter()
            .map(|s| s.samples.iter().flat_map(|f| f.data.iter().copied()).collect())
            .collect();
        (video, audio)
    }

    pub fn set_video_key(&mut self, key: u64) {
        self.video_key = Some(key);
    }

    pub fn set_audio_key(&mut self, key: u64) {
        self.audio_key = Some(key);
    }

    /// Returns a finite lazy sequence of serialized chunk buffers using
    /// [`encoding::DEFAULT`] for `@UTF` payload strings (§4.5, §5, §9).
    pub fn stream(&self, mode: OpMode) -> Result<UsmByteStream<'_>> {
        self.stream_with_encoding(mode, encoding::DEFAULT)
    }

    /// Like [`UsmContainer::stream`], but encodes `@UTF` payload strings
    /// using `enc`. Nothing is serialized until the returned cursor is
    /// advanced: dropping it before exhausting it writes nothing, and
    /// calling `stream`/`stream_with_encoding` again starts a fresh cursor
    /// with its own internal phase/index state (§5, §9).
    pub fn stream_with_encoding(&self, mode: OpMode, enc: &'static Encoding) -> Result<UsmByteStream<'_>> {
        let encrypt = match mode {
            OpMode::Encrypt => true,
            OpMode::Decrypt => false,
            OpMode::None => self.source_encrypted,
        };
        let cipher = if encrypt {
            let key = self
                .video_key
                .or(self.audio_key)
                .ok_or(UsmError::KeyMissing)?;
            Some(Cipher::new(key))
        } else {
            None
        };

        // The mux order depends on every frame's time/channel/signature, so
        // it must be known before the cursor can emit in order; this is the
        // one unavoidable up-front pass (indices and timing only, no payload
        // bytes copied or encrypted yet — that happens lazily in `next`).
        let mut schedule: Vec<ScheduledFrame<'_>> = Vec::new();
        for s in &self.video_streams {
            for (fi, f) in s.frames.iter().enumerate() {
                schedule.push(ScheduledFrame {
                    signature: *b"@SFV",
                    channel_number: s.channel_number,
                    frame_time: f.pts as u32,
                    frame_number: fi as u32,
                    frame_rate: 0,
                    payload: &f.data,
                });
            }
        }
        for s in &self.audio_streams {
            for (fi, f) in s.samples.iter().enumerate() {
                schedule.push(ScheduledFrame {
                    signature: *b"@SFA",
                    channel_number: s.channel_number,
                    frame_time: fi as u32,
                    frame_number: fi as u32,
                    frame_rate: 0,
                    payload: &f.data,
                });
            }
        }
        sort_for_mux(&mut schedule);

        Ok(UsmByteStream {
            container: self,
            enc,
            cipher,
            encrypt,
            schedule,
            phase: Phase::Crid,
        })
    }
}

/// Which leg of the header/bodies/terminators page protocol (§4.4, §9) the
/// cursor is currently emitting, plus the index within that leg.
enum Phase {
    Crid,
    VideoHeader(usize),
    AudioHeader(usize),
    Body(usize),
    VideoEnd(usize),
    AudioEnd(usize),
    Done,
}

/// The explicit `(channel_index, frame_index, phase)` cursor of §9: a finite
/// lazy sequence of serialized chunk buffers over one [`UsmContainer`].
/// Advancing applies the cipher and builds exactly one chunk's bytes per
/// call; nothing beyond the mux schedule itself (frame time/channel/
/// signature, not payload bytes) is computed until the cursor is pulled.
pub struct UsmByteStream<'a> {
    container: &'a UsmContainer,
    enc: &'static Encoding,
    cipher: Option<Cipher>,
    encrypt: bool,
    schedule: Vec<ScheduledFrame<'a>>,
    phase: Phase,
}

impl<'a> UsmByteStream<'a> {
    /// Eagerly drains the cursor into one contiguous buffer. Convenience for
    /// callers that want the whole file in memory (tests, or a `create`/
    /// `encrypt` run small enough not to care); prefer iterating directly to
    /// stream chunks to a sink as they're produced.
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        self.fold(Ok(Vec::new()), |acc, chunk| {
            let mut buf = acc?;
            buf.extend(chunk?);
            Ok(buf)
        })
    }
}

impl<'a> Iterator for UsmByteStream<'a> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.phase {
                Phase::Crid => {
                    self.phase = Phase::VideoHeader(0);
                    let chunk = Chunk::builder()
                        .signature(*b"CRID")
                        .payload_type(PayloadType::Header)
                        .channel_number(0)
                        .build();
                    return Some(
                        self.container
                            .crid_table
                            .encode_with_encoding(self.enc)
                            .map(|payload| chunk.write(&payload)),
                    );
                }
                Phase::VideoHeader(i) => {
                    if i >= self.container.video_streams.len() {
                        self.phase = Phase::AudioHeader(0);
                        continue;
                    }
                    self.phase = Phase::VideoHeader(i + 1);
                    let s = &self.container.video_streams[i];
                    let chunk = Chunk::builder()
                        .signature(*b"@SFV")
                        .payload_type(PayloadType::Header)
                        .channel_number(s.channel_number)
                        .build();
                    return Some(
                        s.header_table
                            .encode_with_encoding(self.enc)
                            .map(|payload| chunk.write(&payload)),
                    );
                }
                Phase::AudioHeader(i) => {
                    if i >= self.container.audio_streams.len() {
                        self.phase = Phase::Body(0);
                        continue;
                    }
                    self.phase = Phase::AudioHeader(i + 1);
                    let s = &self.container.audio_streams[i];
                    let chunk = Chunk::builder()
                        .signature(*b"@SFA")
                        .payload_type(PayloadType::Header)
                        .channel_number(s.channel_number)
                        .build();
                    return Some(
                        s.header_table
                            .encode_with_encoding(self.enc)
                            .map(|payload| chunk.write(&payload)),
                    );
                }
                Phase::Body(i) => {
                    if i >= self.schedule.len() {
                        self.phase = Phase::VideoEnd(0);
                        continue;
                    }
                    self.phase = Phase::Body(i + 1);
                    let frame = &self.schedule[i];
                    let mut data = frame.payload.to_vec();
                    if frame.signature == *b"@SFV" {
                        if let Some(c) = &self.cipher {
                            c.apply_video_mask(&mut data);
                        }
                    }
                    let chunk = Chunk::builder()
                        .signature(frame.signature)
                        .payload_type(PayloadType::Stream)
                        .channel_number(frame.channel_number)
                        .frame_time(frame.frame_time)
                        .frame_rate(frame.frame_rate)
                        .frame_number(frame.frame_number)
                        .encrypt_flag(self.encrypt)
                        .build();
                    return Some(Ok(chunk.write(&data)));
                }
                Phase::VideoEnd(i) => {
                    if i >= self.container.video_streams.len() {
                        self.phase = Phase::AudioEnd(0);
                        continue;
                    }
                    self.phase = Phase::VideoEnd(i + 1);
                    let s = &self.container.video_streams[i];
                    let chunk = Chunk::builder()
                        .signature(*b"@SFV")
                        .payload_type(PayloadType::SectionEnd)
                        .channel_number(s.channel_number)
                        .build();
                    return Some(Ok(chunk.write(&[])));
                }
                Phase::AudioEnd(i) => {
                    if i >= self.container.audio_streams.len() {
                        self.phase = Phase::Done;
                        continue;
                    }
                    self.phase = Phase::AudioEnd(i + 1);
                    let s = &self.container.audio_streams[i];
                    let chunk = Chunk::builder()
                        .signature(*b"@SFA")
                        .payload_type(PayloadType::SectionEnd)
                        .channel_number(s.channel_number)
                        .build();
                    return Some(Ok(chunk.write(&[])));
                }
                Phase::Done => return None,
            }
        }
    }
}

fn column_u32(table: &UtfTable, name: &str) -> u32 {
    table
        .scalar(name)
        .and_then(Value::as_u64)
        .map(|v| v as u32)
        .unwrap_or(0)
}

fn column_string(table: &UtfTable, name: &str) -> Option<String> {
    table.scalar(name).and_then(Value::as_str).map(str::to_string)
}
