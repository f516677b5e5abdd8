//! End-to-end scenarios over the public API: build streams, mux them into a
//! USM byte buffer, then demux and compare. No real USM fixtures exist, so
//! every input here is a hand-built byte literal or synthetic stream rather
//! than a captured file.

use std::io::{Read, Seek, SeekFrom, Write};

use usm::chunk::{Chunk, PayloadType};
use usm::prober::{ProbedAudio, ProbedVideo, ProbedVideoFrame};
use usm::utf::{Column, ColumnStorage, TypeTag, UtfTable, Value};
use usm::{AudioStream, OpMode, UsmContainer, UsmError, VideoStream};

fn small_video_stream() -> VideoStream {
    let probed = ProbedVideo {
        codec_tag: "VP9".to_string(),
        width: 192,
        height: 108,
        fps_num: 24000,
        fps_den: 1001,
        frames: vec![
            ProbedVideoFrame { data: vec![1, 2, 3, 4], pts: 0, is_keyframe: true },
            ProbedVideoFrame { data: vec![5, 6, 7, 8, 9, 10, 11], pts: 1, is_keyframe: false },
        ],
    };
    VideoStream::from_probe(probed, 0)
}

fn small_audio_stream() -> AudioStream {
    let probed = ProbedAudio {
        codec_tag: "HCA".to_string(),
        sample_rate: 48000,
        channels: 2,
        blocks: vec![vec![0u8; 16], vec![1u8; 16], vec![2u8; 16]],
    };
    AudioStream::from_probe(probed, 0)
}

/// S1: a plain container with one VP9 stream (2 frames) and one HCA stream
/// (3 blocks). `demux` returns exactly those bytes concatenated in order,
/// and `stream(NONE)` is stable under a second round-trip.
#[test]
fn s1_plain_container_demuxes_to_source_bytes() {
    let container = UsmContainer::from_streams(vec![small_video_stream()], vec![small_audio_stream()]).unwrap();
    let bytes = container.stream(OpMode::None).unwrap().into_bytes().unwrap();

    let reopened = UsmContainer::open(&bytes, None).unwrap();
    let (video, audio) = reopened.demux();
    assert_eq!(video, vec![vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11]]);
    assert_eq!(audio, vec![[vec![0u8; 16], vec![1u8; 16], vec![2u8; 16]].concat()]);

    let bytes_again = reopened.stream(OpMode::None).unwrap().into_bytes().unwrap();
    assert_eq!(bytes, bytes_again);
}

/// The same container round-tripped through an actual file on disk rather
/// than an in-memory buffer, since `UsmContainer::open` takes a byte slice
/// and has no opinion about where those bytes came from.
#[test]
fn s1_round_trips_through_a_real_file() {
    let container = UsmContainer::from_streams(vec![small_video_stream()], vec![small_audio_stream()]).unwrap();
    let bytes = container.stream(OpMode::None).unwrap().into_bytes().unwrap();

    let mut file = tempfile::tempfile().unwrap();
    file.write_all(&bytes).unwrap();
    file.seek(SeekFrom::Start(0)).unwrap();
    let mut read_back = Vec::new();
    file.read_to_end(&mut read_back).unwrap();

    let reopened = UsmContainer::open(&read_back, None).unwrap();
    let (video, audio) = reopened.demux();
    assert_eq!(video, vec![vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11]]);
    assert_eq!(audio, vec![[vec![0u8; 16], vec![1u8; 16], vec![2u8; 16]].concat()]);
}

/// S2: the same container encrypted. Opening without a key fails with
/// `DecryptionRequired`; opening with the right key yields identical
/// elementary stream bytes to the plaintext version. Uses a video frame
/// longer than the cipher's 64-byte unmasked prefix so the mask actually
/// does something.
#[test]
fn s2_encrypted_container_requires_key_and_decodes_correctly() {
    let plain_frame: Vec<u8> = (0..100u32).map(|i| (i % 256) as u8).collect();
    let probed = ProbedVideo {
        codec_tag: "VP9".to_string(),
        width: 192,
        height: 108,
        fps_num: 24000,
        fps_den: 1001,
        frames: vec![ProbedVideoFrame { data: plain_frame.clone(), pts: 0, is_keyframe: true }],
    };
    let video_stream = VideoStream::from_probe(probed, 0);

    let mut container = UsmContainer::from_streams(vec![video_stream], vec![]).unwrap();
    let key = 0x0123_4567_89AB_CDEFu64;
    container.set_video_key(key);
    let encrypted = container.stream(OpMode::Encrypt).unwrap().into_bytes().unwrap();

    let err = UsmContainer::open(&encrypted, None).unwrap_err();
    assert!(matches!(err, UsmError::DecryptionRequired));

    let decrypted = UsmContainer::open(&encrypted, Some(key)).unwrap();
    let (video, _) = decrypted.demux();
    assert_eq!(video, vec![plain_frame]);
}

/// A container holding only plaintext chunks (`encrypt` flag unset on every
/// `STREAM` chunk) must decode unchanged even when a key is supplied to
/// `open`: the per-chunk flag gates the cipher, not key presence (spec §4.2).
#[test]
fn s2b_plaintext_chunks_are_not_reverted_when_a_key_is_supplied() {
    let plain_frame: Vec<u8> = (0..100u32).map(|i| (i % 256) as u8).collect();
    let probed = ProbedVideo {
        codec_tag: "VP9".to_string(),
        width: 192,
        height: 108,
        fps_num: 24000,
        fps_den: 1001,
        frames: vec![ProbedVideoFrame { data: plain_frame.clone(), pts: 0, is_keyframe: true }],
    };
    let video_stream = VideoStream::from_probe(probed, 0);
    let container = UsmContainer::from_streams(vec![video_stream], vec![]).unwrap();
    let plain_bytes = container.stream(OpMode::None).unwrap().into_bytes().unwrap();

    let key = 0x0123_4567_89AB_CDEFu64;
    let opened_with_key = UsmContainer::open(&plain_bytes, Some(key)).unwrap();
    let (video, _) = opened_with_key.demux();
    assert_eq!(video, vec![plain_frame]);
}

/// S3: a table with zero rows and three `CONSTANT` columns round-trips to
/// an identical table.
#[test]
fn s3_zero_row_table_with_constants_round_trips() {
    let mut table = UtfTable::new("HDR");
    table.columns.push(Column {
        name: "a".to_string(),
        type_tag: TypeTag::U8,
        storage: ColumnStorage::Constant(Value::U8(9)),
    });
    table.columns.push(Column {
        name: "b".to_string(),
        type_tag: TypeTag::U32,
        storage: ColumnStorage::Constant(Value::U32(0xCAFE)),
    });
    table.columns.push(Column {
        name: "c".to_string(),
        type_tag: TypeTag::String,
        storage: ColumnStorage::Constant(Value::String("codec".to_string())),
    });

    let bytes = table.encode().unwrap();
    let decoded = UtfTable::decode(&bytes).unwrap();
    assert_eq!(decoded.row_count(), 0);
    assert_eq!(decoded.scalar("a").unwrap().as_u64(), Some(9));
    assert_eq!(decoded.scalar("b").unwrap().as_u64(), Some(0xCAFE));
    assert_eq!(decoded.scalar("c").unwrap().as_str(), Some("codec"));
}

/// S4: a table whose `strings_offset` points past the table's own size
/// must be rejected as `MalformedTable`, not panic or silently truncate.
#[test]
fn s4_strings_offset_past_table_size_is_rejected() {
    use usm::io::ByteWriter;

    let mut body = ByteWriter::new();
    body.write_u32(24); // rows_offset
    body.write_u32(999_999); // strings_offset: past the table
    body.write_u32(999_999); // bytes_offset
    body.write_u32(0); // name_offset
    body.write_u16(0); // column_count
    body.write_u16(0); // row_stride
    body.write_u32(0); // row_count

    let mut out = ByteWriter::new();
    out.write_bytes(b"@UTF");
    out.write_u32(body.position() as u32);
    out.write_bytes(body.as_slice());

    let err = UtfTable::decode(&out.into_vec()).unwrap_err();
    assert!(matches!(err, UsmError::MalformedTable { .. }));
}

/// S5: muxing a 60-frame VP9 stream at 24000/1001 fps produces strictly
/// increasing `frame_number` (0..59) and monotonic `frame_time` on the wire.
#[test]
fn s5_mux_assigns_sequential_frame_numbers_and_monotonic_time() {
    let frames: Vec<ProbedVideoFrame> = (0..60u64)
        .map(|i| ProbedVideoFrame { data: vec![i as u8; 4], pts: i * 1001, is_keyframe: i == 0 })
        .collect();
    let probed = ProbedVideo {
        codec_tag: "VP9".to_string(),
        width: 192,
        height: 108,
        fps_num: 24000,
        fps_den: 1001,
        frames,
    };
    let video_stream = VideoStream::from_probe(probed, 0);
    let container = UsmContainer::from_streams(vec![video_stream], vec![]).unwrap();
    let bytes = container.stream(OpMode::None).unwrap().into_bytes().unwrap();

    let mut frame_numbers = Vec::new();
    let mut frame_times = Vec::new();
    let mut offset = 0usize;
    while offset < bytes.len() {
        let (chunk, consumed) = Chunk::parse(&bytes[offset..]).unwrap();
        if chunk.signature == *b"@SFV" && chunk.payload_type == PayloadType::Stream {
            frame_numbers.push(chunk.frame_number);
            frame_times.push(chunk.frame_time);
        }
        offset += consumed;
    }

    assert_eq!(frame_numbers, (0u32..60).collect::<Vec<_>>());
    assert!(frame_times.windows(2).all(|w| w[0] < w[1]));
}

/// S6: running `encrypt` on a plain container then extracting yields
/// byte-identical elementary streams to extracting the original.
#[test]
fn s6_encrypt_then_extract_matches_original_extract() {
    let original = UsmContainer::from_streams(vec![small_video_stream()], vec![small_audio_stream()]).unwrap();
    let (orig_video, orig_audio) = original.demux();

    let plain_bytes = original.stream(OpMode::None).unwrap().into_bytes().unwrap();
    let mut reopened = UsmContainer::open(&plain_bytes, None).unwrap();

    let key = 0xDEAD_BEEF_F00D_CAFEu64;
    reopened.set_video_key(key);
    reopened.set_audio_key(key);
    let encrypted_bytes = reopened.stream(OpMode::Encrypt).unwrap().into_bytes().unwrap();

    let extracted = UsmContainer::open(&encrypted_bytes, Some(key)).unwrap();
    let (extracted_video, extracted_audio) = extracted.demux();

    assert_eq!(orig_video, extracted_video);
    assert_eq!(orig_audio, extracted_audio);
}

/// A `UsmContainer` always owns at least one video stream (spec §3);
/// building one from an audio-only stream set must be rejected rather than
/// silently producing a videoless container.
#[test]
fn s7_from_streams_rejects_a_videoless_container() {
    let err = UsmContainer::from_streams(vec![], vec![small_audio_stream()]).unwrap_err();
    assert!(matches!(err, UsmError::StreamOrdering { .. }));
}

/// The same invariant, checked on the read side: a hand-built CRID file
/// with an `@SFA` channel but no `@SFV` channel must fail to open.
#[test]
fn s7b_open_rejects_a_videoless_container() {
    let crid = UtfTable::new("CRID");
    let audio_header = UtfTable::new("AUDIO_HDR");

    let mut bytes = Vec::new();
    bytes.extend(Chunk::builder().signature(*b"CRID").payload_type(PayloadType::Header).channel_number(0).build().write(&crid.encode().unwrap()));
    bytes.extend(Chunk::builder().signature(*b"@SFA").payload_type(PayloadType::Header).channel_number(0).build().write(&audio_header.encode().unwrap()));
    bytes.extend(Chunk::builder().signature(*b"@SFA").payload_type(PayloadType::Stream).channel_number(0).build().write(&[0u8; 8]));
    bytes.extend(Chunk::builder().signature(*b"@SFA").payload_type(PayloadType::SectionEnd).channel_number(0).build().write(&[]));

    let err = UsmContainer::open(&bytes, None).unwrap_err();
    assert!(matches!(err, UsmError::StreamOrdering { .. }));
}
