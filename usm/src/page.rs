//! Page assembly (component C5): per-channel protocol enforcement on demux,
//! and frame interleaving order on mux.

use litemap::LiteMap;

use crate::chunk::{Chunk, PayloadType};
use crate::error::{Result, UsmError};

type ChannelKey = ([u8; 4], u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PageState {
    AwaitingHeader,
    InStream,
    Finalized,
}

fn channel_name(key: &ChannelKey) -> String {
    format!("{}:{}", String::from_utf8_lossy(&key.0), key.1)
}

/// Enforces the per-channel page protocol while iterating chunks in file
/// order: exactly one `HEADER` chunk first, then any number of `STREAM`/
/// `METADATA` chunks, terminated by exactly one `SECTION_END`.
#[derive(Default)]
pub struct PageTracker {
    state: LiteMap<ChannelKey, PageState>,
}

impl PageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, chunk: &Chunk<'_>) -> Result<()> {
        let key: ChannelKey = (chunk.signature, chunk.channel_number);
        let state = self.state.entry(key).or_insert(PageState::AwaitingHeader);
        match (*state, chunk.payload_type) {
            (PageState::AwaitingHeader, PayloadType::Header) => {
                *state = PageState::InStream;
                Ok(())
            }
            (PageState::AwaitingHeader, _) => Err(UsmError::StreamOrdering {
                channel: channel_name(&key),
                reason: "first chunk on a channel must be HEADER".to_string(),
            }),
            (PageState::InStream, PayloadType::Stream | PayloadType::Metadata) => Ok(()),
            (PageState::InStream, PayloadType::SectionEnd) => {
                *state = PageState::Finalized;
                Ok(())
            }
            (PageState::InStream, PayloadType::Header) => Err(UsmError::StreamOrdering {
                channel: channel_name(&key),
                reason: "duplicate HEADER chunk".to_string(),
            }),
            (PageState::Finalized, _) => Err(UsmError::StreamOrdering {
                channel: channel_name(&key),
                reason: "chunk received after SECTION_END".to_string(),
            }),
        }
    }

    /// Channels observed so far that have not yet seen a `SECTION_END`.
    pub fn unfinalized(&self) -> Vec<String> {
        self.state
            .iter()
            .filter(|(_, s)| !matches!(s, PageState::Finalized))
            .map(|(k, _)| channel_name(k))
            .collect()
    }
}

/// One outbound `STREAM` chunk's worth of scheduling metadata, used to order
/// chunks across channels during mux.
pub struct ScheduledFrame<'a> {
    pub signature: [u8; 4],
    pub channel_number: u8,
    pub frame_time: u32,
    pub frame_number: u32,
    pub frame_rate: u8,
    pub payload: &'a [u8],
}

fn signature_rank(sig: &[u8; 4]) -> u8 {
    match sig {
        b"@SFV" => 0,
        b"@SFA" => 1,
        b"@SBT" => 2,
        b"@ALP" => 3,
        _ => 4,
    }
}

/// Orders frames for muxing: ascending frame time, ties broken by channel
/// number, then by signature (`@SFV` before `@SFA`).
pub fn sort_for_mux(frames: &mut [ScheduledFrame<'_>]) {
    frames.sort_by(|a, b| {
        a.frame_time
            .cmp(&b.frame_time)
            .then(a.channel_number.cmp(&b.channel_number))
            .then(signature_rank(&a.signature).cmp(&signature_rank(&b.signature)))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(sig: &[u8; 4], channel: u8, payload_type: PayloadType) -> Chunk<'static> {
        Chunk {
            signature: *sig,
            payload_type,
            frame_time: 0,
            frame_rate: 0,
            frame_number: 0,
            encrypt_flag: false,
            channel_number: channel,
            payload: &[],
        }
    }

    #[test]
    fn accepts_header_stream_section_end() {
        let mut tracker = PageTracker::new();
        tracker.observe(&chunk(b"@SFV", 0, PayloadType::Header)).unwrap();
        tracker.observe(&chunk(b"@SFV", 0, PayloadType::Stream)).unwrap();
        tracker.observe(&chunk(b"@SFV", 0, PayloadType::Stream)).unwrap();
        tracker
            .observe(&chunk(b"@SFV", 0, PayloadType::SectionEnd))
            .unwrap();
        assert!(tracker.unfinalized().is_empty());
    }

    #[test]
    fn rejects_stream_before_header() {
        let mut tracker = PageTracker::new();
        let err = tracker
            .observe(&chunk(b"@SFA", 1, PayloadType::Stream))
            .unwrap_err();
        assert!(matches!(err, UsmError::StreamOrdering { .. }));
    }

    #[test]
    fn rejects_chunk_after_section_end() {
        let mut tracker = PageTracker::new();
        tracker.observe(&chunk(b"@SFV", 0, PayloadType::Header)).unwrap();
        tracker
            .observe(&chunk(b"@SFV", 0, PayloadType::SectionEnd))
            .unwrap();
        let err = tracker
            .observe(&chunk(b"@SFV", 0, PayloadType::Stream))
            .unwrap_err();
        assert!(matches!(err, UsmError::StreamOrdering { .. }));
    }

    #[test]
    fn sorts_by_time_then_channel_then_signature() {
        let mut frames = vec![
            ScheduledFrame {
                signature: *b"@SFA",
                channel_number: 0,
                frame_time: 100,
                frame_number: 1,
                frame_rate: 0,
                payload: &[],
            },
            ScheduledFrame {
                signature: *b"@SFV",
                channel_number: 0,
                frame_time: 100,
                frame_number: 1,
                frame_rate: 30,
                payload: &[],
            },
            ScheduledFrame {
                signature: *b"@SFV",
                channel_number: 0,
                frame_time: 0,
                frame_number: 0,
                frame_rate: 30,
                payload: &[],
            },
        ];
        sort_for_mux(&mut frames);
        assert_eq!(frames[0].frame_time, 0);
        assert_eq!(&frames[1].signature, b"@SFV");
        assert_eq!(&frames[2].signature, b"@SFA");
    }
}
