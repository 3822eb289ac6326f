//! Video frame boundary detection.
//!
//! A boundary is the start of a PES that contains a random access picture:
//! an H.264 IDR slice, an HEVC IRAP picture or an MPEG-2 I picture. The
//! boundary is reported once per PES, stamped with that PES's PTS.

use crate::demux::{TsHeader, parse_pes_pts, pes_header_len};
use std::collections::HashMap;
use tracing::trace;

/// Finds decodable frame boundaries in a packet stream.
///
/// Called once per packet, in stream order.
pub trait FrameBoundaryDetector {
    /// Told the stream type of each elementary PID once a PMT is known.
    fn register_stream(&mut self, _pid: u16, _stream_type: u8) {}

    /// Returns the 90kHz PTS of a frame boundary starting in this packet.
    fn push(&mut self, header: &TsHeader, payload: Option<&[u8]>) -> Option<u64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    Mpeg2,
    H264,
    Hevc,
}

impl VideoCodec {
    pub fn from_stream_type(stream_type: u8) -> Option<Self> {
        match stream_type {
            0x01 | 0x02 => Some(VideoCodec::Mpeg2),
            0x1B => Some(VideoCodec::H264),
            0x24 => Some(VideoCodec::Hevc),
            _ => None,
        }
    }

    /// Whether the start code at `data[0..3]` opens a random access picture.
    fn is_keyframe_at(self, data: &[u8]) -> Option<bool> {
        match self {
            VideoCodec::H264 => data.get(3).map(|b| b & 0x1F == 5),
            VideoCodec::Hevc => data.get(3).map(|b| matches!((b >> 1) & 0x3F, 16..=21)),
            VideoCodec::Mpeg2 => {
                let code = *data.get(3)?;
                if code != 0x00 {
                    return Some(false);
                }
                data.get(5).map(|b| (b >> 3) & 0x07 == 1)
            }
        }
    }
}

// Bytes kept between packets so a start code split across them is found.
const CARRY: usize = 5;

/// Scan `data` for a random access picture start code.
pub fn contains_keyframe(codec: VideoCodec, data: &[u8]) -> bool {
    let mut i = 0;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            if codec.is_keyframe_at(&data[i..]) == Some(true) {
                return true;
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    false
}

#[derive(Debug)]
struct PesState {
    codec: VideoCodec,
    pts: Option<u64>,
    reported: bool,
    carry: Vec<u8>,
}

/// Keyframe detector for MPEG-2, H.264 and HEVC video PIDs.
#[derive(Debug, Default)]
pub struct IdrDetector {
    streams: HashMap<u16, PesState>,
}

impl IdrDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn codec(&self, pid: u16) -> Option<VideoCodec> {
        self.streams.get(&pid).map(|s| s.codec)
    }
}

impl FrameBoundaryDetector for IdrDetector {
    fn register_stream(&mut self, pid: u16, stream_type: u8) {
        let Some(codec) = VideoCodec::from_stream_type(stream_type) else {
            return;
        };
        self.streams
            .entry(pid)
            .and_modify(|s| s.codec = codec)
            .or_insert(PesState {
                codec,
                pts: None,
                reported: false,
                carry: Vec::new(),
            });
    }

    fn push(&mut self, header: &TsHeader, payload: Option<&[u8]>) -> Option<u64> {
        let state = self.streams.get_mut(&header.pid)?;
        let payload = payload?;

        let mut data = payload;
        if header.payload_unit_start {
            state.pts = parse_pes_pts(payload);
            state.reported = false;
            state.carry.clear();
            data = pes_header_len(payload)
                .and_then(|len| payload.get(len..))
                .unwrap_or_default();
        }
        if state.reported || state.pts.is_none() {
            return None;
        }

        let mut buf = std::mem::take(&mut state.carry);
        buf.extend_from_slice(data);
        let found = contains_keyframe(state.codec, &buf);
        state.carry = buf[buf.len().saturating_sub(CARRY)..].to_vec();

        if !found {
            return None;
        }
        state.reported = true;
        trace!("keyframe on PID 0x{:X} at pts {:?}", header.pid, state.pts);
        state.pts
    }
}
