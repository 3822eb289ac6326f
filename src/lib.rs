use crc::{CRC_32_MPEG_2, Crc};
use std::collections::HashMap;

pub mod bits;
pub mod cue;
pub mod demux;
pub mod iframe;
pub mod packet;
pub mod pmt;
pub mod rewrite;
pub mod sidecar;
pub mod source;

pub use rewrite::{RewriteOptions, RewriteStats, Rewriter};

/// Size of one transport stream packet.
pub const TS_PACKET_SIZE: usize = 188;

/// Transport stream sync byte.
pub const SYNC_BYTE: u8 = 0x47;

/// Highest usable PID value (13 bits, 0x1FFF is the null PID).
pub const MAX_PID: u16 = 0x1FFE;

const PTS_CLOCK: f64 = 90_000.0;

const CRC32_MPEG2: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

/// CRC32/MPEG-2 as carried at the end of PSI and splice_info sections.
pub fn crc32_mpeg2(data: &[u8]) -> u32 {
    CRC32_MPEG2.checksum(data)
}

/// Per-PID continuity counter tracker.
#[derive(Debug, Default)]
pub struct Continuity {
    map: HashMap<u16, u8>,
}

impl Continuity {
    pub fn peek(&self, pid: u16) -> Option<u8> {
        self.map.get(&pid).copied()
    }

    /// Returns the counter to stamp on the next packet for `pid` and advances it.
    pub fn next(&mut self, pid: u16) -> u8 {
        let entry = self.map.entry(pid).or_insert(0);
        let current = *entry;
        *entry = (current + 1) & 0x0F;
        current
    }
}

/// Convert 90kHz PTS ticks to seconds, rounded to microseconds.
pub fn pts_to_seconds(pts_90k: u64) -> f64 {
    let secs = pts_90k as f64 / PTS_CLOCK;
    (secs * 1_000_000.0).round() / 1_000_000.0
}

/// Convert seconds to 90kHz PTS ticks, wrapped to 33 bits.
pub fn seconds_to_pts(seconds: f64) -> u64 {
    let ticks = (seconds * PTS_CLOCK).round();
    if ticks <= 0.0 {
        return 0;
    }
    (ticks as u64) & ((1u64 << 33) - 1)
}

/// Parse a PID given as decimal or `0x`-prefixed hex.
pub fn parse_pid(raw: &str) -> anyhow::Result<u16> {
    let raw = raw.trim();
    let pid = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => raw.parse::<u16>(),
    }
    .map_err(|e| anyhow::anyhow!("invalid PID {raw:?}: {e}"))?;
    if pid > MAX_PID {
        return Err(anyhow::anyhow!(
            "PID 0x{pid:X} out of range (max 0x{MAX_PID:X})"
        ));
    }
    Ok(pid)
}
