//! Single-packet carriage of SCTE-35 sections on the cue PID.

use crate::bits::BitWriter;
use crate::cue::encode_time_signal;
use crate::{Continuity, SYNC_BYTE, TS_PACKET_SIZE};
use anyhow::{Context, Result, anyhow};

/// Bytes left for a cue after the TS header and the pointer field.
pub const CUE_CAPACITY: usize = TS_PACKET_SIZE - 4 - 1;

/// Wrap an encoded cue section into one payload-only packet on `pid`.
///
/// The continuity counter for `pid` is advanced only when a packet is built.
pub fn cue_packet(pid: u16, cue: &[u8], cc: &mut Continuity) -> Result<[u8; TS_PACKET_SIZE]> {
    if cue.len() > CUE_CAPACITY {
        return Err(anyhow!(
            "SCTE-35 section too large: {} bytes (max {CUE_CAPACITY} in one packet)",
            cue.len()
        ));
    }
    let counter = cc.peek(pid).unwrap_or(0);

    let mut w = BitWriter::new();
    w.add_int(8, SYNC_BYTE.into())?;
    w.add_flag(false)?; // transport_error_indicator
    w.add_flag(true)?; // payload_unit_start_indicator
    w.add_flag(false)?; // transport_priority
    w.add_int(13, pid.into())?;
    w.add_int(2, 0)?; // transport_scrambling_control
    w.add_int(2, 0b01)?; // adaptation_field_control: payload only
    w.add_int(4, counter.into())?;
    w.add_int(8, 0)?; // pointer_field
    w.add_bytes(cue)?;

    let mut bytes = w.finish().context("cue packet not byte aligned")?;
    bytes.resize(TS_PACKET_SIZE, 0xFF);
    let mut pkt = [0u8; TS_PACKET_SIZE];
    pkt.copy_from_slice(&bytes);
    cc.next(pid);
    Ok(pkt)
}

/// Packet carrying a `time_signal()` at `pts_90k`.
pub fn time_signal_packet(
    pid: u16,
    pts_90k: u64,
    cc: &mut Continuity,
) -> Result<[u8; TS_PACKET_SIZE]> {
    let section = encode_time_signal(pts_90k)?;
    cue_packet(pid, &section, cc)
}
