//! SCTE-35 cue messages: time_signal encoding and decoding of operator
//! supplied payloads.

use crate::bits::BitWriter;
use crate::crc32_mpeg2;
use anyhow::{Context, Result, anyhow};
use base64::Engine;

pub const SPLICE_INFO_TABLE_ID: u8 = 0xFC;

const SPLICE_COMMAND_TIME_SIGNAL: u8 = 0x06;

// protocol_version(1) + encryption/pts_adjustment(5) + cw_index(1) + tier/command_length(3)
const SPLICE_HEADER_LEN: usize = 10;

const TIME_SIGNAL_LEN: usize = 5;

const PTS_MASK: u64 = (1 << 33) - 1;

/// Encode a `splice_info_section` carrying `time_signal()` at `pts_90k`.
pub fn encode_time_signal(pts_90k: u64) -> Result<Vec<u8>> {
    // command type byte + command + descriptor_loop_length + CRC
    let section_length = SPLICE_HEADER_LEN + 1 + TIME_SIGNAL_LEN + 2 + 4;

    let mut w = BitWriter::new();
    w.add_int(8, SPLICE_INFO_TABLE_ID.into())?;
    w.add_flag(false)?; // section_syntax_indicator
    w.add_flag(false)?; // private_indicator
    w.add_int(2, 0b11)?; // sap_type: not specified
    w.add_int(12, section_length as u64)?;
    w.add_int(8, 0)?; // protocol_version
    w.add_flag(false)?; // encrypted_packet
    w.add_int(6, 0)?; // encryption_algorithm
    w.add_int(33, 0)?; // pts_adjustment
    w.add_int(8, 0)?; // cw_index
    w.add_int(12, 0xFFF)?; // tier
    w.add_int(12, TIME_SIGNAL_LEN as u64)?; // splice_command_length
    w.add_int(8, SPLICE_COMMAND_TIME_SIGNAL.into())?;
    w.add_flag(true)?; // time_specified_flag
    w.add_int(6, 0b11_1111)?; // reserved
    w.add_int(33, pts_90k & PTS_MASK)?;
    w.add_int(16, 0)?; // descriptor_loop_length

    let mut section = w.finish().context("time_signal not byte aligned")?;
    let crc = crc32_mpeg2(&section);
    section.extend_from_slice(&crc.to_be_bytes());
    Ok(section)
}

/// Decode an operator cue payload: Base64, or hex with a `0x` prefix.
pub fn decode_cue_payload(raw: &str) -> Result<Vec<u8>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(anyhow!("empty cue payload"));
    }
    if let Some(digits) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        return hex::decode(digits).context("hex decode failed");
    }
    base64::engine::general_purpose::STANDARD
        .decode(raw)
        .context("base64 decode failed")
}

/// Short human readable summary of a cue, for logging only.
pub fn describe(payload: &[u8]) -> String {
    match scte35::parse_splice_info_section(payload) {
        Ok(section) => match section.splice_command {
            scte35::SpliceCommand::TimeSignal(ts) => match ts.splice_time.pts_time {
                Some(pts) => format!("time_signal pts={pts}"),
                None => "time_signal (immediate)".to_string(),
            },
            other => format!("{other:?}"),
        },
        Err(e) => format!("undecodable cue ({} bytes): {e}", payload.len()),
    }
}
