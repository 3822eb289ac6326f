//! Program Map Table patching.
//!
//! A PMT section is rebuilt with the `CUEI` registration descriptor in the
//! program descriptor loop and an extra elementary stream entry (stream type
//! 0x86) for the cue PID. The rebuilt section is packed into a ready-to-use
//! packet payload and cached per PMT PID.

use crate::bits::BitWriter;
use crate::crc32_mpeg2;
use crate::demux::{PMT_TABLE_ID, parse_length, parse_pid_field};
use anyhow::{Context, Result, anyhow};
use std::collections::{HashMap, HashSet};
use std::io;
use tracing::{debug, info};

/// Registration descriptor announcing SCTE-35 (`format_identifier` "CUEI").
pub const CUEI_DESCRIPTOR: [u8; 6] = [0x05, 0x04, b'C', b'U', b'E', b'I'];

pub const SCTE35_STREAM_TYPE: u8 = 0x86;

/// Payload bytes available after the 4-byte TS header.
pub const PMT_PAYLOAD_SIZE: usize = 184;

const ES_ENTRY_LEN: usize = 5;

// Bytes between the end of section_length and the program descriptor loop.
const PMT_FIXED_LEN: usize = 9;

const CRC_LEN: usize = 4;

// Upper bound for section_length of a PMT (ISO/IEC 13818-1 2.4.4.9).
const MAX_SECTION_LENGTH: usize = 1021;

/// Stream types some muxers use for SCTE-35 (private data and 0x86).
pub fn is_scte35_stream_type(stream_type: u8) -> bool {
    matches!(stream_type, 0x06 | SCTE35_STREAM_TYPE)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EsEntry {
    pub stream_type: u8,
    pub pid: u16,
    pub es_info_length: usize,
}

/// Borrowed view of one complete PMT section.
#[derive(Debug)]
pub struct ProgramMapSection<'a> {
    pub section_length: usize,
    pub program_number: u16,
    pub version: u8,
    pub current_next: bool,
    pub section_number: u8,
    pub last_section_number: u8,
    pub pcr_pid: u16,
    /// Program descriptor loop, unmodified.
    pub program_info: &'a [u8],
    /// Elementary stream loop bytes, CRC excluded.
    pub stream_loop: &'a [u8],
    pub streams: Vec<EsEntry>,
    pub crc: u32,
    body: &'a [u8],
}

impl<'a> ProgramMapSection<'a> {
    /// Parse a PMT section starting at its table id.
    ///
    /// Returns `Ok(None)` while fewer bytes than `section_length` announces
    /// are available.
    pub fn parse(section: &'a [u8]) -> Result<Option<Self>> {
        if section.len() < 3 {
            return Ok(None);
        }
        if section[0] != PMT_TABLE_ID {
            return Err(anyhow!(
                "PMT table_id must be 0x02 (found 0x{:02X})",
                section[0]
            ));
        }
        let section_length = parse_length(section[1], section[2]);
        if section.len() < 3 + section_length {
            return Ok(None);
        }
        if section_length < PMT_FIXED_LEN + CRC_LEN {
            return Err(anyhow!("PMT section_length {section_length} too short"));
        }

        let program_number = (section[3] as u16) << 8 | section[4] as u16;
        let version = (section[5] >> 1) & 0x1F;
        let current_next = section[5] & 0x01 != 0;
        let section_number = section[6];
        let last_section_number = section[7];
        let pcr_pid = parse_pid_field(section[8], section[9]);
        let program_info_length = parse_length(section[10], section[11]);
        if PMT_FIXED_LEN + program_info_length + CRC_LEN > section_length {
            return Err(anyhow!(
                "PMT program_info_length {program_info_length} exceeds section_length {section_length}"
            ));
        }

        let program_info_end = 12 + program_info_length;
        let si_length = section_length - PMT_FIXED_LEN - program_info_length;
        let loop_end = program_info_end + si_length - CRC_LEN;

        let mut streams = Vec::new();
        let mut idx = program_info_end;
        while idx < loop_end {
            if idx + ES_ENTRY_LEN > loop_end {
                return Err(anyhow!("PMT elementary stream entry truncated at byte {idx}"));
            }
            let entry = EsEntry {
                stream_type: section[idx],
                pid: parse_pid_field(section[idx + 1], section[idx + 2]),
                es_info_length: parse_length(section[idx + 3], section[idx + 4]),
            };
            idx += ES_ENTRY_LEN + entry.es_info_length;
            if idx > loop_end {
                return Err(anyhow!(
                    "PMT es_info_length overruns stream loop for PID 0x{:X}",
                    entry.pid
                ));
            }
            streams.push(entry);
        }

        let crc = u32::from_be_bytes([
            section[loop_end],
            section[loop_end + 1],
            section[loop_end + 2],
            section[loop_end + 3],
        ]);

        Ok(Some(ProgramMapSection {
            section_length,
            program_number,
            version,
            current_next,
            section_number,
            last_section_number,
            pcr_pid,
            program_info: &section[12..program_info_end],
            stream_loop: &section[program_info_end..loop_end],
            streams,
            crc,
            body: &section[..loop_end],
        }))
    }

    pub fn crc_valid(&self) -> bool {
        crc32_mpeg2(self.body) == self.crc
    }

    /// True when the program loop carries a registration descriptor for `CUEI`.
    pub fn has_cuei_descriptor(&self) -> bool {
        let mut rest = self.program_info;
        while let [tag, len, body @ ..] = rest {
            let len = *len as usize;
            let Some(data) = body.get(..len) else {
                return false;
            };
            if *tag == CUEI_DESCRIPTOR[0] && data.starts_with(&CUEI_DESCRIPTOR[2..]) {
                return true;
            }
            rest = &body[len..];
        }
        false
    }

    pub fn lists_pid(&self, pid: u16) -> bool {
        self.streams.iter().any(|es| es.pid == pid)
    }
}

/// Elementary stream entry declaring `pid` as SCTE-35 with no descriptors.
pub fn scte35_es_entry(pid: u16) -> io::Result<Vec<u8>> {
    let mut w = BitWriter::new();
    w.add_int(8, SCTE35_STREAM_TYPE.into())?;
    w.add_int(3, 0b111)?; // reserved
    w.add_int(13, pid.into())?;
    w.add_int(4, 0b1111)?; // reserved
    w.add_int(12, 0)?; // es_info_length
    w.finish()
}

/// Rebuild `pmt` announcing `cue_pid`, with a fresh CRC.
///
/// The descriptor and the stream entry are each added only when missing.
pub fn patch_section(pmt: &ProgramMapSection<'_>, cue_pid: u16) -> Result<Vec<u8>> {
    let add_descriptor = !pmt.has_cuei_descriptor();
    let add_stream = !pmt.lists_pid(cue_pid);

    let mut program_info_length = pmt.program_info.len();
    let mut section_length = pmt.section_length;
    if add_descriptor {
        program_info_length += CUEI_DESCRIPTOR.len();
        section_length += CUEI_DESCRIPTOR.len();
    }
    if add_stream {
        section_length += ES_ENTRY_LEN;
    }
    if section_length > MAX_SECTION_LENGTH {
        return Err(anyhow!(
            "patched PMT section_length {section_length} exceeds {MAX_SECTION_LENGTH}"
        ));
    }

    let mut w = BitWriter::new();
    w.add_int(8, PMT_TABLE_ID.into())?;
    w.add_flag(true)?; // section_syntax_indicator
    w.add_flag(false)?;
    w.add_int(2, 0b11)?;
    w.add_int(12, section_length as u64)?;
    w.add_int(16, pmt.program_number.into())?;
    w.add_int(2, 0b11)?;
    w.add_int(5, pmt.version.into())?;
    w.add_flag(pmt.current_next)?;
    w.add_int(8, pmt.section_number.into())?;
    w.add_int(8, pmt.last_section_number.into())?;
    w.add_int(3, 0b111)?;
    w.add_int(13, pmt.pcr_pid.into())?;
    w.add_int(4, 0b1111)?;
    w.add_int(12, program_info_length as u64)?;
    w.add_bytes(pmt.program_info)?;
    if add_descriptor {
        w.add_bytes(&CUEI_DESCRIPTOR)?;
    }
    w.add_bytes(pmt.stream_loop)?;
    if add_stream {
        w.add_bytes(&scte35_es_entry(cue_pid)?)?;
    }

    let mut section = w.finish().context("PMT section not byte aligned")?;
    let crc = crc32_mpeg2(&section);
    section.extend_from_slice(&crc.to_be_bytes());
    Ok(section)
}

/// Pointer field, `section` and 0xFF stuffing filling one packet payload.
pub fn pmt_payload(section: &[u8]) -> Result<[u8; PMT_PAYLOAD_SIZE]> {
    if 1 + section.len() > PMT_PAYLOAD_SIZE {
        return Err(anyhow!(
            "patched PMT section is {} bytes and no longer fits a single packet",
            section.len()
        ));
    }
    let mut payload = [0xFF; PMT_PAYLOAD_SIZE];
    payload[0] = 0x00;
    payload[1..1 + section.len()].copy_from_slice(section);
    Ok(payload)
}

struct CachedPmt {
    source: Vec<u8>,
    payload: [u8; PMT_PAYLOAD_SIZE],
}

/// Patches PMT sections and substitutes the result into later PMT packets.
pub struct PmtPatcher {
    cue_pid: u16,
    cache: HashMap<u16, CachedPmt>,
    pid_program: HashMap<u16, u16>,
    stream_types: HashMap<u16, u8>,
    scte35_pids: HashSet<u16>,
}

impl PmtPatcher {
    pub fn new(cue_pid: u16) -> Self {
        Self {
            cue_pid,
            cache: HashMap::new(),
            pid_program: HashMap::new(),
            stream_types: HashMap::new(),
            scte35_pids: HashSet::new(),
        }
    }

    pub fn cue_pid(&self) -> u16 {
        self.cue_pid
    }

    /// Patch a reassembled PMT section seen on `pmt_pid`.
    ///
    /// Returns `Ok(false)` when the section is not complete yet. A section
    /// identical to the one behind the cached payload is not patched again.
    /// Stream types are recorded even when the section is then rejected.
    pub fn patch(&mut self, pmt_pid: u16, section: &[u8]) -> Result<bool> {
        let Some(pmt) = ProgramMapSection::parse(section)? else {
            return Ok(false);
        };
        let source = &section[..3 + pmt.section_length];
        if self
            .cache
            .get(&pmt_pid)
            .is_some_and(|cached| cached.source == source)
        {
            return Ok(true);
        }

        self.pid_program.insert(pmt.pcr_pid, pmt.program_number);
        for es in &pmt.streams {
            debug!(
                "program {} stream: type 0x{:02X} PID 0x{:X} es_info_length {}",
                pmt.program_number, es.stream_type, es.pid, es.es_info_length
            );
            self.pid_program.insert(es.pid, pmt.program_number);
            self.stream_types.insert(es.pid, es.stream_type);
            if is_scte35_stream_type(es.stream_type) {
                self.scte35_pids.insert(es.pid);
            }
        }

        if !pmt.crc_valid() {
            return Err(anyhow!(
                "PMT on PID 0x{pmt_pid:X} fails CRC check (carried 0x{:08X})",
                pmt.crc
            ));
        }

        let patched = patch_section(&pmt, self.cue_pid)?;
        let payload = pmt_payload(&patched)?;
        info!(
            "patched PMT PID 0x{pmt_pid:X} (program {}, version {}): SCTE-35 PID 0x{:X}, section_length {} -> {}",
            pmt.program_number,
            pmt.version,
            self.cue_pid,
            pmt.section_length,
            patched.len() - 3
        );
        self.cache.insert(
            pmt_pid,
            CachedPmt {
                source: source.to_vec(),
                payload,
            },
        );
        Ok(true)
    }

    /// True once any PMT has been patched.
    pub fn has_patch(&self) -> bool {
        !self.cache.is_empty()
    }

    pub fn cached_payload(&self, pmt_pid: u16) -> Option<&[u8; PMT_PAYLOAD_SIZE]> {
        self.cache.get(&pmt_pid).map(|cached| &cached.payload)
    }

    /// Replace the payload of `pkt` with the cached patch for its PID.
    ///
    /// The live header keeps its PID, flags and continuity counter. Packets
    /// without a payload are left alone.
    pub fn substitute(&self, pkt: &mut [u8]) -> bool {
        if pkt.len() != 4 + PMT_PAYLOAD_SIZE || pkt[3] & 0x10 == 0 {
            return false;
        }
        let pid = parse_pid_field(pkt[1], pkt[2]);
        let Some(cached) = self.cache.get(&pid) else {
            return false;
        };
        pkt[1] |= 0x40; // payload_unit_start_indicator
        pkt[3] = (pkt[3] & 0b1100_1111) | 0b0001_0000; // payload only
        pkt[4..].copy_from_slice(&cached.payload);
        true
    }

    pub fn stream_type(&self, pid: u16) -> Option<u8> {
        self.stream_types.get(&pid).copied()
    }

    pub fn stream_types(&self) -> impl Iterator<Item = (u16, u8)> + '_ {
        self.stream_types.iter().map(|(pid, st)| (*pid, *st))
    }

    pub fn program_of(&self, pid: u16) -> Option<u16> {
        self.pid_program.get(&pid).copied()
    }

    pub fn is_scte35_pid(&self, pid: u16) -> bool {
        self.scte35_pids.contains(&pid)
    }
}
