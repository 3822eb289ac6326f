//! Transport stream demux primitives: header parsing, PSI section
//! reassembly, PAT parsing and PES timestamp extraction.
//!
//! [`TsDemux`] does no rewriting of its own; it reports what it saw as
//! [`DemuxEvent`]s and leaves the reaction to the caller.

use crate::{SYNC_BYTE, TS_PACKET_SIZE};
use anyhow::{Result, anyhow};
use std::collections::{HashMap, HashSet};
use tracing::{debug, trace, warn};

pub const PAT_PID: u16 = 0x0000;
pub const PAT_TABLE_ID: u8 = 0x00;
pub const PMT_TABLE_ID: u8 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TsHeader {
    pub pid: u16,
    pub payload_unit_start: bool,
    pub adaptation_field_control: u8,
    pub continuity_counter: u8,
    pub payload_offset: usize,
}

impl TsHeader {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() != TS_PACKET_SIZE {
            return Err(anyhow!("TS packet must be {TS_PACKET_SIZE} bytes"));
        }
        if buf[0] != SYNC_BYTE {
            return Err(anyhow!("sync byte missing (found 0x{:02X})", buf[0]));
        }
        let payload_unit_start = (buf[1] & 0x40) != 0;
        let pid = ((buf[1] & 0x1F) as u16) << 8 | buf[2] as u16;
        let adaptation_field_control = (buf[3] & 0b0011_0000) >> 4;
        let continuity_counter = buf[3] & 0x0F;

        let mut offset = 4;
        if adaptation_field_control & 0b10 != 0 {
            offset += 1 + buf[4] as usize;
        }

        Ok(TsHeader {
            pid,
            payload_unit_start,
            adaptation_field_control,
            continuity_counter,
            payload_offset: offset,
        })
    }

    /// Payload bytes of `buf`, if the packet carries any.
    pub fn payload<'a>(&self, buf: &'a [u8]) -> Option<&'a [u8]> {
        if self.adaptation_field_control & 0b01 == 0 || self.payload_offset > buf.len() {
            return None;
        }
        Some(&buf[self.payload_offset..])
    }
}

/// Read the 12-bit length field packed into `hi` (low nibble) and `lo`.
pub(crate) fn parse_length(hi: u8, lo: u8) -> usize {
    ((hi as usize & 0x0F) << 8) | lo as usize
}

/// Read the 13-bit PID field packed into `hi` (low 5 bits) and `lo`.
pub(crate) fn parse_pid_field(hi: u8, lo: u8) -> u16 {
    ((hi as u16 & 0x1F) << 8) | lo as u16
}

/// Reassembles PSI sections that span several packets.
#[derive(Debug, Default)]
pub struct PsiAssembler {
    buf: HashMap<u16, Vec<u8>>,
}

impl PsiAssembler {
    /// Feed one packet payload; returns a complete section when one ends here.
    pub fn push(&mut self, pid: u16, payload_start: bool, payload: &[u8]) -> Option<Vec<u8>> {
        let mut idx = 0;
        if payload_start {
            let pointer_field = *payload.first()? as usize;
            idx = 1 + pointer_field;
            if idx > payload.len() {
                self.buf.remove(&pid);
                return None;
            }
            self.buf.insert(pid, Vec::new());
        }
        // Continuation without a started section.
        let entry = self.buf.get_mut(&pid)?;
        entry.extend_from_slice(&payload[idx..]);
        if entry.len() < 3 {
            return None;
        }
        let len = 3 + parse_length(entry[1], entry[2]);
        if entry.len() >= len {
            let mut full = self.buf.remove(&pid)?;
            full.truncate(len);
            Some(full)
        } else {
            None
        }
    }
}

/// Program number and PMT PID pairs from a PAT section. Network PID
/// entries (program 0) are skipped.
pub fn parse_pat(section: &[u8]) -> Result<Vec<(u16, u16)>> {
    if section.len() < 12 {
        return Err(anyhow!("PAT section too short"));
    }
    if section[0] != PAT_TABLE_ID {
        return Err(anyhow!("PAT table_id must be 0x00"));
    }
    let section_length = parse_length(section[1], section[2]);
    if section.len() < section_length + 3 || section_length < 9 {
        return Err(anyhow!("PAT incomplete"));
    }
    // table_id(1) section_length(2) transport_stream_id(2) version(1) section numbers(2)
    let mut idx = 8;
    let end = 3 + section_length - 4;
    let mut programs = Vec::new();
    while idx + 4 <= end {
        let program_number = (section[idx] as u16) << 8 | section[idx + 1] as u16;
        let pid = parse_pid_field(section[idx + 2], section[idx + 3]);
        if program_number != 0 {
            programs.push((program_number, pid));
        }
        idx += 4;
    }
    Ok(programs)
}

/// PTS (90kHz) from the PES header at the start of `payload`.
pub fn parse_pes_pts(payload: &[u8]) -> Option<u64> {
    if payload.len() < 14 {
        return None;
    }
    if payload[0] != 0x00 || payload[1] != 0x00 || payload[2] != 0x01 {
        return None;
    }
    let flags = payload[7];
    let pts_dts_flags = (flags >> 6) & 0b11;
    let header_data_len = payload[8] as usize;
    if pts_dts_flags & 0b10 == 0 {
        return None;
    }
    if payload.len() < 9 + header_data_len || header_data_len < 5 {
        return None;
    }
    let b = &payload[9..14];
    let pts = (((b[0] >> 1) as u64) & 0x07) << 30
        | ((b[1] as u64) << 22)
        | (((b[2] >> 1) as u64) << 15)
        | ((b[3] as u64) << 7)
        | ((b[4] >> 1) as u64);
    Some(pts)
}

/// Length of the PES header at the start of `payload`, if one is present.
pub fn pes_header_len(payload: &[u8]) -> Option<usize> {
    if payload.len() < 9 || payload[..3] != [0x00, 0x00, 0x01] {
        return None;
    }
    Some(9 + payload[8] as usize)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DemuxEvent {
    /// A PAT listed `pmt_pid` for `program_number`.
    Program { program_number: u16, pmt_pid: u16 },
    /// A complete PMT section was reassembled on `pid`.
    ProgramMap { pid: u16, section: Vec<u8> },
    /// A PES starting in this packet carried a PTS.
    Pts { pid: u16, pts_90k: u64 },
}

/// Tracks PAT/PMT PIDs and reports tables and timestamps packet by packet.
#[derive(Debug, Default)]
pub struct TsDemux {
    assembler: PsiAssembler,
    pmt_pids: HashSet<u16>,
}

impl TsDemux {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_pmt_pid(&self, pid: u16) -> bool {
        self.pmt_pids.contains(&pid)
    }

    pub fn pmt_pids(&self) -> impl Iterator<Item = u16> + '_ {
        self.pmt_pids.iter().copied()
    }

    /// Parse one packet and collect the events it produced.
    pub fn push(&mut self, pkt: &[u8]) -> Result<(TsHeader, Vec<DemuxEvent>)> {
        let header = TsHeader::parse(pkt)?;
        let mut events = Vec::new();
        let Some(payload) = header.payload(pkt) else {
            return Ok((header, events));
        };

        if header.pid == PAT_PID {
            if let Some(section) =
                self.assembler
                    .push(header.pid, header.payload_unit_start, payload)
            {
                match parse_pat(&section) {
                    Ok(programs) => {
                        for (program_number, pmt_pid) in programs {
                            if self.pmt_pids.insert(pmt_pid) {
                                debug!("PAT: program {program_number} -> PMT PID 0x{pmt_pid:X}");
                            }
                            events.push(DemuxEvent::Program {
                                program_number,
                                pmt_pid,
                            });
                        }
                    }
                    Err(e) => warn!("ignoring PAT section: {e}"),
                }
            }
        } else if self.pmt_pids.contains(&header.pid) {
            if let Some(section) =
                self.assembler
                    .push(header.pid, header.payload_unit_start, payload)
            {
                trace!("PMT section on PID 0x{:X} ({} bytes)", header.pid, section.len());
                events.push(DemuxEvent::ProgramMap {
                    pid: header.pid,
                    section,
                });
            }
        } else if header.payload_unit_start
            && let Some(pts_90k) = parse_pes_pts(payload)
        {
            events.push(DemuxEvent::Pts {
                pid: header.pid,
                pts_90k,
            });
        }

        Ok((header, events))
    }
}
