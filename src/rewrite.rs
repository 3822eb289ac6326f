//! The packet rewrite loop.
//!
//! Packets are read one at a time and written back in order. PMT packets get
//! the patched payload once a patch exists; cue packets are written right
//! before the packet that opened a frame boundary.

use crate::cue::{decode_cue_payload, describe};
use crate::demux::{DemuxEvent, TsDemux};
use crate::iframe::{FrameBoundaryDetector, IdrDetector};
use crate::packet::{cue_packet, time_signal_packet};
use crate::pmt::PmtPatcher;
use crate::sidecar::{CueScheduler, SidecarEntry};
use crate::source::{open_input, open_output};
use crate::{Continuity, SYNC_BYTE, TS_PACKET_SIZE, pts_to_seconds};
use anyhow::{Context, Result};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace, warn};

pub const DEFAULT_OUTPUT: &str = "output.ts";
pub const DEFAULT_SIDECAR: &str = "sidecar.txt";

#[derive(Debug, Clone)]
pub struct RewriteOptions {
    /// PID the cue packets are written on.
    pub cue_pid: u16,
    pub sidecar: PathBuf,
    /// Emit a time_signal on every frame boundary.
    pub time_signals: bool,
}

impl RewriteOptions {
    pub fn new(cue_pid: u16) -> Self {
        Self {
            cue_pid,
            sidecar: PathBuf::from(DEFAULT_SIDECAR),
            time_signals: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// No PMT patch cached yet.
    Seeking,
    /// PMT packets are being substituted.
    Steady,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RewriteStats {
    pub packets_in: u64,
    pub packets_out: u64,
    pub boundaries: u64,
    pub cues: u64,
    pub time_signals: u64,
    pub skipped_cues: u64,
    pub pmt_substitutions: u64,
}

pub struct Rewriter<D = IdrDetector> {
    options: RewriteOptions,
    demux: TsDemux,
    patcher: PmtPatcher,
    scheduler: CueScheduler,
    detector: D,
    continuity: Continuity,
    current_pts: Option<u64>,
    stats: RewriteStats,
}

impl Rewriter<IdrDetector> {
    pub fn new(options: RewriteOptions) -> Self {
        Self::with_detector(options, IdrDetector::new())
    }
}

impl<D: FrameBoundaryDetector> Rewriter<D> {
    pub fn with_detector(options: RewriteOptions, detector: D) -> Self {
        let patcher = PmtPatcher::new(options.cue_pid);
        Self {
            options,
            demux: TsDemux::new(),
            patcher,
            scheduler: CueScheduler::new(),
            detector,
            continuity: Continuity::default(),
            current_pts: None,
            stats: RewriteStats::default(),
        }
    }

    pub fn mode(&self) -> Mode {
        if self.patcher.has_patch() {
            Mode::Steady
        } else {
            Mode::Seeking
        }
    }

    /// Most recent PES timestamp seen on any PID (90kHz).
    pub fn current_pts(&self) -> Option<u64> {
        self.current_pts
    }

    pub fn stats(&self) -> RewriteStats {
        self.stats
    }

    pub fn patcher(&self) -> &PmtPatcher {
        &self.patcher
    }

    pub fn scheduler(&self) -> &CueScheduler {
        &self.scheduler
    }

    /// Rewrite every packet of `input` into `output`.
    pub fn run<R: Read, W: Write>(&mut self, mut input: R, mut output: W) -> Result<RewriteStats> {
        let mut pkt = [0u8; TS_PACKET_SIZE];
        if !find_start(&mut input, &mut pkt).context("failed to read input")? {
            warn!("no transport stream packets in input");
            return Ok(self.stats);
        }
        loop {
            self.process_packet(&mut pkt, &mut output)?;
            let filled = read_packet(&mut input, &mut pkt).context("failed to read input")?;
            if filled < TS_PACKET_SIZE {
                if filled > 0 {
                    warn!("dropping {filled} trailing bytes (partial packet)");
                }
                break;
            }
        }
        output.flush().context("failed to flush output")?;
        Ok(self.stats)
    }

    /// Handle one input packet, writing it and any cue packets it triggers.
    pub fn process_packet<W: Write + ?Sized>(
        &mut self,
        pkt: &mut [u8; TS_PACKET_SIZE],
        out: &mut W,
    ) -> Result<()> {
        self.stats.packets_in += 1;
        let (header, events) = self
            .demux
            .push(&pkt[..])
            .with_context(|| format!("bad packet #{}", self.stats.packets_in))?;
        for event in events {
            self.handle_event(event);
        }

        if let Some(pts_90k) = self.detector.push(&header, header.payload(&pkt[..])) {
            self.on_boundary(pts_90k, out)?;
        }

        if self.demux.is_pmt_pid(header.pid) && self.patcher.substitute(&mut pkt[..]) {
            self.stats.pmt_substitutions += 1;
        }
        self.write(&pkt[..], out)
    }

    fn handle_event(&mut self, event: DemuxEvent) {
        match event {
            DemuxEvent::Program { .. } => {}
            DemuxEvent::ProgramMap { pid, section } => {
                match self.patcher.patch(pid, &section) {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!("PMT on PID 0x{pid:X} incomplete, waiting");
                        return;
                    }
                    // Boundaries are still found from the streams it lists.
                    Err(e) => warn!("PMT on PID 0x{pid:X} left unpatched: {e:#}"),
                }
                for (es_pid, stream_type) in self.patcher.stream_types() {
                    self.detector.register_stream(es_pid, stream_type);
                }
            }
            DemuxEvent::Pts { pid, pts_90k } => {
                trace!("PID 0x{pid:X} pts {pts_90k}");
                self.current_pts = Some(pts_90k);
            }
        }
    }

    fn on_boundary<W: Write + ?Sized>(&mut self, pts_90k: u64, out: &mut W) -> Result<()> {
        self.stats.boundaries += 1;
        let pts = pts_to_seconds(pts_90k);
        trace!("frame boundary at {pts:.6}");

        if self.options.time_signals {
            let pkt = time_signal_packet(self.options.cue_pid, pts_90k, &mut self.continuity)?;
            self.write(&pkt, out)?;
            self.stats.time_signals += 1;
        }

        self.scheduler.load_file(&self.options.sidecar, pts)?;
        if let Some(entry) = self.scheduler.due(pts) {
            self.emit_cue(entry, pts, out)?;
        }
        Ok(())
    }

    fn emit_cue<W: Write + ?Sized>(
        &mut self,
        entry: SidecarEntry,
        pts: f64,
        out: &mut W,
    ) -> Result<()> {
        let built = decode_cue_payload(&entry.cue).and_then(|cue| {
            let pkt = cue_packet(self.options.cue_pid, &cue, &mut self.continuity)?;
            Ok((pkt, cue))
        });
        let (pkt, cue) = match built {
            Ok(built) => built,
            Err(e) => {
                warn!("skipping cue scheduled at {:.6}: {e:#}", entry.scheduled);
                self.stats.skipped_cues += 1;
                return Ok(());
            }
        };
        info!(
            "inserting cue at pts {pts:.6} (scheduled {:.6}) on PID 0x{:X}: {}",
            entry.scheduled,
            self.options.cue_pid,
            describe(&cue)
        );
        self.write(&pkt, out)?;
        self.stats.cues += 1;
        Ok(())
    }

    fn write<W: Write + ?Sized>(&mut self, pkt: &[u8], out: &mut W) -> Result<()> {
        out.write_all(pkt).context("failed to write output")?;
        self.stats.packets_out += 1;
        Ok(())
    }
}

/// Skip bytes up to the first sync byte and read the rest of that packet.
fn find_start<R: Read + ?Sized>(input: &mut R, pkt: &mut [u8; TS_PACKET_SIZE]) -> io::Result<bool> {
    let mut skipped = 0usize;
    loop {
        if read_packet(input, &mut pkt[..1])? == 0 {
            return Ok(false);
        }
        if pkt[0] == SYNC_BYTE {
            break;
        }
        skipped += 1;
    }
    if skipped > 0 {
        debug!("skipped {skipped} bytes before first sync byte");
    }
    Ok(read_packet(input, &mut pkt[1..])? == TS_PACKET_SIZE - 1)
}

/// Fill `buf` from `input`; returns the number of bytes read before EOF.
fn read_packet<R: Read + ?Sized>(input: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Rewrite `input` (path, `-` or `udp://` address) into `output`.
pub fn rewrite(input: &str, output: &Path, options: RewriteOptions) -> Result<RewriteStats> {
    let reader = open_input(input)?;
    let writer = open_output(output)?;
    info!(
        "rewriting {input} -> {}, SCTE-35 PID 0x{:X}, sidecar {}",
        output.display(),
        options.cue_pid,
        options.sidecar.display()
    );
    let mut rewriter = Rewriter::new(options);
    let stats = rewriter.run(reader, writer)?;
    if rewriter.mode() == Mode::Seeking {
        warn!("no PMT was patched; output does not announce the SCTE-35 PID");
    }
    info!(
        "done: {} packets in, {} out, {} boundaries, {} cues, {} time signals, {} cues skipped",
        stats.packets_in,
        stats.packets_out,
        stats.boundaries,
        stats.cues,
        stats.time_signals,
        stats.skipped_cues
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn find_start_skips_garbage() {
        let mut data = vec![0x00, 0x12, 0x34];
        data.push(SYNC_BYTE);
        data.extend_from_slice(&[0xAA; 187]);
        let mut pkt = [0u8; TS_PACKET_SIZE];
        assert!(find_start(&mut Cursor::new(data), &mut pkt).unwrap());
        assert_eq!(pkt[0], SYNC_BYTE);
        assert_eq!(pkt[187], 0xAA);
    }

    #[test]
    fn find_start_on_empty_input() {
        let mut pkt = [0u8; TS_PACKET_SIZE];
        assert!(!find_start(&mut Cursor::new(Vec::new()), &mut pkt).unwrap());
    }

    #[test]
    fn run_on_empty_input_writes_nothing() {
        let mut rewriter = Rewriter::new(RewriteOptions::new(0x86));
        let mut out = Vec::new();
        let stats = rewriter.run(Cursor::new(Vec::new()), &mut out).unwrap();
        assert_eq!(stats, RewriteStats::default());
        assert!(out.is_empty());
        assert_eq!(rewriter.mode(), Mode::Seeking);
    }
}
