//! Sidecar cue scheduling.
//!
//! The sidecar is a text source of `scheduled_time,cue_payload` lines with
//! optional `#` comments. Times are presentation times in seconds; `0`
//! means "at the next frame boundary". The file is re-read on every
//! boundary so an operator can append cues while a stream is running.

use anyhow::{Context, Result, anyhow};
use std::collections::{HashSet, VecDeque};
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use tracing::{debug, warn};

/// How far back, in seconds, a boundary may look for a due entry.
pub const DUE_WINDOW: f64 = 10.0;

#[derive(Debug, Clone, PartialEq)]
pub struct SidecarEntry {
    /// Presentation time in seconds.
    pub scheduled: f64,
    /// Cue payload exactly as written in the sidecar.
    pub cue: String,
    /// Time as written in the sidecar, before `0` was resolved.
    pub requested: f64,
}

impl SidecarEntry {
    fn same_cue(&self, other: &SidecarEntry) -> bool {
        if self.cue != other.cue {
            return false;
        }
        // Zero-time copies resolve to different boundaries but are one cue.
        self.scheduled == other.scheduled || (self.requested == 0.0 && other.requested == 0.0)
    }
}

/// Parse one sidecar line. Blank and comment-only lines yield `None`.
pub fn parse_sidecar_line(line: &str) -> Result<Option<(f64, String)>> {
    let line = line.split('#').next().unwrap_or_default().trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (time, cue) = line
        .split_once(',')
        .ok_or_else(|| anyhow!("sidecar line must look like time,cue: {line:?}"))?;
    let time: f64 = time
        .trim()
        .parse()
        .with_context(|| format!("invalid sidecar time {time:?}"))?;
    if !time.is_finite() {
        return Err(anyhow!("invalid sidecar time {time}"));
    }
    let cue = cue.trim();
    if cue.is_empty() {
        return Err(anyhow!("sidecar line has no cue payload"));
    }
    Ok(Some((time, cue.to_string())))
}

/// Pending cues ordered by scheduled time.
///
/// A `0,cue` line is taken once when it appears in the sidecar. It is taken
/// again only after a read in which it was absent.
#[derive(Debug, Default)]
pub struct CueScheduler {
    pending: VecDeque<SidecarEntry>,
    // Payloads of the zero-time lines in the previous read.
    immediate: HashSet<String>,
}

impl CueScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn pending(&self) -> impl Iterator<Item = &SidecarEntry> {
        self.pending.iter()
    }

    /// Merge the entries of `source` into the queue at boundary `pts`.
    ///
    /// Returns the number of entries added. Entries already queued, zero-time
    /// lines already taken from an earlier read and entries scheduled before
    /// `pts` are skipped; malformed lines are logged and skipped.
    pub fn load<R: BufRead>(&mut self, source: R, pts: f64) -> Result<usize> {
        let mut added = 0;
        let mut immediate = HashSet::new();
        for (lineno, line) in source.lines().enumerate() {
            let line = line.context("failed to read sidecar")?;
            let (time, cue) = match parse_sidecar_line(&line) {
                Ok(Some(parsed)) => parsed,
                Ok(None) => continue,
                Err(e) => {
                    warn!("sidecar line {}: {e:#}", lineno + 1);
                    continue;
                }
            };
            let entry = if time == 0.0 {
                immediate.insert(cue.clone());
                if self.immediate.contains(&cue) {
                    continue;
                }
                SidecarEntry {
                    scheduled: pts,
                    cue,
                    requested: time,
                }
            } else {
                if time < pts {
                    continue;
                }
                SidecarEntry {
                    scheduled: time,
                    cue,
                    requested: time,
                }
            };
            if self.pending.iter().any(|queued| queued.same_cue(&entry)) {
                continue;
            }
            debug!("queued cue at {:.6}: {}", entry.scheduled, entry.cue);
            self.pending.push_back(entry);
            added += 1;
        }
        self.immediate = immediate;
        if added > 0 {
            self.pending
                .make_contiguous()
                .sort_by(|a, b| a.scheduled.total_cmp(&b.scheduled));
        }
        Ok(added)
    }

    /// Load from a sidecar file; a missing file counts as empty.
    pub fn load_file(&mut self, path: &Path, pts: f64) -> Result<usize> {
        match File::open(path) {
            Ok(file) => self.load(BufReader::new(file), pts),
            Err(e) if e.kind() == io::ErrorKind::NotFound => self.load(io::empty(), pts),
            Err(e) => Err(e).with_context(|| format!("open sidecar {:?}", path)),
        }
    }

    /// Pop the head entry if it is scheduled within `[pts - DUE_WINDOW, pts]`.
    pub fn due(&mut self, pts: f64) -> Option<SidecarEntry> {
        let head = self.pending.front()?;
        if !(pts - DUE_WINDOW <= head.scheduled && head.scheduled <= pts) {
            return None;
        }
        self.pending.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn load(sched: &mut CueScheduler, text: &str, pts: f64) -> usize {
        sched.load(Cursor::new(text), pts).unwrap()
    }

    #[test]
    fn parse_line_with_comment() {
        assert_eq!(
            parse_sidecar_line("38103.868589, /DAWAAAAAAAAAP/wBQb+Qjo1vQAAuwxz9A== # ad break")
                .unwrap(),
            Some((38103.868589, "/DAWAAAAAAAAAP/wBQb+Qjo1vQAAuwxz9A==".to_string()))
        );
        assert_eq!(parse_sidecar_line("   # only a comment").unwrap(), None);
        assert_eq!(parse_sidecar_line("").unwrap(), None);
        assert!(parse_sidecar_line("no comma").is_err());
        assert!(parse_sidecar_line("abc,CUE").is_err());
        assert!(parse_sidecar_line("12.0,").is_err());
    }

    #[test]
    fn zero_time_resolves_to_current_pts() {
        let mut sched = CueScheduler::new();
        assert_eq!(load(&mut sched, "0,CUE_PAYLOAD_A\n", 1000.0), 1);
        let head = sched.pending().next().unwrap();
        assert_eq!(head.scheduled, 1000.0);
        assert_eq!(head.cue, "CUE_PAYLOAD_A");
    }

    #[test]
    fn missed_entries_are_dropped() {
        let mut sched = CueScheduler::new();
        assert_eq!(load(&mut sched, "999.9,LATE\n1000.0,EXACT\n", 1000.0), 1);
        assert_eq!(sched.pending().next().unwrap().cue, "EXACT");
    }

    #[test]
    fn queue_sorted_after_load() {
        let mut sched = CueScheduler::new();
        load(&mut sched, "300,C\n100,A\n", 50.0);
        load(&mut sched, "200,B\n50.5,Z\n", 50.0);
        let times: Vec<f64> = sched.pending().map(|e| e.scheduled).collect();
        assert_eq!(times, vec![50.5, 100.0, 200.0, 300.0]);
    }

    #[test]
    fn duplicates_are_loaded_once() {
        let mut sched = CueScheduler::new();
        let text = "500,CUE\n500,CUE\n";
        assert_eq!(load(&mut sched, text, 10.0), 1);
        assert_eq!(load(&mut sched, text, 10.0), 0);
        assert_eq!(sched.len(), 1);
        // Same time, other payload is a different entry.
        assert_eq!(load(&mut sched, "500,OTHER\n", 10.0), 1);
        assert_eq!(sched.len(), 2);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let mut sched = CueScheduler::new();
        assert_eq!(load(&mut sched, "garbage\n20,GOOD\nx,BAD\n", 10.0), 1);
    }

    #[test]
    fn due_window_scenario() {
        let mut sched = CueScheduler::new();
        assert!(sched.due(990.0).is_none());
        load(&mut sched, "0,CUE_PAYLOAD_A\n", 1000.0);
        assert!(sched.due(1011.0).is_none());
        let fired = sched.due(1000.0).unwrap();
        assert_eq!(fired.cue, "CUE_PAYLOAD_A");
        assert!(sched.is_empty());
    }

    #[test]
    fn due_waits_for_scheduled_time() {
        let mut sched = CueScheduler::new();
        load(&mut sched, "1000,CUE_PAYLOAD_A\n", 990.0);
        assert!(sched.due(995.0).is_none());
        assert_eq!(sched.due(1005.0).unwrap().cue, "CUE_PAYLOAD_A");
    }

    #[test]
    fn zero_time_line_fires_once_while_present() {
        let mut sched = CueScheduler::new();
        load(&mut sched, "0,NOW\n", 1000.0);
        assert!(sched.due(1000.0).is_some());
        // The sidecar is re-read on the next boundary.
        assert_eq!(load(&mut sched, "0,NOW\n", 1000.04), 0);
        assert!(sched.due(1000.04).is_none());
        assert_eq!(load(&mut sched, "0,NOW\n0,LATER\n", 1000.08), 1);
        assert_eq!(sched.due(1000.08).unwrap().cue, "LATER");
    }

    #[test]
    fn zero_time_line_can_be_reissued() {
        let mut sched = CueScheduler::new();
        load(&mut sched, "0,X\n", 100.0);
        assert_eq!(sched.due(100.0).unwrap().cue, "X");
        // Operator clears the sidecar, then writes the same line again.
        assert_eq!(load(&mut sched, "", 200.0), 0);
        assert_eq!(load(&mut sched, "0,X\n", 300.0), 1);
        let entry = sched.due(300.0).unwrap();
        assert_eq!((entry.cue.as_str(), entry.scheduled), ("X", 300.0));
    }

    #[test]
    fn missing_sidecar_clears_zero_time_memory() {
        let mut sched = CueScheduler::new();
        load(&mut sched, "0,X\n", 100.0);
        assert!(sched.due(100.0).is_some());
        let path = Path::new("/nonexistent/dir/sidecar.txt");
        assert_eq!(sched.load_file(path, 150.0).unwrap(), 0);
        assert_eq!(load(&mut sched, "0,X\n", 200.0), 1);
    }

    #[test]
    fn zero_time_line_behind_backlog_fires_once() {
        let mut sched = CueScheduler::new();
        let text = "100,A\n0,X\n";
        let mut fired = Vec::new();
        for pts in [100.0, 100.04, 100.08, 100.12] {
            load(&mut sched, text, pts);
            if let Some(entry) = sched.due(pts) {
                fired.push(entry.cue);
            }
        }
        assert_eq!(fired, vec!["A", "X"]);
        assert!(sched.is_empty());
    }

    #[test]
    fn zero_time_duplicate_of_pending_copy_is_skipped() {
        let mut sched = CueScheduler::new();
        load(&mut sched, "50,A\n0,X\n", 40.0);
        // X has not fired yet; clearing and re-adding it does not queue a second copy.
        load(&mut sched, "", 41.0);
        assert_eq!(load(&mut sched, "0,X\n", 42.0), 0);
        assert_eq!(sched.len(), 2);
    }

    #[test]
    fn due_window_bounds() {
        let mut sched = CueScheduler::new();
        load(&mut sched, "1000,A\n", 0.0);
        assert!(sched.due(999.99).is_none());
        assert!(sched.due(1010.01).is_none());
        assert!(sched.due(1010.0).is_some());

        load(&mut sched, "1000,B\n", 0.0);
        assert!(sched.due(1000.0).is_some());
    }

    #[test]
    fn due_fires_one_entry_per_call() {
        let mut sched = CueScheduler::new();
        load(&mut sched, "100,A\n101,B\n102,C\n", 0.0);
        assert_eq!(sched.due(105.0).unwrap().cue, "A");
        assert_eq!(sched.due(105.0).unwrap().cue, "B");
        assert_eq!(sched.due(105.0).unwrap().cue, "C");
        assert!(sched.due(105.0).is_none());
    }

    #[test]
    fn missing_file_is_empty() {
        let mut sched = CueScheduler::new();
        let path = Path::new("/nonexistent/dir/sidecar.txt");
        assert_eq!(sched.load_file(path, 0.0).unwrap(), 0);
    }

    mod prop {
        use crate::sidecar::CueScheduler;
        use proptest::prelude::*;
        use std::io::Cursor;

        proptest! {
            #[test]
            fn queue_stays_sorted(times in proptest::collection::vec(1u32..100_000, 1..40)) {
                let mut sched = CueScheduler::new();
                for chunk in times.chunks(7) {
                    let text: String = chunk
                        .iter()
                        .map(|t| format!("{t},CUE{t}\n"))
                        .collect();
                    sched.load(Cursor::new(text), 0.5).unwrap();
                }
                let queued: Vec<f64> = sched.pending().map(|e| e.scheduled).collect();
                prop_assert!(queued.windows(2).all(|w| w[0] <= w[1]));
                let mut distinct = times.clone();
                distinct.sort_unstable();
                distinct.dedup();
                prop_assert_eq!(queued.len(), distinct.len());
            }
        }
    }
}
