//! Cumulative counters and timings of the engine.

use std::{fs::OpenOptions, io::Write, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::Error;

/// Report every this many generated seeds
pub const REPORT_INTERVAL: u64 = 50;

/// Name of the stats file in the log directory
pub const STATS_FILE: &str = "hybrid_stats.jsonl";

/// Counters of the engine, for the whole process lifetime
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HybridStats {
    /// Traces processed
    pub traces: u64,
    /// Conditional branches seen
    pub branches: u64,
    /// Branches the filters picked for solving
    pub interesting: u64,
    /// Branches whose extra constraints were not collected
    pub pruned: u64,
    /// Memory compare solutions found
    pub memcmp_solutions: u64,
    /// Solve requests served
    pub requests: u64,
    /// Requests flipped with all extra constraints
    pub nested: u64,
    /// Requests only flipped on their own
    pub optimistic: u64,
    /// Requests that could not be flipped, or failed
    pub unsat: u64,
    /// Requests for explored prefixes or missing snapshots
    pub dup: u64,
    /// Seed files written
    pub seeds: u64,
    /// Time spent processing trace events
    pub trace_time: Duration,
    /// Time spent collecting extra constraints
    pub extra_time: Duration,
    /// Time spent reloading snapshots
    pub reload_time: Duration,
    /// Time spent solving requests, reloading included
    pub solving_time: Duration,
}

impl HybridStats {
    /// All zero
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a written seed, returns `true` if a report is due.
    pub fn seed_written(&mut self) -> bool {
        self.seeds += 1;
        self.seeds % REPORT_INTERVAL == 0
    }

    /// Log the counters.
    pub fn report(&self) {
        match serde_json::to_string(self) {
            Ok(json) => log::info!("Hybrid stats: {json}"),
            Err(err) => log::warn!("Could not serialize stats: {err}"),
        }
    }

    /// Append the counters as a json line to `path`.
    pub fn append_to(&self, path: &Path) -> Result<(), Error> {
        let mut file = OpenOptions::new().append(true).create(true).open(path)?;
        writeln!(file, "{}", serde_json::to_string(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, time::Duration};

    use crate::stats::{HybridStats, REPORT_INTERVAL};

    #[test]
    fn test_report_interval() {
        let mut stats = HybridStats::new();
        let due: Vec<u64> = (1..=2 * REPORT_INTERVAL)
            .filter(|_| stats.seed_written())
            .collect();
        assert_eq!(due.len(), 2);
        assert_eq!(stats.seeds, 2 * REPORT_INTERVAL);
    }

    #[test]
    fn test_append_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.jsonl");
        let mut stats = HybridStats::new();
        stats.traces = 3;
        stats.solving_time = Duration::from_millis(1500);
        stats.append_to(&path).unwrap();
        stats.traces = 4;
        stats.append_to(&path).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<HybridStats> = contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].traces, 3);
        assert_eq!(lines[1].solving_time, Duration::from_millis(1500));
    }
}
