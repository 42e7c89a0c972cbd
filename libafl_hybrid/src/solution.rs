//! Solutions of the solver and of memory compares, and turning them into new seeds.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use crossbeam_queue::SegQueue;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::{fs::write_file_atomic, tree::entry_name, Error};

/// Concrete byte values for some input offsets
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Solution {
    /// `offset -> value`
    pub bytes: HashMap<u32, u8>,
    /// Trace the solution was found in
    pub tid: u32,
    /// Address of the solved branch or compare
    pub addr: u64,
    /// Calling context of the solved branch or compare
    pub ctx: u64,
    /// Visit order of the solved branch or compare
    pub order: u32,
}

impl Solution {
    /// A solution without origin
    #[must_use]
    pub fn new(bytes: HashMap<u32, u8>) -> Self {
        Self {
            bytes,
            ..Self::default()
        }
    }

    /// Number of assigned bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// `true` if no byte is assigned
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Write the assignment into `input`, growing it with zeroes where needed.
    pub fn apply(&self, input: &mut Vec<u8>) -> Result<(), Error> {
        if let Some(max) = self.bytes.keys().max() {
            let needed = *max as usize + 1;
            if needed > input.len() {
                input.try_reserve(needed - input.len())?;
                input.resize(needed, 0);
            }
        }
        for (offset, value) in &self.bytes {
            input[*offset as usize] = *value;
        }
        Ok(())
    }
}

/// Solutions waiting for a consumer, shared between threads.
#[derive(Debug, Clone, Default)]
pub struct SolutionQueue {
    inner: Arc<SegQueue<Solution>>,
}

impl SolutionQueue {
    /// An empty queue
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a solution
    pub fn push(&self, solution: Solution) {
        self.inner.push(solution);
    }

    /// Take the oldest solution
    #[must_use]
    pub fn pop(&self) -> Option<Solution> {
        self.inner.pop()
    }

    /// Number of waiting solutions
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// `true` if nothing is waiting
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Locate the input a trace was recorded with.
///
/// Queue `0` is the fuzzer's queue, where entries carry a suffix after the id. Queue `1` holds the
/// seeds written by this engine. Other queues are unknown.
#[must_use]
pub fn source_testcase(output_dir: &Path, qid: u32, tree_id: u32) -> Option<PathBuf> {
    let name = entry_name(tree_id);
    match qid {
        0 => {
            let queue = output_dir.join("afl-slave").join("queue");
            let mut matches: Vec<PathBuf> = fs::read_dir(&queue)
                .ok()?
                .filter_map(Result::ok)
                .filter(|entry| entry.file_name().to_string_lossy().starts_with(&name))
                .map(|entry| entry.path())
                .collect();
            matches.sort();
            matches.into_iter().next()
        }
        1 => Some(output_dir.join("fifo").join("queue").join(name)),
        _ => None,
    }
}

/// Writes new seeds as `id:NNNNNN` files, numbered from a counter.
#[derive(Debug, Clone)]
pub struct SeedWriter {
    dir: PathBuf,
    next_id: u32,
}

impl SeedWriter {
    /// Seeds go to `dir`, starting at `id:000000`
    #[must_use]
    pub fn new<P>(dir: P) -> Self
    where
        P: Into<PathBuf>,
    {
        Self {
            dir: dir.into(),
            next_id: 0,
        }
    }

    /// The id of the next seed
    #[must_use]
    pub fn next_id(&self) -> u32 {
        self.next_id
    }

    /// Write `solution` on top of `source` as a new seed, returns its path.
    ///
    /// A missing or unreadable source counts as empty input.
    pub fn write(&mut self, source: Option<&Path>, solution: &Solution) -> Result<PathBuf, Error> {
        let mut input = match source {
            Some(path) => fs::read(path).unwrap_or_else(|err| {
                log::warn!("Could not read source testcase {}: {err}", path.display());
                Vec::new()
            }),
            None => {
                log::warn!("No source testcase, the seed only holds the solution");
                Vec::new()
            }
        };
        solution.apply(&mut input)?;

        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(entry_name(self.next_id));
        write_file_atomic(&path, &input)?;
        self.next_id += 1;
        log::debug!(
            "New seed {} with {} solved bytes",
            path.display(),
            solution.len()
        );
        Ok(path)
    }
}
