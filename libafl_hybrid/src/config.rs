//! Configuration of the hybrid engine.
//!
//! Everything has a default, a few paths can be overridden from the environment so the engine can be
//! dropped into an existing fuzzing setup, see [`HybridConfig::from_env`].

use std::{env, path::PathBuf, time::Duration};

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::filters::path_prefix::PREFIX_MAP_BYTES;

/// Env var holding the output directory of the fuzzer
pub const OUTPUT_DIR_ENV: &str = "SYMCC_OUTPUT_DIR";
/// Env var holding the directory for trace tree snapshots
pub const TREE_DIR_ENV: &str = "MARCO_TREE_DIR";
/// Env var holding the log directory
pub const LOG_DIR_ENV: &str = "MARCO_LOG_DIR";

/// Which branches get solved
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    IntoPrimitive,
    TryFromPrimitive,
)]
#[repr(u32)]
pub enum FilterMode {
    /// qsym style: new edges and new call contexts, after basic block pruning
    Coverage = 0,
    /// Unexplored continuations of the path prefix, coverage only promotes
    PathPrefix = 1,
}

#[allow(clippy::derivable_impls)]
impl Default for FilterMode {
    fn default() -> Self {
        Self::PathPrefix
    }
}

/// Configuration of a [`crate::HybridEngine`]
#[derive(Debug, Clone, TypedBuilder, Serialize, Deserialize)]
pub struct HybridConfig {
    /// Output directory of the fuzzer, new seeds go to `<output_dir>/fifo/queue`
    #[builder(default = PathBuf::from("."), setter(into))]
    pub output_dir: PathBuf,
    /// Directory of the trace tree snapshots
    #[builder(default = PathBuf::from("."), setter(into))]
    pub tree_dir: PathBuf,
    /// Directory for log files of the embedding binary
    #[builder(default = PathBuf::from("."), setter(into))]
    pub log_dir: PathBuf,
    /// The input of the current trace, `<output_dir>/.cur_input` if unset
    #[builder(default, setter(strip_option, into))]
    pub current_input: Option<PathBuf>,
    /// Pipe the decision records are written to
    #[builder(default = PathBuf::from("/tmp/pcpipe"), setter(into))]
    pub decision_pipe: PathBuf,
    /// Pipe the solve requests are read from
    #[builder(default = PathBuf::from("/tmp/myfifo"), setter(into))]
    pub request_pipe: PathBuf,
    /// Branch filter
    #[builder(default)]
    pub filter_mode: FilterMode,
    /// Write memory compare solutions as seed files instead of queueing them
    #[builder(default = false)]
    pub save_whole: bool,
    /// Timeout of a single solver query
    #[builder(default = Duration::from_millis(1000))]
    pub solver_timeout: Duration,
    /// Wall clock time spent on the events of a single trace
    #[builder(default = Duration::from_secs(30))]
    pub trace_budget: Duration,
    /// Backoff before reopening the request pipe after its writer went away
    #[builder(default = Duration::from_millis(50))]
    pub reopen_backoff: Duration,
    /// Size of the persistent path prefix bitmap, in bytes
    #[builder(default = PREFIX_MAP_BYTES)]
    pub prefix_map_bytes: usize,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

fn env_path(name: &str) -> Option<PathBuf> {
    env::var_os(name)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

impl HybridConfig {
    /// The default config, with the directories taken from the environment where set.
    ///
    /// Empty variables count as unset.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().with_env()
    }

    /// Override the directories of this config from the environment.
    #[must_use]
    pub fn with_env(mut self) -> Self {
        if let Some(dir) = env_path(OUTPUT_DIR_ENV) {
            self.output_dir = dir;
        }
        if let Some(dir) = env_path(TREE_DIR_ENV) {
            self.tree_dir = dir;
        }
        if let Some(dir) = env_path(LOG_DIR_ENV) {
            self.log_dir = dir;
        }
        self
    }

    /// The input file of the current trace
    #[must_use]
    pub fn current_input(&self) -> PathBuf {
        self.current_input
            .clone()
            .unwrap_or_else(|| self.output_dir.join(".cur_input"))
    }

    /// Where new seeds are written
    #[must_use]
    pub fn seed_dir(&self) -> PathBuf {
        self.output_dir.join("fifo").join("queue")
    }
}

#[cfg(test)]
mod tests {
    use std::{env, path::PathBuf, time::Duration};

    use serial_test::serial;

    use crate::config::{FilterMode, HybridConfig, LOG_DIR_ENV, OUTPUT_DIR_ENV, TREE_DIR_ENV};

    #[test]
    fn test_defaults() {
        let config = HybridConfig::default();
        assert_eq!(config.decision_pipe, PathBuf::from("/tmp/pcpipe"));
        assert_eq!(config.request_pipe, PathBuf::from("/tmp/myfifo"));
        assert_eq!(config.solver_timeout, Duration::from_secs(1));
        assert_eq!(config.filter_mode, FilterMode::PathPrefix);
        assert_eq!(config.current_input(), PathBuf::from("./.cur_input"));
        assert_eq!(config.seed_dir(), PathBuf::from("./fifo/queue"));
    }

    #[test]
    fn test_builder() {
        let config = HybridConfig::builder()
            .output_dir("/out")
            .current_input("/out/input")
            .filter_mode(FilterMode::Coverage)
            .save_whole(true)
            .build();
        assert_eq!(config.current_input(), PathBuf::from("/out/input"));
        assert!(config.save_whole);
        assert_eq!(FilterMode::try_from(0).unwrap(), FilterMode::Coverage);
        assert!(FilterMode::try_from(2).is_err());
    }

    #[test]
    #[serial]
    fn test_from_env() {
        env::set_var(OUTPUT_DIR_ENV, "/work/out");
        env::set_var(TREE_DIR_ENV, "");
        env::remove_var(LOG_DIR_ENV);

        let config = HybridConfig::from_env();
        assert_eq!(config.output_dir, PathBuf::from("/work/out"));
        assert_eq!(config.tree_dir, PathBuf::from("."));
        assert_eq!(config.log_dir, PathBuf::from("."));
        assert_eq!(config.current_input(), PathBuf::from("/work/out/.cur_input"));

        env::remove_var(OUTPUT_DIR_ENV);
        env::remove_var(TREE_DIR_ENV);
    }

    #[test]
    fn test_serde() {
        let config = HybridConfig::builder().tree_dir("/trees").build();
        let json = serde_json::to_string(&config).unwrap();
        let back: HybridConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.tree_dir, PathBuf::from("/trees"));
        assert_eq!(back.prefix_map_bytes, config.prefix_map_bytes);
    }
}
