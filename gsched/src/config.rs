//! Configuration read from `gsched/config.json` in xdg config directories
//! and from environment variables.
//!
//! `GSCHED_DEBUG` is a bitmask, see [DebugMask].
//! `GSCHED_COPIES` overrides [`Config::n_copies`].

use crate::{backend::dummy::DummyConfig, error::SchedError, scheduler::MAX_COPIES};
use nanoserde::DeJson;

/// Default number of nodes the scheduler is sized for
pub const DEFAULT_GRAPH_SIZE: usize = 2048;

/// Which debug messages get printed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DebugMask(u32);

impl DebugMask {
    #[must_use]
    pub const fn new(mask: u32) -> DebugMask {
        DebugMask(mask)
    }

    /// Reads `GSCHED_DEBUG`, zero if not set
    #[must_use]
    pub fn from_env() -> DebugMask {
        DebugMask(std::env::var("GSCHED_DEBUG").ok().and_then(|x| x.parse().ok()).unwrap_or(0))
    }

    /// Node assignments and splits
    #[must_use]
    pub const fn sched(&self) -> bool {
        self.0 % 2 == 1
    }

    /// Graph allocation and reservation
    #[must_use]
    pub const fn alloc(&self) -> bool {
        (self.0 >> 1) % 2 == 1
    }

    /// Split computation
    #[must_use]
    pub const fn compute(&self) -> bool {
        (self.0 >> 2) % 2 == 1
    }

    /// Event records and waits
    #[must_use]
    pub const fn events(&self) -> bool {
        (self.0 >> 3) % 2 == 1
    }

    /// Backend registration and initialization
    #[must_use]
    pub const fn registry(&self) -> bool {
        (self.0 >> 4) % 2 == 1
    }
}

/// Configuration of the host cpu backend
#[derive(DeJson, Debug, Clone, Default)]
pub struct CpuConfig {
    /// Worker threads, 0 means one per core
    #[nserde(default)]
    pub n_threads: usize,
}

/// Scheduler and backend configuration
#[derive(DeJson, Debug, Clone, Default)]
pub struct Config {
    /// Copies of split inputs for pipelining, 0 means 1
    #[nserde(default)]
    pub n_copies: usize,
    /// Expected number of nodes, 0 means [DEFAULT_GRAPH_SIZE]
    #[nserde(default)]
    pub graph_size: usize,
    /// Debug bitmask, `GSCHED_DEBUG` takes precedence
    #[nserde(default)]
    pub debug: u32,
    /// Cpu backend configuration
    #[nserde(default)]
    pub cpu: CpuConfig,
    /// Configuration of dummy device for testing
    #[nserde(default)]
    pub dummy: DummyConfig,
}

impl Config {
    /// Parses config from json
    pub fn from_json(json: &str) -> Result<Config, SchedError> {
        Config::deserialize_json(json).map_err(|e| SchedError::parse_error(format!("config, {e}")))
    }

    /// Searches xdg config directories for `gsched/config.json`, then applies environment variables.
    /// If not found or failed to parse, uses defaults.
    #[must_use]
    pub fn load() -> Config {
        let debug = DebugMask::from_env();
        let mut config = xdg::BaseDirectories::new()
            .map_err(|e| {
                if debug.registry() {
                    println!("Failed to find config directories for config.json, {e}");
                }
            })
            .ok()
            .map(|bd| {
                let mut dirs = bd.get_config_dirs();
                dirs.push(bd.get_config_home());
                dirs
            })
            .and_then(|paths| {
                paths.into_iter().find_map(|mut path| {
                    path.push("gsched/config.json");
                    std::fs::read_to_string(&path).ok()
                })
            })
            .and_then(|file| {
                Config::from_json(&file)
                    .map_err(|e| {
                        if debug.registry() {
                            println!("Failed to parse config.json, {e}");
                        }
                    })
                    .ok()
            })
            .unwrap_or_else(|| {
                if debug.registry() {
                    println!("Failed to get config, using defaults.");
                }
                Config::default()
            });
        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        if let Ok(x) = std::env::var("GSCHED_DEBUG") {
            if let Ok(x) = x.parse::<u32>() {
                self.debug = x;
            }
        }
        if let Ok(x) = std::env::var("GSCHED_COPIES") {
            if let Ok(x) = x.parse::<usize>() {
                self.n_copies = x;
            }
        }
    }

    #[must_use]
    pub fn debug_mask(&self) -> DebugMask {
        DebugMask(self.debug)
    }

    /// Number of copies, clamped to `1..=MAX_COPIES`
    #[must_use]
    pub fn copies(&self) -> usize {
        self.n_copies.clamp(1, MAX_COPIES)
    }

    #[must_use]
    pub fn graph_size(&self) -> usize {
        if self.graph_size == 0 {
            DEFAULT_GRAPH_SIZE
        } else {
            self.graph_size
        }
    }
}
