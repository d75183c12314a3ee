//! TOML configuration file and command-line overrides.
//!
//! ```toml
//! [coordinator]
//! target_cpu = 4
//! sample_period = 0x1000
//!
//! [sim]
//! iterations = 65536
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use ibstrace_core::Config;
use ibstrace_host::SimConfig;
use serde::{Deserialize, Serialize};

use crate::cli::TargetArgs;

/// Contents of an `ibst` configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Coordinator parameters.
    pub coordinator: Config,
    /// Simulated unit parameters.
    pub sim: SimConfig,
}

impl Settings {
    /// Parses a configuration file body.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("invalid ibst configuration")
    }

    /// Loads `path`, or the defaults when no file is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("in {}", path.display()))
    }

    /// Applies command-line overrides on top of the file values.
    pub fn apply(&mut self, args: &TargetArgs) {
        let c = &mut self.coordinator;
        if let Some(cpu) = args.cpu {
            c.target_cpu = cpu;
        }
        if let Some(period) = args.period {
            c.sample_period = period;
        }
        if let Some(capacity) = args.capacity {
            c.sample_capacity = capacity;
        }
        if args.no_sampling {
            c.sampling = false;
        }
        if let Some(ms) = args.timeout_ms {
            c.dispatch_timeout_ms = Some(ms);
        }
        if let Some(iterations) = args.iterations {
            self.sim.iterations = iterations;
        }
    }
}
