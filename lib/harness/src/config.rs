// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Run configuration.

use std::fmt;
use std::str::FromStr;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Restrict the matrix to one position.
///
/// `case` is the 1-based sequence number within the level; 0 runs the whole
/// level. Filtered-out cases still consume their position so the ordering
/// stays deterministic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseFilter {
    pub level: u8,
    pub case: usize,
}

impl FromStr for CaseFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (level, case) = s
            .split_once(',')
            .ok_or_else(|| format!("expected LEVEL,CASE, got {s:?}"))?;
        Ok(CaseFilter {
            level: level
                .trim()
                .parse()
                .map_err(|e| format!("bad level in {s:?}: {e}"))?,
            case: case
                .trim()
                .parse()
                .map_err(|e| format!("bad case in {s:?}: {e}"))?,
        })
    }
}

impl fmt::Display for CaseFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.level, self.case)
    }
}

/// Configuration for one harness run.
#[derive(Debug, Clone, Builder, Validate, Serialize, Deserialize)]
pub struct RunConfig {
    /// Shuffles which items are exchanged between which participants.
    #[builder(default = "0")]
    pub seed: u64,

    /// Items each participant considers sending to each peer.
    #[validate(range(min = 1))]
    #[builder(default = "10")]
    pub item_count: usize,

    /// Iterations of every matrix case.
    #[validate(range(min = 1))]
    #[builder(default = "2")]
    pub iterations: u32,

    /// Probability that a given item is sent to a given peer.
    #[validate(range(min = 0.0, max = 1.0))]
    #[builder(default = "0.5")]
    pub prob_item: f64,

    /// Probability that a participant sends anything to a given peer.
    #[validate(range(min = 0.0, max = 1.0))]
    #[builder(default = "0.85")]
    pub prob_rank: f64,

    /// Probability that a participant takes part in the run at all.
    #[validate(range(min = 0.0, max = 1.0))]
    #[builder(default = "0.9")]
    pub prob_world: f64,

    /// Run only one matrix position.
    #[builder(default)]
    pub only: Option<CaseFilter>,

    /// Which participant emits the expensive diagnostics (layout dumps,
    /// pattern dumps); -1 means all of them.
    #[builder(default = "0")]
    pub dump_rank: i64,
}

impl RunConfig {
    pub fn builder() -> RunConfigBuilder {
        RunConfigBuilder::default()
    }

    /// Whether `rank` should emit heavyweight diagnostics.
    pub fn dumps_enabled(&self, rank: usize) -> bool {
        self.dump_rank == -1 || self.dump_rank == rank as i64
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig::builder().build().expect("defaults are complete")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = RunConfig::default();
        config.validate().unwrap();
        assert_eq!(config.item_count, 10);
        assert_eq!(config.iterations, 2);
        assert!(config.only.is_none());
    }

    #[test]
    fn out_of_range_probability_is_rejected() {
        let config = RunConfig::builder().prob_item(1.5).build().unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn case_filter_parses_and_round_trips() {
        let filter: CaseFilter = "2,13".parse().unwrap();
        assert_eq!(filter, CaseFilter { level: 2, case: 13 });
        assert_eq!(filter.to_string(), "2,13");
        assert!("2".parse::<CaseFilter>().is_err());
        assert!("x,1".parse::<CaseFilter>().is_err());
    }
}
