// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The exhaustive test-matrix driver.
//!
//! Four levels run in a fixed order: the scalar sweep, the 7x7 cross of
//! level-2 shapes, the 6x6 cross of level-3 structs, and the two composite
//! cases. Every case follows the same barrier-delimited pipeline: generate
//! descriptors, compute geometry, plan guarded buffers, stage the pattern,
//! exchange, sweep guards, validate, synchronize. The first fatal condition
//! aborts the whole group; a `--only` filter skips cases without disturbing
//! the deterministic ordering.

use std::fmt;
use std::thread;

use thiserror::Error;
use tracing::{debug, info, info_span, trace};

use crate::buffers::{BufferError, CaseBuffers, GuardViolation};
use crate::config::RunConfig;
use crate::fabric::{
    Fabric, FabricError, LocalFabric, RecvSide, SendSide, pack_elements, unpack_elements,
};
use crate::layout::catalog::{self, CatalogError, Variant};
use crate::layout::{Layout, LayoutError, ScalarKind};
use crate::pattern;
use crate::plan::{ExchangePlan, build_group_plans};

/// Elements per logical item in the level-2 sweep.
const LEVEL2_ELEMENTS: usize = 12;

/// One position in the matrix: level plus 1-based case number within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaseId {
    pub level: u8,
    pub case: usize,
}

impl fmt::Display for CaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.level, self.case)
    }
}

/// Fatal per-case conditions. Every variant aborts the whole group.
#[derive(Debug, Error)]
pub enum CaseError {
    #[error("case {case}: malformed layout: {source}")]
    MalformedLayout {
        case: CaseId,
        source: LayoutError,
    },

    #[error("case {case}: {source}")]
    Catalog {
        case: CaseId,
        source: CatalogError,
    },

    #[error("case {case}: invalid buffer sizing: {source}")]
    InvalidBufferSizing {
        case: CaseId,
        source: BufferError,
    },

    #[error("case {case}: guard overrun: {source}")]
    GuardOverrun {
        case: CaseId,
        source: GuardViolation,
    },

    #[error("case {case}: pattern mismatch: {mismatches} bytes wrong, first at offset {first}")]
    PatternMismatch {
        case: CaseId,
        mismatches: usize,
        first: usize,
    },

    #[error("case {case}: exchange failed: {source}")]
    Exchange {
        case: CaseId,
        source: FabricError,
    },
}

/// Byte and case counters for one participant, merged group-wide at the end.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub cases_executed: u64,
}

impl RunStats {
    /// Bytes accumulate across participants; the case count does not (every
    /// participant walks the same matrix).
    pub fn merge(&mut self, other: RunStats) {
        self.bytes_sent += other.bytes_sent;
        self.bytes_received += other.bytes_received;
        self.cases_executed = self.cases_executed.max(other.cases_executed);
    }
}

/// Drives the matrix for one participant.
pub struct MatrixDriver<'a, F: Fabric> {
    fabric: &'a F,
    rank: usize,
    plan: &'a ExchangePlan,
    config: &'a RunConfig,
    stats: RunStats,
}

impl<'a, F: Fabric> MatrixDriver<'a, F> {
    pub fn new(fabric: &'a F, rank: usize, plan: &'a ExchangePlan, config: &'a RunConfig) -> Self {
        Self {
            fabric,
            rank,
            plan,
            config,
            stats: RunStats::default(),
        }
    }

    /// Run the whole matrix. The first fatal condition flags the group and
    /// returns; peers unwind from their next synchronization point.
    pub fn run(mut self) -> Result<RunStats, CaseError> {
        self.run_level1()?;
        self.run_level2()?;
        self.run_level3()?;
        self.run_level4()?;
        debug!(stats = ?self.stats, "participant finished matrix");
        Ok(self.stats)
    }

    fn level_enabled(&self, level: u8) -> bool {
        self.config.only.is_none_or(|f| f.level == level)
    }

    fn case_skipped(&self, seq: usize) -> bool {
        self.config
            .only
            .is_some_and(|f| f.case != 0 && f.case != seq)
    }

    /// Level 1: each scalar kind against itself.
    fn run_level1(&mut self) -> Result<(), CaseError> {
        if !self.level_enabled(1) {
            return Ok(());
        }
        for index in 0..catalog::LEVEL1_VARIANTS {
            let case = CaseId {
                level: 1,
                case: index + 1,
            };
            if self.case_skipped(case.case) {
                continue;
            }
            info!(%case, "starting case");
            let variant = self.variant(case, catalog::level1(index))?;
            self.execute_case(case, variant.clone(), variant)?;
            self.checkpoint(case)?;
        }
        Ok(())
    }

    /// Level 2: every pairing of level-2 shapes over a shared base, so every
    /// send form must interoperate with every receive form.
    fn run_level2(&mut self) -> Result<(), CaseError> {
        if !self.level_enabled(2) {
            return Ok(());
        }
        let base = Layout::scalar(ScalarKind::I32);
        let mut seq = 0;
        for send_index in 0..catalog::LEVEL2_VARIANTS {
            for recv_index in 0..catalog::LEVEL2_VARIANTS {
                seq += 1;
                let case = CaseId { level: 2, case: seq };
                if self.case_skipped(seq) {
                    continue;
                }
                info!(%case, send_index, recv_index, "starting case");
                let send = self.variant(
                    case,
                    catalog::level2(send_index, LEVEL2_ELEMENTS, base.clone()),
                )?;
                let recv = self.variant(
                    case,
                    catalog::level2(recv_index, LEVEL2_ELEMENTS, base.clone()),
                )?;
                self.execute_case(case, send, recv)?;
                self.checkpoint(case)?;
            }
        }
        Ok(())
    }

    /// Level 3: every pairing of two-part struct shapes over a fixed base pair.
    fn run_level3(&mut self) -> Result<(), CaseError> {
        if !self.level_enabled(3) {
            return Ok(());
        }
        let base_a = Layout::scalar(ScalarKind::I32);
        let base_b = Layout::scalar(ScalarKind::I8);
        let mut seq = 0;
        for send_index in 0..catalog::LEVEL3_VARIANTS {
            for recv_index in 0..catalog::LEVEL3_VARIANTS {
                seq += 1;
                let case = CaseId { level: 3, case: seq };
                if self.case_skipped(seq) {
                    continue;
                }
                info!(%case, send_index, recv_index, "starting case");
                let send =
                    self.variant(case, catalog::level3(send_index, base_a.clone(), base_b.clone()))?;
                let recv =
                    self.variant(case, catalog::level3(recv_index, base_a.clone(), base_b.clone()))?;
                self.execute_case(case, send, recv)?;
                self.checkpoint(case)?;
            }
        }
        Ok(())
    }

    /// Level 4: hand-built composites.
    fn run_level4(&mut self) -> Result<(), CaseError> {
        if !self.level_enabled(4) {
            return Ok(());
        }
        for index in 0..catalog::LEVEL4_VARIANTS {
            let case = CaseId {
                level: 4,
                case: index + 1,
            };
            if self.case_skipped(case.case) {
                continue;
            }
            info!(%case, "starting case");
            let (send, recv) = match catalog::level4(index, self.rank) {
                Ok(pair) => pair,
                Err(source) => return Err(CaseError::Catalog { case, source }),
            };
            self.execute_case(case, send, recv)?;
            self.checkpoint(case)?;
        }
        Ok(())
    }

    fn variant(
        &self,
        case: CaseId,
        result: Result<Variant, CatalogError>,
    ) -> Result<Variant, CaseError> {
        result.map_err(|source| CaseError::Catalog { case, source })
    }

    fn checkpoint(&self, case: CaseId) -> Result<(), CaseError> {
        self.fabric
            .barrier(self.rank)
            .map_err(|source| CaseError::Exchange { case, source })
    }

    /// Run one case; on failure flag the group so peers stop waiting.
    fn execute_case(&mut self, case: CaseId, send: Variant, recv: Variant) -> Result<(), CaseError> {
        let result = self.try_case(case, send, recv);
        if result.is_err() {
            self.fabric.abort(self.rank);
        }
        result
    }

    fn try_case(&mut self, case: CaseId, send: Variant, recv: Variant) -> Result<(), CaseError> {
        let send_layout = send
            .layout
            .commit()
            .map_err(|source| CaseError::MalformedLayout { case, source })?;
        let recv_layout = recv
            .layout
            .commit()
            .map_err(|source| CaseError::MalformedLayout { case, source })?;

        if self.config.dumps_enabled(self.rank) {
            trace!(%case, layout = %send.layout.describe(), geometry = %send_layout.extents(), "send layout");
            trace!(%case, layout = %recv.layout.describe(), geometry = %recv_layout.extents(), "recv layout");
        }

        // Both sides must agree on the logical element byte size or the
        // exchange cannot conserve bytes.
        let element_size = send_layout.byte_size() * send.multiplier;
        let recv_element_size = recv_layout.byte_size() * recv.multiplier;
        if element_size != recv_element_size {
            return Err(CaseError::MalformedLayout {
                case,
                source: LayoutError::MismatchedElementSizes {
                    send: element_size,
                    recv: recv_element_size,
                },
            });
        }

        let total_send = self.plan.total_send * send.multiplier;
        let total_recv = self.plan.total_recv * recv.multiplier;
        let scale = |values: &[usize], factor: usize| -> Vec<usize> {
            values.iter().map(|v| v * factor).collect()
        };
        let send_counts = scale(&self.plan.send_counts, send.multiplier);
        let send_displs = scale(&self.plan.send_displs, send.multiplier);
        let recv_counts = scale(&self.plan.recv_counts, recv.multiplier);
        let recv_displs = scale(&self.plan.recv_displs, recv.multiplier);

        let mut buffers = CaseBuffers::plan(&send_layout, &recv_layout, total_send, total_recv)
            .map_err(|source| CaseError::InvalidBufferSizing { case, source })?;
        self.sweep_guards(&buffers, case, "after allocation")?;

        for iteration in 0..self.config.iterations {
            pattern::fill(buffers.send_val.payload_mut(), self.rank, iteration);
            // Hole markers: bytes the exchange never writes must keep these.
            buffers.send_msg.fill_payload(0);
            buffers.recv_msg.fill_payload(1);
            self.sweep_guards(&buffers, case, "after pattern fill")?;

            // Stage the packed pattern into the message buffer through the
            // send layout, exercising the same engine the exchange uses.
            let send_origin = buffers.send_origin;
            unpack_elements(
                buffers.send_msg.payload_mut(),
                send_origin,
                &send_layout,
                0,
                total_send,
                buffers.send_val.payload(),
            )
            .map_err(|source| CaseError::Exchange { case, source })?;
            self.sweep_guards(&buffers, case, "after staging send data")?;

            self.fabric
                .alltoallv(
                    self.rank,
                    SendSide {
                        payload: buffers.send_msg.payload(),
                        origin: buffers.send_origin,
                        counts: &send_counts,
                        displs: &send_displs,
                        layout: &send_layout,
                    },
                    RecvSide {
                        payload: buffers.recv_msg.payload_mut(),
                        origin: buffers.recv_origin,
                        counts: &recv_counts,
                        displs: &recv_displs,
                        layout: &recv_layout,
                    },
                )
                .map_err(|source| CaseError::Exchange { case, source })?;
            self.sweep_guards(&buffers, case, "after exchange")?;
            self.checkpoint(case)?;

            // Extract what arrived back into packed form for validation.
            let mut extracted = Vec::with_capacity(recv_layout.byte_size() * total_recv);
            pack_elements(
                buffers.recv_msg.payload(),
                buffers.recv_origin,
                &recv_layout,
                0,
                total_recv,
                &mut extracted,
            )
            .map_err(|source| CaseError::Exchange { case, source })?;
            buffers.recv_val.payload_mut().copy_from_slice(&extracted);
            self.sweep_guards(&buffers, case, "after extracting results")?;

            let report = pattern::validate(
                buffers.recv_val.payload(),
                element_size,
                &self.plan.recv_counts,
                &self.plan.remote_send_displs,
                iteration,
            );
            if !report.is_clean() {
                if self.config.dumps_enabled(self.rank) {
                    debug!(%case, "validation dump:\n{}", report.dump(buffers.recv_val.payload()));
                }
                return Err(CaseError::PatternMismatch {
                    case,
                    mismatches: report.mismatches(),
                    first: report.first_mismatch().unwrap_or_default(),
                });
            }

            self.stats.bytes_sent += (send_layout.byte_size() * total_send) as u64;
            self.stats.bytes_received += (recv_layout.byte_size() * total_recv) as u64;
        }

        self.stats.cases_executed += 1;
        Ok(())
    }

    fn sweep_guards(
        &self,
        buffers: &CaseBuffers,
        case: CaseId,
        checkpoint: &str,
    ) -> Result<(), CaseError> {
        buffers
            .check_all(checkpoint)
            .map_err(|source| CaseError::GuardOverrun { case, source })
    }
}

/// Group-level failure of a local run.
#[derive(Debug, Error)]
pub enum GroupError {
    #[error("invalid configuration: {0}")]
    Config(#[from] validator::ValidationErrors),

    #[error("a group needs at least one participant")]
    EmptyGroup,

    #[error("participant {rank} failed: {source}")]
    Participant {
        rank: usize,
        source: CaseError,
    },

    #[error("participant {rank} panicked")]
    Panicked { rank: usize },
}

/// Run the full matrix on an in-process group of `world_size` participants.
pub fn run_local_group(config: &RunConfig, world_size: usize) -> Result<RunStats, GroupError> {
    use validator::Validate;
    config.validate()?;
    if world_size == 0 {
        return Err(GroupError::EmptyGroup);
    }
    debug!(
        config = %serde_json::to_string(config).unwrap_or_default(),
        world_size,
        "starting matrix run"
    );

    let plans = build_group_plans(config, world_size);
    let fabric = LocalFabric::new(world_size);

    let results: Vec<Result<RunStats, GroupError>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..world_size)
            .map(|rank| {
                let fabric = &fabric;
                let plan = &plans[rank];
                scope.spawn(move || {
                    let span = info_span!("participant", rank);
                    let _guard = span.enter();
                    MatrixDriver::new(fabric, rank, plan, config).run()
                })
            })
            .collect();
        handles
            .into_iter()
            .enumerate()
            .map(|(rank, handle)| match handle.join() {
                Ok(Ok(stats)) => Ok(stats),
                Ok(Err(source)) => Err(GroupError::Participant { rank, source }),
                Err(_) => Err(GroupError::Panicked { rank }),
            })
            .collect()
    });

    // An abort raised by one participant echoes out of every peer's next
    // barrier; report the root cause, not an echo.
    fn is_abort_echo(err: &GroupError) -> bool {
        matches!(
            err,
            GroupError::Participant {
                source: CaseError::Exchange {
                    source: FabricError::Aborted { .. },
                    ..
                },
                ..
            }
        )
    }

    let mut merged = RunStats::default();
    let mut failure: Option<GroupError> = None;
    for result in results {
        match result {
            Ok(stats) => merged.merge(stats),
            Err(err) => {
                let replace = match &failure {
                    None => true,
                    Some(existing) => is_abort_echo(existing) && !is_abort_echo(&err),
                };
                if replace {
                    failure = Some(err);
                }
            }
        }
    }
    match failure {
        Some(err) => Err(err),
        None => {
            info!(
                bytes_sent = merged.bytes_sent,
                bytes_received = merged.bytes_received,
                cases = merged.cases_executed,
                "group finished clean"
            );
            Ok(merged)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CaseFilter;

    fn config_for(only: Option<CaseFilter>) -> RunConfig {
        RunConfig::builder()
            .seed(11)
            .item_count(4)
            .iterations(2)
            .only(only)
            .build()
            .unwrap()
    }

    #[test]
    fn level1_runs_nine_cases() {
        let config = config_for(Some(CaseFilter { level: 1, case: 0 }));
        let stats = run_local_group(&config, 2).unwrap();
        assert_eq!(stats.cases_executed, 9);
        assert!(stats.bytes_sent > 0);
    }

    #[test]
    fn only_filter_selects_a_single_case() {
        let config = config_for(Some(CaseFilter { level: 2, case: 13 }));
        let stats = run_local_group(&config, 2).unwrap();
        assert_eq!(stats.cases_executed, 1);
    }

    #[test]
    fn level4_composites_pass_with_asymmetric_group() {
        let config = config_for(Some(CaseFilter { level: 4, case: 0 }));
        let stats = run_local_group(&config, 3).unwrap();
        assert_eq!(stats.cases_executed, 2);
    }

    #[test]
    fn single_participant_group_is_valid() {
        let config = config_for(Some(CaseFilter { level: 3, case: 0 }));
        let stats = run_local_group(&config, 1).unwrap();
        assert_eq!(stats.cases_executed, 36);
    }

    #[test]
    fn empty_group_is_rejected() {
        let config = config_for(None);
        assert!(matches!(
            run_local_group(&config, 0),
            Err(GroupError::EmptyGroup)
        ));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = RunConfig::builder().prob_world(2.0).build().unwrap();
        assert!(matches!(
            run_local_group(&config, 2),
            Err(GroupError::Config(_))
        ));
    }

    #[test]
    fn stats_merge_sums_bytes_but_not_cases() {
        let mut a = RunStats {
            bytes_sent: 10,
            bytes_received: 20,
            cases_executed: 5,
        };
        a.merge(RunStats {
            bytes_sent: 1,
            bytes_received: 2,
            cases_executed: 5,
        });
        assert_eq!(a.bytes_sent, 11);
        assert_eq!(a.bytes_received, 22);
        assert_eq!(a.cases_executed, 5);
    }
}
