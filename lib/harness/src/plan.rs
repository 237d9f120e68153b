// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Exchange plans and topology randomization.
//!
//! Every matrix case exchanges the same randomized topology: per peer, how
//! many logical items go in each direction and where each peer's segment
//! starts. Counts and displacements are in logical elements; the driver
//! scales them by the case's count multiplier.
//!
//! Each participant's draws come from its own generator seeded with
//! `seed + rank`, one draw per decision in a fixed order, so the whole
//! group's topology is a pure function of (seed, world size, item count) and
//! every participant can derive any peer's tables without an extra exchange.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::RunConfig;

/// Per-peer counts and displacements for one participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangePlan {
    pub send_counts: Vec<usize>,
    pub recv_counts: Vec<usize>,
    pub send_displs: Vec<usize>,
    pub recv_displs: Vec<usize>,
    /// For each peer: that peer's own send-side displacement for its segment
    /// to us. Validation-only metadata.
    pub remote_send_displs: Vec<usize>,
    pub total_send: usize,
    pub total_recv: usize,
}

/// Build every participant's plan for the run.
pub fn build_group_plans(config: &RunConfig, world_size: usize) -> Vec<ExchangePlan> {
    let items = config.item_count;
    let mut rngs: Vec<StdRng> = (0..world_size)
        .map(|rank| StdRng::seed_from_u64(config.seed.wrapping_add(rank as u64)))
        .collect();

    // First draw per participant: does it take part at all.
    let active: Vec<bool> = rngs
        .iter_mut()
        .map(|rng| rng.gen_bool(config.prob_world))
        .collect();

    // send_items[rank][peer] = items rank sends to peer.
    let mut send_counts = vec![vec![0usize; world_size]; world_size];
    for (rank, rng) in rngs.iter_mut().enumerate() {
        for peer in 0..world_size {
            let pair_on = rng.gen_bool(config.prob_rank);
            for _ in 0..items {
                let item_on = rng.gen_bool(config.prob_item);
                if item_on && pair_on && active[rank] && active[peer] {
                    send_counts[rank][peer] += 1;
                }
            }
        }
    }

    let send_displs: Vec<Vec<usize>> = send_counts.iter().map(|row| prefix_sums(row)).collect();

    (0..world_size)
        .map(|rank| {
            let recv_counts: Vec<usize> =
                (0..world_size).map(|peer| send_counts[peer][rank]).collect();
            let recv_displs = prefix_sums(&recv_counts);
            let remote_send_displs: Vec<usize> =
                (0..world_size).map(|peer| send_displs[peer][rank]).collect();
            let total_send = send_counts[rank].iter().sum();
            let total_recv = recv_counts.iter().sum();
            ExchangePlan {
                send_counts: send_counts[rank].clone(),
                recv_counts,
                send_displs: send_displs[rank].clone(),
                recv_displs,
                remote_send_displs,
                total_send,
                total_recv,
            }
        })
        .collect()
}

fn prefix_sums(counts: &[usize]) -> Vec<usize> {
    let mut displs = Vec::with_capacity(counts.len());
    let mut running = 0;
    for &count in counts {
        displs.push(running);
        running += count;
    }
    displs
}
