// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! CLI entry point: spin up a participant group and run the matrix.

use anyhow::Result;
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use allswap_harness::{CaseFilter, RunConfig, run_local_group};

/// Exchange deterministic byte patterns through dozens of layout shapes and
/// validate every byte that arrives.
///
/// The run is deterministic for a fixed seed, participant count, and option
/// set; the exchange fabric under test is free not to be.
#[derive(Debug, Parser)]
#[command(name = "allswap-run", version, about)]
struct Cli {
    /// Participants in the exchange group.
    #[arg(long, default_value_t = 4)]
    participants: usize,

    /// Seed shuffling which items are exchanged.
    #[arg(short, long, default_value_t = 0)]
    seed: u64,

    /// Items each participant considers sending to each peer.
    #[arg(short = 'c', long, default_value_t = 10)]
    item_count: usize,

    /// Probability that an item is sent to a peer.
    #[arg(short = 'i', long, default_value_t = 0.5)]
    prob_item: f64,

    /// Probability that a participant sends anything to a peer.
    #[arg(short = 'r', long, default_value_t = 0.85)]
    prob_rank: f64,

    /// Probability that a participant takes part at all.
    #[arg(short = 'w', long, default_value_t = 0.9)]
    prob_world: f64,

    /// Iterations of every matrix case.
    #[arg(short = 't', long, default_value_t = 2)]
    iters: u32,

    /// Run only one matrix position, e.g. "2,13"; case 0 runs a whole level.
    #[arg(short, long)]
    only: Option<CaseFilter>,

    /// Verbosity: 0 quiet, 1 cases, 2 diagnostics, 3 byte-level traces.
    #[arg(short, long, default_value_t = 0)]
    verbose: u8,

    /// Participant allowed to emit expensive dumps; -1 for all.
    #[arg(short = 'z', long, default_value_t = 0)]
    verbose_rank: i64,
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| {
            EnvFilter::new(format!("allswap_run={default},allswap_harness={default}"))
        });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = RunConfig::builder()
        .seed(cli.seed)
        .item_count(cli.item_count)
        .iterations(cli.iters)
        .prob_item(cli.prob_item)
        .prob_rank(cli.prob_rank)
        .prob_world(cli.prob_world)
        .only(cli.only)
        .dump_rank(cli.verbose_rank)
        .build()?;

    match run_local_group(&config, cli.participants) {
        Ok(stats) => {
            println!(
                "[OK] all cases passed. Executed {} cases with seed {} across {} participants ({} bytes sent, {} received).",
                stats.cases_executed,
                cli.seed,
                cli.participants,
                stats.bytes_sent,
                stats.bytes_received
            );
            Ok(())
        }
        Err(err) => {
            error!("{err:#}");
            eprintln!("TEST FAILED: {err}");
            std::process::exit(1);
        }
    }
}
