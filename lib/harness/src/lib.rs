// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! # allswap harness
//!
//! Validates that a vectored all-to-all exchange moves bytes correctly no
//! matter how each side describes the memory layout of its elements.
//!
//! The pieces, leaves first:
//! - [`layout`]: descriptor trees, extent computation, the variant catalog;
//! - [`buffers`]: sentinel-guarded buffer planning and checking;
//! - [`pattern`]: deterministic byte patterns and the metadata-only validator;
//! - [`plan`]: randomized exchange topologies and per-peer tables;
//! - [`fabric`]: the exchange collaborator and the pack/unpack engine;
//! - [`driver`]: the exhaustive matrix over all of the above.

pub mod buffers;
pub mod config;
pub mod driver;
pub mod fabric;
pub mod layout;
pub mod pattern;
pub mod plan;

pub use config::{CaseFilter, RunConfig};
pub use driver::{GroupError, RunStats, run_local_group};
