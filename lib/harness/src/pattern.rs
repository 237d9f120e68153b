// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Deterministic byte patterns and their metadata-only validator.
//!
//! The generator is a pure function of (byte index, writer rank, iteration):
//! the sequence starts at the iteration number and steps by `rank + 1` per
//! byte, wrapping through the byte representation. Values 0 and 1 are
//! remapped to 255 so they stay reserved as hole markers for bytes nothing
//! ever wrote.
//!
//! The validator rebuilds each peer's sequence from metadata alone: the
//! peer's own send-side displacement (in the peer's element units) gives the
//! byte index its segment started at, and from there the walk is identical
//! to the fill. It never reads sender memory.

use tracing::debug;

/// The value every reserved (0/1) counter byte is remapped to.
const HOLE_REMAP: u8 = 255;

/// Bytes per dump row.
const DUMP_ROW: usize = 10;

/// The byte a writer produces at a global byte index.
pub fn expected_byte(index: usize, writer: usize, iteration: u32) -> u8 {
    let raw = (iteration as u64).wrapping_add((writer as u64 + 1).wrapping_mul(index as u64)) as u8;
    if raw < 2 { HOLE_REMAP } else { raw }
}

/// Fill `buf` with this writer's sequence starting at byte index 0.
pub fn fill(buf: &mut [u8], writer: usize, iteration: u32) {
    for (index, byte) in buf.iter_mut().enumerate() {
        *byte = expected_byte(index, writer, iteration);
    }
}

/// Outcome of a validation walk.
#[derive(Debug)]
pub struct ValidationReport {
    mismatches: usize,
    first_mismatch: Option<usize>,
    expected: Vec<u8>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.mismatches == 0
    }

    pub fn mismatches(&self) -> usize {
        self.mismatches
    }

    pub fn first_mismatch(&self) -> Option<usize> {
        self.first_mismatch
    }

    /// Row-by-row dump of received versus expected bytes, flushing a row
    /// whenever its corruption status changes so the first divergent run is
    /// easy to localize.
    pub fn dump(&self, received: &[u8]) -> String {
        let mut out = String::new();
        let mut last_row_corrupt: Option<bool> = None;
        for (row_index, (got, want)) in received
            .chunks(DUMP_ROW)
            .zip(self.expected.chunks(DUMP_ROW))
            .enumerate()
        {
            let corrupt = got != want;
            if last_row_corrupt != Some(corrupt) {
                let mut line = format!("{:04}: ", row_index * DUMP_ROW);
                for (g, w) in got.iter().zip(want.iter()) {
                    line.push_str(&format!("{:3}-{:<3} ", g, w));
                }
                line.push_str(if corrupt { "-- CORRUPT" } else { "-- VALID" });
                line.push('\n');
                out.push_str(&line);
            }
            last_row_corrupt = Some(corrupt);
        }
        out
    }
}

/// Check `received` against every peer's reconstructed sequence.
///
/// `element_size` is the logical element byte size shared by both sides of
/// the exchange; `recv_counts` and `remote_send_displs` are in logical
/// elements, the latter being each peer's displacement in its own send
/// buffer. Peers are walked in increasing rank order, matching the packed
/// receive layout.
pub fn validate(
    received: &[u8],
    element_size: usize,
    recv_counts: &[usize],
    remote_send_displs: &[usize],
    iteration: u32,
) -> ValidationReport {
    debug_assert_eq!(recv_counts.len(), remote_send_displs.len());
    let mut expected = Vec::with_capacity(received.len());
    let mut mismatches = 0;
    let mut first_mismatch = None;
    let mut cursor = 0usize;
    for (peer, (&count, &displ)) in recv_counts.iter().zip(remote_send_displs).enumerate() {
        let start = element_size * displ;
        for index in 0..element_size * count {
            if cursor >= received.len() {
                break;
            }
            let want = expected_byte(start + index, peer, iteration);
            expected.push(want);
            if received[cursor] != want {
                mismatches += 1;
                first_mismatch.get_or_insert(cursor);
            }
            cursor += 1;
        }
    }
    if mismatches > 0 {
        debug!(mismatches, first_mismatch, "pattern validation failed");
    }
    ValidationReport {
        mismatches,
        first_mismatch,
        expected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn reserved_values_are_remapped() {
        // Iteration 0, writer 0: counter runs 0,1,2,... so the first two
        // bytes collapse to the hole remap value.
        let mut buf = [0u8; 4];
        fill(&mut buf, 0, 0);
        assert_eq!(buf, [255, 255, 2, 3]);
    }

    #[test]
    fn sequence_steps_by_writer_rank_plus_one() {
        let mut buf = [0u8; 5];
        fill(&mut buf, 2, 5);
        assert_eq!(buf, [5, 8, 11, 14, 17]);
    }

    #[test]
    fn counter_wraps_through_byte_range() {
        assert_eq!(expected_byte(128, 1, 0), HOLE_REMAP); // 256 wraps to 0
        assert_eq!(expected_byte(127, 1, 2), HOLE_REMAP); // 2 + 254 wraps to 0
        assert_eq!(expected_byte(100, 1, 2), (2u8).wrapping_add(200));
    }

    #[test]
    fn validator_reconstructs_multi_peer_stream() {
        // Two peers; peer 0 sent us elements starting at its displacement 3,
        // peer 1 starting at 0. Element size 4.
        let element_size = 4;
        let counts = [2usize, 3];
        let displs = [3usize, 0];
        let mut stream = Vec::new();
        for index in 0..element_size * counts[0] {
            stream.push(expected_byte(element_size * displs[0] + index, 0, 7));
        }
        for index in 0..element_size * counts[1] {
            stream.push(expected_byte(element_size * displs[1] + index, 1, 7));
        }
        let report = validate(&stream, element_size, &counts, &displs, 7);
        assert!(report.is_clean());
    }

    #[test]
    fn single_corrupt_byte_is_counted_and_located() {
        let counts = [4usize];
        let displs = [0usize];
        let mut stream: Vec<u8> = (0..16).map(|i| expected_byte(i, 0, 3)).collect();
        stream[9] ^= 0x40;
        let report = validate(&stream, 4, &counts, &displs, 3);
        assert_eq!(report.mismatches(), 1);
        assert_eq!(report.first_mismatch(), Some(9));
    }

    #[test]
    fn zero_count_peer_contributes_nothing() {
        let counts = [0usize, 2];
        let displs = [5usize, 1];
        let stream: Vec<u8> = (0..8).map(|i| expected_byte(8 + i, 1, 0)).collect();
        let report = validate(&stream, 4, &counts, &displs, 0);
        assert!(report.is_clean());
    }

    #[rstest]
    #[case(0, 0)]
    #[case(3, 1)]
    #[case(2, 9)]
    fn validation_is_idempotent(#[case] displ: usize, #[case] iteration: u32) {
        let counts = [3usize];
        let displs = [displ];
        let stream: Vec<u8> = (0..12)
            .map(|i| expected_byte(displs[0] * 4 + i, 0, iteration))
            .collect();
        let first = validate(&stream, 4, &counts, &displs, iteration);
        let second = validate(&stream, 4, &counts, &displs, iteration);
        assert_eq!(first.mismatches(), second.mismatches());
        assert_eq!(first.first_mismatch(), second.first_mismatch());
    }

    #[test]
    fn dump_flushes_rows_on_status_change() {
        let counts = [4usize];
        let displs = [0usize];
        let mut stream: Vec<u8> = (0..40).map(|i| expected_byte(i, 0, 4)).collect();
        stream[25] = 0;
        let report = validate(&stream, 10, &counts, &displs, 4);
        let dump = report.dump(&stream);
        let lines: Vec<&str> = dump.lines().collect();
        // Row 0 valid, row 2 corrupt, row 3 valid again; row 1 repeats row
        // 0's status and is elided.
        assert!(lines[0].starts_with("0000:"));
        assert!(lines[0].ends_with("-- VALID"));
        assert!(lines[1].starts_with("0020:"));
        assert!(lines[1].ends_with("-- CORRUPT"));
        assert!(lines[2].starts_with("0030:"));
        assert!(lines[2].ends_with("-- VALID"));
    }
}
