// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The exchange fabric: the collaborator that actually moves bytes.
//!
//! The harness treats the fabric as the subject under test. It sees only the
//! [`Fabric`] trait: an abortable group barrier plus the vectored all-to-all
//! operation parameterized by per-peer element counts, element displacements
//! and a committed layout on each side.
//!
//! The pack/unpack engine lives here too: packing walks a layout's typemap
//! element by element and streams the touched bytes in pack order; unpacking
//! is its inverse. The driver reuses it to move pattern bytes between
//! validation and message buffers through a layout, so the same engine is
//! exercised on both the self-move and the group exchange paths. All buffer
//! access is bounds-checked; a typemap position outside the payload is an
//! error, never a wild write.

mod local;

pub use local::LocalFabric;

use thiserror::Error;

use crate::layout::CommittedLayout;

#[derive(Debug, Error)]
pub enum FabricError {
    /// Another participant flagged a fatal failure; the group is unwinding.
    #[error("group aborted by participant {rank}")]
    Aborted { rank: usize },

    #[error(
        "layout walk left {buffer} buffer bounds: element {element}, byte offset {offset}, payload {len} bytes"
    )]
    OutOfBounds {
        buffer: &'static str,
        element: usize,
        offset: isize,
        len: usize,
    },

    #[error("peer {peer} stream carries {got} bytes, receiver expects {want}")]
    StreamSizeMismatch { peer: usize, got: usize, want: usize },

    #[error("pack stream exhausted: {got} bytes for {want} expected")]
    StreamExhausted { got: usize, want: usize },

    #[error("no stream deposited for peer {peer}")]
    MissingStream { peer: usize },

    #[error("fabric state poisoned by a crashed participant")]
    Poisoned,
}

/// Send half of a vectored all-to-all.
pub struct SendSide<'a> {
    pub payload: &'a [u8],
    /// Payload index of the layout's logical offset zero.
    pub origin: isize,
    pub counts: &'a [usize],
    pub displs: &'a [usize],
    pub layout: &'a CommittedLayout,
}

/// Receive half of a vectored all-to-all.
pub struct RecvSide<'a> {
    pub payload: &'a mut [u8],
    pub origin: isize,
    pub counts: &'a [usize],
    pub displs: &'a [usize],
    pub layout: &'a CommittedLayout,
}

/// Group-wide synchronization and data movement.
pub trait Fabric {
    fn world_size(&self) -> usize;

    /// Block until every participant arrives, or until someone aborts.
    fn barrier(&self, rank: usize) -> Result<(), FabricError>;

    /// Flag the group as failed and wake every parked participant.
    fn abort(&self, rank: usize);

    /// The vectored all-to-all under test. Blocks until the local side's
    /// data movement is complete.
    fn alltoallv(
        &self,
        rank: usize,
        send: SendSide<'_>,
        recv: RecvSide<'_>,
    ) -> Result<(), FabricError>;
}

/// Stream `count` elements out of `payload` in pack order, appending to `out`.
///
/// Element `first + i` sits at `origin + (first + i) * extent`; each typemap
/// segment is read relative to that.
pub fn pack_elements(
    payload: &[u8],
    origin: isize,
    layout: &CommittedLayout,
    first: usize,
    count: usize,
    out: &mut Vec<u8>,
) -> Result<(), FabricError> {
    let extent = layout.extents().extent as isize;
    for i in 0..count {
        let element = first + i;
        let base = origin + element as isize * extent;
        for segment in layout.segments() {
            let start = base + segment.offset();
            let range = checked_range(start, segment.len(), payload.len(), "send", element)?;
            out.extend_from_slice(&payload[range]);
        }
    }
    Ok(())
}

/// Inverse of [`pack_elements`]: scatter `src` into `payload` through the
/// layout. Returns the bytes consumed.
pub fn unpack_elements(
    payload: &mut [u8],
    origin: isize,
    layout: &CommittedLayout,
    first: usize,
    count: usize,
    src: &[u8],
) -> Result<usize, FabricError> {
    let extent = layout.extents().extent as isize;
    let mut cursor = 0usize;
    for i in 0..count {
        let element = first + i;
        let base = origin + element as isize * extent;
        for segment in layout.segments() {
            let start = base + segment.offset();
            let range = checked_range(start, segment.len(), payload.len(), "recv", element)?;
            let next = cursor + segment.len();
            if next > src.len() {
                return Err(FabricError::StreamExhausted {
                    got: src.len(),
                    want: count * layout.byte_size(),
                });
            }
            payload[range].copy_from_slice(&src[cursor..next]);
            cursor = next;
        }
    }
    Ok(cursor)
}

fn checked_range(
    start: isize,
    len: usize,
    payload_len: usize,
    buffer: &'static str,
    element: usize,
) -> Result<std::ops::Range<usize>, FabricError> {
    if start < 0 || start as usize + len > payload_len {
        return Err(FabricError::OutOfBounds {
            buffer,
            element,
            offset: start,
            len: payload_len,
        });
    }
    let start = start as usize;
    Ok(start..start + len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{Layout, ScalarKind};

    #[test]
    fn pack_reads_typemap_order_unpack_inverts() {
        // Backward single-element blocks: pack order differs from address
        // order, so a round trip through a linear buffer must reverse twice.
        let layout = Layout::strided(3, 1, -1, Layout::scalar(ScalarKind::I32))
            .unwrap()
            .commit()
            .unwrap();
        let origin = -layout.extents().true_lower_bound;
        let mut payload = vec![0u8; layout.extents().true_extent];
        let src: Vec<u8> = (1..=12).collect();
        let consumed =
            unpack_elements(&mut payload, origin, &layout, 0, 1, &src).unwrap();
        assert_eq!(consumed, 12);
        // First packed word lands highest in memory.
        assert_eq!(&payload[8..12], &[1, 2, 3, 4]);
        assert_eq!(&payload[0..4], &[9, 10, 11, 12]);

        let mut out = Vec::new();
        pack_elements(&payload, origin, &layout, 0, 1, &mut out).unwrap();
        assert_eq!(out, src);
    }

    #[test]
    fn pack_respects_element_displacements() {
        let layout = Layout::scalar(ScalarKind::I16).commit().unwrap();
        let payload: Vec<u8> = (0..10).collect();
        let mut out = Vec::new();
        pack_elements(&payload, 0, &layout, 2, 2, &mut out).unwrap();
        assert_eq!(out, vec![4, 5, 6, 7]);
    }

    #[test]
    fn struct_scatter_lands_each_part_at_its_displacement() {
        use crate::layout::StructPart;
        // i8 at 0 and i64-sized slot at 4, like a split header.
        let layout = Layout::structure(vec![
            StructPart {
                base: Layout::scalar(ScalarKind::I8),
                displacement: 0,
                block_len: 1,
            },
            StructPart {
                base: Layout::scalar(ScalarKind::I64),
                displacement: 4,
                block_len: 1,
            },
        ])
        .unwrap()
        .commit()
        .unwrap();
        let mut payload = vec![0u8; 12];
        let src: Vec<u8> = (1..=9).collect();
        unpack_elements(&mut payload, 0, &layout, 0, 1, &src).unwrap();
        assert_eq!(payload[0], 1);
        assert_eq!(&payload[1..4], &[0, 0, 0]);
        assert_eq!(&payload[4..12], &[2, 3, 4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn out_of_bounds_walk_is_an_error() {
        let layout = Layout::scalar(ScalarKind::I64).commit().unwrap();
        let payload = vec![0u8; 8];
        let mut out = Vec::new();
        let err = pack_elements(&payload, 0, &layout, 1, 1, &mut out).unwrap_err();
        assert!(matches!(err, FabricError::OutOfBounds { .. }));
    }

    #[test]
    fn short_stream_is_an_error() {
        let layout = Layout::scalar(ScalarKind::I32).commit().unwrap();
        let mut payload = vec![0u8; 8];
        let err = unpack_elements(&mut payload, 0, &layout, 0, 2, &[1, 2, 3]).unwrap_err();
        assert!(matches!(err, FabricError::StreamExhausted { .. }));
    }
}
