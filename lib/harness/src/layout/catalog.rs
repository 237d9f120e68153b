// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The layout variant catalog driven by the test matrix.
//!
//! Four generator levels, selected by a (level, index) pair:
//! 1. bare scalar kinds;
//! 2. multiples of one base expressed contiguously or through strided blocks
//!    (gapped, half-filled, reversed);
//! 3. two-part structs over a pair of bases, with displacements derived from
//!    the bases' declared or true spans, plus a resized wrapper;
//! 4. hand-built composites: an asymmetric scalar/struct pairing and a
//!    four-level nested composition.
//!
//! Every generator is deterministic in its arguments; an index at or past a
//! level's variant count reports [`CatalogError::NoMoreVariants`], which the
//! driver uses to stop iterating rather than as a failure.

use std::sync::Arc;

use thiserror::Error;

use super::{Layout, LayoutError, ScalarKind, StructPart};

pub const LEVEL1_VARIANTS: usize = 9;
pub const LEVEL2_VARIANTS: usize = 7;
pub const LEVEL3_VARIANTS: usize = 6;
pub const LEVEL4_VARIANTS: usize = 2;

/// The scalar kinds swept by level 1.
const LEVEL1_KINDS: [ScalarKind; LEVEL1_VARIANTS] = [
    ScalarKind::I8,
    ScalarKind::F32,
    ScalarKind::I32,
    ScalarKind::U8,
    ScalarKind::I16,
    ScalarKind::U32,
    ScalarKind::I64,
    ScalarKind::U64,
    ScalarKind::F64,
];

#[derive(Debug, Error)]
pub enum CatalogError {
    /// The index walked past the level's last variant. Terminates iteration;
    /// not a failure.
    #[error("no variant {index} in level {level}")]
    NoMoreVariants { level: u8, index: usize },

    #[error(transparent)]
    Layout(#[from] LayoutError),
}

/// A generated descriptor plus the repetition count that makes one logical
/// element out of it.
#[derive(Debug, Clone)]
pub struct Variant {
    pub layout: Arc<Layout>,
    pub multiplier: usize,
}

impl Variant {
    fn new(layout: Arc<Layout>, multiplier: usize) -> Self {
        Self { layout, multiplier }
    }
}

/// Level 1: one scalar kind per index.
pub fn level1(index: usize) -> Result<Variant, CatalogError> {
    let kind = LEVEL1_KINDS
        .get(index)
        .ok_or(CatalogError::NoMoreVariants { level: 1, index })?;
    Ok(Variant::new(Layout::scalar(*kind), 1))
}

/// Split an element count into (block_count, block_len), trying divisors
/// 12, 5, 3, 2 in that order and falling back to single-element blocks.
fn block_split(element_count: usize) -> (usize, usize) {
    if element_count % 12 == 0 {
        (12, element_count / 12)
    } else if element_count % 5 == 0 {
        (element_count / 5, 5)
    } else if element_count % 3 == 0 {
        (element_count / 3, 3)
    } else if element_count % 2 == 0 {
        (element_count / 2, 2)
    } else {
        (element_count, 1)
    }
}

/// Level 2: `element_count` repetitions of `base` in various shapes.
pub fn level2(
    index: usize,
    element_count: usize,
    base: Arc<Layout>,
) -> Result<Variant, CatalogError> {
    let (blocks, per_block) = block_split(element_count);
    let len = per_block as isize;
    let variant = match index {
        // The base reused wholesale; the repetition count rides on the side.
        0 => Variant::new(base, element_count),
        1 => Variant::new(Layout::contiguous(element_count, base), 1),
        // Strided but numerically identical to contiguous.
        2 => Variant::new(Layout::strided(blocks, per_block, len, base)?, 1),
        // One empty element between blocks.
        3 => Variant::new(Layout::strided(blocks, per_block, len + 1, base)?, 1),
        // Exactly half the footprint filled.
        4 => Variant::new(Layout::strided(blocks, per_block, 2 * len, base)?, 1),
        // Contiguous, laid out backward.
        5 => Variant::new(Layout::strided(blocks, per_block, -len, base)?, 1),
        // Backward with a gap.
        6 => Variant::new(Layout::strided(blocks, per_block, -len - 1, base)?, 1),
        _ => return Err(CatalogError::NoMoreVariants { level: 2, index }),
    };
    Ok(variant)
}

/// Level 3: two-part structs of `base_a` and `base_b`.
pub fn level3(
    index: usize,
    base_a: Arc<Layout>,
    base_b: Arc<Layout>,
) -> Result<Variant, CatalogError> {
    let a = base_a.extents()?;
    let b = base_b.extents()?;
    let (displ_a, displ_b) = match index {
        // A first at its true origin, B immediately after A's data.
        0 | 5 => (-a.true_lower_bound, -b.true_lower_bound + a.true_extent as isize),
        // B first, then A, no space.
        1 => (-a.lower_bound + b.true_extent as isize, -b.true_lower_bound),
        // A at zero referencing its declared span, B after A's full extent.
        2 => (0, a.lower_bound - b.lower_bound + a.extent as isize),
        // Mirror of 2 with B first.
        3 => (a.lower_bound - b.lower_bound + b.extent as isize, 0),
        // A pushed down to -11, B after A's extent with slack.
        4 => (-11 - a.lower_bound, -b.true_lower_bound + a.extent as isize),
        _ => return Err(CatalogError::NoMoreVariants { level: 3, index }),
    };
    let layout = Layout::structure(vec![
        StructPart {
            base: base_a,
            displacement: displ_a,
            block_len: 1,
        },
        StructPart {
            base: base_b,
            displacement: displ_b,
            block_len: 1,
        },
    ])?;
    if index == 5 {
        let e = layout.extents()?;
        return Ok(Variant::new(
            Layout::resized(layout, e.lower_bound - 13, e.extent + 13),
            1,
        ));
    }
    Ok(Variant::new(layout, 1))
}

/// Level 4: hand-built composite cases. Returns the (send, recv) pair for
/// the given participant.
pub fn level4(index: usize, rank: usize) -> Result<(Variant, Variant), CatalogError> {
    match index {
        0 => {
            // Participant 0 sends plain bytes two at a time; everyone else
            // describes the same two bytes through a split struct.
            let variant = if rank == 0 {
                Variant::new(Layout::scalar(ScalarKind::I8), 2)
            } else {
                let split = Layout::structure(vec![
                    StructPart {
                        base: Layout::scalar(ScalarKind::I8),
                        displacement: -4,
                        block_len: 1,
                    },
                    StructPart {
                        base: Layout::scalar(ScalarKind::I8),
                        displacement: 4,
                        block_len: 1,
                    },
                ])?;
                Variant::new(split, 1)
            };
            Ok((variant.clone(), variant))
        }
        1 => {
            // Four levels of nesting: scalars -> displaced pairs -> struct of
            // structs -> a backward vector of 48 logical elements.
            let byte = Layout::scalar(ScalarKind::I8);
            let low = level3(4, Arc::clone(&byte), Arc::clone(&byte))?.layout;
            let dense = level3(2, Arc::clone(&byte), byte)?.layout;
            let pair = level3(2, low, dense)?.layout;
            let vector = level2(5, 48, pair)?;
            Ok((vector.clone(), vector))
        }
        _ => Err(CatalogError::NoMoreVariants { level: 4, index }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn block_split_prefers_twelve() {
        assert_eq!(block_split(12), (12, 1));
        assert_eq!(block_split(24), (12, 2));
        assert_eq!(block_split(10), (2, 5));
        assert_eq!(block_split(9), (3, 3));
        assert_eq!(block_split(14), (7, 2));
        assert_eq!(block_split(7), (7, 1));
    }

    #[test]
    fn level1_sentinels() {
        assert!(level1(0).is_ok());
        assert!(level1(LEVEL1_VARIANTS - 1).is_ok());
        assert!(matches!(
            level1(LEVEL1_VARIANTS),
            Err(CatalogError::NoMoreVariants { level: 1, .. })
        ));
    }

    #[rstest]
    #[case(2, 12)]
    #[case(3, 12)]
    #[case(4, 12)]
    #[case(5, 12)]
    #[case(6, 12)]
    fn level2_variants_carry_all_bytes(#[case] index: usize, #[case] count: usize) {
        let v = level2(index, count, Layout::scalar(ScalarKind::I32)).unwrap();
        let e = v.layout.extents().unwrap();
        assert_eq!(e.byte_size * v.multiplier, count * 4);
        assert_eq!(v.multiplier, 1);
    }

    #[test]
    fn level2_scalar_passthrough_multiplies() {
        let v = level2(0, 12, Layout::scalar(ScalarKind::I32)).unwrap();
        assert_eq!(v.multiplier, 12);
        assert_eq!(v.layout.extents().unwrap().byte_size, 4);
    }

    #[test]
    fn level2_concrete_strides() {
        // Count 12 decomposes to 12 single-element blocks.
        let gapped = level2(3, 12, Layout::scalar(ScalarKind::I32)).unwrap();
        match gapped.layout.as_ref() {
            Layout::Strided {
                block_count,
                block_len,
                stride,
                ..
            } => {
                assert_eq!((*block_count, *block_len, *stride), (12, 1, 2));
            }
            other => panic!("expected strided layout, got {}", other.describe()),
        }
        let backward = level2(5, 12, Layout::scalar(ScalarKind::I32)).unwrap();
        match backward.layout.as_ref() {
            Layout::Strided { stride, .. } => assert_eq!(*stride, -1),
            other => panic!("expected strided layout, got {}", other.describe()),
        }
    }

    #[test]
    fn level3_all_variants_same_size() {
        let a = Layout::scalar(ScalarKind::I32);
        let b = Layout::scalar(ScalarKind::I8);
        for index in 0..LEVEL3_VARIANTS {
            let v = level3(index, Arc::clone(&a), Arc::clone(&b)).unwrap();
            assert_eq!(v.layout.extents().unwrap().byte_size, 5, "variant {index}");
            assert_eq!(v.multiplier, 1);
        }
    }

    #[test]
    fn level3_resize_widens_by_thirteen() {
        let a = Layout::scalar(ScalarKind::I32);
        let b = Layout::scalar(ScalarKind::I8);
        let plain = level3(0, Arc::clone(&a), Arc::clone(&b)).unwrap();
        let resized = level3(5, a, b).unwrap();
        let pe = plain.layout.extents().unwrap();
        let re = resized.layout.extents().unwrap();
        assert_eq!(re.lower_bound, pe.lower_bound - 13);
        assert_eq!(re.extent, pe.extent + 13);
    }

    #[test]
    fn level4_sides_always_match_in_bytes() {
        for rank in 0..3 {
            for index in 0..LEVEL4_VARIANTS {
                let (send, recv) = level4(index, rank).unwrap();
                let s = send.layout.extents().unwrap();
                let r = recv.layout.extents().unwrap();
                assert_eq!(s.byte_size * send.multiplier, r.byte_size * recv.multiplier);
            }
        }
    }

    #[test]
    fn level4_asymmetric_pair_sizes_agree_across_ranks() {
        let (zero, _) = level4(0, 0).unwrap();
        let (other, _) = level4(0, 1).unwrap();
        let z = zero.layout.extents().unwrap();
        let o = other.layout.extents().unwrap();
        assert_eq!(z.byte_size * zero.multiplier, o.byte_size * other.multiplier);
    }

    #[test]
    fn generators_are_deterministic() {
        let first = level2(4, 12, Layout::scalar(ScalarKind::I32)).unwrap();
        let second = level2(4, 12, Layout::scalar(ScalarKind::I32)).unwrap();
        assert_eq!(
            first.layout.extents().unwrap(),
            second.layout.extents().unwrap()
        );
        assert_eq!(first.layout.describe(), second.layout.describe());
    }
}
