// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Flattened byte maps.
//!
//! A committed layout carries its typemap: the ordered list of byte ranges
//! one element touches, offsets relative to the element origin. Pack order is
//! the recursive-descent order of the tree, which is what defines the byte
//! sequence a packed exchange carries.

use derive_getters::Getters;

use super::{Layout, LayoutError};

/// One contiguous byte range of an element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Getters)]
pub struct Segment {
    /// Byte offset relative to the element origin; negative for layouts whose
    /// data starts below their logical origin.
    #[getter(copy)]
    offset: isize,

    /// Length in bytes.
    #[getter(copy)]
    len: usize,
}

impl Segment {
    pub fn new(offset: isize, len: usize) -> Self {
        Self { offset, len }
    }
}

/// Flatten a layout into its typemap, coalescing runs that are adjacent both
/// in pack order and in memory.
pub(super) fn segments(layout: &Layout) -> Result<Vec<Segment>, LayoutError> {
    let mut out = Vec::new();
    walk(layout, 0, &mut out)?;
    Ok(coalesce(out))
}

fn walk(layout: &Layout, origin: isize, out: &mut Vec<Segment>) -> Result<(), LayoutError> {
    match layout {
        Layout::Scalar(kind) => {
            out.push(Segment::new(origin, kind.width_bytes()));
            Ok(())
        }
        Layout::Contiguous { count, base } => {
            let ext = base.extents()?.extent as isize;
            for k in 0..*count {
                walk(base, origin + k as isize * ext, out)?;
            }
            Ok(())
        }
        Layout::Strided {
            block_count,
            block_len,
            stride,
            base,
        } => {
            let ext = base.extents()?.extent as isize;
            for block in 0..*block_count as isize {
                for k in 0..*block_len as isize {
                    walk(base, origin + (block * stride + k) * ext, out)?;
                }
            }
            Ok(())
        }
        Layout::Struct { parts } => {
            if parts.is_empty() {
                return Err(LayoutError::EmptyStruct);
            }
            for part in parts {
                let ext = part.base.extents()?.extent as isize;
                for k in 0..part.block_len as isize {
                    walk(&part.base, origin + part.displacement + k * ext, out)?;
                }
            }
            Ok(())
        }
        Layout::Resized { inner, .. } => walk(inner, origin, out),
    }
}

fn coalesce(segments: Vec<Segment>) -> Vec<Segment> {
    let mut out: Vec<Segment> = Vec::with_capacity(segments.len());
    for seg in segments {
        if let Some(last) = out.last_mut() {
            if last.offset + last.len as isize == seg.offset {
                last.len += seg.len;
                continue;
            }
        }
        out.push(seg);
    }
    out
}
