// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Layout descriptors and extent computation.
//!
//! A [`Layout`] is an immutable tree describing how the bytes of one logical
//! element are arranged in memory: a flat scalar, a contiguous run, a strided
//! run of blocks (possibly gapped or running backward), a struct of displaced
//! parts, or a resized wrapper that overrides the declared geometry without
//! touching the data footprint.
//!
//! Two spans matter for every descriptor and are computed by [`Layout::extents`]:
//! - the *declared* span (`lower_bound`, `extent`): the per-repetition stride
//!   used when the descriptor is repeated as an element of something larger;
//! - the *true* span (`true_lower_bound`, `true_extent`): the byte range that
//!   actually carries data, which negative strides and resizes can push either
//!   above or below the declared span.
//!
//! Descriptors are built once per test case, committed via [`Layout::commit`]
//! (which caches geometry and the flattened byte map), and released by drop.

pub mod catalog;
mod typemap;

pub use typemap::Segment;

use std::fmt;
use std::sync::Arc;

use strum::{Display, EnumIter};
use thiserror::Error;

/// Errors for malformed descriptor trees.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LayoutError {
    #[error("struct layout requires at least one part")]
    EmptyStruct,

    #[error("strided layout requires a positive block count")]
    ZeroBlockCount,

    #[error("strided layout requires a positive block length")]
    ZeroBlockLength,

    #[error("layout byte size overflows while computing {0}")]
    SizeOverflow(&'static str),

    #[error("send/recv element sizes differ: {send} != {recv} bytes")]
    MismatchedElementSizes { send: usize, recv: usize },
}

/// Primitive numeric kinds usable as layout leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ScalarKind {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
}

impl ScalarKind {
    /// Width of one value of this kind in bytes.
    pub fn width_bytes(self) -> usize {
        match self {
            ScalarKind::I8 | ScalarKind::U8 => 1,
            ScalarKind::I16 | ScalarKind::U16 => 2,
            ScalarKind::I32 | ScalarKind::U32 | ScalarKind::F32 => 4,
            ScalarKind::I64 | ScalarKind::U64 | ScalarKind::F64 => 8,
        }
    }
}

/// One part of a struct layout: `block_len` repetitions of `base` starting at
/// a byte displacement relative to the struct origin.
#[derive(Debug, Clone)]
pub struct StructPart {
    pub base: Arc<Layout>,
    pub displacement: isize,
    pub block_len: usize,
}

/// A structural description of how repeated logical elements map onto bytes.
#[derive(Debug, Clone)]
pub enum Layout {
    Scalar(ScalarKind),
    Contiguous {
        count: usize,
        base: Arc<Layout>,
    },
    Strided {
        block_count: usize,
        block_len: usize,
        /// Signed, in units of `base`'s extent. Negative strides lay blocks
        /// out backward; strides larger than `block_len` leave gaps.
        stride: isize,
        base: Arc<Layout>,
    },
    Struct {
        parts: Vec<StructPart>,
    },
    Resized {
        inner: Arc<Layout>,
        lower_bound: isize,
        extent: usize,
    },
}

/// Geometry of a layout: declared span, true span, and data byte count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extents {
    pub lower_bound: isize,
    pub extent: usize,
    pub true_lower_bound: isize,
    pub true_extent: usize,
    pub byte_size: usize,
}

impl fmt::Display for Extents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "span {}:{} (true {}:{}), size {}",
            self.lower_bound,
            self.lower_bound + self.extent as isize,
            self.true_lower_bound,
            self.true_lower_bound + self.true_extent as isize,
            self.byte_size
        )
    }
}

impl Layout {
    /// A scalar leaf. Scalars are process-wide constants; sharing the `Arc`
    /// is free.
    pub fn scalar(kind: ScalarKind) -> Arc<Layout> {
        Arc::new(Layout::Scalar(kind))
    }

    /// `count` back-to-back repetitions of `base`.
    pub fn contiguous(count: usize, base: Arc<Layout>) -> Arc<Layout> {
        Arc::new(Layout::Contiguous { count, base })
    }

    /// `block_count` blocks of `block_len` elements, block origins spaced by
    /// `stride` element extents.
    pub fn strided(
        block_count: usize,
        block_len: usize,
        stride: isize,
        base: Arc<Layout>,
    ) -> Result<Arc<Layout>, LayoutError> {
        if block_count == 0 {
            return Err(LayoutError::ZeroBlockCount);
        }
        if block_len == 0 {
            return Err(LayoutError::ZeroBlockLength);
        }
        Ok(Arc::new(Layout::Strided {
            block_count,
            block_len,
            stride,
            base,
        }))
    }

    /// A struct of displaced parts.
    pub fn structure(parts: Vec<StructPart>) -> Result<Arc<Layout>, LayoutError> {
        if parts.is_empty() {
            return Err(LayoutError::EmptyStruct);
        }
        Ok(Arc::new(Layout::Struct { parts }))
    }

    /// Override `inner`'s declared geometry without changing its data
    /// footprint.
    pub fn resized(
        inner: Arc<Layout>,
        lower_bound: isize,
        extent: usize,
    ) -> Arc<Layout> {
        Arc::new(Layout::Resized {
            inner,
            lower_bound,
            extent,
        })
    }

    /// Compute the declared and true spans plus the data byte count.
    ///
    /// Pure; fails only on malformed nesting (empty struct, overflowing
    /// sizes — strided validation happens at construction).
    pub fn extents(&self) -> Result<Extents, LayoutError> {
        match self {
            Layout::Scalar(kind) => {
                let w = kind.width_bytes();
                Ok(Extents {
                    lower_bound: 0,
                    extent: w,
                    true_lower_bound: 0,
                    true_extent: w,
                    byte_size: w,
                })
            }
            Layout::Contiguous { count, base } => {
                let b = base.extents()?;
                let n = *count;
                let byte_size = n
                    .checked_mul(b.byte_size)
                    .ok_or(LayoutError::SizeOverflow("contiguous size"))?;
                // A count of zero still reports one unit's declared extent so
                // the degenerate type keeps a usable stride.
                if n == 0 {
                    return Ok(Extents {
                        lower_bound: b.lower_bound,
                        extent: b.extent,
                        true_lower_bound: b.true_lower_bound,
                        true_extent: 0,
                        byte_size: 0,
                    });
                }
                let extent = n
                    .checked_mul(b.extent)
                    .ok_or(LayoutError::SizeOverflow("contiguous extent"))?;
                Ok(Extents {
                    lower_bound: b.lower_bound,
                    extent,
                    true_lower_bound: b.true_lower_bound,
                    // No trailing padding beyond the last repetition's data.
                    true_extent: (n - 1) * b.extent + b.true_extent,
                    byte_size,
                })
            }
            Layout::Strided {
                block_count,
                block_len,
                stride,
                base,
            } => {
                let b = base.extents()?;
                let ext = b.extent as isize;
                let count = *block_count as isize;
                let len = *block_len as isize;
                // Element indices covered: block j holds j*stride .. j*stride+len-1.
                let (min_elem, max_elem) = if *stride >= 0 {
                    (0, stride * (count - 1) + len - 1)
                } else {
                    (stride * (count - 1), len - 1)
                };
                let lower_bound = b.lower_bound + min_elem * ext;
                let upper_bound = b.lower_bound + (max_elem + 1) * ext;
                let true_lower_bound = b.true_lower_bound + min_elem * ext;
                let true_upper = b.true_lower_bound + max_elem * ext + b.true_extent as isize;
                let byte_size = block_count
                    .checked_mul(*block_len)
                    .and_then(|n| n.checked_mul(b.byte_size))
                    .ok_or(LayoutError::SizeOverflow("strided size"))?;
                Ok(Extents {
                    lower_bound,
                    extent: (upper_bound - lower_bound) as usize,
                    true_lower_bound,
                    true_extent: (true_upper - true_lower_bound) as usize,
                    byte_size,
                })
            }
            Layout::Struct { parts } => {
                if parts.is_empty() {
                    return Err(LayoutError::EmptyStruct);
                }
                let mut lower = isize::MAX;
                let mut upper = isize::MIN;
                let mut true_lower = isize::MAX;
                let mut true_upper = isize::MIN;
                let mut byte_size = 0usize;
                for part in parts {
                    let b = part.base.extents()?;
                    let n = part.block_len as isize;
                    lower = lower.min(part.displacement + b.lower_bound);
                    upper = upper.max(part.displacement + b.lower_bound + n * b.extent as isize);
                    true_lower = true_lower.min(part.displacement + b.true_lower_bound);
                    true_upper = true_upper.max(
                        part.displacement
                            + (n - 1) * b.extent as isize
                            + b.true_lower_bound
                            + b.true_extent as isize,
                    );
                    byte_size = part
                        .block_len
                        .checked_mul(b.byte_size)
                        .and_then(|s| byte_size.checked_add(s))
                        .ok_or(LayoutError::SizeOverflow("struct size"))?;
                }
                Ok(Extents {
                    lower_bound: lower,
                    extent: (upper - lower) as usize,
                    true_lower_bound: true_lower,
                    true_extent: (true_upper - true_lower) as usize,
                    byte_size,
                })
            }
            Layout::Resized {
                inner,
                lower_bound,
                extent,
            } => {
                let b = inner.extents()?;
                // The declared window wins on both spans; only the byte count
                // survives from the wrapped layout.
                Ok(Extents {
                    lower_bound: *lower_bound,
                    extent: *extent,
                    true_lower_bound: *lower_bound,
                    true_extent: *extent,
                    byte_size: b.byte_size,
                })
            }
        }
    }

    /// Commit this descriptor: cache its geometry and flattened byte map.
    pub fn commit(&self) -> Result<CommittedLayout, LayoutError> {
        let extents = self.extents()?;
        let segments = typemap::segments(self)?;
        Ok(CommittedLayout {
            layout: Arc::new(self.clone()),
            extents,
            segments,
        })
    }

    /// One-line structural dump of the tree.
    pub fn describe(&self) -> String {
        match self {
            Layout::Scalar(kind) => kind.to_string(),
            Layout::Contiguous { count, base } => {
                format!("contig({} x {})", count, base.describe())
            }
            Layout::Strided {
                block_count,
                block_len,
                stride,
                base,
            } => format!(
                "strided({} x {} stride {} of {})",
                block_count,
                block_len,
                stride,
                base.describe()
            ),
            Layout::Struct { parts } => {
                let inner: Vec<String> = parts
                    .iter()
                    .map(|p| {
                        if p.block_len == 1 {
                            format!("{}@{}", p.base.describe(), p.displacement)
                        } else {
                            format!("{} x {}@{}", p.block_len, p.base.describe(), p.displacement)
                        }
                    })
                    .collect();
                format!("struct{{{}}}", inner.join(", "))
            }
            Layout::Resized {
                inner,
                lower_bound,
                extent,
            } => format!(
                "resized(lb {} ext {} of {})",
                lower_bound,
                extent,
                inner.describe()
            ),
        }
    }
}

/// A committed layout: the immutable tree plus cached geometry and the
/// flattened byte map used by the pack/unpack engine.
#[derive(Debug, Clone)]
pub struct CommittedLayout {
    layout: Arc<Layout>,
    extents: Extents,
    segments: Vec<Segment>,
}

impl CommittedLayout {
    pub fn layout(&self) -> &Arc<Layout> {
        &self.layout
    }

    pub fn extents(&self) -> Extents {
        self.extents
    }

    /// Data segments of one element in pack order, offsets relative to the
    /// element origin.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Data bytes in one element.
    pub fn byte_size(&self) -> usize {
        self.extents.byte_size
    }
}
