// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Guarded buffers for one test case.
//!
//! Every case works on four buffers: the send/recv message buffers the
//! exchange operates on, and the send/recv validation buffers holding the
//! packed byte pattern. Each buffer is wrapped in fixed-length sentinel
//! margins; message and validation buffers use distinct sentinel values so a
//! report can name the buffer class that was overrun, not just the fact.

use thiserror::Error;

use crate::layout::CommittedLayout;

/// Margin length on each side of a payload.
pub const GUARD_LEN: usize = 30;

/// Sentinel byte for message-buffer margins.
pub const MESSAGE_SENTINEL: u8 = 127;

/// Sentinel byte for validation-buffer margins.
pub const VALIDATION_SENTINEL: u8 = 128;

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("buffer sizing overflowed for {buffer} ({elements} elements)")]
    InvalidSizing {
        buffer: &'static str,
        elements: usize,
    },
}

/// Which sentinel family a buffer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferClass {
    Message,
    Validation,
}

impl BufferClass {
    pub fn sentinel(self) -> u8 {
        match self {
            BufferClass::Message => MESSAGE_SENTINEL,
            BufferClass::Validation => VALIDATION_SENTINEL,
        }
    }
}

/// A guard margin failed its sentinel sweep. Data corruption has already
/// happened; the run cannot be trusted past this point.
#[derive(Debug, Error)]
#[error(
    "{buffer} {edge} guard overwritten at offset {offset}: found {found}, expected {expected} ({checkpoint})"
)]
pub struct GuardViolation {
    pub buffer: &'static str,
    pub edge: GuardEdge,
    pub offset: usize,
    pub found: u8,
    pub expected: u8,
    pub checkpoint: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardEdge {
    Pre,
    Post,
}

impl std::fmt::Display for GuardEdge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GuardEdge::Pre => write!(f, "preamble"),
            GuardEdge::Post => write!(f, "post"),
        }
    }
}

/// A byte payload flanked by sentinel-filled margins.
#[derive(Debug)]
pub struct GuardedBuffer {
    name: &'static str,
    class: BufferClass,
    bytes: Vec<u8>,
    payload_len: usize,
}

impl GuardedBuffer {
    pub fn new(name: &'static str, class: BufferClass, payload_len: usize) -> Self {
        let mut bytes = vec![class.sentinel(); payload_len + 2 * GUARD_LEN];
        bytes[GUARD_LEN..GUARD_LEN + payload_len].fill(0);
        Self {
            name,
            class,
            bytes,
            payload_len,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn payload(&self) -> &[u8] {
        &self.bytes[GUARD_LEN..GUARD_LEN + self.payload_len]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.bytes[GUARD_LEN..GUARD_LEN + self.payload_len]
    }

    /// Overwrite the whole payload with one value (hole markers between
    /// iterations).
    pub fn fill_payload(&mut self, value: u8) {
        self.payload_mut().fill(value);
    }

    /// Sweep both margins against the class sentinel.
    pub fn check_guards(&self, checkpoint: &str) -> Result<(), GuardViolation> {
        let expected = self.class.sentinel();
        let (pre, rest) = self.bytes.split_at(GUARD_LEN);
        let post = &rest[self.payload_len..];
        for (offset, &found) in pre.iter().enumerate() {
            if found != expected {
                return Err(self.violation(GuardEdge::Pre, offset, found, checkpoint));
            }
        }
        for (offset, &found) in post.iter().enumerate() {
            if found != expected {
                return Err(self.violation(GuardEdge::Post, offset, found, checkpoint));
            }
        }
        Ok(())
    }

    fn violation(
        &self,
        edge: GuardEdge,
        offset: usize,
        found: u8,
        checkpoint: &str,
    ) -> GuardViolation {
        GuardViolation {
            buffer: self.name,
            edge,
            offset,
            found,
            expected: self.class.sentinel(),
            checkpoint: checkpoint.to_string(),
        }
    }
}

/// The four buffers of one case, plus the origin shifts that map each
/// layout's logical offset zero into its message payload.
#[derive(Debug)]
pub struct CaseBuffers {
    pub send_msg: GuardedBuffer,
    pub recv_msg: GuardedBuffer,
    pub send_val: GuardedBuffer,
    pub recv_val: GuardedBuffer,
    pub send_origin: isize,
    pub recv_origin: isize,
}

impl CaseBuffers {
    /// Size and allocate the case buffers.
    ///
    /// Message buffers hold `elements` repetitions spaced by the declared
    /// extent, but only the last repetition's true footprint: interior
    /// elements may pad, the tail never does. Validation buffers hold the
    /// packed data bytes only.
    pub fn plan(
        send: &CommittedLayout,
        recv: &CommittedLayout,
        send_elements: usize,
        recv_elements: usize,
    ) -> Result<Self, BufferError> {
        let send_len = message_len(send, send_elements, "send message")?;
        let recv_len = message_len(recv, recv_elements, "recv message")?;
        let send_packed = send
            .byte_size()
            .checked_mul(send_elements)
            .ok_or(BufferError::InvalidSizing {
                buffer: "send validation",
                elements: send_elements,
            })?;
        let recv_packed = recv
            .byte_size()
            .checked_mul(recv_elements)
            .ok_or(BufferError::InvalidSizing {
                buffer: "recv validation",
                elements: recv_elements,
            })?;
        Ok(Self {
            send_msg: GuardedBuffer::new("send message", BufferClass::Message, send_len),
            recv_msg: GuardedBuffer::new("recv message", BufferClass::Message, recv_len),
            send_val: GuardedBuffer::new("send validation", BufferClass::Validation, send_packed),
            recv_val: GuardedBuffer::new("recv validation", BufferClass::Validation, recv_packed),
            send_origin: -send.extents().true_lower_bound,
            recv_origin: -recv.extents().true_lower_bound,
        })
    }

    /// Sweep all eight margins. First violation wins; any violation is fatal
    /// to the whole run.
    pub fn check_all(&self, checkpoint: &str) -> Result<(), GuardViolation> {
        self.send_msg.check_guards(checkpoint)?;
        self.recv_msg.check_guards(checkpoint)?;
        self.send_val.check_guards(checkpoint)?;
        self.recv_val.check_guards(checkpoint)?;
        Ok(())
    }
}

fn message_len(
    layout: &CommittedLayout,
    elements: usize,
    buffer: &'static str,
) -> Result<usize, BufferError> {
    let e = layout.extents();
    if elements == 0 {
        return Ok(0);
    }
    (elements - 1)
        .checked_mul(e.extent)
        .and_then(|interior| interior.checked_add(e.true_extent))
        .ok_or(BufferError::InvalidSizing { buffer, elements })
}
