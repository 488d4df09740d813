/*
 * Copyright 2025 Security Union LLC
 *
 * Licensed under either of
 *
 * * Apache License, Version 2.0
 *   (http://www.apache.org/licenses/LICENSE-2.0)
 * * MIT license
 *   (http://opensource.org/licenses/MIT)
 *
 * at your option.
 *
 * Unless you explicitly state otherwise, any contribution intentionally
 * submitted for inclusion in the work by you, as defined in the Apache-2.0
 * license, shall be dual licensed as above, without any additional terms or
 * conditions.
 */

use std::collections::VecDeque;

use crate::frame::EncodedFrame;
use crate::{LhdcError, Result};

/// Ordered, bounded collection of frames awaiting decode.
///
/// Frames leave in insertion order. The bound is enforced by rejecting new
/// frames, never by evicting queued ones.
#[derive(Debug)]
pub struct PendingFrameQueue {
    /// MTU limiter: maximum number of queued frames
    limit: usize,
    frames: VecDeque<EncodedFrame>,
}

impl PendingFrameQueue {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            frames: VecDeque::with_capacity(limit),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.frames.len() >= self.limit
    }

    /// Free slots under the MTU limiter
    pub fn headroom(&self) -> usize {
        self.limit.saturating_sub(self.frames.len())
    }

    pub fn append(&mut self, frame: EncodedFrame) -> Result<()> {
        if self.is_full() {
            return Err(LhdcError::MtuLimit { limit: self.limit });
        }
        self.frames.push_back(frame);
        Ok(())
    }

    /// Insert at the head. Only the drift corrector does this.
    pub fn prepend(&mut self, frame: EncodedFrame) -> Result<()> {
        if self.is_full() {
            return Err(LhdcError::MtuLimit { limit: self.limit });
        }
        self.frames.push_front(frame);
        Ok(())
    }

    pub fn pop_front(&mut self) -> Option<EncodedFrame> {
        self.frames.pop_front()
    }

    pub fn front(&self) -> Option<&EncodedFrame> {
        self.frames.front()
    }

    /// Remove the first frame matching `predicate`.
    pub fn remove<F>(&mut self, predicate: F) -> Option<EncodedFrame>
    where
        F: Fn(&EncodedFrame) -> bool,
    {
        let index = self.frames.iter().position(predicate)?;
        self.frames.remove(index)
    }

    pub fn clear(&mut self) -> usize {
        let dropped = self.frames.len();
        self.frames.clear();
        dropped
    }

    pub fn iter(&self) -> impl Iterator<Item = &EncodedFrame> {
        self.frames.iter()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = EncodedFrame> + '_ {
        self.frames.drain(..)
    }
}
