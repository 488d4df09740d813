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

use serde::{Deserialize, Serialize};

/// Sequence number carried by drift-correction fillers.
pub const FILLER_SEQUENCE: u16 = u16::MAX;
/// Timestamp carried by drift-correction fillers.
pub const FILLER_TIMESTAMP: u32 = u32::MAX;

/// Identity of a frame within the transport stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FrameIdentity {
    /// Media header sequence number of the packet that carried the frame
    pub sequence_number: u16,
    /// Media header timestamp of the packet that carried the frame
    pub timestamp: u32,
    /// 1-based position of the frame inside its packet
    pub cur_sub_sequence: u8,
    /// Number of frames the packet declared
    pub total_sub_sequence: u8,
}

/// One codec frame extracted from a transport packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    pub identity: FrameIdentity,
    /// Encoded bytes; the length is the parsed frame length
    pub data: Vec<u8>,
}

impl EncodedFrame {
    pub fn new(identity: FrameIdentity, data: Vec<u8>) -> Self {
        Self { identity, data }
    }

    pub fn sequence_number(&self) -> u16 {
        self.identity.sequence_number
    }

    pub fn timestamp(&self) -> u32 {
        self.identity.timestamp
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Copy of this frame marked as a drift-correction filler.
    pub fn to_filler(&self, data: Vec<u8>) -> Self {
        Self {
            identity: FrameIdentity {
                sequence_number: FILLER_SEQUENCE,
                timestamp: FILLER_TIMESTAMP,
                ..self.identity
            },
            data,
        }
    }

    pub fn is_drift_filler(&self) -> bool {
        self.identity.sequence_number == FILLER_SEQUENCE
            && self.identity.timestamp == FILLER_TIMESTAMP
    }
}

/// Recycles frame byte buffers so steady-state ingestion does not allocate.
#[derive(Debug)]
pub struct FramePool {
    free: Vec<Vec<u8>>,
    max_retained: usize,
    allocations: u64,
}

impl FramePool {
    pub fn new(max_retained: usize) -> Self {
        Self {
            free: Vec::with_capacity(max_retained),
            max_retained,
            allocations: 0,
        }
    }

    /// Pre-allocate `count` buffers of `size` bytes.
    pub fn prefill(&mut self, count: usize, size: usize) {
        let count = count.min(self.max_retained);
        while self.free.len() < count {
            self.free.push(Vec::with_capacity(size));
            self.allocations += 1;
        }
        log::debug!("frame pool prefilled: {} buffers of {size} bytes", self.free.len());
    }

    /// Buffer holding exactly a copy of `bytes`.
    pub fn acquire_copy(&mut self, bytes: &[u8]) -> Vec<u8> {
        let mut buf = self.take();
        buf.extend_from_slice(bytes);
        buf
    }

    pub fn release(&mut self, mut buf: Vec<u8>) {
        if self.free.len() < self.max_retained {
            buf.clear();
            self.free.push(buf);
        }
    }

    /// Return a frame's buffer to the pool.
    pub fn recycle(&mut self, frame: EncodedFrame) {
        self.release(frame.data);
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Number of buffers the pool had to allocate itself
    pub fn allocations(&self) -> u64 {
        self.allocations
    }

    fn take(&mut self) -> Vec<u8> {
        match self.free.pop() {
            Some(buf) => buf,
            None => {
                self.allocations += 1;
                Vec::new()
            }
        }
    }
}
