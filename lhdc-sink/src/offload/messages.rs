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

//! Envelopes and control messages exchanged with the offload decoder.

use crate::config::ChannelMode;
use crate::frame::{EncodedFrame, FrameIdentity};

/// Control messages sent from the feeder to the decoder thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMessage {
    /// New input is available
    Process,
    /// Stop touching the rings and exit
    Shutdown,
}

/// Frame identity carried alongside the encoded bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InFrameInfo {
    pub identity: FrameIdentity,
    pub channel_mode: ChannelMode,
}

/// One encoded frame on its way to the decoder
#[derive(Debug)]
pub struct InEnvelope {
    /// Reset generation the frame was submitted in
    pub epoch: u64,
    pub info: InFrameInfo,
    pub frame: EncodedFrame,
}

/// One tick's worth of PCM on its way back to the feeder
#[derive(Debug)]
pub struct OutEnvelope {
    pub epoch: u64,
    /// Identity of the last frame decoded into this envelope
    pub info: Option<InFrameInfo>,
    pub frame_samples: u32,
    pub decoded_frames: u32,
    /// Running count of input envelopes consumed when this envelope was last written
    pub frame_idx: u64,
    pub pcm: Vec<u8>,
    capacity: usize,
}

impl OutEnvelope {
    pub fn new(capacity: usize) -> Self {
        Self {
            epoch: 0,
            info: None,
            frame_samples: 0,
            decoded_frames: 0,
            frame_idx: 0,
            pcm: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.pcm.len() >= self.capacity
    }

    /// Clear for reuse in `epoch`.
    pub fn recycle(&mut self, epoch: u64) {
        self.epoch = epoch;
        self.info = None;
        self.frame_samples = 0;
        self.decoded_frames = 0;
        self.frame_idx = 0;
        self.pcm.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_envelope_recycle() {
        let mut env = OutEnvelope::new(32);
        env.pcm.extend_from_slice(&[1; 32]);
        env.decoded_frames = 2;
        env.info = Some(InFrameInfo::default());
        assert!(env.is_full());

        env.recycle(7);
        assert_eq!(env.epoch, 7);
        assert!(env.pcm.is_empty());
        assert!(env.info.is_none());
        assert_eq!(env.decoded_frames, 0);
        assert_eq!(env.capacity(), 32);
        assert!(env.pcm.capacity() >= 32);
    }
}
