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

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::config::ChannelMode;
use crate::frame::FrameIdentity;
use crate::packet::MediaHeader;

/// Snapshot of the most recently processed frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LastFrameInfo {
    pub sequence_number: u16,
    pub timestamp: u32,
    pub cur_sub_sequence: u8,
    pub total_sub_sequence: u8,
    /// Samples per channel in one decoded frame
    pub frame_samples: u32,
    /// Samples per queued frame used for queue-depth reporting
    pub list_samples: u32,
    /// Frames decoded since the stream was configured
    pub decoded_frames: u64,
    /// Frames accepted but not yet decoded
    pub undecoded_frames: u32,
    pub channel_mode: ChannelMode,
}

impl LastFrameInfo {
    /// Position of the frame inside its packet as a fraction in `[0, 1]`.
    pub fn packet_completion(&self) -> f32 {
        if self.total_sub_sequence == 0 {
            return 0.0;
        }
        self.cur_sub_sequence as f32 / self.total_sub_sequence as f32
    }

    /// Fraction of accepted frames already decoded.
    pub fn decode_completion(&self) -> f32 {
        let total = self.decoded_frames + self.undecoded_frames as u64;
        if total == 0 {
            return 0.0;
        }
        self.decoded_frames as f32 / total as f32
    }
}

/// Shared, last-write-wins publication point for [`LastFrameInfo`].
///
/// Clones share the same record, so a telemetry reader can hold one while
/// the decode path updates another.
#[derive(Debug, Clone, Default)]
pub struct LastFramePublisher {
    inner: Arc<Mutex<LastFrameInfo>>,
}

impl LastFramePublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> LastFrameInfo {
        match self.inner.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut LastFrameInfo),
    {
        match self.inner.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    /// Reset for a freshly configured stream.
    pub fn reset(&self, frame_samples: u32, channel_mode: ChannelMode) {
        self.update(|info| {
            *info = LastFrameInfo {
                frame_samples,
                list_samples: frame_samples,
                channel_mode,
                ..Default::default()
            };
        });
    }

    /// Reset to the identity of a packet about to be parsed.
    pub fn preparse(&self, media: &MediaHeader, frame_samples: u32) {
        self.update(|info| {
            *info = LastFrameInfo {
                sequence_number: media.sequence_number,
                timestamp: media.timestamp,
                frame_samples,
                list_samples: frame_samples,
                channel_mode: info.channel_mode,
                ..Default::default()
            };
        });
        log::debug!(
            "preparse seq {} timestamp {:08x}",
            media.sequence_number,
            media.timestamp
        );
    }

    /// Record decoded frames ending with `identity`.
    pub fn frames_decoded(
        &self,
        identity: &FrameIdentity,
        decoded: u64,
        undecoded: u32,
        frame_samples: u32,
        channel_mode: ChannelMode,
    ) {
        self.update(|info| {
            info.sequence_number = identity.sequence_number;
            info.timestamp = identity.timestamp;
            info.cur_sub_sequence = identity.cur_sub_sequence;
            info.total_sub_sequence = identity.total_sub_sequence;
            info.frame_samples = frame_samples;
            info.decoded_frames += decoded;
            info.undecoded_frames = undecoded;
            info.channel_mode = channel_mode;
        });
    }

    pub fn set_undecoded(&self, undecoded: u32) {
        self.update(|info| info.undecoded_frames = undecoded);
    }
}
