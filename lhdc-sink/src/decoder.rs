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

//! Direct decode path: one frame per output tick, decoded in the caller's context.

use crate::config::{ChannelMode, StreamConfig};
use crate::engine::CodecEngine;
use crate::frame::FramePool;
use crate::last_frame::LastFramePublisher;
use crate::queue::PendingFrameQueue;
use crate::{FatalError, LhdcError, Result};

/// Wrap an engine failure as a fatal error; the engine and queue are out of step.
pub(crate) fn engine_failure(err: LhdcError) -> LhdcError {
    if err.is_fatal() {
        err
    } else {
        FatalError::Engine(err.to_string()).into()
    }
}

#[derive(Debug)]
pub struct DirectDecoder {
    samples_per_frame: u32,
    frame_bytes: usize,
    channel_mode: ChannelMode,
}

impl DirectDecoder {
    pub fn new(config: &StreamConfig, samples_per_frame: u32) -> Self {
        Self {
            samples_per_frame,
            frame_bytes: config.frame_bytes(samples_per_frame),
            channel_mode: config.channel_mode,
        }
    }

    /// PCM bytes of one output tick
    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    pub fn set_channel_mode(&mut self, mode: ChannelMode) {
        self.channel_mode = mode;
    }

    /// Decode the head frame into `out`.
    ///
    /// `out` must be exactly one frame of PCM. An empty queue is reported as
    /// [`LhdcError::CacheUnderflow`] and leaves `out` untouched.
    pub fn decode(
        &mut self,
        out: &mut [u8],
        engine: &mut dyn CodecEngine,
        queue: &mut PendingFrameQueue,
        pool: &mut FramePool,
        last_frame: &LastFramePublisher,
    ) -> Result<usize> {
        if out.len() != self.frame_bytes {
            return Err(LhdcError::InvalidArgument(format!(
                "output buffer is {} bytes, one frame is {}",
                out.len(),
                self.frame_bytes
            )));
        }

        let Some(frame) = queue.pop_front() else {
            log::debug!("lhdc decode cache underflow");
            last_frame.set_undecoded(0);
            return Err(LhdcError::CacheUnderflow);
        };

        let produced = engine.decode_frame(out, &frame.data).map_err(engine_failure)?;
        if produced != self.frame_bytes {
            log::warn!(
                "decode produced {produced} bytes for frame of {} bytes (seq {} ts {} {}/{})",
                frame.len(),
                frame.sequence_number(),
                frame.timestamp(),
                frame.identity.cur_sub_sequence,
                frame.identity.total_sub_sequence
            );
            return Err(FatalError::PcmLengthMismatch {
                produced,
                expected: self.frame_bytes,
            }
            .into());
        }

        last_frame.frames_decoded(
            &frame.identity,
            1,
            queue.len() as u32,
            self.samples_per_frame,
            self.channel_mode,
        );
        pool.recycle(frame);
        Ok(produced)
    }
}
