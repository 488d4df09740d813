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

//! Packet reassembly: recover codec frame boundaries inside a transport packet
//! and move each frame into the pending queue.

use crate::config::{ChannelMode, ProtocolGeneration};
use crate::drift::DriftCorrector;
use crate::engine::CodecEngine;
use crate::frame::{EncodedFrame, FrameIdentity, FramePool};
use crate::packet::{LatencyClass, MediaHeader, PacketHeader, PACKET_HEADER_LEN};
use crate::queue::PendingFrameQueue;
use crate::{FatalError, LhdcError, Result};

/// Expected on-wire sequence number before the first packet arrives
pub const INITIAL_EXPECTED_SEQUENCE: u8 = 0xff;

/// Bytes of frame header copied in front of the right channel of a dual-mono frame
const SPLIT_FRAME_HEADER_LEN: usize = 2;

/// Whether a call advances the tracked on-wire sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceTracking {
    Update,
    Peek,
}

/// Result of reassembling one transport packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketOutcome {
    /// Frame count declared by the packet header
    pub declared_frames: u8,
    /// Frames appended to the pending queue
    pub frames_queued: usize,
    /// Payload bytes after the packet header
    pub payload_bytes: usize,
    /// Packets missing between the expected and observed sequence numbers
    pub lost_packets: u8,
    pub latency: Option<LatencyClass>,
}

/// Summary returned by [`Reassembler::validate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketSummary {
    pub frames: usize,
    /// Bytes that would be queued across all frames
    pub frame_bytes: usize,
}

/// Location of one frame inside the packet payload
#[derive(Debug, Clone, Copy)]
struct FrameSpan {
    offset: usize,
    frame_len: usize,
    is_split: bool,
}

impl FrameSpan {
    /// Payload bytes the frame occupies on the wire.
    fn wire_len(&self) -> usize {
        if self.is_split {
            (self.frame_len - SPLIT_FRAME_HEADER_LEN) * 2 + SPLIT_FRAME_HEADER_LEN
        } else {
            self.frame_len
        }
    }
}

#[derive(Debug)]
pub struct Reassembler {
    generation: ProtocolGeneration,
    channel_mode: ChannelMode,
    expected_sequence: u8,
    /// Set once the first packet after a reset has been tracked
    has_baseline: bool,
}

impl Reassembler {
    pub fn new(generation: ProtocolGeneration, channel_mode: ChannelMode) -> Self {
        Self {
            generation,
            channel_mode,
            expected_sequence: INITIAL_EXPECTED_SEQUENCE,
            has_baseline: false,
        }
    }

    pub fn expected_sequence(&self) -> u8 {
        self.expected_sequence
    }

    pub fn set_channel_mode(&mut self, mode: ChannelMode) {
        self.channel_mode = mode;
    }

    /// Forget the tracked sequence number. The next packet becomes the new baseline.
    pub fn reset(&mut self) {
        self.expected_sequence = INITIAL_EXPECTED_SEQUENCE;
        self.has_baseline = false;
    }

    /// Slice `packet` into frames and append them to `queue`.
    ///
    /// Stops with [`LhdcError::MtuLimit`] when the queue is full; frames
    /// appended before that stay queued. When `drift` is given it runs after
    /// every appended frame and a failed step aborts the rest of the packet.
    #[allow(clippy::too_many_arguments)]
    pub fn ingest(
        &mut self,
        media: &MediaHeader,
        packet: &[u8],
        tracking: SequenceTracking,
        engine: &dyn CodecEngine,
        queue: &mut PendingFrameQueue,
        pool: &mut FramePool,
        mut drift: Option<&mut DriftCorrector>,
    ) -> Result<PacketOutcome> {
        let Some(header) = PacketHeader::parse(self.generation, packet) else {
            log::debug!("packet of {} bytes has no header", packet.len());
            return Ok(PacketOutcome::default());
        };
        let payload = &packet[PACKET_HEADER_LEN..];
        let mut outcome = PacketOutcome {
            declared_frames: header.frame_count,
            payload_bytes: payload.len(),
            latency: header.latency,
            ..Default::default()
        };

        if header.frame_count == 0 {
            log::debug!("no frame in packet seq {}", media.sequence_number);
            return Ok(outcome);
        }
        outcome.lost_packets = self.check_continuity(header.sequence, tracking);

        let declared = header.frame_count;
        let channel_mode = self.channel_mode;
        let mut queued: u8 = 0;
        self.scan(payload, declared, engine, |span| {
            if queue.is_full() {
                log::warn!(
                    "MTU limiter hit: dropping frames {}..={declared} of seq {}",
                    queued + 1,
                    media.sequence_number
                );
                return Err(LhdcError::MtuLimit {
                    limit: queue.limit(),
                });
            }
            let data = copy_frame(payload, span, channel_mode, pool)?;
            queued += 1;
            let frame = EncodedFrame::new(
                FrameIdentity {
                    sequence_number: media.sequence_number,
                    timestamp: media.timestamp,
                    cur_sub_sequence: queued,
                    total_sub_sequence: declared,
                },
                data,
            );
            match drift.as_deref_mut() {
                Some(corrector) => {
                    let template = frame.clone();
                    queue.append(frame)?;
                    let reserved = (declared - queued) as usize;
                    corrector.adjust(queue, &template, reserved, pool)?;
                }
                None => queue.append(frame)?,
            }
            outcome.frames_queued += 1;
            Ok(())
        })?;

        log::trace!(
            "seq {} ts {}: queued {}/{} frames, queue {}",
            media.sequence_number,
            media.timestamp,
            outcome.frames_queued,
            declared,
            queue.len()
        );
        Ok(outcome)
    }

    /// Check that `packet` holds every frame it declares without queueing anything
    /// or advancing the tracked sequence number.
    pub fn validate(&self, packet: &[u8], engine: &dyn CodecEngine) -> Result<PacketSummary> {
        let header =
            PacketHeader::parse(self.generation, packet).ok_or(LhdcError::InputNotEnough)?;
        if self.has_baseline && header.sequence != self.expected_sequence {
            log::debug!(
                "peek: seq {} differs from expected {}",
                header.sequence,
                self.expected_sequence
            );
        }
        let payload = &packet[PACKET_HEADER_LEN..];
        let mut summary = PacketSummary {
            frames: 0,
            frame_bytes: 0,
        };
        let channel_mode = self.channel_mode;
        let scanned = self.scan(payload, header.frame_count, engine, |span| {
            if span.is_split && !channel_mode.is_split() {
                return Err(FatalError::CombinedStereoUnsupported.into());
            }
            summary.frames += 1;
            summary.frame_bytes += span.frame_len;
            Ok(())
        });
        match scanned {
            // a frame cut short by the packet end is missing data, not corruption
            Err(LhdcError::Fatal(FatalError::FrameOverrun {
                frame_len,
                offset,
                payload_len,
            })) => {
                log::debug!(
                    "peek: frame of {frame_len} bytes at {offset} exceeds payload of {payload_len}"
                );
                return Err(LhdcError::InputNotEnough);
            }
            other => {
                other?;
            }
        }
        if summary.frames < header.frame_count as usize {
            return Err(LhdcError::InputNotEnough);
        }
        Ok(summary)
    }

    /// Advisory continuity check. Returns the number of packets that appear lost.
    fn check_continuity(&mut self, observed: u8, tracking: SequenceTracking) -> u8 {
        if !self.has_baseline {
            log::debug!("sequence baseline {observed}");
            if tracking == SequenceTracking::Update {
                self.expected_sequence = observed.wrapping_add(1);
                self.has_baseline = true;
            }
            return 0;
        }
        let mut lost = 0;
        if observed != self.expected_sequence {
            let gap = observed.wrapping_sub(self.expected_sequence);
            log::warn!(
                "packet lost: now {observed}, expected {}",
                self.expected_sequence
            );
            if gap < 0x80 {
                lost = gap;
            }
        }
        if tracking == SequenceTracking::Update {
            self.expected_sequence = observed.wrapping_add(1);
        }
        lost
    }

    /// Walk frame boundaries, calling `visit` for each frame found.
    fn scan<F>(
        &self,
        payload: &[u8],
        declared: u8,
        engine: &dyn CodecEngine,
        mut visit: F,
    ) -> Result<usize>
    where
        F: FnMut(FrameSpan) -> Result<()>,
    {
        let mut offset = 0;
        let mut found = 0;
        while offset < payload.len() && found < declared as usize {
            let Some(info) = engine.fetch_frame_info(&payload[offset..]) else {
                log::debug!("no frame info at offset {offset} of {}", payload.len());
                break;
            };
            if info.frame_len == 0 || (info.is_split && info.frame_len < SPLIT_FRAME_HEADER_LEN)
            {
                return Err(FatalError::ZeroLengthFrame { offset }.into());
            }
            let span = FrameSpan {
                offset,
                frame_len: info.frame_len,
                is_split: info.is_split,
            };
            let remaining = payload.len() - offset;
            if span.wire_len() > remaining {
                return Err(FatalError::FrameOverrun {
                    frame_len: span.wire_len(),
                    offset,
                    payload_len: payload.len(),
                }
                .into());
            }
            if info.is_split {
                log::trace!(
                    "dual-mono frame at {offset}: {} bytes, left first: {}",
                    info.frame_len,
                    info.is_left
                );
            }
            visit(span)?;
            found += 1;
            offset += span.wire_len();
        }
        Ok(found)
    }
}

/// Copy one frame out of the payload honouring the channel selection.
fn copy_frame(
    payload: &[u8],
    span: FrameSpan,
    channel_mode: ChannelMode,
    pool: &mut FramePool,
) -> Result<Vec<u8>> {
    let start = span.offset;
    let len = span.frame_len;
    if !span.is_split {
        return Ok(pool.acquire_copy(&payload[start..start + len]));
    }
    match channel_mode {
        ChannelMode::Left => Ok(pool.acquire_copy(&payload[start..start + len])),
        ChannelMode::Right => {
            let mut data = pool.acquire_copy(&payload[start..start + SPLIT_FRAME_HEADER_LEN]);
            let right = start + len;
            data.extend_from_slice(&payload[right..right + len - SPLIT_FRAME_HEADER_LEN]);
            Ok(data)
        }
        ChannelMode::Stereo | ChannelMode::LeftRightMerge => {
            Err(FatalError::CombinedStereoUnsupported.into())
        }
    }
}
