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

//! Resynchronization of the pending queue after a stream discontinuity.

use serde::{Deserialize, Serialize};

use crate::frame::{FrameIdentity, FramePool};
use crate::queue::PendingFrameQueue;
use crate::{LhdcError, Result};

/// Fields of a [`SyncTarget`] that must match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncMask(u8);

impl SyncMask {
    pub const SEQ: SyncMask = SyncMask(0x01);
    pub const CURR_SUB_SEQ: SyncMask = SyncMask(0x02);
    pub const TOTAL_SUB_SEQ: SyncMask = SyncMask(0x04);
    pub const ALL: SyncMask = SyncMask(0x07);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> Self {
        SyncMask(bits & Self::ALL.0)
    }

    pub fn contains(self, other: SyncMask) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for SyncMask {
    type Output = SyncMask;

    fn bitor(self, rhs: SyncMask) -> SyncMask {
        SyncMask(self.0 | rhs.0)
    }
}

/// Frame identity the queue has to be aligned to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncTarget {
    pub sequence_number: u16,
    pub cur_sub_sequence: u8,
    pub total_sub_sequence: u8,
}

impl SyncTarget {
    fn matches(&self, frame: &FrameIdentity, mask: SyncMask) -> bool {
        (!mask.contains(SyncMask::SEQ) || frame.sequence_number == self.sequence_number)
            && (!mask.contains(SyncMask::CURR_SUB_SEQ)
                || frame.cur_sub_sequence == self.cur_sub_sequence)
            && (!mask.contains(SyncMask::TOTAL_SUB_SEQ)
                || frame.total_sub_sequence == self.total_sub_sequence)
    }
}

/// Identity of the frame at the head of the queue. Sub-sequence fields are not reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HeadFrameInfo {
    pub sequence_number: u16,
    pub timestamp: u32,
    pub cur_sub_sequence: u8,
    pub total_sub_sequence: u8,
}

/// Queue operations expressed in frames and samples
#[derive(Debug, Clone, Copy)]
pub struct FrameSynchronizer {
    samples_per_frame: u32,
}

impl FrameSynchronizer {
    pub fn new(samples_per_frame: u32) -> Self {
        Self { samples_per_frame }
    }

    pub fn samples_per_frame(&self) -> u32 {
        self.samples_per_frame
    }

    /// Drop head frames until the head matches `target` under `mask`.
    ///
    /// Returns the number of frames dropped. If no frame matches the queue
    /// ends up empty and [`LhdcError::SyncMismatch`] is returned.
    pub fn synchronize(
        &self,
        queue: &mut PendingFrameQueue,
        pool: &mut FramePool,
        target: &SyncTarget,
        mask: SyncMask,
    ) -> Result<usize> {
        let mut dropped = 0;
        let mut matched = false;
        for _ in 0..queue.len() {
            let Some(head) = queue.front() else { break };
            if target.matches(&head.identity, mask) {
                matched = true;
                break;
            }
            if let Some(frame) = queue.pop_front() {
                pool.recycle(frame);
                dropped += 1;
            }
        }

        match queue.front() {
            Some(head) => log::info!(
                "synchronize: matched {matched}, dropped {dropped}, head seq {} ts {} {}/{}",
                head.sequence_number(),
                head.timestamp(),
                head.identity.cur_sub_sequence,
                head.identity.total_sub_sequence
            ),
            None => log::info!("synchronize: matched {matched}, dropped {dropped}, queue empty"),
        }

        if matched {
            Ok(dropped)
        } else {
            Err(LhdcError::SyncMismatch)
        }
    }

    /// Drop head frames until at most `keep` remain. Returns the number dropped.
    pub fn trim_to(
        &self,
        queue: &mut PendingFrameQueue,
        pool: &mut FramePool,
        keep: usize,
    ) -> usize {
        let mut dropped = 0;
        while queue.len() > keep {
            let Some(frame) = queue.pop_front() else { break };
            pool.recycle(frame);
            dropped += 1;
        }
        log::debug!("trim to {keep}: dropped {dropped}, queue {}", queue.len());
        dropped
    }

    /// Samples represented by the queued frames.
    pub fn queued_samples(&self, queue: &PendingFrameQueue) -> u64 {
        queue.len() as u64 * self.samples_per_frame as u64
    }

    /// Drop whole frames worth `samples` samples from the head.
    pub fn discard_samples(
        &self,
        queue: &mut PendingFrameQueue,
        pool: &mut FramePool,
        samples: u32,
    ) -> Result<usize> {
        if self.samples_per_frame == 0 || samples % self.samples_per_frame != 0 {
            return Err(LhdcError::InvalidArgument(format!(
                "{samples} samples is not a multiple of the {}-sample frame",
                self.samples_per_frame
            )));
        }
        if self.queued_samples(queue) < samples as u64 {
            log::debug!(
                "cannot discard {samples} samples, only {} queued",
                self.queued_samples(queue)
            );
            return Err(LhdcError::SyncMismatch);
        }
        let frames = (samples / self.samples_per_frame) as usize;
        for _ in 0..frames {
            if let Some(frame) = queue.pop_front() {
                pool.recycle(frame);
            }
        }
        if let Some(head) = queue.front() {
            log::debug!(
                "discarded {samples} samples, head seq {}",
                head.sequence_number()
            );
        }
        Ok(frames)
    }

    pub fn head_frame_info(&self, queue: &PendingFrameQueue) -> HeadFrameInfo {
        queue
            .front()
            .map(|head| HeadFrameInfo {
                sequence_number: head.sequence_number(),
                timestamp: head.timestamp(),
                cur_sub_sequence: 0,
                total_sub_sequence: 0,
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::EncodedFrame;

    fn create_test_frame(seq: u16, cur: u8, total: u8) -> EncodedFrame {
        EncodedFrame::new(
            FrameIdentity {
                sequence_number: seq,
                timestamp: seq as u32 * 1024,
                cur_sub_sequence: cur,
                total_sub_sequence: total,
            },
            vec![0; 8],
        )
    }

    fn create_test_queue(seqs: &[u16]) -> PendingFrameQueue {
        let mut queue = PendingFrameQueue::new(70);
        for &seq in seqs {
            queue.append(create_test_frame(seq, 1, 1)).unwrap();
        }
        queue
    }

    #[test]
    fn test_synchronize_to_sequence() {
        let sync = FrameSynchronizer::new(256);
        let mut pool = FramePool::new(8);
        let mut queue = create_test_queue(&[10, 11, 12, 13]);
        let target = SyncTarget {
            sequence_number: 12,
            ..Default::default()
        };
        assert_eq!(
            sync.synchronize(&mut queue, &mut pool, &target, SyncMask::SEQ),
            Ok(2)
        );
        assert_eq!(queue.front().unwrap().sequence_number(), 12);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_synchronize_miss_empties_queue() {
        let sync = FrameSynchronizer::new(256);
        let mut pool = FramePool::new(8);
        let mut queue = create_test_queue(&[10, 11, 12, 13]);
        let target = SyncTarget {
            sequence_number: 99,
            ..Default::default()
        };
        assert_eq!(
            sync.synchronize(&mut queue, &mut pool, &target, SyncMask::SEQ),
            Err(LhdcError::SyncMismatch)
        );
        assert!(queue.is_empty());
        assert_eq!(pool.available(), 4);

        assert_eq!(
            sync.synchronize(&mut queue, &mut pool, &target, SyncMask::SEQ),
            Err(LhdcError::SyncMismatch)
        );
    }

    #[test]
    fn test_synchronize_with_sub_sequence_mask() {
        let sync = FrameSynchronizer::new(256);
        let mut pool = FramePool::new(8);
        let mut queue = PendingFrameQueue::new(70);
        for cur in 1..=3 {
            queue.append(create_test_frame(40, cur, 3)).unwrap();
        }
        queue.append(create_test_frame(41, 1, 3)).unwrap();

        let target = SyncTarget {
            sequence_number: 40,
            cur_sub_sequence: 3,
            total_sub_sequence: 3,
        };
        assert_eq!(
            sync.synchronize(&mut queue, &mut pool, &target, SyncMask::ALL),
            Ok(2)
        );
        assert_eq!(queue.front().unwrap().identity.cur_sub_sequence, 3);

        // sequence ignored: first frame with cur == 1 is seq 41
        let target = SyncTarget {
            sequence_number: 0,
            cur_sub_sequence: 1,
            total_sub_sequence: 3,
        };
        let mask = SyncMask::CURR_SUB_SEQ | SyncMask::TOTAL_SUB_SEQ;
        assert_eq!(sync.synchronize(&mut queue, &mut pool, &target, mask), Ok(1));
        assert_eq!(queue.front().unwrap().sequence_number(), 41);
    }

    #[test]
    fn test_empty_mask_matches_head() {
        let sync = FrameSynchronizer::new(256);
        let mut pool = FramePool::new(8);
        let mut queue = create_test_queue(&[1, 2]);
        let mask = SyncMask::from_bits(0);
        assert_eq!(
            sync.synchronize(&mut queue, &mut pool, &SyncTarget::default(), mask),
            Ok(0)
        );
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_trim_to() {
        let sync = FrameSynchronizer::new(256);
        let mut pool = FramePool::new(8);
        let mut queue = create_test_queue(&[1, 2, 3, 4, 5]);
        assert_eq!(sync.trim_to(&mut queue, &mut pool, 2), 3);
        assert_eq!(queue.front().unwrap().sequence_number(), 4);
        assert_eq!(sync.trim_to(&mut queue, &mut pool, 10), 0);
    }

    #[test]
    fn test_samples_helpers() {
        let sync = FrameSynchronizer::new(256);
        let mut pool = FramePool::new(8);
        let mut queue = create_test_queue(&[1, 2, 3, 4]);
        assert_eq!(sync.queued_samples(&queue), 1024);

        assert!(matches!(
            sync.discard_samples(&mut queue, &mut pool, 100),
            Err(LhdcError::InvalidArgument(_))
        ));
        assert_eq!(
            sync.discard_samples(&mut queue, &mut pool, 2048),
            Err(LhdcError::SyncMismatch)
        );
        assert_eq!(queue.len(), 4);
        assert_eq!(sync.discard_samples(&mut queue, &mut pool, 512), Ok(2));
        assert_eq!(queue.front().unwrap().sequence_number(), 3);
    }

    #[test]
    fn test_head_frame_info() {
        let sync = FrameSynchronizer::new(256);
        let mut queue = PendingFrameQueue::new(8);
        assert_eq!(sync.head_frame_info(&queue), HeadFrameInfo::default());
        queue.append(create_test_frame(77, 2, 3)).unwrap();
        let head = sync.head_frame_info(&queue);
        assert_eq!(head.sequence_number, 77);
        assert_eq!(head.timestamp, 77 * 1024);
        assert_eq!(head.cur_sub_sequence, 0);
        assert_eq!(head.total_sub_sequence, 0);
    }
}
