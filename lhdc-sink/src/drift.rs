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

//! Drift correction for the pending-frame queue.
//!
//! An external clock-drift measurement says how many frames playback is ahead
//! or behind. Positive values mean the decoder is under-fed and fillers are
//! inserted at the head; negative values mean it is over-fed and queued frames
//! are dropped from the head. One frame is corrected per call.

use crate::frame::{EncodedFrame, FramePool};
use crate::queue::PendingFrameQueue;
use crate::{LhdcError, Result};

/// What a single correction step did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftAction {
    Idle,
    Dropped,
    Inserted,
}

#[derive(Debug, Default)]
pub struct DriftCorrector {
    /// Frames owed to playback; positive = insert, negative = drop
    owed: i32,
}

impl DriftCorrector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the owed counter from a drift measurement.
    ///
    /// Ignored while a previous measurement is still being worked off.
    pub fn seed(&mut self, frames: i32) -> bool {
        if frames == 0 || self.owed != 0 {
            return false;
        }
        log::debug!("drift correction seeded with {frames} frames");
        self.owed = frames;
        true
    }

    pub fn owed(&self) -> i32 {
        self.owed
    }

    pub fn reset(&mut self) {
        self.owed = 0;
    }

    /// Apply one correction step.
    ///
    /// `current` is the frame most recently queued; fillers are copies of it.
    /// `reserved` is the number of queue slots that must stay free for frames
    /// still to be appended. Without headroom the step fails with
    /// [`LhdcError::SyncMismatch`] and the counter is left as it was.
    pub fn adjust(
        &mut self,
        queue: &mut PendingFrameQueue,
        current: &EncodedFrame,
        reserved: usize,
        pool: &mut FramePool,
    ) -> Result<DriftAction> {
        if self.owed < 0 {
            let Some(frame) = queue.pop_front() else {
                log::trace!("drift: nothing to drop, retrying next time");
                return Ok(DriftAction::Idle);
            };
            pool.recycle(frame);
            self.owed += 1;
            log::warn!("drift: dropped head frame, owed {}", self.owed);
            return Ok(DriftAction::Dropped);
        }

        if self.owed > 0 {
            if queue.len() + reserved >= queue.limit() {
                log::debug!(
                    "drift: no headroom for filler ({} queued, {reserved} reserved, limit {})",
                    queue.len(),
                    queue.limit()
                );
                return Err(LhdcError::SyncMismatch);
            }
            let filler = current.to_filler(pool.acquire_copy(&current.data));
            queue.prepend(filler)?;
            self.owed -= 1;
            log::warn!("drift: inserted filler frame, owed {}", self.owed);
            return Ok(DriftAction::Inserted);
        }

        Ok(DriftAction::Idle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameIdentity;

    fn create_test_frame(seq: u16) -> EncodedFrame {
        EncodedFrame::new(
            FrameIdentity {
                sequence_number: seq,
                timestamp: seq as u32 * 256,
                cur_sub_sequence: 2,
                total_sub_sequence: 3,
            },
            vec![0xc3; 24],
        )
    }

    fn create_test_queue(limit: usize, len: usize) -> PendingFrameQueue {
        let mut queue = PendingFrameQueue::new(limit);
        for seq in 0..len {
            queue.append(create_test_frame(seq as u16)).unwrap();
        }
        queue
    }

    #[test]
    fn test_positive_drift_converges() {
        let mut queue = create_test_queue(16, 4);
        let mut pool = FramePool::new(8);
        let mut drift = DriftCorrector::new();
        assert!(drift.seed(3));
        let current = create_test_frame(3);

        for expected_owed in [2, 1, 0] {
            let action = drift.adjust(&mut queue, &current, 0, &mut pool).unwrap();
            assert_eq!(action, DriftAction::Inserted);
            assert_eq!(drift.owed(), expected_owed);
        }
        assert_eq!(queue.len(), 7);
        let fillers = queue.iter().take(3).filter(|f| f.is_drift_filler()).count();
        assert_eq!(fillers, 3);
        assert_eq!(queue.front().unwrap().data, current.data);
        assert_eq!(queue.front().unwrap().identity.cur_sub_sequence, 2);

        // converged: further calls do nothing
        assert_eq!(
            drift.adjust(&mut queue, &current, 0, &mut pool).unwrap(),
            DriftAction::Idle
        );
        assert_eq!(queue.len(), 7);
    }

    #[test]
    fn test_positive_drift_without_headroom_keeps_counter() {
        let mut queue = create_test_queue(10, 9);
        let mut pool = FramePool::new(8);
        let mut drift = DriftCorrector::new();
        drift.seed(3);
        let current = create_test_frame(8);

        assert_eq!(
            drift.adjust(&mut queue, &current, 0, &mut pool).unwrap(),
            DriftAction::Inserted
        );
        assert_eq!(drift.owed(), 2);
        assert_eq!(
            drift.adjust(&mut queue, &current, 0, &mut pool),
            Err(LhdcError::SyncMismatch)
        );
        assert_eq!(drift.owed(), 2);
        assert_eq!(queue.len(), 10);
    }

    #[test]
    fn test_reserved_slots_count_against_headroom() {
        let mut queue = create_test_queue(10, 6);
        let mut pool = FramePool::new(8);
        let mut drift = DriftCorrector::new();
        drift.seed(1);
        let current = create_test_frame(5);
        assert_eq!(
            drift.adjust(&mut queue, &current, 4, &mut pool),
            Err(LhdcError::SyncMismatch)
        );
        assert_eq!(
            drift.adjust(&mut queue, &current, 3, &mut pool).unwrap(),
            DriftAction::Inserted
        );
    }

    #[test]
    fn test_negative_drift_drops_head() {
        let mut queue = create_test_queue(16, 3);
        let mut pool = FramePool::new(8);
        let mut drift = DriftCorrector::new();
        drift.seed(-2);
        let current = create_test_frame(2);

        assert_eq!(
            drift.adjust(&mut queue, &current, 0, &mut pool).unwrap(),
            DriftAction::Dropped
        );
        assert_eq!(drift.owed(), -1);
        assert_eq!(queue.front().unwrap().sequence_number(), 1);
        drift.adjust(&mut queue, &current, 0, &mut pool).unwrap();
        assert_eq!(drift.owed(), 0);
        assert_eq!(queue.len(), 1);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_seed_ignored_while_owed() {
        let mut drift = DriftCorrector::new();
        assert!(!drift.seed(0));
        assert!(drift.seed(-1));
        assert!(!drift.seed(5));
        assert_eq!(drift.owed(), -1);
        drift.reset();
        assert_eq!(drift.owed(), 0);
    }
}
